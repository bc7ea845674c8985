//! Packet file reader

use crate::bundle::BundleReader;
use crate::index::PacketIndexReader;
use crate::{INDEX_FILE_NAME, Result};
use geopack_formats::{PacketIndexEntry, QuadtreePath};
use std::path::{Path, PathBuf};

/// Reads packets back in index order.
pub struct PacketFileReader {
    dir: PathBuf,
    index: PacketIndexReader,
    bundle: BundleReader,
}

impl PacketFileReader {
    /// Open the packet file in `dir`.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let index = PacketIndexReader::open(dir.join(INDEX_FILE_NAME))?;
        let bundle = BundleReader::open(&dir)?;
        Ok(Self { dir, index, bundle })
    }

    /// Packet file directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Underlying index reader.
    pub const fn index(&self) -> &PacketIndexReader {
        &self.index
    }

    /// Underlying bundle reader.
    pub const fn bundle(&self) -> &BundleReader {
        &self.bundle
    }

    /// Number of packets in the index.
    pub const fn num_packets(&self) -> u64 {
        self.index.num_records()
    }

    /// Read the next packet, or `None` at the end of the index.
    pub fn read_next(&self) -> Result<Option<(QuadtreePath, Vec<u8>)>> {
        match self.index.read_next()? {
            Some(entry) => Ok(Some((entry.path, self.read_entry(&entry)?))),
            None => Ok(None),
        }
    }

    /// Read the payload an entry points at, verifying its checksum.
    pub fn read_entry(&self, entry: &PacketIndexEntry) -> Result<Vec<u8>> {
        if self.index.header().has_payload_checksum() {
            self.bundle.read_at_with_checksum(entry.addr())
        } else {
            self.bundle.read_at(entry.position, entry.size)
        }
    }

    /// Release the reader.
    pub fn close(self) -> Result<()> {
        self.index.close()
    }
}
