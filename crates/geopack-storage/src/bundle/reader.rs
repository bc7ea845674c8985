//! Bundle reader

use super::header::{BundleHeader, SegmentInfo};
use super::{BUNDLE_HEADER_NAME, locate};
use crate::io::read_exact_at;
use crate::{Result, StorageError};
use geopack_formats::BundleAddr;
use geopack_formats::checksum::verify_trailing_crc;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

/// Read-only access to a closed bundle.
pub struct BundleReader {
    dir: PathBuf,
    header: BundleHeader,
    header_size: u64,
    starts: Vec<u64>,
    sizes: Vec<u64>,
    files: Vec<File>,
}

impl BundleReader {
    /// Open the bundle in `dir`.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let data = fs::read(dir.join(BUNDLE_HEADER_NAME))?;
        let header = BundleHeader::from_bytes(&data)?;

        let mut starts = Vec::with_capacity(header.segments.len());
        let mut sizes = Vec::with_capacity(header.segments.len());
        let mut files = Vec::with_capacity(header.segments.len());
        let mut start = 0u64;
        for segment in &header.segments {
            let file = File::open(dir.join(&segment.name))?;
            let on_disk = file.metadata()?.len();
            if on_disk < segment.size {
                return Err(StorageError::TruncatedData {
                    expected: segment.size as usize,
                    actual: on_disk as usize,
                });
            }
            starts.push(start);
            sizes.push(segment.size);
            files.push(file);
            start += segment.size;
        }

        Ok(Self {
            dir,
            header,
            header_size: data.len() as u64,
            starts,
            sizes,
            files,
        })
    }

    /// Bundle directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Segments in position order.
    pub fn segments(&self) -> &[SegmentInfo] {
        &self.header.segments
    }

    /// Size of the header file in bytes.
    pub const fn header_size(&self) -> u64 {
        self.header_size
    }

    /// Total payload bytes across all segments.
    pub fn total_size(&self) -> u64 {
        self.sizes.iter().sum()
    }

    /// Read `size` bytes at global `position`.
    pub fn read_at(&self, position: u64, size: u32) -> Result<Vec<u8>> {
        let index = locate(&self.starts, &self.sizes, position, u64::from(size))?;
        let mut buf = vec![0u8; size as usize];
        read_exact_at(&self.files[index], &mut buf, position - self.starts[index])?;
        Ok(buf)
    }

    /// Read a payload stored with a trailing CRC32 and verify it.
    ///
    /// Returns the payload without the checksum.
    pub fn read_at_with_checksum(&self, addr: BundleAddr) -> Result<Vec<u8>> {
        let mut data = self.read_at(addr.position, addr.size)?;
        let len = verify_trailing_crc(&data)
            .map_err(|m| StorageError::CorruptPayload {
                position: addr.position,
                stored: m.stored,
                computed: m.computed,
            })?
            .len();
        data.truncate(len);
        Ok(data)
    }
}
