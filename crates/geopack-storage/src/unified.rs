//! Unified indices: one index over several packet files
//!
//! [`unify_packet_files`] merges the finalized indices of several packet
//! files into one index. Each entry's `extra` field is replaced with the
//! number of the packet file it came from, and the packet file directories
//! are listed, in file-number order, in a `packetfiles.json` sidecar.

use crate::bundle::BundleReader;
use crate::config::PacketFileConfig;
use crate::index::{Finalization, PacketIndexReader, PacketIndexWriter};
use crate::merge::Merge;
use crate::{CHANNELS_NAME, INDEX_FILE_NAME, PACKET_FILES_NAME, Result, StorageError};
use geopack_formats::{PacketIndexEntry, QuadtreePath};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Contents of `packetfiles.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketFileList {
    /// Packet file directories; position is the file number
    pub packet_files: Vec<PathBuf>,
}

/// One auxiliary channel described in `channels.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    /// Channel id, as stored in entry `extra` tags by producers
    pub id: u32,
    /// Display name
    pub name: String,
    /// Free-form type string (`imagery`, `terrain`, ...)
    #[serde(default)]
    pub kind: String,
}

/// Contents of `channels.json`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChannelList {
    /// Channels in id order
    pub channels: Vec<Channel>,
}

impl PacketFileList {
    /// Read `packetfiles.json` from `dir`.
    pub fn load(dir: &Path) -> Result<Self> {
        let text = fs::read_to_string(dir.join(PACKET_FILES_NAME))?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Write `packetfiles.json` into `dir`.
    pub fn store(&self, dir: &Path) -> Result<()> {
        fs::write(
            dir.join(PACKET_FILES_NAME),
            serde_json::to_string_pretty(self)?,
        )?;
        Ok(())
    }
}

impl ChannelList {
    /// Read `channels.json` from `dir` if present.
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(CHANNELS_NAME);
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&text)?))
    }

    /// Write `channels.json` into `dir`.
    pub fn store(&self, dir: &Path) -> Result<()> {
        fs::write(dir.join(CHANNELS_NAME), serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Merge the indices of `inputs` into a unified index in `output_dir`.
///
/// Returns the number of entries written.
pub fn unify_packet_files<P: AsRef<Path>>(inputs: &[P], output_dir: &Path) -> Result<u64> {
    unify_packet_files_with_config(inputs, output_dir, &PacketFileConfig::default())
}

/// [`unify_packet_files`] with explicit read batch and sort budget.
pub fn unify_packet_files_with_config<P: AsRef<Path>>(
    inputs: &[P],
    output_dir: &Path,
    config: &PacketFileConfig,
) -> Result<u64> {
    fs::create_dir_all(output_dir)?;

    let mut merge = Merge::new(format!("unify {}", output_dir.display()));
    let mut has_checksum = None;
    let mut packet_files = Vec::with_capacity(inputs.len());
    for input in inputs {
        let dir = input.as_ref();
        let reader = PacketIndexReader::open(dir.join(INDEX_FILE_NAME))?;
        let flag = reader.header().has_payload_checksum();
        if *has_checksum.get_or_insert(flag) != flag {
            reader.close()?;
            return Err(StorageError::InvalidFormat(format!(
                "packet file {} disagrees on payload checksums",
                dir.display()
            )));
        }
        merge.add_source(reader.into_source(config.read_batch())?)?;
        packet_files.push(dir.to_path_buf());
    }
    merge.start()?;

    let writer = PacketIndexWriter::create(
        output_dir.join(INDEX_FILE_NAME),
        has_checksum.unwrap_or(true),
    )?
    .with_min_sort_buffer(config.min_sort_buffer)
    .with_merge_read_batch(config.read_batch());

    let mut written = 0u64;
    while merge.is_active() {
        let file_number = u32::try_from(merge.current_source_id()?)
            .map_err(|_| StorageError::InvalidFormat("too many packet files".to_string()))?;
        let mut entry = *merge.current()?;
        entry.extra = file_number;
        writer.write_append(&entry)?;
        written += 1;
        merge.advance()?;
    }
    merge.close()?;

    let finalization: Finalization = writer.close(config.max_sort_buffer)?;
    PacketFileList { packet_files }.store(output_dir)?;

    debug!(
        "Unified {} packet files into {} ({} entries, {:?})",
        inputs.len(),
        output_dir.display(),
        written,
        finalization
    );
    Ok(written)
}

/// Reads packets through a unified index.
pub struct UnifiedIndexReader {
    dir: PathBuf,
    index: PacketIndexReader,
    packet_files: PacketFileList,
    bundles: Vec<BundleReader>,
    channels: Option<ChannelList>,
}

impl UnifiedIndexReader {
    /// Open the unified index in `dir` and every packet file it lists.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let packet_files = PacketFileList::load(&dir)?;
        let bundles = packet_files
            .packet_files
            .iter()
            .map(BundleReader::open)
            .collect::<Result<Vec<_>>>()?;
        let channels = ChannelList::load(&dir)?;
        let index = PacketIndexReader::open(dir.join(INDEX_FILE_NAME))?;
        Ok(Self {
            dir,
            index,
            packet_files,
            bundles,
            channels,
        })
    }

    /// Unified index directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Packet files in file-number order.
    pub fn packet_files(&self) -> &[PathBuf] {
        &self.packet_files.packet_files
    }

    /// Channel sidecar, if the index has one.
    pub const fn channels(&self) -> Option<&ChannelList> {
        self.channels.as_ref()
    }

    /// Underlying index reader.
    pub const fn index(&self) -> &PacketIndexReader {
        &self.index
    }

    /// Number of entries in the unified index.
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

    /// Read the payload of a unified entry from its packet file.
    pub fn read_entry(&self, entry: &PacketIndexEntry) -> Result<Vec<u8>> {
        let bundle = self.bundles.get(entry.extra as usize).ok_or_else(|| {
            StorageError::InvalidFormat(format!(
                "entry {} refers to packet file {} of {}",
                entry.path,
                entry.extra,
                self.bundles.len()
            ))
        })?;
        if self.index.header().has_payload_checksum() {
            bundle.read_at_with_checksum(entry.addr())
        } else {
            bundle.read_at(entry.position, entry.size)
        }
    }

    /// Release the reader.
    pub fn close(self) -> Result<()> {
        self.index.close()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::packetfile::PacketFileWriter;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_unify_two_packet_files() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let out = dir.path().join("unified");

        let writer = PacketFileWriter::create(&a, PacketFileConfig::default()).unwrap();
        for p in ["0", "2", "20"] {
            writer.write_append(p.parse().unwrap(), p.as_bytes()).unwrap();
        }
        writer.close().unwrap();

        let writer = PacketFileWriter::create(&b, PacketFileConfig::default()).unwrap();
        for p in ["1", "13", "3"] {
            writer.write_append(p.parse().unwrap(), p.as_bytes()).unwrap();
        }
        writer.close().unwrap();

        fs::create_dir_all(&out).unwrap();
        ChannelList {
            channels: vec![Channel {
                id: 0,
                name: "imagery".to_string(),
                kind: "image".to_string(),
            }],
        }
        .store(&out)
        .unwrap();

        assert_eq!(unify_packet_files(&[&a, &b], &out).unwrap(), 6);

        let reader = UnifiedIndexReader::open(&out).unwrap();
        assert_eq!(reader.packet_files(), &[a.clone(), b.clone()]);
        assert_eq!(reader.num_packets(), 6);
        assert_eq!(reader.channels().unwrap().channels[0].name, "imagery");

        let mut seen = Vec::new();
        while let Some((path, payload)) = reader.read_next().unwrap() {
            assert_eq!(payload, path.to_string().into_bytes());
            seen.push(path.to_string());
        }
        assert_eq!(seen, vec!["0", "1", "13", "2", "20", "3"]);

        let files: Vec<u32> = (0..6)
            .map(|i| reader.index().read_record(i).unwrap().extra)
            .collect();
        assert_eq!(files, vec![0, 1, 1, 0, 0, 1]);
        reader.close().unwrap();
    }

    #[test]
    fn test_unify_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let inputs: Vec<PathBuf> = Vec::new();
        assert!(matches!(
            unify_packet_files(&inputs, dir.path()),
            Err(StorageError::NoSources(_))
        ));
    }
}
