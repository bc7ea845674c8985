//! Replication manifests
//!
//! A manifest lists every physical file a packet file or unified index
//! depends on, so the set can be copied or published elsewhere. Each
//! [`ManifestEntry`] pairs the logical path a file is known by with the
//! path it currently lives at.
//!
//! Logical paths can be relocated with a prefix. When a file is missing
//! under the prefix and a fallback prefix is configured (a disconnected
//! publish area, say) the fallback is tried before giving up.

use crate::bundle::{BUNDLE_HEADER_NAME, BundleHeader};
use crate::unified::PacketFileList;
use crate::{CHANNELS_NAME, INDEX_FILE_NAME, PACKET_FILES_NAME, Result, StorageError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// One file in a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Logical path of the file
    pub original_path: PathBuf,
    /// Where the file was found
    pub current_path: PathBuf,
    /// File size in bytes
    pub size: u64,
}

/// Path rewriting for a manifest walk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestOptions {
    /// Directory logical paths are rebased under
    pub prefix: Option<PathBuf>,
    /// Directory tried when a file is missing under `prefix`
    pub fallback_prefix: Option<PathBuf>,
}

/// Enumerates the files behind packet files and unified indices.
#[derive(Debug, Clone, Default)]
pub struct ManifestWalker {
    options: ManifestOptions,
}

impl ManifestWalker {
    /// Create a walker.
    pub const fn new(options: ManifestOptions) -> Self {
        Self { options }
    }

    /// Walk options.
    pub const fn options(&self) -> &ManifestOptions {
        &self.options
    }

    /// Files of a packet file: index, bundle header, segments, channels.
    pub fn walk_packet_file(&self, dir: &Path) -> Result<Vec<ManifestEntry>> {
        let mut entries = vec![self.resolve(&dir.join(INDEX_FILE_NAME))?];
        self.walk_bundle(dir, &mut entries)?;
        entries.extend(self.resolve_optional(&dir.join(CHANNELS_NAME))?);
        Ok(entries)
    }

    /// Files of a unified index and of every packet file it lists.
    ///
    /// The packet files' own indices are not included; only their bundles
    /// are read through a unified index.
    pub fn walk_unified(&self, dir: &Path) -> Result<Vec<ManifestEntry>> {
        let mut entries = vec![self.resolve(&dir.join(INDEX_FILE_NAME))?];

        let list_entry = self.resolve(&dir.join(PACKET_FILES_NAME))?;
        let list_dir = list_entry
            .current_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let list = PacketFileList::load(&list_dir)?;
        entries.push(list_entry);
        entries.extend(self.resolve_optional(&dir.join(CHANNELS_NAME))?);

        for packet_file in &list.packet_files {
            self.walk_bundle(packet_file, &mut entries)?;
        }
        Ok(entries)
    }

    /// Walk each path, as a unified index when it has a `packetfiles.json`
    /// and as a packet file otherwise.
    pub fn walk<P: AsRef<Path>>(&self, paths: &[P]) -> Result<Vec<ManifestEntry>> {
        let mut entries = Vec::new();
        for path in paths {
            let path = path.as_ref();
            if self.resolve_optional(&path.join(PACKET_FILES_NAME))?.is_some() {
                entries.extend(self.walk_unified(path)?);
            } else {
                entries.extend(self.walk_packet_file(path)?);
            }
        }
        if entries.is_empty() {
            return Err(StorageError::EmptyManifest(format!(
                "no files found for {} paths",
                paths.len()
            )));
        }
        Ok(entries)
    }

    fn walk_bundle(&self, dir: &Path, entries: &mut Vec<ManifestEntry>) -> Result<()> {
        let header_entry = self.resolve(&dir.join(BUNDLE_HEADER_NAME))?;
        let header = BundleHeader::from_bytes(&fs::read(&header_entry.current_path)?)?;
        entries.push(header_entry);
        for segment in &header.segments {
            entries.push(self.resolve(&dir.join(&segment.name))?);
        }
        Ok(())
    }

    /// Locate `original`, failing with `MissingDeltaSource` if absent.
    pub fn resolve(&self, original: &Path) -> Result<ManifestEntry> {
        self.resolve_optional(original)?
            .ok_or_else(|| StorageError::MissingDeltaSource(original.to_path_buf()))
    }

    fn resolve_optional(&self, original: &Path) -> Result<Option<ManifestEntry>> {
        let primary = match &self.options.prefix {
            Some(prefix) => rebase(prefix, original),
            None => original.to_path_buf(),
        };
        if let Some(entry) = entry_at(original, primary)? {
            return Ok(Some(entry));
        }

        if let Some(fallback) = &self.options.fallback_prefix {
            let candidate = rebase(fallback, original);
            if let Some(entry) = entry_at(original, candidate)? {
                debug!(
                    "Resolved {} from fallback {}",
                    original.display(),
                    entry.current_path.display()
                );
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }
}

fn entry_at(original: &Path, current: PathBuf) -> Result<Option<ManifestEntry>> {
    match fs::metadata(&current) {
        Ok(meta) if meta.is_file() => Ok(Some(ManifestEntry {
            original_path: original.to_path_buf(),
            current_path: current,
            size: meta.len(),
        })),
        Ok(_) => Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// `original` re-rooted under `prefix`.
fn rebase(prefix: &Path, original: &Path) -> PathBuf {
    let relative: PathBuf = original
        .components()
        .filter(|c| !matches!(c, Component::RootDir | Component::Prefix(_)))
        .collect();
    prefix.join(relative)
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::config::PacketFileConfig;
    use crate::packetfile::PacketFileWriter;
    use crate::unified::unify_packet_files;
    use pretty_assertions::assert_eq;

    fn build_packet_file(dir: &Path, segment_break: u64) {
        let writer = PacketFileWriter::create(
            dir,
            PacketFileConfig::default().with_segment_break(segment_break),
        )
        .unwrap();
        let mut path = geopack_formats::QuadtreePath::root();
        for _ in 0..10 {
            path.advance(3);
            writer.write_append(path, &[7u8; 40]).unwrap();
        }
        writer.close().unwrap();
    }

    fn names(entries: &[ManifestEntry]) -> Vec<String> {
        entries
            .iter()
            .map(|e| {
                e.original_path
                    .file_name()
                    .unwrap()
                    .to_string_lossy()
                    .into_owned()
            })
            .collect()
    }

    #[test]
    fn test_rebase() {
        assert_eq!(
            rebase(Path::new("/mnt/publish"), Path::new("/db/tiles/pack.idx")),
            PathBuf::from("/mnt/publish/db/tiles/pack.idx")
        );
        assert_eq!(
            rebase(Path::new("/mnt"), Path::new("tiles")),
            PathBuf::from("/mnt/tiles")
        );
    }

    #[test]
    fn test_packet_file_manifest() {
        let dir = tempfile::tempdir().unwrap();
        build_packet_file(dir.path(), 100);

        let walker = ManifestWalker::default();
        let entries = walker.walk(&[dir.path()]).unwrap();
        let names = names(&entries);
        assert_eq!(names[0], "pack.idx");
        assert_eq!(names[1], "bundle.hdr");
        // 10 payloads of 44 bytes, two per 100 byte segment
        assert_eq!(names.len(), 2 + 5);
        assert!(names[2..].iter().all(|n| n.starts_with("bundle.0")));
        assert_eq!(entries[0].size, 18 + 10 * 28);
        assert_eq!(entries[0].original_path, entries[0].current_path);
    }

    #[test]
    fn test_prefix_and_fallback() {
        let root = tempfile::tempdir().unwrap();
        let primary = root.path().join("primary");
        let publish = root.path().join("publish");
        build_packet_file(&publish.join("db/tiles"), 1 << 20);
        fs::create_dir_all(primary.join("db/tiles")).unwrap();
        // Only the index exists under the primary prefix
        fs::copy(
            publish.join("db/tiles/pack.idx"),
            primary.join("db/tiles/pack.idx"),
        )
        .unwrap();

        let walker = ManifestWalker::new(ManifestOptions {
            prefix: Some(primary.clone()),
            fallback_prefix: Some(publish.clone()),
        });
        let entries = walker.walk_packet_file(Path::new("/db/tiles")).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].original_path, PathBuf::from("/db/tiles/pack.idx"));
        assert!(entries[0].current_path.starts_with(&primary));
        assert!(entries[1].current_path.starts_with(&publish));
        assert!(entries[2].current_path.starts_with(&publish));

        let no_fallback = ManifestWalker::new(ManifestOptions {
            prefix: Some(primary),
            fallback_prefix: None,
        });
        match no_fallback.walk_packet_file(Path::new("/db/tiles")) {
            Err(StorageError::MissingDeltaSource(path)) => {
                assert_eq!(path, PathBuf::from("/db/tiles/bundle.hdr"));
            }
            other => panic!("expected missing delta source, got {other:?}"),
        }
    }

    #[test]
    fn test_unified_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let unified = dir.path().join("unified");
        build_packet_file(&a, 1 << 20);
        build_packet_file(&b, 1 << 20);
        unify_packet_files(&[&a, &b], &unified).unwrap();

        let entries = ManifestWalker::default().walk(&[&unified]).unwrap();
        assert_eq!(
            names(&entries),
            vec![
                "pack.idx",
                "packetfiles.json",
                "bundle.hdr",
                "bundle.0000",
                "bundle.hdr",
                "bundle.0000",
            ]
        );
        assert!(entries[2].original_path.starts_with(&a));
        assert!(entries[4].original_path.starts_with(&b));
    }

    #[test]
    fn test_empty_manifest() {
        let paths: Vec<PathBuf> = Vec::new();
        assert!(matches!(
            ManifestWalker::default().walk(&paths),
            Err(StorageError::EmptyManifest(_))
        ));
    }
}
