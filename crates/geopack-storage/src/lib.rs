//! On-disk storage engine for quadtree-keyed packets.
//!
//! Packets are small binary payloads (imagery tiles, vector features,
//! terrain blocks) keyed by a [`QuadtreePath`]. A packet file is a
//! directory holding:
//!
//! - **Bundle**: append-only payload segments (`bundle.0000`, ...) plus a
//!   `bundle.hdr` describing them
//! - **Index**: `pack.idx`, a header followed by fixed-width
//!   [`PacketIndexEntry`] records sorted in quadtree preorder
//!
//! Producers may append packets in any order and from several threads.
//! Closing the index writer picks the cheapest finalization that yields a
//! preorder-sorted index: a rename, a per-level merge, or a full external
//! sort driven by the generic [`merge::Merge`] engine.
//!
//! # Example
//!
//! ```rust,no_run
//! use geopack_storage::{PacketFileConfig, PacketFileReader, PacketFileWriter};
//!
//! # fn example() -> geopack_storage::Result<()> {
//! let writer = PacketFileWriter::create("/tmp/tiles", PacketFileConfig::default())?;
//! writer.write_append("0123".parse()?, b"tile bytes")?;
//! writer.close()?;
//!
//! let reader = PacketFileReader::open("/tmp/tiles")?;
//! while let Some((path, payload)) = reader.read_next()? {
//!     println!("{path}: {} bytes", payload.len());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! [`QuadtreePath`]: geopack_formats::QuadtreePath
//! [`PacketIndexEntry`]: geopack_formats::PacketIndexEntry

#![warn(missing_docs)]
#![allow(clippy::must_use_candidate)]

use geopack_formats::FormatError;
use std::path::PathBuf;
use thiserror::Error;

// Generic K-way merge
pub mod merge;

// Packet index writer, reader and sorting
pub mod index;

// Payload bundle
pub mod bundle;

// Packet file (bundle + index)
pub mod packetfile;

// Index-of-indices composition
pub mod unified;

// Replication manifests
pub mod manifest;

// Configuration
pub mod config;

// Positional file I/O
mod io;

pub use bundle::{BundleReader, BundleWriter};
pub use config::PacketFileConfig;
pub use index::{Finalization, PacketIndexReader, PacketIndexWriter, SortedRegion};
pub use manifest::{ManifestEntry, ManifestOptions, ManifestWalker};
pub use merge::{Merge, MergeSource};
pub use packetfile::{Allocation, PacketFileReader, PacketFileWriter, RejectedWrite};
pub use unified::{UnifiedIndexReader, unify_packet_files};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Index record checksum mismatch.
    #[error("Corrupt record: stored crc {stored:#010x}, computed {computed:#010x}")]
    CorruptRecord {
        /// Checksum stored with the record
        stored: u32,
        /// Checksum computed from the record bytes
        computed: u32,
    },

    /// Index or bundle header checksum mismatch.
    #[error("Corrupt header: stored crc {stored:#010x}, computed {computed:#010x}")]
    CorruptHeader {
        /// Checksum stored in the header
        stored: u32,
        /// Checksum computed from the header bytes
        computed: u32,
    },

    /// Payload checksum mismatch.
    #[error("Corrupt payload at {position}: stored crc {stored:#010x}, computed {computed:#010x}")]
    CorruptPayload {
        /// Bundle position of the payload
        position: u64,
        /// Checksum stored after the payload
        stored: u32,
        /// Checksum computed from the payload
        computed: u32,
    },

    /// Unsupported format version.
    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Version this build reads
        expected: u32,
        /// Version found on disk
        found: u32,
    },

    /// Invalid data format.
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Invalid quadtree path.
    #[error("Invalid quadtree path: {0}")]
    InvalidPath(String),

    /// Data shorter than the structure it should hold.
    #[error("Truncated data: expected {expected} bytes, got {actual} bytes")]
    TruncatedData {
        /// Expected minimum size
        expected: usize,
        /// Actual size
        actual: usize,
    },

    /// A source added to a running merge starts at or before the current output.
    #[error("Out of order source {name} added to merge {merge}")]
    OutOfOrderSource {
        /// Merge the source was added to
        merge: String,
        /// Name of the rejected source
        name: String,
    },

    /// Merge started without any sources.
    #[error("Merge {0} has no sources")]
    NoSources(String),

    /// Merge started twice.
    #[error("Merge {0} already started")]
    AlreadyStarted(String),

    /// Merge accessed while not started or after it finished.
    #[error("Merge {0} is not active")]
    NotActive(String),

    /// Write attempted on a closed writer.
    #[error("Writer for {} is closed", .0.display())]
    ClosedWriter(PathBuf),

    /// Index closed while some allocated record slots were never written.
    #[error("Index {} has {written} of {allocated} records written", .path.display())]
    IncompleteIndex {
        /// Final index path
        path: PathBuf,
        /// Record slots allocated
        allocated: u64,
        /// Record slots written
        written: u64,
    },

    /// Allocation used with a different key or size than it reserved.
    #[error("Allocation mismatch: {0}")]
    AllocationMismatch(String),

    /// Bundle segment addressing error.
    #[error("Bundle error: {0}")]
    Bundle(String),

    /// Manifest walk produced no files.
    #[error("Empty manifest: {0}")]
    EmptyManifest(String),

    /// A referenced file exists in neither the primary nor the fallback location.
    #[error("Missing delta source: {}", .0.display())]
    MissingDeltaSource(PathBuf),

    /// Sidecar metadata could not be parsed or written.
    #[error("Metadata error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<FormatError> for StorageError {
    fn from(e: FormatError) -> Self {
        match e {
            FormatError::InvalidFormat(msg) => Self::InvalidFormat(msg),
            FormatError::VersionMismatch { expected, found } => Self::VersionMismatch {
                expected: u32::from(expected),
                found: u32::from(found),
            },
            FormatError::CorruptHeader { stored, computed } => {
                Self::CorruptHeader { stored, computed }
            }
            FormatError::CorruptRecord { stored, computed } => {
                Self::CorruptRecord { stored, computed }
            }
            FormatError::InvalidPath(msg) => Self::InvalidPath(msg),
            FormatError::TruncatedData { expected, actual } => {
                Self::TruncatedData { expected, actual }
            }
            FormatError::BinRead(msg) => Self::InvalidFormat(msg),
            FormatError::Io(io) => Self::Io(io),
        }
    }
}

impl From<binrw::Error> for StorageError {
    fn from(e: binrw::Error) -> Self {
        FormatError::from(e).into()
    }
}

/// Version information for the storage engine.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Index file name inside a packet file or unified index directory.
pub const INDEX_FILE_NAME: &str = "pack.idx";

/// Sidecar listing the packet files a unified index refers to.
pub const PACKET_FILES_NAME: &str = "packetfiles.json";

/// Optional sidecar describing auxiliary channels.
pub const CHANNELS_NAME: &str = "channels.json";

/// Suffix of the temporary file an index is written to before finalization.
pub const TEMP_SUFFIX: &str = ".tmp";

/// Suffix of the scratch file used by the external sort.
pub const SORT_SCRATCH_SUFFIX: &str = ".sort.tmp";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_errors_map_to_same_variant() {
        let e: StorageError = FormatError::CorruptRecord {
            stored: 1,
            computed: 2,
        }
        .into();
        assert!(matches!(
            e,
            StorageError::CorruptRecord {
                stored: 1,
                computed: 2
            }
        ));

        let e: StorageError = FormatError::VersionMismatch {
            expected: 1,
            found: 3,
        }
        .into();
        assert!(matches!(
            e,
            StorageError::VersionMismatch {
                expected: 1,
                found: 3
            }
        ));

        let e: StorageError = FormatError::InvalidFormat("sig".into()).into();
        assert!(matches!(e, StorageError::InvalidFormat(_)));
    }

    #[test]
    fn test_error_display() {
        let e = StorageError::ClosedWriter(PathBuf::from("/data/pack.idx"));
        assert!(e.to_string().contains("/data/pack.idx"));
        let e = StorageError::CorruptPayload {
            position: 96,
            stored: 0,
            computed: 1,
        };
        assert!(e.to_string().contains("96"));
    }
}
