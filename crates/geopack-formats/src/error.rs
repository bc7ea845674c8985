//! Error types for packet index formats

use thiserror::Error;

/// Errors that can occur when decoding or encoding packet index data
#[derive(Debug, Error)]
pub enum FormatError {
    /// File does not carry the expected signature
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Header declares a format version this build does not understand
    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Version this build writes and reads
        expected: u16,
        /// Version found on disk
        found: u16,
    },

    /// Header checksum mismatch
    #[error("Corrupt header: stored crc {stored:#010x}, computed {computed:#010x}")]
    CorruptHeader {
        /// Checksum stored in the header
        stored: u32,
        /// Checksum computed over the header bytes
        computed: u32,
    },

    /// Record checksum mismatch
    #[error("Corrupt record: stored crc {stored:#010x}, computed {computed:#010x}")]
    CorruptRecord {
        /// Checksum stored after the record
        stored: u32,
        /// Checksum computed over the record bytes
        computed: u32,
    },

    /// Quadtree path is malformed (bad level, bad branch, stray bits)
    #[error("Invalid quadtree path: {0}")]
    InvalidPath(String),

    /// Data is too short for the expected structure
    #[error("Truncated data: expected {expected} bytes, got {actual} bytes")]
    TruncatedData {
        /// Expected minimum size
        expected: usize,
        /// Actual data size
        actual: usize,
    },

    /// Binary read/write error
    #[error("Binary parsing error: {0}")]
    BinRead(String),

    /// IO error during parsing or building
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<binrw::Error> for FormatError {
    fn from(e: binrw::Error) -> Self {
        match e {
            binrw::Error::Io(io) => Self::Io(io),
            binrw::Error::Custom { err, .. } => match err.downcast::<Self>() {
                Ok(inner) => *inner,
                Err(other) => Self::BinRead(format!("{other:?}")),
            },
            other => Self::BinRead(other.to_string()),
        }
    }
}

/// Result type alias for format operations
pub type Result<T> = std::result::Result<T, FormatError>;
