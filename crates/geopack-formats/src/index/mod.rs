//! Packet index file format
//!
//! A packet index is an [`IndexHeader`] followed by a dense array of
//! fixed-width [`PacketIndexEntry`] records. Record `i` lives at byte
//! `INDEX_HEADER_SIZE + i * RECORD_SIZE`, so the record count follows
//! from the file size alone.

mod entry;
mod header;

pub use entry::{BundleAddr, PacketIndexEntry, RECORD_SIZE};
pub use header::{INDEX_FORMAT_VERSION, INDEX_HEADER_SIZE, INDEX_SIGNATURE, IndexHeader};

/// Byte offset of record `index` in an index file.
pub const fn record_offset(index: u64) -> u64 {
    INDEX_HEADER_SIZE as u64 + index * RECORD_SIZE as u64
}

/// Number of whole records in an index file of `file_size` bytes.
pub const fn record_count(file_size: u64) -> u64 {
    file_size.saturating_sub(INDEX_HEADER_SIZE as u64) / RECORD_SIZE as u64
}
