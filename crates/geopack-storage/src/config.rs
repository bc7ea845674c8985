//! Configuration for packet file writers

use geopack_formats::RECORD_SIZE;
use serde::{Deserialize, Serialize};

/// Configuration for a packet file writer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacketFileConfig {
    /// Memory budget for sorting the index on close (in bytes)
    pub max_sort_buffer: usize,

    /// Floor applied to `max_sort_buffer` (in bytes)
    pub min_sort_buffer: usize,

    /// Bundle segment rollover size (in bytes)
    pub segment_break: u64,

    /// Append a CRC32 to every payload
    pub payload_checksums: bool,

    /// Records buffered per source when merging sorted regions
    pub merge_read_batch: usize,
}

/// Default index sort budget.
pub const DEFAULT_MAX_SORT_BUFFER: usize = 64 * 1024 * 1024; // 64 MB

/// Default floor for the index sort budget.
pub const DEFAULT_MIN_SORT_BUFFER: usize = 64 * 1024; // 64 KB

/// Default bundle segment size.
pub const DEFAULT_SEGMENT_BREAK: u64 = 1024 * 1024 * 1024; // 1 GB

/// Default merge read batch.
pub const DEFAULT_MERGE_READ_BATCH: usize = 256;

impl Default for PacketFileConfig {
    fn default() -> Self {
        Self {
            max_sort_buffer: DEFAULT_MAX_SORT_BUFFER,
            min_sort_buffer: DEFAULT_MIN_SORT_BUFFER,
            segment_break: DEFAULT_SEGMENT_BREAK,
            payload_checksums: true,
            merge_read_batch: DEFAULT_MERGE_READ_BATCH,
        }
    }
}

impl PacketFileConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the sort budget used when the index is finalized
    #[must_use]
    pub const fn with_max_sort_buffer(mut self, bytes: usize) -> Self {
        self.max_sort_buffer = bytes;
        self
    }

    /// Set the floor for the sort budget
    #[must_use]
    pub const fn with_min_sort_buffer(mut self, bytes: usize) -> Self {
        self.min_sort_buffer = bytes;
        self
    }

    /// Set the bundle segment rollover size
    #[must_use]
    pub const fn with_segment_break(mut self, bytes: u64) -> Self {
        self.segment_break = bytes;
        self
    }

    /// Enable or disable payload checksums
    #[must_use]
    pub const fn with_payload_checksums(mut self, enable: bool) -> Self {
        self.payload_checksums = enable;
        self
    }

    /// Set the per-source read batch for region merges
    #[must_use]
    pub const fn with_merge_read_batch(mut self, records: usize) -> Self {
        self.merge_read_batch = records;
        self
    }

    /// Effective sort floor, never smaller than one record.
    pub fn sort_floor(&self) -> usize {
        self.min_sort_buffer.max(RECORD_SIZE)
    }

    /// Effective read batch, at least one record.
    pub fn read_batch(&self) -> usize {
        self.merge_read_batch.max(1)
    }
}
