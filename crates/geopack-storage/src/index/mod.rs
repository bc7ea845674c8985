//! Packet index files
//!
//! [`PacketIndexWriter`] appends records to a temporary file from any
//! number of threads and, on close, turns it into a preorder-sorted index.
//! [`PacketIndexReader`] validates the header and hands records out
//! sequentially, in batches, or by record number.

mod order;
mod reader;
mod sort;
mod source;
mod writer;

pub use order::{LEVEL_SLOTS, WriteOrder};
pub use reader::PacketIndexReader;
pub use sort::{external_sort, merge_regions};
pub use source::IndexRegionSource;
pub use writer::{Finalization, IndexSlot, PacketIndexWriter};

use std::path::{Path, PathBuf};

/// A contiguous, already ordered run of records.
///
/// `position` is the record number of the first record in the run, so the
/// run occupies bytes starting at `record_offset(position)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SortedRegion {
    /// Record number of the first record
    pub position: u64,
    /// Number of records
    pub count: u64,
}

impl SortedRegion {
    /// Create a region.
    pub const fn new(position: u64, count: u64) -> Self {
        Self { position, count }
    }

    /// Record number one past the end of the region.
    pub const fn end(&self) -> u64 {
        self.position + self.count
    }
}

/// `path` with `suffix` appended to its file name.
pub(crate) fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}
