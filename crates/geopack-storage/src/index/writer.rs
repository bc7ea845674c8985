//! Packet index writer

use super::order::WriteOrder;
use super::sort::{external_sort, merge_regions};
use super::with_suffix;
use crate::config::{DEFAULT_MERGE_READ_BATCH, DEFAULT_MIN_SORT_BUFFER};
use crate::io::{remove_scratch, write_all_at};
use crate::{Result, StorageError, TEMP_SUFFIX};
use geopack_formats::index::record_offset;
use geopack_formats::{IndexHeader, PacketIndexEntry, QuadtreePath};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// How [`PacketIndexWriter::close`] produced the final index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finalization {
    /// No records were written; the temporary file was renamed.
    Empty,
    /// Records arrived in preorder; the temporary file was renamed.
    AlreadySorted,
    /// Each level arrived as one ordered run; the runs were merged.
    LevelMerge {
        /// Number of level runs merged
        regions: usize,
    },
    /// Every record fit in one sort buffer.
    InMemorySort,
    /// Records were sorted in chunks and the chunks merged.
    ExternalSort {
        /// Number of sorted chunks merged
        regions: usize,
    },
}

impl Finalization {
    /// Whether the final index is the temporary file, unmoved.
    pub const fn is_rename(&self) -> bool {
        matches!(self, Self::Empty | Self::AlreadySorted)
    }
}

/// Reserved record slot returned by [`PacketIndexWriter::allocate_append`].
///
/// A slot is consumed by exactly one [`PacketIndexWriter::write_at`].
#[derive(Debug)]
pub struct IndexSlot {
    path: QuadtreePath,
    record: u64,
}

impl IndexSlot {
    /// Path the slot was reserved for.
    pub const fn path(&self) -> QuadtreePath {
        self.path
    }

    /// Record number of the slot.
    pub const fn record(&self) -> u64 {
        self.record
    }
}

struct WriterState {
    file: Option<Arc<File>>,
    next_record: u64,
    written: u64,
    order: WriteOrder,
}

/// Append-only writer for a packet index.
///
/// Records go to `<index>.tmp`. Any number of threads may append: record
/// numbers and order statistics are updated under one lock, and the record
/// bytes are written outside it. [`close`](Self::close) finalizes the
/// temporary file into a preorder-sorted index at the final path.
pub struct PacketIndexWriter {
    index_path: PathBuf,
    temp_path: PathBuf,
    header: IndexHeader,
    min_sort_buffer: usize,
    merge_read_batch: usize,
    state: Mutex<WriterState>,
}

impl PacketIndexWriter {
    /// Create an index at `index_path`.
    ///
    /// Any existing index at that path is deleted first, so an interrupted
    /// writer never leaves a valid-looking index behind.
    pub fn create<P: AsRef<Path>>(index_path: P, has_payload_checksum: bool) -> Result<Self> {
        let index_path = index_path.as_ref().to_path_buf();
        let temp_path = with_suffix(&index_path, TEMP_SUFFIX);

        match fs::remove_file(&index_path) {
            Ok(()) => debug!("Removed stale index {}", index_path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;

        let header = IndexHeader::new(has_payload_checksum);
        write_all_at(&file, &header.to_bytes()?, 0)?;

        Ok(Self {
            index_path,
            temp_path,
            header,
            min_sort_buffer: DEFAULT_MIN_SORT_BUFFER,
            merge_read_batch: DEFAULT_MERGE_READ_BATCH,
            state: Mutex::new(WriterState {
                file: Some(Arc::new(file)),
                next_record: 0,
                written: 0,
                order: WriteOrder::default(),
            }),
        })
    }

    /// Set the floor applied to the sort budget on close.
    #[must_use]
    pub fn with_min_sort_buffer(mut self, bytes: usize) -> Self {
        self.min_sort_buffer = bytes;
        self
    }

    /// Set the records buffered per source when merging runs.
    #[must_use]
    pub fn with_merge_read_batch(mut self, records: usize) -> Self {
        self.merge_read_batch = records;
        self
    }

    /// Final index path.
    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    /// Header written to the index.
    pub const fn header(&self) -> &IndexHeader {
        &self.header
    }

    /// Records allocated so far.
    pub fn entry_count(&self) -> u64 {
        self.state.lock().next_record
    }

    /// Whether all records so far arrived in preorder.
    pub fn is_preorder(&self) -> bool {
        self.state.lock().order.is_preorder()
    }

    /// Whether every level so far arrived as one ordered run.
    pub fn is_level_ordered(&self) -> bool {
        self.state.lock().order.is_level_ordered()
    }

    /// Reserve the next record slot for `path`.
    pub fn allocate_append(&self, path: QuadtreePath) -> Result<IndexSlot> {
        let mut state = self.state.lock();
        if state.file.is_none() {
            return Err(StorageError::ClosedWriter(self.index_path.clone()));
        }
        let record = state.next_record;
        state.next_record += 1;
        state.order.update(path, record);
        Ok(IndexSlot { path, record })
    }

    /// Fill a slot reserved by [`allocate_append`](Self::allocate_append).
    ///
    /// Every allocated slot must be written before [`close`](Self::close).
    pub fn write_at(&self, slot: IndexSlot, position: u64, size: u32, extra: u32) -> Result<()> {
        self.fill_slot(&slot, position, size, extra)
    }

    /// Write a slot without consuming it, so a failed write can be retried.
    pub(crate) fn fill_slot(
        &self,
        slot: &IndexSlot,
        position: u64,
        size: u32,
        extra: u32,
    ) -> Result<()> {
        let file = self.open_file()?;
        let entry = PacketIndexEntry::new(slot.path, position, size, extra);
        write_all_at(&file, &entry.encode(), record_offset(slot.record))?;
        self.state.lock().written += 1;
        Ok(())
    }

    /// Allocate and write one record.
    pub fn write_append(&self, entry: &PacketIndexEntry) -> Result<()> {
        let slot = self.allocate_append(entry.path)?;
        self.write_at(slot, entry.position, entry.size, entry.extra)
    }

    fn open_file(&self) -> Result<Arc<File>> {
        self.state
            .lock()
            .file
            .clone()
            .ok_or_else(|| StorageError::ClosedWriter(self.index_path.clone()))
    }

    /// Finalize the index using at most `max_sort_buffer` bytes for sorting.
    ///
    /// The cheapest sufficient strategy is chosen: a rename when the
    /// records are already in preorder, a merge of per-level runs when
    /// each level arrived in order, otherwise an external sort.
    ///
    /// Fails with [`StorageError::IncompleteIndex`] if any allocated slot
    /// was never written. No index is produced in that case.
    pub fn close(&self, max_sort_buffer: usize) -> Result<Finalization> {
        let (file, order, count, written) = {
            let mut state = self.state.lock();
            let file = state
                .file
                .take()
                .ok_or_else(|| StorageError::ClosedWriter(self.index_path.clone()))?;
            (file, state.order.clone(), state.next_record, state.written)
        };
        file.sync_all()?;
        drop(file);
        if written != count {
            warn!(
                "Index {} closed with {} unwritten slots",
                self.index_path.display(),
                count.saturating_sub(written)
            );
            remove_scratch(&self.temp_path);
            return Err(StorageError::IncompleteIndex {
                path: self.index_path.clone(),
                allocated: count,
                written,
            });
        }

        let finalization = if count == 0 {
            fs::rename(&self.temp_path, &self.index_path)?;
            Finalization::Empty
        } else if order.is_preorder() {
            fs::rename(&self.temp_path, &self.index_path)?;
            Finalization::AlreadySorted
        } else if order.is_level_ordered() {
            let regions = order.level_regions();
            merge_regions(
                &self.temp_path,
                &regions,
                &self.index_path,
                &self.header,
                self.merge_read_batch,
            )?;
            remove_scratch(&self.temp_path);
            Finalization::LevelMerge {
                regions: regions.len(),
            }
        } else {
            let finalization = external_sort(
                &self.temp_path,
                &self.index_path,
                &self.header,
                count,
                max_sort_buffer,
                self.min_sort_buffer,
                self.merge_read_batch,
            )?;
            remove_scratch(&self.temp_path);
            finalization
        };

        debug!(
            "Finalized index {} ({} records): {:?}",
            self.index_path.display(),
            count,
            finalization
        );
        Ok(finalization)
    }
}

impl Drop for PacketIndexWriter {
    fn drop(&mut self) {
        if self.state.get_mut().file.is_some() {
            warn!(
                "Index writer for {} dropped without close",
                self.index_path.display()
            );
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::index::PacketIndexReader;
    use pretty_assertions::assert_eq;

    fn path(s: &str) -> QuadtreePath {
        s.parse().unwrap()
    }

    fn read_all(index: &Path) -> Vec<PacketIndexEntry> {
        let reader = PacketIndexReader::open(index).unwrap();
        let mut out = Vec::new();
        while let Some(entry) = reader.read_next().unwrap() {
            out.push(entry);
        }
        reader.close().unwrap();
        out
    }

    #[test]
    fn test_empty_index() {
        let dir = tempfile::tempdir().unwrap();
        let index = dir.path().join("pack.idx");
        let writer = PacketIndexWriter::create(&index, false).unwrap();
        assert_eq!(writer.close(1024).unwrap(), Finalization::Empty);

        let reader = PacketIndexReader::open(&index).unwrap();
        assert_eq!(reader.num_records(), 0);
        assert!(reader.read_next().unwrap().is_none());
        reader.close().unwrap();
        assert!(!dir.path().join("pack.idx.tmp").exists());
    }

    #[test]
    fn test_level_ordered_merge() {
        let dir = tempfile::tempdir().unwrap();
        let index = dir.path().join("pack.idx");
        let writer = PacketIndexWriter::create(&index, true).unwrap();
        for (i, p) in ["1", "3", "02", "20", "21", "333"].iter().enumerate() {
            writer
                .write_append(&PacketIndexEntry::new(path(p), i as u64, 1, 0))
                .unwrap();
        }
        assert!(!writer.is_preorder());
        assert!(writer.is_level_ordered());
        assert_eq!(writer.entry_count(), 6);
        assert_eq!(
            writer.close(1024).unwrap(),
            Finalization::LevelMerge { regions: 3 }
        );

        let keys: Vec<String> = read_all(&index).iter().map(|e| e.path.to_string()).collect();
        assert_eq!(keys, vec!["02", "1", "20", "21", "3", "333"]);
        assert!(!dir.path().join("pack.idx.tmp").exists());
    }

    #[test]
    fn test_in_memory_sort() {
        let dir = tempfile::tempdir().unwrap();
        let index = dir.path().join("pack.idx");
        let writer = PacketIndexWriter::create(&index, false).unwrap();
        for (i, p) in ["3", "00", "1", "01"].iter().enumerate() {
            writer
                .write_append(&PacketIndexEntry::new(path(p), i as u64, 1, 0))
                .unwrap();
        }
        assert!(!writer.is_level_ordered());
        assert_eq!(writer.close(1 << 20).unwrap(), Finalization::InMemorySort);

        let keys: Vec<String> = read_all(&index).iter().map(|e| e.path.to_string()).collect();
        assert_eq!(keys, vec!["00", "01", "1", "3"]);
        assert!(!dir.path().join("pack.idx.sort.tmp").exists());
    }

    #[test]
    fn test_closed_writer() {
        let dir = tempfile::tempdir().unwrap();
        let index = dir.path().join("pack.idx");
        let writer = PacketIndexWriter::create(&index, false).unwrap();
        let slot = writer.allocate_append(path("0")).unwrap();
        writer.write_at(slot, 0, 10, 0).unwrap();
        writer.close(1024).unwrap();

        assert!(matches!(
            writer.allocate_append(path("1")),
            Err(StorageError::ClosedWriter(_))
        ));
        assert!(matches!(writer.close(1024), Err(StorageError::ClosedWriter(_))));
    }

    #[test]
    fn test_unwritten_slot_fails_close() {
        let dir = tempfile::tempdir().unwrap();
        let index = dir.path().join("pack.idx");
        let writer = PacketIndexWriter::create(&index, false).unwrap();
        writer
            .write_append(&PacketIndexEntry::new(path("0"), 0, 10, 0))
            .unwrap();
        let abandoned = writer.allocate_append(path("1")).unwrap();
        drop(abandoned);

        match writer.close(1024) {
            Err(StorageError::IncompleteIndex {
                allocated, written, ..
            }) => {
                assert_eq!(allocated, 2);
                assert_eq!(written, 1);
            }
            other => panic!("expected incomplete index, got {other:?}"),
        }
        assert!(!index.exists());
        assert!(!dir.path().join("pack.idx.tmp").exists());
    }

    #[test]
    fn test_stale_index_removed_on_create() {
        let dir = tempfile::tempdir().unwrap();
        let index = dir.path().join("pack.idx");
        std::fs::write(&index, b"old index").unwrap();

        let writer = PacketIndexWriter::create(&index, false).unwrap();
        assert!(!index.exists());
        drop(writer);
        assert!(!index.exists());
    }

    #[test]
    fn test_allocate_then_write_out_of_order() {
        let dir = tempfile::tempdir().unwrap();
        let index = dir.path().join("pack.idx");
        let writer = PacketIndexWriter::create(&index, false).unwrap();
        let first = writer.allocate_append(path("0")).unwrap();
        let second = writer.allocate_append(path("1")).unwrap();
        assert_eq!(second.record(), 1);
        writer.write_at(second, 200, 20, 1).unwrap();
        writer.write_at(first, 100, 10, 0).unwrap();
        assert_eq!(writer.close(1024).unwrap(), Finalization::AlreadySorted);

        let entries = read_all(&index);
        assert_eq!(entries[0].position, 100);
        assert_eq!(entries[1].extra, 1);
    }
}
