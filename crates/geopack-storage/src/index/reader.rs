//! Packet index reader

use super::{IndexRegionSource, SortedRegion};
use crate::io::read_exact_at;
use crate::{Result, StorageError};
use geopack_formats::index::{record_count, record_offset};
use geopack_formats::{INDEX_HEADER_SIZE, IndexHeader, PacketIndexEntry, RECORD_SIZE};
use parking_lot::Mutex;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Reader for a finalized packet index.
///
/// The reader can be shared between threads. Each call to
/// [`read_next`](Self::read_next) claims the next record number under a
/// short lock and then reads outside it, so concurrent callers split the
/// records between them: every record is returned once, in no particular
/// assignment to threads.
///
/// Calling [`seek`](Self::seek) while other threads are reading is not
/// supported; the order in which records are then handed out is
/// unspecified.
pub struct PacketIndexReader {
    path: PathBuf,
    file: Arc<File>,
    header: IndexHeader,
    num_records: u64,
    cursor: Mutex<u64>,
    closed: bool,
}

impl PacketIndexReader {
    /// Open an index and validate its header.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let file_size = file.metadata()?.len();

        if file_size < INDEX_HEADER_SIZE as u64 {
            return Err(StorageError::TruncatedData {
                expected: INDEX_HEADER_SIZE,
                actual: file_size as usize,
            });
        }

        let mut header_bytes = [0u8; INDEX_HEADER_SIZE];
        read_exact_at(&file, &mut header_bytes, 0)?;
        let header = IndexHeader::from_bytes(&header_bytes)?;

        let num_records = record_count(file_size);
        let body = file_size - INDEX_HEADER_SIZE as u64;
        if body % RECORD_SIZE as u64 != 0 {
            warn!(
                "Index {} has {} trailing bytes after {} records",
                path.display(),
                body % RECORD_SIZE as u64,
                num_records
            );
        }

        debug!("Opened index {} with {} records", path.display(), num_records);

        Ok(Self {
            path,
            file: Arc::new(file),
            header,
            num_records,
            cursor: Mutex::new(0),
            closed: false,
        })
    }

    /// Path the reader was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Validated header.
    pub const fn header(&self) -> &IndexHeader {
        &self.header
    }

    /// Number of records, computed from the file size.
    pub const fn num_records(&self) -> u64 {
        self.num_records
    }

    /// Move the cursor to record number `record`.
    ///
    /// Seeking past the end is allowed; the next read returns `None`.
    pub fn seek(&self, record: u64) {
        *self.cursor.lock() = record;
    }

    /// Record number the next sequential read will return.
    pub fn tell(&self) -> u64 {
        *self.cursor.lock()
    }

    /// Read the record at the cursor, or `None` at the end of the index.
    pub fn read_next(&self) -> Result<Option<PacketIndexEntry>> {
        let record = {
            let mut cursor = self.cursor.lock();
            if *cursor >= self.num_records {
                return Ok(None);
            }
            let record = *cursor;
            *cursor += 1;
            record
        };
        self.read_record(record).map(Some)
    }

    /// Read up to `max` records starting at the cursor in one I/O call.
    ///
    /// Returns an empty vector at the end of the index.
    pub fn read_next_batch(&self, max: usize) -> Result<Vec<PacketIndexEntry>> {
        let (first, count) = {
            let mut cursor = self.cursor.lock();
            let count = self
                .num_records
                .saturating_sub(*cursor)
                .min(max as u64);
            let first = *cursor;
            *cursor += count;
            (first, count)
        };
        if count == 0 {
            return Ok(Vec::new());
        }

        let mut buf = vec![0u8; count as usize * RECORD_SIZE];
        read_exact_at(&self.file, &mut buf, record_offset(first))?;
        Ok(PacketIndexEntry::decode_all(&buf)?)
    }

    /// Read record number `record` without touching the cursor.
    pub fn read_record(&self, record: u64) -> Result<PacketIndexEntry> {
        if record >= self.num_records {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "record {record} out of range for {} ({} records)",
                    self.path.display(),
                    self.num_records
                ),
            )));
        }
        let mut buf = [0u8; RECORD_SIZE];
        read_exact_at(&self.file, &mut buf, record_offset(record))?;
        Ok(PacketIndexEntry::decode(&buf)?)
    }

    /// Turn the unread remainder of the index into a merge source.
    pub fn into_source(mut self, batch: usize) -> Result<IndexRegionSource> {
        let start = self.tell().min(self.num_records);
        let region = SortedRegion::new(start, self.num_records - start);
        self.closed = true;
        IndexRegionSource::new(
            self.path.display().to_string(),
            Arc::clone(&self.file),
            region,
            batch,
        )
    }

    /// Release the reader.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

impl Drop for PacketIndexReader {
    fn drop(&mut self) {
        if !self.closed {
            warn!("Index reader for {} dropped without close", self.path.display());
        }
    }
}
