//! Merge sources backed by runs of records in an index file.

use super::SortedRegion;
use crate::Result;
use crate::io::read_exact_at;
use crate::merge::MergeSource;
use geopack_formats::index::record_offset;
use geopack_formats::{PacketIndexEntry, RECORD_SIZE};
use std::collections::VecDeque;
use std::fs::File;
use std::sync::Arc;

/// Reads one [`SortedRegion`] of an index file in batches.
///
/// Several sources may share one file handle; reads are positional.
pub struct IndexRegionSource {
    name: String,
    file: Arc<File>,
    next_record: u64,
    end_record: u64,
    batch: usize,
    buffer: VecDeque<PacketIndexEntry>,
}

impl IndexRegionSource {
    /// Create a source over `region` and load its first batch.
    pub fn new(
        name: impl Into<String>,
        file: Arc<File>,
        region: SortedRegion,
        batch: usize,
    ) -> Result<Self> {
        let mut source = Self {
            name: name.into(),
            file,
            next_record: region.position,
            end_record: region.end(),
            batch: batch.max(1),
            buffer: VecDeque::new(),
        };
        source.fill()?;
        Ok(source)
    }

    /// Records not yet returned, including the current one.
    pub fn remaining(&self) -> u64 {
        self.buffer.len() as u64 + (self.end_record - self.next_record)
    }

    fn fill(&mut self) -> Result<()> {
        let n = (self.end_record - self.next_record).min(self.batch as u64);
        if n == 0 {
            return Ok(());
        }
        let mut buf = vec![0u8; n as usize * RECORD_SIZE];
        read_exact_at(&self.file, &mut buf, record_offset(self.next_record))?;
        self.buffer.extend(PacketIndexEntry::decode_all(&buf)?);
        self.next_record += n;
        Ok(())
    }
}

impl MergeSource<PacketIndexEntry> for IndexRegionSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn peek(&self) -> Option<&PacketIndexEntry> {
        self.buffer.front()
    }

    fn advance(&mut self) -> Result<bool> {
        self.buffer.pop_front();
        if self.buffer.is_empty() {
            self.fill()?;
        }
        Ok(!self.buffer.is_empty())
    }

    fn close(&mut self) -> Result<()> {
        self.buffer.clear();
        self.next_record = self.end_record;
        Ok(())
    }
}
