//! Bundle writer

use super::header::{BundleHeader, SegmentInfo};
use super::{BUNDLE_HEADER_NAME, locate, segment_name};
use crate::io::write_all_at;
use crate::{Result, StorageError};
use geopack_formats::BundleAddr;
use geopack_formats::checksum::{CRC_SIZE, crc32};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

struct Segment {
    name: String,
    start: u64,
    size: u64,
    file: Arc<File>,
}

struct BundleState {
    segments: Vec<Segment>,
    closed: bool,
}

/// Append-only writer for a payload bundle.
///
/// Space is reserved with [`allocate`](Self::allocate) under a lock and
/// filled with [`write_at`](Self::write_at) outside it, so several
/// threads can append to one bundle.
pub struct BundleWriter {
    dir: PathBuf,
    segment_break: u64,
    state: Mutex<BundleState>,
}

impl BundleWriter {
    /// Create a bundle in `dir`, creating the directory if needed.
    pub fn create<P: AsRef<Path>>(dir: P, segment_break: u64) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let first = Self::open_segment(&dir, 0, 0)?;
        debug!(
            "Created bundle {} with segment break {}",
            dir.display(),
            segment_break
        );

        Ok(Self {
            dir,
            segment_break: segment_break.max(1),
            state: Mutex::new(BundleState {
                segments: vec![first],
                closed: false,
            }),
        })
    }

    fn open_segment(dir: &Path, index: usize, start: u64) -> Result<Segment> {
        let name = segment_name(index);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(dir.join(&name))?;
        Ok(Segment {
            name,
            start,
            size: 0,
            file: Arc::new(file),
        })
    }

    /// Bundle directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Bytes allocated so far across all segments.
    pub fn total_size(&self) -> u64 {
        let state = self.state.lock();
        state
            .segments
            .last()
            .map_or(0, |segment| segment.start + segment.size)
    }

    /// Reserve `size` bytes and return their global position.
    pub fn allocate(&self, size: u64) -> Result<u64> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(StorageError::ClosedWriter(self.dir.clone()));
        }

        let (index, start, used) = match state.segments.last() {
            Some(segment) => (state.segments.len() - 1, segment.start, segment.size),
            None => return Err(StorageError::Bundle("bundle has no segments".to_string())),
        };
        if used > 0 && used + size > self.segment_break {
            let segment = Self::open_segment(&self.dir, index + 1, start + used)?;
            debug!("Bundle {} rolled over to {}", self.dir.display(), segment.name);
            state.segments.push(segment);
        }

        let segment = state
            .segments
            .last_mut()
            .ok_or_else(|| StorageError::Bundle("bundle has no segments".to_string()))?;
        let position = segment.start + segment.size;
        segment.size += size;
        Ok(position)
    }

    /// Write `data` at a previously allocated position.
    pub fn write_at(&self, position: u64, data: &[u8]) -> Result<()> {
        let (file, offset) = {
            let state = self.state.lock();
            if state.closed {
                return Err(StorageError::ClosedWriter(self.dir.clone()));
            }
            let starts: Vec<u64> = state.segments.iter().map(|s| s.start).collect();
            let sizes: Vec<u64> = state.segments.iter().map(|s| s.size).collect();
            let index = locate(&starts, &sizes, position, data.len() as u64)?;
            let segment = &state.segments[index];
            (Arc::clone(&segment.file), position - segment.start)
        };
        write_all_at(&file, data, offset)?;
        Ok(())
    }

    /// Allocate and write `data` without a checksum.
    pub fn append(&self, data: &[u8]) -> Result<BundleAddr> {
        let size = stored_size(data.len())?;
        let addr = BundleAddr::new(self.allocate(u64::from(size))?, size);
        self.write_at(addr.position, data)?;
        Ok(addr)
    }

    /// Allocate and write `payload` followed by its CRC32.
    pub fn append_with_checksum(&self, payload: &[u8]) -> Result<BundleAddr> {
        let size = stored_size(payload.len() + CRC_SIZE)?;
        let addr = BundleAddr::new(self.allocate(u64::from(size))?, size);
        self.write_with_checksum_at(addr, payload)?;
        Ok(addr)
    }

    /// Write `payload` followed by its CRC32 into an allocated address.
    ///
    /// `addr.size` must equal the payload length plus the checksum.
    pub fn write_with_checksum_at(&self, addr: BundleAddr, payload: &[u8]) -> Result<()> {
        if addr.size as usize != payload.len() + CRC_SIZE {
            return Err(StorageError::AllocationMismatch(format!(
                "allocated {} bytes at {} for a {} byte payload with checksum",
                addr.size,
                addr.position,
                payload.len()
            )));
        }
        let mut buf = Vec::with_capacity(payload.len() + CRC_SIZE);
        buf.extend_from_slice(payload);
        buf.extend_from_slice(&crc32(payload).to_le_bytes());
        self.write_at(addr.position, &buf)
    }

    /// Sync all segments and write the bundle header.
    pub fn close(&self) -> Result<BundleHeader> {
        let segments = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(StorageError::ClosedWriter(self.dir.clone()));
            }
            state.closed = true;
            std::mem::take(&mut state.segments)
        };

        for segment in &segments {
            segment.file.sync_all()?;
        }

        let header = BundleHeader {
            segment_break: self.segment_break,
            segments: segments
                .iter()
                .map(|s| SegmentInfo {
                    name: s.name.clone(),
                    size: s.size,
                })
                .collect(),
        };
        fs::write(self.dir.join(BUNDLE_HEADER_NAME), header.to_bytes()?)?;
        debug!(
            "Closed bundle {} with {} segments",
            self.dir.display(),
            header.segments.len()
        );
        Ok(header)
    }
}

fn stored_size(len: usize) -> Result<u32> {
    u32::try_from(len)
        .map_err(|_| StorageError::Bundle(format!("payload of {len} bytes is too large")))
}

impl Drop for BundleWriter {
    fn drop(&mut self) {
        if !self.state.get_mut().closed {
            warn!("Bundle writer for {} dropped without close", self.dir.display());
        }
    }
}
