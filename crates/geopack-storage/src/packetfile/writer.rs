//! Packet file writer

use crate::bundle::BundleWriter;
use crate::config::PacketFileConfig;
use crate::index::{Finalization, IndexSlot, PacketIndexWriter};
use crate::{INDEX_FILE_NAME, Result, StorageError};
use geopack_formats::checksum::CRC_SIZE;
use geopack_formats::{BundleAddr, PacketIndexEntry, QuadtreePath};
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Space reserved in both the bundle and the index for one packet.
///
/// Returned by [`PacketFileWriter::allocate_append`] and consumed by
/// [`PacketFileWriter::write_at`].
#[derive(Debug)]
pub struct Allocation {
    addr: BundleAddr,
    slot: IndexSlot,
    extra: u32,
}

impl Allocation {
    /// Bundle address reserved for the payload.
    pub const fn addr(&self) -> BundleAddr {
        self.addr
    }

    /// Path the allocation was made for.
    pub const fn path(&self) -> QuadtreePath {
        self.slot.path()
    }

    /// Extra tag recorded in the index entry.
    pub const fn extra(&self) -> u32 {
        self.extra
    }

    /// Set the extra tag recorded in the index entry.
    #[must_use]
    pub fn with_extra(mut self, extra: u32) -> Self {
        self.extra = extra;
        self
    }
}

/// A failed [`PacketFileWriter::write_at`].
///
/// Carries the allocation back so the write can be retried. An allocation
/// that is dropped unwritten makes [`PacketFileWriter::close`] fail with
/// [`StorageError::IncompleteIndex`].
#[derive(Debug, Error)]
#[error("{error}")]
pub struct RejectedWrite {
    #[source]
    error: StorageError,
    allocation: Allocation,
}

impl RejectedWrite {
    /// Why the write failed.
    pub const fn error(&self) -> &StorageError {
        &self.error
    }

    /// Take back the allocation for another attempt.
    pub fn into_allocation(self) -> Allocation {
        self.allocation
    }

    /// Split into the error and the allocation.
    pub fn into_parts(self) -> (StorageError, Allocation) {
        (self.error, self.allocation)
    }
}

impl From<RejectedWrite> for StorageError {
    fn from(rejected: RejectedWrite) -> Self {
        rejected.error
    }
}

/// Writes payloads to a bundle and their entries to a packet index.
///
/// The directory ends up holding `pack.idx`, `bundle.hdr` and the bundle
/// segments.
pub struct PacketFileWriter {
    dir: PathBuf,
    config: PacketFileConfig,
    bundle: BundleWriter,
    index: PacketIndexWriter,
    alloc_lock: Mutex<()>,
}

impl PacketFileWriter {
    /// Create a packet file in `dir`.
    pub fn create<P: AsRef<Path>>(dir: P, config: PacketFileConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let bundle = BundleWriter::create(&dir, config.segment_break)?;
        let index = PacketIndexWriter::create(dir.join(INDEX_FILE_NAME), config.payload_checksums)?
            .with_min_sort_buffer(config.min_sort_buffer)
            .with_merge_read_batch(config.read_batch());

        debug!("Created packet file {}", dir.display());
        Ok(Self {
            dir,
            config,
            bundle,
            index,
            alloc_lock: Mutex::new(()),
        })
    }

    /// Packet file directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Configuration the writer was created with.
    pub const fn config(&self) -> &PacketFileConfig {
        &self.config
    }

    /// Index writer, for order statistics.
    pub const fn index(&self) -> &PacketIndexWriter {
        &self.index
    }

    /// Bytes stored for a payload of `payload_len` bytes.
    pub fn stored_size(&self, payload_len: usize) -> Result<u32> {
        let len = if self.config.payload_checksums {
            payload_len + CRC_SIZE
        } else {
            payload_len
        };
        u32::try_from(len)
            .map_err(|_| StorageError::Bundle(format!("payload of {len} bytes is too large")))
    }

    /// Reserve bundle space and an index slot for a payload.
    ///
    /// Both reservations happen under one lock, so no other allocation can
    /// land between them.
    pub fn allocate_append(&self, path: QuadtreePath, payload_len: usize) -> Result<Allocation> {
        let size = self.stored_size(payload_len)?;
        let _guard = self.alloc_lock.lock();
        let position = self.bundle.allocate(u64::from(size))?;
        let slot = self.index.allocate_append(path)?;
        Ok(Allocation {
            addr: BundleAddr::new(position, size),
            slot,
            extra: 0,
        })
    }

    /// Write the payload and index entry for an allocation.
    ///
    /// On failure the allocation is handed back inside the error.
    pub fn write_at(
        &self,
        path: QuadtreePath,
        payload: &[u8],
        allocation: Allocation,
    ) -> std::result::Result<(), RejectedWrite> {
        match self.fill(path, payload, &allocation) {
            Ok(()) => Ok(()),
            Err(error) => Err(RejectedWrite { error, allocation }),
        }
    }

    fn fill(&self, path: QuadtreePath, payload: &[u8], allocation: &Allocation) -> Result<()> {
        if path != allocation.path() {
            return Err(StorageError::AllocationMismatch(format!(
                "allocation for {} written as {}",
                allocation.path(),
                path
            )));
        }
        let addr = allocation.addr;
        if self.stored_size(payload.len())? != addr.size {
            return Err(StorageError::AllocationMismatch(format!(
                "allocation of {} bytes for {} written with {} bytes",
                addr.size,
                path,
                payload.len()
            )));
        }

        if self.config.payload_checksums {
            self.bundle.write_with_checksum_at(addr, payload)?;
        } else {
            self.bundle.write_at(addr.position, payload)?;
        }
        self.index
            .fill_slot(&allocation.slot, addr.position, addr.size, allocation.extra)
    }

    /// Allocate and write one packet.
    pub fn write_append(&self, path: QuadtreePath, payload: &[u8]) -> Result<BundleAddr> {
        let allocation = self.allocate_append(path, payload.len())?;
        let addr = allocation.addr();
        self.write_at(path, payload, allocation)?;
        Ok(addr)
    }

    /// Index an already written payload under another path.
    pub fn write_duplicate(&self, path: QuadtreePath, addr: BundleAddr, extra: u32) -> Result<()> {
        if addr.end() > self.bundle.total_size() {
            return Err(StorageError::Bundle(format!(
                "duplicate of {path} points past the end of the bundle at {}",
                addr.position
            )));
        }
        self.index
            .write_append(&PacketIndexEntry::new(path, addr.position, addr.size, extra))
    }

    /// Close the bundle, then finalize the index.
    pub fn close(&self) -> Result<Finalization> {
        self.bundle.close()?;
        self.index.close(self.config.max_sort_buffer)
    }
}
