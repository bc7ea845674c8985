//! Fixed-width packet index records
//!
//! ```text
//! path      u64 LE   QuadtreePath
//! position  u64 LE   bundle position of the payload
//! size      u32 LE   payload size including any trailing CRC
//! extra     u32 LE   caller-defined tag
//! crc       u32 LE   CRC32 of the 24 bytes above
//! ```

use crate::checksum::{CRC_SIZE, crc32};
use crate::error::{FormatError, Result};
use crate::quadtree::{QUADTREE_PATH_SIZE, QuadtreePath};
use binrw::{BinRead, BinResult, BinWrite};
use std::io::{Read, Seek, Write};

/// Serialized size of one index record.
pub const RECORD_SIZE: usize = 28;

const POSITION_OFFSET: usize = QUADTREE_PATH_SIZE;
const SIZE_OFFSET: usize = POSITION_OFFSET + 8;
const EXTRA_OFFSET: usize = SIZE_OFFSET + 4;
const CRC_OFFSET: usize = EXTRA_OFFSET + 4;

/// Location of a payload inside a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BundleAddr {
    /// Global bundle position
    pub position: u64,
    /// Stored size in bytes
    pub size: u32,
}

impl BundleAddr {
    /// Create a new address.
    pub const fn new(position: u64, size: u32) -> Self {
        Self { position, size }
    }

    /// Position one past the last byte.
    pub const fn end(&self) -> u64 {
        self.position + self.size as u64
    }
}

/// One packet index record.
///
/// Ordering compares the path first so a sorted run of entries is in
/// quadtree preorder; the remaining fields only break ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PacketIndexEntry {
    /// Quadtree key
    pub path: QuadtreePath,
    /// Bundle position of the payload
    pub position: u64,
    /// Payload size in bytes
    pub size: u32,
    /// Caller-defined tag (channel id, packet file number, ...)
    pub extra: u32,
}

impl PacketIndexEntry {
    /// Create a new entry.
    pub const fn new(path: QuadtreePath, position: u64, size: u32, extra: u32) -> Self {
        Self {
            path,
            position,
            size,
            extra,
        }
    }

    /// Bundle address the entry points at.
    pub const fn addr(&self) -> BundleAddr {
        BundleAddr::new(self.position, self.size)
    }

    /// Serialize into a record, appending a fresh checksum.
    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut out = [0u8; RECORD_SIZE];
        out[..POSITION_OFFSET].copy_from_slice(&self.path.to_bytes());
        out[POSITION_OFFSET..SIZE_OFFSET].copy_from_slice(&self.position.to_le_bytes());
        out[SIZE_OFFSET..EXTRA_OFFSET].copy_from_slice(&self.size.to_le_bytes());
        out[EXTRA_OFFSET..CRC_OFFSET].copy_from_slice(&self.extra.to_le_bytes());
        let crc = crc32(&out[..CRC_OFFSET]);
        out[CRC_OFFSET..].copy_from_slice(&crc.to_le_bytes());
        out
    }

    /// Deserialize one record, verifying its checksum.
    ///
    /// The checksum is checked before the path is decoded, so any
    /// damaged byte reports [`FormatError::CorruptRecord`].
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < RECORD_SIZE {
            return Err(FormatError::TruncatedData {
                expected: RECORD_SIZE,
                actual: data.len(),
            });
        }

        let stored = u32::from_le_bytes(le_array(&data[CRC_OFFSET..RECORD_SIZE]));
        let computed = crc32(&data[..CRC_OFFSET]);
        if stored != computed {
            return Err(FormatError::CorruptRecord { stored, computed });
        }

        Ok(Self {
            path: QuadtreePath::from_bytes(&data[..POSITION_OFFSET])?,
            position: u64::from_le_bytes(le_array(&data[POSITION_OFFSET..SIZE_OFFSET])),
            size: u32::from_le_bytes(le_array(&data[SIZE_OFFSET..EXTRA_OFFSET])),
            extra: u32::from_le_bytes(le_array(&data[EXTRA_OFFSET..CRC_OFFSET])),
        })
    }

    /// Decode every record in a buffer whose length is a multiple of
    /// [`RECORD_SIZE`].
    pub fn decode_all(data: &[u8]) -> Result<Vec<Self>> {
        if data.len() % RECORD_SIZE != 0 {
            return Err(FormatError::TruncatedData {
                expected: data.len().next_multiple_of(RECORD_SIZE),
                actual: data.len(),
            });
        }
        data.chunks_exact(RECORD_SIZE).map(Self::decode).collect()
    }

    /// Payload size without the trailing checksum, when one is present.
    pub const fn payload_size(&self, has_checksum: bool) -> u32 {
        if has_checksum {
            self.size.saturating_sub(CRC_SIZE as u32)
        } else {
            self.size
        }
    }
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

impl BinRead for PacketIndexEntry {
    type Args<'a> = ();

    fn read_options<R: Read + Seek>(
        reader: &mut R,
        _endian: binrw::Endian,
        _args: Self::Args<'_>,
    ) -> BinResult<Self> {
        let mut buf = [0u8; RECORD_SIZE];
        reader.read_exact(&mut buf)?;
        Self::decode(&buf).map_err(|e| binrw::Error::Custom {
            pos: reader.stream_position().unwrap_or(0),
            err: Box::new(e),
        })
    }
}

impl BinWrite for PacketIndexEntry {
    type Args<'a> = ();

    fn write_options<W: Write + Seek>(
        &self,
        writer: &mut W,
        _endian: binrw::Endian,
        _args: Self::Args<'_>,
    ) -> BinResult<()> {
        writer.write_all(&self.encode())?;
        Ok(())
    }
}
