//! Packet index file header
//!
//! ```text
//! signature       [u8; 10]   "GeoPackIdx"
//! format_version  u16 LE
//! has_checksum    u16 LE     1 if payloads carry a trailing CRC32
//! header_crc      u32 LE     CRC32 of the 14 bytes above
//! ```

use crate::checksum::crc32;
use crate::error::{FormatError, Result};
use binrw::io::Cursor;
use binrw::{BinRead, BinWrite};

/// Signature at the start of every packet index file.
pub const INDEX_SIGNATURE: [u8; 10] = *b"GeoPackIdx";

/// Index format version written by this crate.
pub const INDEX_FORMAT_VERSION: u16 = 1;

/// Serialized header size in bytes.
pub const INDEX_HEADER_SIZE: usize = 18;

/// On-disk layout of the header.
#[derive(Debug, Clone, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
struct RawIndexHeader {
    signature: [u8; 10],
    format_version: u16,
    has_checksum: u16,
    header_crc: u32,
}

impl RawIndexHeader {
    fn compute_crc(&self) -> u32 {
        let mut covered = [0u8; INDEX_HEADER_SIZE - 4];
        covered[..10].copy_from_slice(&self.signature);
        covered[10..12].copy_from_slice(&self.format_version.to_le_bytes());
        covered[12..14].copy_from_slice(&self.has_checksum.to_le_bytes());
        crc32(&covered)
    }
}

/// Validated packet index header.
///
/// Created once when an index file is created and never modified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexHeader {
    format_version: u16,
    has_payload_checksum: bool,
}

impl IndexHeader {
    /// Header for a new index at the current format version.
    pub const fn new(has_payload_checksum: bool) -> Self {
        Self {
            format_version: INDEX_FORMAT_VERSION,
            has_payload_checksum,
        }
    }

    /// Format version recorded in the file.
    pub const fn format_version(&self) -> u16 {
        self.format_version
    }

    /// Whether payloads referenced by this index end in a CRC32.
    pub const fn has_payload_checksum(&self) -> bool {
        self.has_payload_checksum
    }

    /// Serialize with a freshly computed header checksum.
    pub fn to_bytes(&self) -> Result<[u8; INDEX_HEADER_SIZE]> {
        let mut raw = RawIndexHeader {
            signature: INDEX_SIGNATURE,
            format_version: self.format_version,
            has_checksum: u16::from(self.has_payload_checksum),
            header_crc: 0,
        };
        raw.header_crc = raw.compute_crc();

        let mut out = [0u8; INDEX_HEADER_SIZE];
        raw.write(&mut Cursor::new(&mut out[..]))?;
        Ok(out)
    }

    /// Parse and validate a header.
    ///
    /// Checks run in order: signature, checksum, version.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < INDEX_HEADER_SIZE {
            return Err(FormatError::TruncatedData {
                expected: INDEX_HEADER_SIZE,
                actual: data.len(),
            });
        }

        let raw = RawIndexHeader::read(&mut Cursor::new(&data[..INDEX_HEADER_SIZE]))?;

        if raw.signature != INDEX_SIGNATURE {
            return Err(FormatError::InvalidFormat(format!(
                "bad index signature {:?}",
                String::from_utf8_lossy(&raw.signature)
            )));
        }

        let computed = raw.compute_crc();
        if computed != raw.header_crc {
            return Err(FormatError::CorruptHeader {
                stored: raw.header_crc,
                computed,
            });
        }

        if raw.format_version != INDEX_FORMAT_VERSION {
            return Err(FormatError::VersionMismatch {
                expected: INDEX_FORMAT_VERSION,
                found: raw.format_version,
            });
        }

        Ok(Self {
            format_version: raw.format_version,
            has_payload_checksum: raw.has_checksum != 0,
        })
    }
}
