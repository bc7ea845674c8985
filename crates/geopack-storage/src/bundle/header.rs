//! Bundle header file (`bundle.hdr`)
//!
//! ```text
//! signature      [u8; 10]  "GeoBundle\0"
//! version        u32 LE
//! segment_count  u32 LE
//! segment_break  u64 LE
//! segments       segment_count x { name_len u16, name, size u64 }
//! crc            u32 LE    CRC32 of everything above
//! ```

use crate::{Result, StorageError};
use binrw::io::Cursor;
use binrw::{BinRead, BinWrite};
use geopack_formats::checksum::{CRC_SIZE, append_crc, verify_trailing_crc};

/// Signature at the start of every bundle header.
pub const BUNDLE_SIGNATURE: [u8; 10] = *b"GeoBundle\0";

/// Bundle header version written by this crate.
pub const BUNDLE_FORMAT_VERSION: u32 = 1;

/// One data segment of a bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    /// File name inside the bundle directory
    pub name: String,
    /// Bytes of payload data in the segment
    pub size: u64,
}

#[derive(Debug, BinRead, BinWrite)]
#[brw(little)]
struct RawSegment {
    name_len: u16,
    #[br(count = name_len)]
    name: Vec<u8>,
    size: u64,
}

#[derive(Debug, BinRead, BinWrite)]
#[brw(little)]
struct RawBundleHeader {
    signature: [u8; 10],
    version: u32,
    segment_count: u32,
    segment_break: u64,
    #[br(count = segment_count)]
    segments: Vec<RawSegment>,
}

/// Parsed bundle header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleHeader {
    /// Segment rollover size the bundle was written with
    pub segment_break: u64,
    /// Segments in position order
    pub segments: Vec<SegmentInfo>,
}

impl BundleHeader {
    /// Serialize with a trailing checksum.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let segments = self
            .segments
            .iter()
            .map(|s| {
                let name_len = u16::try_from(s.name.len()).map_err(|_| {
                    StorageError::Bundle(format!("segment name too long: {}", s.name))
                })?;
                Ok(RawSegment {
                    name_len,
                    name: s.name.as_bytes().to_vec(),
                    size: s.size,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let raw = RawBundleHeader {
            signature: BUNDLE_SIGNATURE,
            version: BUNDLE_FORMAT_VERSION,
            segment_count: u32::try_from(segments.len())
                .map_err(|_| StorageError::Bundle("too many segments".to_string()))?,
            segment_break: self.segment_break,
            segments,
        };

        let mut cursor = Cursor::new(Vec::new());
        raw.write(&mut cursor)?;
        let mut data = cursor.into_inner();
        append_crc(&mut data);
        Ok(data)
    }

    /// Parse and validate: signature, then checksum, then version.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if !data.starts_with(&BUNDLE_SIGNATURE) {
            return Err(StorageError::InvalidFormat(
                "bad bundle header signature".to_string(),
            ));
        }
        if data.len() < BUNDLE_SIGNATURE.len() + CRC_SIZE {
            return Err(StorageError::TruncatedData {
                expected: BUNDLE_SIGNATURE.len() + CRC_SIZE,
                actual: data.len(),
            });
        }
        let body = verify_trailing_crc(data).map_err(|m| StorageError::CorruptHeader {
            stored: m.stored,
            computed: m.computed,
        })?;

        let raw = RawBundleHeader::read(&mut Cursor::new(body))?;
        if raw.version != BUNDLE_FORMAT_VERSION {
            return Err(StorageError::VersionMismatch {
                expected: BUNDLE_FORMAT_VERSION,
                found: raw.version,
            });
        }

        let segments = raw
            .segments
            .into_iter()
            .map(|s| {
                String::from_utf8(s.name)
                    .map(|name| SegmentInfo { name, size: s.size })
                    .map_err(|e| StorageError::InvalidFormat(format!("segment name: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            segment_break: raw.segment_break,
            segments,
        })
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> BundleHeader {
        BundleHeader {
            segment_break: 4096,
            segments: vec![
                SegmentInfo {
                    name: "bundle.0000".to_string(),
                    size: 4000,
                },
                SegmentInfo {
                    name: "bundle.0001".to_string(),
                    size: 12,
                },
            ],
        }
    }

    #[test]
    fn test_header_bytes() {
        let data = sample().to_bytes().unwrap();
        assert_eq!(&data[..10], b"GeoBundle\0");
        // signature + version + count + break + 2 x (2 + 11 + 8) + crc
        assert_eq!(data.len(), 10 + 4 + 4 + 8 + 2 * 21 + 4);
        assert_eq!(BundleHeader::from_bytes(&data).unwrap(), sample());
    }

    #[test]
    fn test_corrupt_header() {
        let mut data = sample().to_bytes().unwrap();
        data[30] ^= 0x20;
        assert!(matches!(
            BundleHeader::from_bytes(&data),
            Err(StorageError::CorruptHeader { .. })
        ));

        let mut data = sample().to_bytes().unwrap();
        data[0] = b'X';
        assert!(matches!(
            BundleHeader::from_bytes(&data),
            Err(StorageError::InvalidFormat(_))
        ));
    }
}
