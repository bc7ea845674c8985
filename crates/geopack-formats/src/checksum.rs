//! CRC32 helpers shared by index records, headers and payloads
//!
//! All checksums are IEEE CRC32 stored as 4 little-endian bytes directly
//! after the bytes they cover.

/// Size of a stored checksum in bytes.
pub const CRC_SIZE: usize = 4;

/// Compute the CRC32 of `data`.
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Append the CRC32 of `buf` to its end.
pub fn append_crc(buf: &mut Vec<u8>) {
    let crc = crc32(buf);
    buf.extend_from_slice(&crc.to_le_bytes());
}

/// Outcome of checking a buffer that ends with a stored CRC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrcMismatch {
    /// Checksum found in the trailing bytes
    pub stored: u32,
    /// Checksum computed over the covered bytes
    pub computed: u32,
}

/// Split `data` into its covered bytes and verify the trailing CRC.
///
/// Returns the covered bytes on success. Buffers shorter than
/// [`CRC_SIZE`] are reported as a mismatch against a stored value of 0.
pub fn verify_trailing_crc(data: &[u8]) -> Result<&[u8], CrcMismatch> {
    let Some(split) = data.len().checked_sub(CRC_SIZE) else {
        return Err(CrcMismatch {
            stored: 0,
            computed: crc32(data),
        });
    };
    let (body, tail) = data.split_at(split);
    let mut stored = [0u8; CRC_SIZE];
    stored.copy_from_slice(tail);
    let stored = u32::from_le_bytes(stored);
    let computed = crc32(body);
    if stored == computed {
        Ok(body)
    } else {
        Err(CrcMismatch { stored, computed })
    }
}
