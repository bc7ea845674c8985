//! Append-only payload bundles
//!
//! A bundle is a directory with a header file and numbered data segments:
//!
//! ```text
//! bundle.hdr
//! bundle.0000
//! bundle.0001
//! ...
//! ```
//!
//! Positions are global across segments: segment `i` starts where segment
//! `i - 1` ends. A payload never spans two segments; a new segment is
//! started when an allocation would push a non-empty segment past the
//! segment break.

mod header;
mod reader;
mod writer;

pub use header::{BUNDLE_FORMAT_VERSION, BUNDLE_SIGNATURE, BundleHeader, SegmentInfo};
pub use reader::BundleReader;
pub use writer::BundleWriter;

use crate::{Result, StorageError};

/// Header file name inside a bundle directory.
pub const BUNDLE_HEADER_NAME: &str = "bundle.hdr";

/// File name of segment `index`.
pub fn segment_name(index: usize) -> String {
    format!("bundle.{index:04}")
}

/// Find the segment holding `[position, position + len)`.
///
/// `starts` holds each segment's first position and `sizes` its length.
fn locate(starts: &[u64], sizes: &[u64], position: u64, len: u64) -> Result<usize> {
    let index = starts.partition_point(|&start| start <= position);
    let Some(index) = index.checked_sub(1) else {
        return Err(StorageError::Bundle(format!(
            "position {position} before first segment"
        )));
    };
    let end = starts[index] + sizes[index];
    if position + len > end {
        return Err(StorageError::Bundle(format!(
            "range {position}+{len} crosses end of segment {index} at {end}"
        )));
    }
    Ok(index)
}
