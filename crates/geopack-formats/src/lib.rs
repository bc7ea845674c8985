//! Binary formats for quadtree-keyed packet storage
//!
#![allow(clippy::cast_possible_truncation)] // Intentional for binary format parsing
#![allow(clippy::cast_lossless)] // Sometimes clearer than From
#![allow(clippy::module_name_repetitions)] // Clear naming is preferred
#![allow(clippy::doc_markdown)]
//! This crate holds the pure encoding side of the geopack storage engine.
//! Nothing here touches the filesystem; `geopack-storage` builds the
//! writers, readers and merge machinery on top of these types.
//!
//! # Formats
//!
//! - **Quadtree paths**: 8-byte keys ordered in preorder traversal order
//! - **Index header**: signature, version and payload-checksum flag with a
//!   header CRC32
//! - **Index records**: 28-byte `{path, position, size, extra, crc}` entries
//!
//! # Example
//!
//! ```
//! use geopack_formats::{PacketIndexEntry, QuadtreePath};
//!
//! let path: QuadtreePath = "0213".parse().unwrap();
//! let entry = PacketIndexEntry::new(path, 4096, 200, 0);
//! let bytes = entry.encode();
//! assert_eq!(PacketIndexEntry::decode(&bytes).unwrap(), entry);
//! ```

#![warn(missing_docs)]

pub mod checksum;
pub mod error;
pub mod index;
pub mod quadtree;

pub use checksum::{CRC_SIZE, crc32};
pub use error::{FormatError, Result};
pub use index::{
    BundleAddr, INDEX_FORMAT_VERSION, INDEX_HEADER_SIZE, IndexHeader, PacketIndexEntry,
    RECORD_SIZE,
};
pub use quadtree::{MAX_LEVEL, QUADTREE_PATH_SIZE, QuadtreePath};
