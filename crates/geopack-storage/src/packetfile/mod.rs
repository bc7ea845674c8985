//! Packet files: one bundle plus one packet index in a directory

mod reader;
mod writer;

pub use reader::PacketFileReader;
pub use writer::{Allocation, PacketFileWriter, RejectedWrite};
