//! Whole-file layout of a packet index built from the public API.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use binrw::BinWrite;
use binrw::io::Cursor;
use geopack_formats::index::{record_count, record_offset};
use geopack_formats::{
    FormatError, INDEX_HEADER_SIZE, IndexHeader, PacketIndexEntry, QuadtreePath, RECORD_SIZE,
};
use pretty_assertions::assert_eq;

fn build_index(entries: &[PacketIndexEntry]) -> Vec<u8> {
    let mut cursor = Cursor::new(IndexHeader::new(true).to_bytes().unwrap().to_vec());
    cursor.set_position(INDEX_HEADER_SIZE as u64);
    for entry in entries {
        entry.write_le(&mut cursor).unwrap();
    }
    cursor.into_inner()
}

#[test]
fn records_are_addressable_by_number() {
    let entries: Vec<PacketIndexEntry> = (0..8u32)
        .map(|i| {
            let path = QuadtreePath::from_level_row_col(3, i, 7 - i).unwrap();
            PacketIndexEntry::new(path, u64::from(i) * 1000, 996 + 4, i)
        })
        .collect();
    let data = build_index(&entries);

    assert_eq!(data.len(), INDEX_HEADER_SIZE + entries.len() * RECORD_SIZE);
    assert_eq!(record_count(data.len() as u64), 8);

    let header = IndexHeader::from_bytes(&data).unwrap();
    assert!(header.has_payload_checksum());

    for (i, expected) in entries.iter().enumerate() {
        let start = record_offset(i as u64) as usize;
        let entry = PacketIndexEntry::decode(&data[start..start + RECORD_SIZE]).unwrap();
        assert_eq!(&entry, expected);
        assert_eq!(entry.path.level_row_col(), (3, i as u32, 7 - i as u32));
    }
}

#[test]
fn noncanonical_path_with_valid_crc_is_rejected() {
    let mut record = PacketIndexEntry::new("1".parse().unwrap(), 0, 0, 0).encode();
    // Set a branch bit below level 1, then fix up the checksum
    record[7] |= 0x01;
    let crc = geopack_formats::crc32(&record[..24]);
    record[24..].copy_from_slice(&crc.to_le_bytes());

    assert!(matches!(
        PacketIndexEntry::decode(&record),
        Err(FormatError::InvalidPath(_))
    ));
}
