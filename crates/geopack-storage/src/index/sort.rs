//! External sort and region merging for index finalization.

use super::writer::Finalization;
use super::{IndexRegionSource, SortedRegion, with_suffix};
use crate::io::{read_exact_at, remove_scratch, write_all_at};
use crate::merge::Merge;
use crate::{Result, SORT_SCRATCH_SUFFIX};
use geopack_formats::index::record_offset;
use geopack_formats::{IndexHeader, PacketIndexEntry, RECORD_SIZE};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Merge sorted regions of `input` into a new index at `output`.
///
/// Returns the number of records written.
pub fn merge_regions(
    input: &Path,
    regions: &[SortedRegion],
    output: &Path,
    header: &IndexHeader,
    read_batch: usize,
) -> Result<u64> {
    debug!(
        "Merging {} sorted regions of {} into {}",
        regions.len(),
        input.display(),
        output.display()
    );

    let file = Arc::new(File::open(input)?);
    let mut merge = Merge::new(format!("regions of {}", input.display()));
    for (i, region) in regions.iter().enumerate() {
        merge.add_source(IndexRegionSource::new(
            format!("region {i}"),
            Arc::clone(&file),
            *region,
            read_batch,
        )?)?;
    }
    merge.start()?;

    let mut out = BufWriter::new(
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(output)?,
    );
    out.write_all(&header.to_bytes()?)?;

    let mut written = 0u64;
    while merge.is_active() {
        out.write_all(&merge.current()?.encode())?;
        written += 1;
        merge.advance()?;
    }
    merge.close()?;

    let out = out.into_inner().map_err(std::io::IntoInnerError::into_error)?;
    out.sync_all()?;
    Ok(written)
}

/// Sort the `count` records of `input` into a new index at `output`.
///
/// Records are sorted in chunks of at most `max_sort_buffer` bytes, each
/// chunk written as a sorted region of `<output>.sort.tmp`, and the regions
/// merged into `output`. A budget below `min_sort_buffer` (or below one
/// record) is raised to it.
pub fn external_sort(
    input: &Path,
    output: &Path,
    header: &IndexHeader,
    count: u64,
    max_sort_buffer: usize,
    min_sort_buffer: usize,
    read_batch: usize,
) -> Result<Finalization> {
    let floor = min_sort_buffer.max(RECORD_SIZE);
    let budget = if max_sort_buffer < floor {
        info!(
            "Sort buffer of {} bytes raised to minimum of {} bytes",
            max_sort_buffer, floor
        );
        floor
    } else {
        max_sort_buffer
    };
    let chunk_records = ((budget / RECORD_SIZE) as u64).clamp(1, count.max(1));

    let scratch = with_suffix(output, SORT_SCRATCH_SUFFIX);
    let source = File::open(input)?;
    let sorted = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&scratch)?;
    write_all_at(&sorted, &header.to_bytes()?, 0)?;

    let mut regions = Vec::new();
    let mut buf = Vec::with_capacity(chunk_records as usize * RECORD_SIZE);
    let mut start = 0u64;
    while start < count {
        let n = chunk_records.min(count - start);
        buf.resize(n as usize * RECORD_SIZE, 0);
        read_exact_at(&source, &mut buf, record_offset(start))?;

        let mut entries = PacketIndexEntry::decode_all(&buf)?;
        entries.sort_unstable();
        for (chunk, entry) in buf.chunks_exact_mut(RECORD_SIZE).zip(&entries) {
            chunk.copy_from_slice(&entry.encode());
        }
        write_all_at(&sorted, &buf, record_offset(start))?;

        regions.push(SortedRegion::new(start, n));
        start += n;
    }
    sorted.sync_all()?;
    drop(sorted);
    drop(source);

    debug!(
        "Sorted {} records into {} regions of up to {} records",
        count,
        regions.len(),
        chunk_records
    );

    if regions.len() == 1 {
        fs::rename(&scratch, output)?;
        return Ok(Finalization::InMemorySort);
    }

    merge_regions(&scratch, &regions, output, header, read_batch)?;
    remove_scratch(&scratch);
    Ok(Finalization::ExternalSort {
        regions: regions.len(),
    })
}
