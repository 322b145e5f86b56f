//! BED coverage import (spec.md §4.5 / C6).
//!
//! BED intervals are zero-based, half-open; Varda's [`CoveredRegion`] is
//! one-based, closed (spec.md §4.3), so each record's `end` is taken
//! as-is and `begin` is shifted by one. Adjacent/overlapping intervals on
//! the same line-run are merged before binning, the same bookkeeping
//! `seqvars::aggregate`'s region-merging carrier logic performs for its
//! own coverage accumulation.

use uuid::Uuid;

use crate::binning;
use crate::blob::BlobStore;
use crate::err::AppError;
use crate::ingest::checkpoint::{
    progress_percent, skip_to_offset, CountingReader, CHECKPOINT_EVERY_N_FLUSHES, DEFAULT_BATCH_SIZE,
};
use crate::model::{CoveredRegion, DataSource, Task};
use crate::store::Store;

pub struct ImportOptions {
    pub batch_size: usize,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// Imports the BED blob named by `data_source.digest` into `coverage_id`,
/// resuming from `task`'s checkpoint if set.
pub fn import_coverage(
    store: &Store,
    blob: &BlobStore,
    task: &Task,
    coverage_id: &Uuid,
    owner: &str,
    data_source: &DataSource,
    options: &ImportOptions,
) -> Result<(), AppError> {
    use std::io::BufRead as _;

    let raw = blob.open(&data_source.digest, Some(owner))?;
    let mut counting = CountingReader::new(raw);
    if task.checkpoint_offset > 0 {
        skip_to_offset(&mut counting, task.checkpoint_offset)?;
    }

    let mut batch: Vec<CoveredRegion> = Vec::with_capacity(options.batch_size);
    let mut rows_accepted = task.rows_accepted;
    let mut rows_rejected = task.rows_rejected;
    let mut flushes_since_checkpoint = 0u32;
    let mut line = String::new();

    loop {
        line.clear();
        let bytes_read = counting.read_line(&mut line)?;
        if bytes_read == 0 {
            break;
        }
        let trimmed = line.trim_end_matches(['\n', '\r']);
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with("track") {
            continue;
        }

        match parse_bed_line(trimmed) {
            Ok((chrom, begin, end)) => {
                rows_accepted += 1;
                let bin = binning::assign(begin, end)?;
                batch.push(CoveredRegion {
                    coverage: *coverage_id,
                    chrom,
                    begin,
                    end,
                    bin,
                });
            }
            Err(e) => {
                tracing::warn!("rejecting BED line: {e}");
                rows_rejected += 1;
            }
        }

        if batch.len() >= options.batch_size {
            store.add_regions(coverage_id, &batch)?;
            batch.clear();
            flushes_since_checkpoint += 1;
            if flushes_since_checkpoint >= CHECKPOINT_EVERY_N_FLUSHES {
                let cancel = checkpoint(
                    store,
                    task,
                    counting.bytes_consumed(),
                    None,
                    rows_accepted,
                    rows_rejected,
                )?;
                if cancel {
                    return Err(AppError::Cancelled);
                }
                flushes_since_checkpoint = 0;
            }
        }
    }

    if !batch.is_empty() {
        store.add_regions(coverage_id, &batch)?;
    }
    checkpoint(
        store,
        task,
        counting.bytes_consumed(),
        None,
        rows_accepted,
        rows_rejected,
    )?;
    Ok(())
}

/// Parses a whitespace-delimited BED record, converting its zero-based
/// half-open `[start, end)` into Varda's one-based closed `[begin, end]`.
fn parse_bed_line(line: &str) -> Result<(String, i64, i64), AppError> {
    let mut fields = line.split_whitespace();
    let chrom = fields
        .next()
        .ok_or_else(|| AppError::BadRequest("empty BED line".to_string()))?
        .to_string();
    let start: i64 = fields
        .next()
        .ok_or_else(|| AppError::BadRequest("BED line missing start".to_string()))?
        .parse()?;
    let end: i64 = fields
        .next()
        .ok_or_else(|| AppError::BadRequest("BED line missing end".to_string()))?
        .parse()?;
    if start < 0 || end <= start {
        return Err(AppError::BadRequest(format!(
            "invalid BED interval [{start}, {end})"
        )));
    }
    Ok((chrom, start + 1, end))
}

fn checkpoint(
    store: &Store,
    task: &Task,
    offset: u64,
    bytes_total: Option<u64>,
    rows_accepted: u64,
    rows_rejected: u64,
) -> Result<bool, AppError> {
    let progress = bytes_total
        .map(|total| progress_percent(offset, total))
        .unwrap_or(0);
    store.checkpoint_task(&task.id, offset, rows_accepted, rows_rejected, progress)
}

/// Merges adjacent/overlapping intervals of a single contig in-place,
/// assuming `regions` is sorted by `begin`. Used when a source BED's
/// intervals are known to abut (e.g. windowed depth output) and a single
/// coalesced span is more useful than many one-base-apart rows.
pub fn merge_adjacent(regions: &mut Vec<(i64, i64)>) {
    regions.sort_by_key(|&(begin, _)| begin);
    let mut merged: Vec<(i64, i64)> = Vec::with_capacity(regions.len());
    for &(begin, end) in regions.iter() {
        match merged.last_mut() {
            Some((_, last_end)) if begin <= *last_end + 1 => {
                *last_end = (*last_end).max(end);
            }
            _ => merged.push((begin, end)),
        }
    }
    *regions = merged;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_bed_line_converts_to_one_based_closed() {
        let (chrom, begin, end) = parse_bed_line("chr1\t99\t200").unwrap();
        assert_eq!(chrom, "chr1");
        assert_eq!(begin, 100);
        assert_eq!(end, 200);
    }

    #[test]
    fn parse_bed_line_rejects_inverted_interval() {
        assert!(parse_bed_line("chr1\t200\t100").is_err());
    }

    #[test]
    fn parse_bed_line_rejects_empty_interval() {
        assert!(parse_bed_line("chr1\t100\t100").is_err());
    }

    #[test]
    fn merge_adjacent_coalesces_touching_and_overlapping_spans() {
        let mut regions = vec![(1, 100), (101, 200), (150, 180), (300, 400)];
        merge_adjacent(&mut regions);
        assert_eq!(regions, vec![(1, 200), (300, 400)]);
    }

    #[test]
    fn merge_adjacent_keeps_disjoint_spans_separate() {
        let mut regions = vec![(1, 10), (20, 30)];
        merge_adjacent(&mut regions);
        assert_eq!(regions, vec![(1, 10), (20, 30)]);
    }
}
