//! VCF variation import (spec.md §4.5 / C6).
//!
//! Opens the blob via C4, normalizes each allele via C3, bins via C1, and
//! batch-writes Observations to C5, checkpointing progress on the Task
//! every few flushes. Structured the way `seqvars::ingest`/`seqvars::
//! aggregate` drive their own `noodles` VCF readers, generalized from
//! per-carrier aggregate counts to Varda's Observation rows.

use noodles::vcf as vcf;
use std::sync::atomic::Ordering;
use uuid::Uuid;

use crate::blob::BlobStore;
use crate::err::AppError;
use crate::ingest::checkpoint::{
    progress_percent, skip_to_offset, CountingReader, CHECKPOINT_EVERY_N_FLUSHES, DEFAULT_BATCH_SIZE,
};
use crate::model::{DataSource, Observation, Task, Zygosity};
use crate::reference::ReferenceOracle;
use crate::store::Store;
use crate::variant::{normalize, Normalized, ReferenceMismatchPolicy};

/// How zygosity is derived from a VCF record (spec.md §4.5).
#[derive(Debug, Clone, Copy)]
pub enum ZygosityMode {
    /// Derive from the `GT` field (default).
    Genotype,
    /// Derive from `PL`, picking the most likely genotype and dropping
    /// calls whose confidence falls below `quality_threshold` (phred
    /// units, the gap between the best and second-best likelihood).
    Likelihood { quality_threshold: u32 },
}

pub struct ImportOptions {
    pub batch_size: usize,
    pub zygosity_mode: ZygosityMode,
    pub reference_mismatch_policy: ReferenceMismatchPolicy,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            zygosity_mode: ZygosityMode::Genotype,
            reference_mismatch_policy: ReferenceMismatchPolicy::Abort,
        }
    }
}

/// Imports the VCF blob named by `data_source.digest` into `variation_id`,
/// resuming from `task`'s checkpoint if set. Mutates `task` via `store`.
pub fn import_variation(
    store: &Store,
    blob: &BlobStore,
    reference: Option<&dyn ReferenceOracle>,
    task: &Task,
    variation_id: &Uuid,
    owner: &str,
    data_source: &DataSource,
    options: &ImportOptions,
) -> Result<(), AppError> {
    let raw = blob.open(&data_source.digest, Some(owner))?;
    let bytes_total = estimate_total(&data_source.digest, blob, owner);
    let mut counting = CountingReader::new(raw);
    if task.checkpoint_offset > 0 {
        skip_to_offset(&mut counting, task.checkpoint_offset)?;
    }
    let bytes_consumed = counting.counter();

    let mut reader = vcf::reader::Builder::default()
        .build_from_reader(counting)
        .map_err(|e| AppError::BadRequest(format!("could not build VCF reader: {e}")))?;
    let header = reader
        .read_header()
        .map_err(|e| AppError::BadRequest(format!("could not read VCF header: {e}")))?;

    let mut batch: Vec<(Uuid, Observation)> = Vec::with_capacity(options.batch_size);
    let mut rows_accepted = task.rows_accepted;
    let mut rows_rejected = task.rows_rejected;
    let mut flushes_since_checkpoint = 0u32;
    let mut record_buf = vcf::variant::RecordBuf::default();

    loop {
        let bytes_read = reader
            .read_record_buf(&header, &mut record_buf)
            .map_err(|e| AppError::BadRequest(format!("problem reading VCF record: {e}")))?;
        if bytes_read == 0 {
            break;
        }

        match handle_record(&record_buf, &header, variation_id, reference, options) {
            Ok(rows) => {
                rows_accepted += rows.len() as u64;
                for (variant, observation) in rows {
                    let variant_id = store.upsert_variant(&variant)?;
                    batch.push((variant_id, observation));
                }
            }
            Err(RecordOutcome::Dropped) => rows_rejected += 1,
            Err(RecordOutcome::Fatal(e)) => return Err(e),
        }

        if batch.len() >= options.batch_size {
            flush(store, &mut batch)?;
            flushes_since_checkpoint += 1;
            if flushes_since_checkpoint >= CHECKPOINT_EVERY_N_FLUSHES {
                let cancel = checkpoint(
                    store,
                    task,
                    bytes_consumed.load(Ordering::Relaxed),
                    bytes_total,
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

    flush(store, &mut batch)?;
    checkpoint(
        store,
        task,
        bytes_consumed.load(Ordering::Relaxed),
        bytes_total,
        rows_accepted,
        rows_rejected,
    )?;
    Ok(())
}

enum RecordOutcome {
    Dropped,
    Fatal(AppError),
}

fn handle_record(
    record: &vcf::variant::RecordBuf,
    header: &vcf::Header,
    variation_id: &Uuid,
    reference: Option<&dyn ReferenceOracle>,
    options: &ImportOptions,
) -> Result<Vec<(crate::model::Variant, Observation)>, RecordOutcome> {
    let chrom = record.reference_sequence_name().to_string();
    let begin: i64 = usize::from(
        record
            .variant_start()
            .ok_or_else(|| RecordOutcome::Fatal(AppError::BadRequest("missing POS".to_string())))?,
    ) as i64;
    let reference_allele = record.reference_bases().to_string();
    let alt_alleles: Vec<String> = record
        .alternate_bases()
        .as_ref()
        .iter()
        .map(|s| s.to_string())
        .collect();

    let mut out = Vec::new();
    for (allele_index, alt) in alt_alleles.iter().enumerate() {
        let allele_number = allele_index + 1;
        let (support, zygosity) =
            match tally_allele(record, header, allele_number, options.zygosity_mode) {
                Some(tally) => tally,
                None => continue,
            };
        if support == 0 {
            continue;
        }

        let normalized = normalize(
            &chrom,
            begin,
            &reference_allele,
            alt,
            reference,
            options.reference_mismatch_policy,
        )
        .map_err(RecordOutcome::Fatal)?;

        let variant = match normalized {
            Normalized::Accepted(v) => v,
            Normalized::Dropped { reason } => {
                tracing::warn!("dropping record: {reason}");
                return Err(RecordOutcome::Dropped);
            }
        };

        out.push((
            variant,
            Observation {
                variation: *variation_id,
                support,
                zygosity,
            },
        ));
    }
    Ok(out)
}

/// Counts individuals carrying `allele_number` across every sample column
/// (the "pooling" semantics of spec.md §4.5: a multi-sample VCF flattens
/// into the single target Sample).
fn tally_allele(
    record: &vcf::variant::RecordBuf,
    header: &vcf::Header,
    allele_number: usize,
    mode: ZygosityMode,
) -> Option<(u32, Zygosity)> {
    use vcf::variant::record::samples::keys::key;
    use vcf::variant::record_buf::samples::sample::Value;

    let mut support = 0u32;
    let mut zygosities = std::collections::HashSet::new();

    for (_name, sample) in header.sample_names().iter().zip(record.samples().values()) {
        let calls = match mode {
            ZygosityMode::Genotype => sample
                .get(key::GENOTYPE)
                .and_then(|v| v.as_ref())
                .and_then(|v| match v {
                    Value::Genotype(gt) => genotype_allele_calls(gt),
                    _ => None,
                }),
            ZygosityMode::Likelihood { quality_threshold } => sample
                .get(key::ROUNDED_GENOTYPE_LIKELIHOODS)
                .and_then(|v| v.as_ref())
                .and_then(|v| match v {
                    Value::Array(vcf::variant::record_buf::samples::sample::value::Array::Integer(pl)) => {
                        likelihood_allele_calls(pl, quality_threshold)
                    }
                    _ => None,
                }),
        };

        let Some(alleles) = calls else { continue };
        let occurrences = alleles.iter().filter(|a| **a == Some(allele_number)).count();
        if occurrences == 0 {
            continue;
        }
        support += 1;
        zygosities.insert(if occurrences >= 2 {
            Zygosity::Hom
        } else {
            Zygosity::Het
        });
    }

    if support == 0 {
        return None;
    }
    let zygosity = if zygosities.len() == 1 {
        zygosities.into_iter().next().unwrap()
    } else {
        Zygosity::Unknown
    };
    Some((support, zygosity))
}

fn genotype_allele_calls(
    gt: &vcf::variant::record_buf::samples::sample::value::genotype::Genotype,
) -> Option<Vec<Option<usize>>> {
    Some(gt.iter().map(|&(allele, _phasing)| allele).collect())
}

fn likelihood_allele_calls(pl: &[Option<i32>], quality_threshold: u32) -> Option<Vec<Option<usize>>> {
    let values: Vec<i32> = pl.iter().filter_map(|v| *v).collect();
    if values.len() < 3 {
        return None;
    }
    let mut sorted = values.clone();
    sorted.sort_unstable();
    let confidence = (sorted[1] - sorted[0]) as u32;
    if confidence < quality_threshold {
        return None;
    }
    let best_index = values.iter().position(|&v| v == sorted[0])?;
    // Biallelic PL order is [0/0, 0/1, 1/1] at indices 0, 1, 2.
    match best_index {
        0 => Some(vec![Some(0), Some(0)]),
        1 => Some(vec![Some(0), Some(1)]),
        2 => Some(vec![Some(1), Some(1)]),
        _ => None,
    }
}

fn flush(store: &Store, batch: &mut Vec<(Uuid, Observation)>) -> Result<(), AppError> {
    if batch.is_empty() {
        return Ok(());
    }
    let mut by_variant: std::collections::HashMap<Uuid, Vec<(Uuid, Observation)>> =
        std::collections::HashMap::new();
    for (variant_id, observation) in batch.drain(..) {
        by_variant
            .entry(variant_id)
            .or_default()
            .push((observation.variation, observation));
    }
    for (variant_id, rows) in by_variant {
        store.add_observations(&variant_id, &rows)?;
    }
    Ok(())
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

fn estimate_total(digest: &str, blob: &BlobStore, owner: &str) -> Option<u64> {
    blob.content_length(digest, Some(owner)).ok().flatten()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn estimate_total_reports_size_for_a_plain_blob() {
        let dir = tempfile::tempdir().unwrap();
        let blob = BlobStore::new(dir.path());
        let digest = blob.put(b"##fileformat=VCFv4.3\n").unwrap();
        assert_eq!(estimate_total(&digest, &blob, "owner"), Some(22));
    }

    #[test]
    fn zygosity_mode_default_is_genotype() {
        let options = ImportOptions::default();
        assert!(matches!(options.zygosity_mode, ZygosityMode::Genotype));
    }

    #[test]
    fn likelihood_allele_calls_picks_lowest_pl() {
        let pl = vec![Some(0), Some(30), Some(200)];
        let calls = likelihood_allele_calls(&pl, 10).unwrap();
        assert_eq!(calls, vec![Some(0), Some(0)]);
    }

    #[test]
    fn likelihood_allele_calls_drops_low_confidence() {
        let pl = vec![Some(0), Some(2), Some(200)];
        assert!(likelihood_allele_calls(&pl, 10).is_none());
    }

    #[test]
    fn likelihood_allele_calls_detects_homalt() {
        let pl = vec![Some(200), Some(30), Some(0)];
        let calls = likelihood_allele_calls(&pl, 10).unwrap();
        assert_eq!(calls, vec![Some(1), Some(1)]);
    }
}
