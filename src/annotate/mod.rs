//! Annotation pipeline (spec.md §4.8 / C8).
//!
//! Streams an original VCF record-by-record, computing `freq` (C7) per
//! allele per query and appending `<slug>_OBS`/`<slug>_COV`/`<slug>_FREQ`
//! INFO fields, one value per ALT allele (`Number=A`), the same "copy
//! input record, extend INFO, write" shape
//! `strucvars::ingest::write_ingest_record` uses for its own enrichment.

use noodles::vcf as vcf;
use uuid::Uuid;

use crate::blob::BlobStore;
use crate::err::AppError;
use crate::frequency::freq;
use crate::ingest::checkpoint::{
    progress_percent, skip_to_offset, CountingReader, CHECKPOINT_EVERY_N_FLUSHES,
};
use crate::model::{DataSource, Task};
use crate::store::Store;
use crate::variant::{normalize, Normalized, ReferenceMismatchPolicy};
use crate::reference::ReferenceOracle;

/// `(slug, selection expression)` pairs, in output column order.
pub type Queries = Vec<(String, String)>;

/// Adds the three INFO declarations each query contributes to the output
/// header (spec.md §4.8(1)), leaving every other header field untouched.
/// Every field is `Number=A`: one value per ALT allele, since §4.8 step 2
/// annotates each allele of a record independently.
pub fn build_output_header(input_header: &vcf::Header, queries: &Queries) -> Result<vcf::Header, AppError> {
    use vcf::header::record::value::map::info::{Number, Type};
    use vcf::header::record::value::map::Info;
    use vcf::header::record::value::Map;

    let mut header = input_header.clone();
    for (slug, _) in queries {
        header.infos_mut().insert(
            format!("{slug}_OBS"),
            Map::<Info>::new(Number::A, Type::Integer, format!("Observed allele count for query {slug}")),
        );
        header.infos_mut().insert(
            format!("{slug}_COV"),
            Map::<Info>::new(Number::A, Type::Integer, format!("Covered sample total for query {slug}")),
        );
        header.infos_mut().insert(
            format!("{slug}_FREQ"),
            Map::<Info>::new(Number::A, Type::Float, format!("Observed/covered ratio for query {slug}")),
        );
    }
    Ok(header)
}

/// Runs annotation of `data_source`'s blob against `queries`, writing the
/// enriched VCF through `out_blob` and registering the resulting
/// [`DataSource`] digest on completion. Resumes from `task`'s checkpoint.
pub fn annotate(
    store: &Store,
    blob: &BlobStore,
    out_blob: &BlobStore,
    reference: Option<&dyn ReferenceOracle>,
    task: &Task,
    data_source: &DataSource,
    owner: &str,
    queries: &Queries,
) -> Result<String, AppError> {
    let raw = blob.open(&data_source.digest, Some(owner))?;
    let mut counting = CountingReader::new(raw);
    if task.checkpoint_offset > 0 {
        skip_to_offset(&mut counting, task.checkpoint_offset)?;
    }
    let bytes_consumed = counting.counter();

    let mut reader = vcf::reader::Builder::default()
        .build_from_reader(counting)
        .map_err(|e| AppError::BadRequest(format!("could not build VCF reader: {e}")))?;
    let input_header = reader
        .read_header()
        .map_err(|e| AppError::BadRequest(format!("could not read VCF header: {e}")))?;
    let output_header = build_output_header(&input_header, queries)?;

    let mut output: Vec<u8> = Vec::new();
    {
        let mut writer = vcf::writer::Writer::new(&mut output);
        writer
            .write_header(&output_header)
            .map_err(|e| AppError::Internal(format!("writing VCF header: {e}")))?;

        let mut record_buf = vcf::variant::RecordBuf::default();
        let mut rows_accepted = task.rows_accepted;
        let rows_rejected = task.rows_rejected;
        let mut flushes_since_checkpoint = 0u32;

        loop {
            let bytes_read = reader
                .read_record_buf(&input_header, &mut record_buf)
                .map_err(|e| AppError::BadRequest(format!("problem reading VCF record: {e}")))?;
            if bytes_read == 0 {
                break;
            }

            let record = annotate_record(store, reference, &record_buf, queries)?;
            writer
                .write_variant_record(&output_header, &record)
                .map_err(|e| AppError::Internal(format!("writing VCF record: {e}")))?;
            rows_accepted += 1;

            flushes_since_checkpoint += 1;
            if flushes_since_checkpoint >= CHECKPOINT_EVERY_N_FLUSHES {
                let cancel = store.checkpoint_task(
                    &task.id,
                    bytes_consumed.load(std::sync::atomic::Ordering::Relaxed),
                    rows_accepted,
                    rows_rejected,
                    0,
                )?;
                if cancel {
                    return Err(AppError::Cancelled);
                }
                flushes_since_checkpoint = 0;
            }
        }

        let final_offset = bytes_consumed.load(std::sync::atomic::Ordering::Relaxed);
        store.checkpoint_task(&task.id, final_offset, rows_accepted, rows_rejected, progress_percent(final_offset, final_offset.max(1)))?;
    }

    out_blob.put(&output)
}

/// Copies an input record and appends the three per-query INFO fields,
/// one value per ALT allele in order (spec.md §4.8 step 2), normalizing
/// each allele independently and dropping only that allele's contribution
/// (as a missing `.` value) on a reference mismatch rather than the whole
/// record.
fn annotate_record(
    store: &Store,
    reference: Option<&dyn ReferenceOracle>,
    record: &vcf::variant::RecordBuf,
    queries: &Queries,
) -> Result<vcf::variant::RecordBuf, AppError> {
    use vcf::variant::record_buf::info::field::value::Array as InfoArray;
    use vcf::variant::record_buf::info::field::Value;

    let chrom = record.reference_sequence_name().to_string();
    let begin: i64 = usize::from(
        record
            .variant_start()
            .ok_or_else(|| AppError::BadRequest("missing POS".to_string()))?,
    ) as i64;
    let reference_allele = record.reference_bases().to_string();
    let alt_alleles: Vec<String> = record
        .alternate_bases()
        .as_ref()
        .iter()
        .map(|s| s.to_string())
        .collect();
    if alt_alleles.is_empty() {
        return Err(AppError::BadRequest("record has no ALT allele".to_string()));
    }

    let builder = vcf::variant::record_buf::builder::Builder::default()
        .set_reference_sequence_name(chrom.clone())
        .set_variant_start(record.variant_start().expect("checked above"))
        .set_reference_bases(reference_allele.clone())
        .set_alternate_bases(record.alternate_bases().clone())
        .set_samples(record.samples().clone());

    let mut info = record.info().clone();

    let mut observed_by_query: Vec<Vec<Option<i32>>> =
        queries.iter().map(|_| Vec::with_capacity(alt_alleles.len())).collect();
    let mut covered_by_query: Vec<Vec<Option<i32>>> =
        queries.iter().map(|_| Vec::with_capacity(alt_alleles.len())).collect();
    let mut ratio_by_query: Vec<Vec<Option<f32>>> =
        queries.iter().map(|_| Vec::with_capacity(alt_alleles.len())).collect();

    for alt in &alt_alleles {
        let normalized = normalize(
            &chrom,
            begin,
            &reference_allele,
            alt,
            reference,
            ReferenceMismatchPolicy::Drop,
        )?;
        let variant = match normalized {
            Normalized::Accepted(variant) => Some(variant),
            Normalized::Dropped { reason } => {
                tracing::warn!("dropping allele from annotation: {reason}");
                None
            }
        };

        for (i, (_slug, selection_src)) in queries.iter().enumerate() {
            match &variant {
                Some(variant) => {
                    let frequency = freq(store, variant, selection_src)?;
                    observed_by_query[i].push(Some(frequency.observed as i32));
                    covered_by_query[i].push(Some(frequency.covered as i32));
                    let ratio = frequency.ratio().unwrap_or(0.0);
                    let rounded = (ratio * 1_000_000.0).round() / 1_000_000.0;
                    ratio_by_query[i].push(Some(rounded as f32));
                }
                None => {
                    observed_by_query[i].push(None);
                    covered_by_query[i].push(None);
                    ratio_by_query[i].push(None);
                }
            }
        }
    }

    for (i, (slug, _)) in queries.iter().enumerate() {
        info.insert(
            format!("{slug}_OBS"),
            Some(Value::Array(InfoArray::Integer(std::mem::take(&mut observed_by_query[i])))),
        );
        info.insert(
            format!("{slug}_COV"),
            Some(Value::Array(InfoArray::Integer(std::mem::take(&mut covered_by_query[i])))),
        );
        info.insert(
            format!("{slug}_FREQ"),
            Some(Value::Array(InfoArray::Float(std::mem::take(&mut ratio_by_query[i])))),
        );
    }

    Ok(builder.set_info(info).build())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn build_output_header_declares_three_fields_per_query() {
        let input_header = vcf::Header::builder().build();
        let queries: Queries = vec![("cohortA".to_string(), "*".to_string())];
        let header = build_output_header(&input_header, &queries).unwrap();
        assert!(header.infos().contains_key("cohortA_OBS"));
        assert!(header.infos().contains_key("cohortA_COV"));
        assert!(header.infos().contains_key("cohortA_FREQ"));
    }

    #[test]
    fn build_output_header_handles_multiple_queries_without_collision() {
        let input_header = vcf::Header::builder().build();
        let queries: Queries = vec![
            ("a".to_string(), "*".to_string()),
            ("b".to_string(), "sample:x".to_string()),
        ];
        let header = build_output_header(&input_header, &queries).unwrap();
        assert_eq!(header.infos().len(), 6);
    }

    fn new_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        (dir, Store::open(dir.path()).unwrap())
    }

    #[test]
    fn annotate_record_emits_one_value_per_alt_allele() {
        use vcf::variant::record_buf::info::field::value::Array as InfoArray;
        use vcf::variant::record_buf::info::field::Value;

        let (_dir, store) = new_store();
        let queries: Queries = vec![("cohortA".to_string(), "*".to_string())];

        let record = vcf::variant::record_buf::builder::Builder::default()
            .set_reference_sequence_name("1".to_string())
            .set_variant_start(noodles::core::Position::try_from(100usize).unwrap())
            .set_reference_bases("A".to_string())
            .set_alternate_bases(vcf::variant::record_buf::AlternateBases::from(vec![
                "G".to_string(),
                "T".to_string(),
            ]))
            .build();

        let annotated = annotate_record(&store, None, &record, &queries).unwrap();
        let value = annotated.info().get("cohortA_OBS").unwrap().clone().unwrap();
        match value {
            Value::Array(InfoArray::Integer(values)) => assert_eq!(values.len(), 2),
            other => panic!("expected an Integer array, got {other:?}"),
        }
    }
}
