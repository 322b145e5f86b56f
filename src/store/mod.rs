//! Observation/coverage store (spec.md §4.4 / C5).
//!
//! A `rocksdb::TransactionDB` standing in for the relational store spec.md
//! treats as an external collaborator: one column family per table, row
//! locks via `transaction().get_for_update_cf`, and unique constraints
//! enforced by a read-then-conditional-put inside the same transaction —
//! exactly the pattern `seqvars::aggregate::import_vcf` uses for its own
//! counts/carrier rows, generalized here to every table spec.md §3 names.

pub mod keys;
pub mod selection;

use std::path::Path;
use std::sync::Arc;

use rocksdb::{ColumnFamilyDescriptor, MultiThreaded, TransactionDB, TransactionDBOptions};
use uuid::Uuid;

use crate::binning;
use crate::err::AppError;
use crate::model::{
    Annotation, Coverage, CoveredRegion, DataSource, Observation, Sample, SampleState, Task,
    TaskState, Variant, Variation,
};
use selection::Selection;

const CF_META: &str = "meta";
const CF_SAMPLES: &str = "samples";
const CF_DATA_SOURCES: &str = "data_sources";
const CF_DATA_SOURCES_BY_DIGEST: &str = "data_sources_by_digest";
const CF_VARIATIONS: &str = "variations";
const CF_VARIATIONS_BY_DIGEST: &str = "variations_by_digest";
const CF_COVERAGES: &str = "coverages";
const CF_COVERAGES_BY_DIGEST: &str = "coverages_by_digest";
const CF_VARIANTS: &str = "variants";
const CF_OBSERVATIONS: &str = "observations";
const CF_COVERED_REGIONS: &str = "covered_regions";
const CF_TASKS: &str = "tasks";
const CF_ANNOTATIONS: &str = "annotations";
const CF_GROUP_MEMBERS: &str = "group_members";
const CF_SAMPLE_LOCKS: &str = "sample_locks";

const ALL_CFS: &[&str] = &[
    CF_META,
    CF_SAMPLES,
    CF_DATA_SOURCES,
    CF_DATA_SOURCES_BY_DIGEST,
    CF_VARIATIONS,
    CF_VARIATIONS_BY_DIGEST,
    CF_COVERAGES,
    CF_COVERAGES_BY_DIGEST,
    CF_VARIANTS,
    CF_OBSERVATIONS,
    CF_COVERED_REGIONS,
    CF_TASKS,
    CF_ANNOTATIONS,
    CF_GROUP_MEMBERS,
    CF_SAMPLE_LOCKS,
];

const MAX_TRANSACTION_RETRIES: u32 = 3;

/// How long [`Store::acquire_sample_lock`] waits for a contending import to
/// release a sample before giving up.
const SAMPLE_LOCK_MAX_WAIT: std::time::Duration = std::time::Duration::from_secs(600);
const SAMPLE_LOCK_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(200);

/// Resolved facts about a sample, carried alongside the predicate evaluator
/// so [`Selection`] can be evaluated without extra store round-trips per
/// candidate.
struct SampleFacts {
    active: bool,
    coverage_profile: bool,
    pool_size: u32,
}

pub struct Store {
    db: Arc<TransactionDB<MultiThreaded>>,
    path: std::path::PathBuf,
}

impl Store {
    /// Opens (creating if absent) the transactional store at `path`, with
    /// one column family per table.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref();
        let options = rocksdb_utils_lookup::tune_options(rocksdb::Options::default(), None);
        let tx_options = TransactionDBOptions::default();
        let cf_descriptors = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, options.clone()))
            .collect::<Vec<_>>();

        let db = TransactionDB::open_cf_descriptors(&options, &tx_options, path, cf_descriptors)?;
        let cf_meta = db.cf_handle(CF_META).expect("declared above");
        db.put_cf(&cf_meta, "varda-version", crate::common::VERSION)?;

        Ok(Self {
            db: Arc::new(db),
            path: path.to_path_buf(),
        })
    }

    /// Runs RocksDB's compaction over every column family. Must be called
    /// after the transactional handle has been dropped, mirroring
    /// `seqvars::aggregate::run`'s separate compaction scope.
    pub fn compact(path: impl AsRef<Path>) -> Result<(), AppError> {
        let options = rocksdb_utils_lookup::tune_options(rocksdb::Options::default(), None);
        let db = rocksdb::DB::open_cf_with_opts(
            &options,
            path.as_ref(),
            ALL_CFS.iter().map(|name| (name.to_string(), options.clone())).collect::<Vec<_>>(),
        )?;
        rocksdb_utils_lookup::force_compaction_cf(&db, ALL_CFS, Some("  "), true)?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<Arc<rocksdb::BoundColumnFamily<'_>>, AppError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| AppError::Internal(format!("missing column family {name}")))
    }

    /// Retries a transactional closure on RocksDB serialization conflicts
    /// with a short backoff, the way `import_vcf`'s commit loop does.
    fn with_retries<T>(
        &self,
        mut f: impl FnMut(&rocksdb::Transaction<'_, TransactionDB<MultiThreaded>>) -> Result<T, AppError>,
    ) -> Result<T, AppError> {
        let mut attempt = 0;
        loop {
            let txn = self.db.transaction();
            let result = f(&txn);
            match result {
                Ok(value) => match txn.commit() {
                    Ok(()) => return Ok(value),
                    Err(e) => {
                        attempt += 1;
                        if attempt > MAX_TRANSACTION_RETRIES {
                            return Err(AppError::StoreRetriesExceeded(e.to_string()));
                        }
                        tracing::warn!(attempt, "transaction commit conflict, retrying: {e}");
                        std::thread::sleep(std::time::Duration::from_millis(20 * attempt as u64));
                    }
                },
                Err(e) => return Err(e),
            }
        }
    }

    // ---- samples ----------------------------------------------------

    pub fn put_sample(&self, sample: &Sample) -> Result<(), AppError> {
        let cf = self.cf(CF_SAMPLES)?;
        let bytes = serde_json::to_vec(sample)
            .map_err(|e| AppError::Internal(format!("encoding sample: {e}")))?;
        self.db.put_cf(&cf, keys::id_key(&sample.id), bytes)?;
        Ok(())
    }

    pub fn get_sample(&self, id: &Uuid) -> Result<Option<Sample>, AppError> {
        let cf = self.cf(CF_SAMPLES)?;
        let Some(bytes) = self.db.get_cf(&cf, keys::id_key(id))? else {
            return Ok(None);
        };
        let sample = serde_json::from_slice(&bytes)
            .map_err(|e| AppError::Internal(format!("decoding sample: {e}")))?;
        Ok(Some(sample))
    }

    /// Adds `sample_id` to `group_id`'s membership roster, used by the
    /// `group:<id>` selection clause.
    pub fn add_group_member(&self, group_id: &str, sample_id: &Uuid) -> Result<(), AppError> {
        let cf = self.cf(CF_GROUP_MEMBERS)?;
        self.db
            .put_cf(&cf, keys::group_member_key(group_id, sample_id), [])?;
        Ok(())
    }

    fn group_members(&self, group_id: &str) -> Result<Vec<Uuid>, AppError> {
        let cf = self.cf(CF_GROUP_MEMBERS)?;
        let prefix = keys::group_member_prefix(group_id);
        let mut out = Vec::new();
        let iter = self.db.prefix_iterator_cf(&cf, &prefix);
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let sample_bytes: [u8; 16] = key[prefix.len()..]
                .try_into()
                .map_err(|_| AppError::Internal("malformed group member key".to_string()))?;
            out.push(Uuid::from_bytes(sample_bytes));
        }
        Ok(out)
    }

    /// Activates `sample_id` (spec.md §4.9 guard): fails unless no task
    /// targeting it is `waiting`/`running`, no import currently holds the
    /// sample's advisory lock, and it has at least one Variation (plus a
    /// Coverage, if `coverage_profile`).
    pub fn activate_sample(&self, sample_id: &Uuid) -> Result<(), AppError> {
        self.with_retries(|txn| {
            let cf_samples = self.cf(CF_SAMPLES)?;
            let cf_locks = self.cf(CF_SAMPLE_LOCKS)?;
            let bytes = txn
                .get_for_update_cf(&cf_samples, keys::id_key(sample_id), true)?
                .ok_or_else(|| AppError::NotFound(format!("sample {sample_id}")))?;
            let mut sample: Sample = serde_json::from_slice(&bytes)
                .map_err(|e| AppError::Internal(format!("decoding sample: {e}")))?;

            if txn
                .get_for_update_cf(&cf_locks, keys::id_key(sample_id), true)?
                .is_some()
            {
                return Err(AppError::SampleStateConflict(
                    "sample is locked by an in-progress import".to_string(),
                ));
            }
            if self.sample_has_pending_or_running_task(sample_id)? {
                return Err(AppError::SampleStateConflict(
                    "a task targeting this sample is waiting or running".to_string(),
                ));
            }
            if !self.sample_has_variation(sample_id)? {
                return Err(AppError::SampleStateConflict(
                    "sample has no Variation".to_string(),
                ));
            }
            if sample.coverage_profile && !self.sample_has_coverage(sample_id)? {
                return Err(AppError::SampleStateConflict(
                    "coverage_profile sample has no Coverage".to_string(),
                ));
            }

            sample.state = SampleState::Active;
            let encoded = serde_json::to_vec(&sample)
                .map_err(|e| AppError::Internal(format!("encoding sample: {e}")))?;
            txn.put_cf(&cf_samples, keys::id_key(sample_id), encoded)?;
            Ok(())
        })
    }

    /// Admin-only deactivation; does not take the activation guard, but
    /// still refuses to run against a sample an import currently holds.
    pub fn deactivate_sample(&self, sample_id: &Uuid) -> Result<(), AppError> {
        self.with_retries(|txn| {
            let cf_samples = self.cf(CF_SAMPLES)?;
            let cf_locks = self.cf(CF_SAMPLE_LOCKS)?;
            if txn
                .get_for_update_cf(&cf_locks, keys::id_key(sample_id), true)?
                .is_some()
            {
                return Err(AppError::SampleStateConflict(
                    "sample is locked by an in-progress import".to_string(),
                ));
            }
            let bytes = txn
                .get_for_update_cf(&cf_samples, keys::id_key(sample_id), true)?
                .ok_or_else(|| AppError::NotFound(format!("sample {sample_id}")))?;
            let mut sample: Sample = serde_json::from_slice(&bytes)
                .map_err(|e| AppError::Internal(format!("decoding sample: {e}")))?;
            sample.state = SampleState::Inactive;
            let encoded = serde_json::to_vec(&sample)
                .map_err(|e| AppError::Internal(format!("encoding sample: {e}")))?;
            txn.put_cf(&cf_samples, keys::id_key(sample_id), encoded)?;
            Ok(())
        })
    }

    /// Blocks until `sample_id`'s advisory lock is free (or already held by
    /// `task_id`, letting a resumed task reclaim its own lock), then marks
    /// it held by `task_id`. This is spec.md §5's "concurrent imports into
    /// the same Sample are serialized by the per-sample lock": a second
    /// importer waits for the first to finish rather than racing it.
    pub fn acquire_sample_lock(&self, sample_id: &Uuid, task_id: &Uuid) -> Result<(), AppError> {
        let deadline = std::time::Instant::now() + SAMPLE_LOCK_MAX_WAIT;
        loop {
            let acquired = self.with_retries(|txn| {
                let cf = self.cf(CF_SAMPLE_LOCKS)?;
                let existing = txn.get_for_update_cf(&cf, keys::id_key(sample_id), true)?;
                if let Some(bytes) = &existing {
                    if bytes.as_slice() != task_id.as_bytes().as_slice() {
                        return Ok(false);
                    }
                }
                txn.put_cf(&cf, keys::id_key(sample_id), task_id.as_bytes().as_slice())?;
                Ok(true)
            })?;
            if acquired {
                return Ok(());
            }
            if std::time::Instant::now() >= deadline {
                return Err(AppError::SampleStateConflict(format!(
                    "timed out waiting for sample {sample_id}'s import lock"
                )));
            }
            tracing::debug!(sample_id = %sample_id, task_id = %task_id, "waiting for sample import lock");
            std::thread::sleep(SAMPLE_LOCK_POLL_INTERVAL);
        }
    }

    /// Releases `task_id`'s lock on `sample_id`. A no-op if the lock is held
    /// by someone else or already absent (e.g. a double-release after a
    /// crash-recovered resume).
    pub fn release_sample_lock(&self, sample_id: &Uuid, task_id: &Uuid) -> Result<(), AppError> {
        self.with_retries(|txn| {
            let cf = self.cf(CF_SAMPLE_LOCKS)?;
            let existing = txn.get_for_update_cf(&cf, keys::id_key(sample_id), true)?;
            if existing.as_deref() == Some(task_id.as_bytes().as_slice()) {
                txn.delete_cf(&cf, keys::id_key(sample_id))?;
            }
            Ok(())
        })
    }

    fn sample_has_variation(&self, sample_id: &Uuid) -> Result<bool, AppError> {
        let cf = self.cf(CF_VARIATIONS)?;
        Ok(self
            .db
            .iterator_cf(&cf, rocksdb::IteratorMode::Start)
            .filter_map(Result::ok)
            .any(|(_, value)| {
                serde_json::from_slice::<Variation>(&value)
                    .map(|v| &v.sample == sample_id)
                    .unwrap_or(false)
            }))
    }

    fn sample_has_coverage(&self, sample_id: &Uuid) -> Result<bool, AppError> {
        let cf = self.cf(CF_COVERAGES)?;
        Ok(self
            .db
            .iterator_cf(&cf, rocksdb::IteratorMode::Start)
            .filter_map(Result::ok)
            .any(|(_, value)| {
                serde_json::from_slice::<Coverage>(&value)
                    .map(|c| &c.sample == sample_id)
                    .unwrap_or(false)
            }))
    }

    fn sample_has_pending_or_running_task(&self, sample_id: &Uuid) -> Result<bool, AppError> {
        let cf = self.cf(CF_TASKS)?;
        Ok(self
            .db
            .iterator_cf(&cf, rocksdb::IteratorMode::Start)
            .filter_map(Result::ok)
            .any(|(_, value)| {
                serde_json::from_slice::<Task>(&value)
                    .map(|t| {
                        &t.target == sample_id
                            && matches!(t.state, TaskState::Waiting | TaskState::Running)
                    })
                    .unwrap_or(false)
            }))
    }

    // ---- data sources / variations / coverages -----------------------

    pub fn data_source_by_digest(
        &self,
        owner: &Uuid,
        digest: &str,
    ) -> Result<Option<Uuid>, AppError> {
        let cf = self.cf(CF_DATA_SOURCES_BY_DIGEST)?;
        let Some(bytes) = self.db.get_cf(&cf, keys::data_source_digest_key(owner, digest))? else {
            return Ok(None);
        };
        let bytes: [u8; 16] = bytes
            .try_into()
            .map_err(|_| AppError::Internal("malformed data source id".to_string()))?;
        Ok(Some(Uuid::from_bytes(bytes)))
    }

    pub fn put_data_source(&self, data_source: &DataSource) -> Result<(), AppError> {
        self.with_retries(|txn| {
            let cf = self.cf(CF_DATA_SOURCES)?;
            let cf_digest = self.cf(CF_DATA_SOURCES_BY_DIGEST)?;
            let digest_key = keys::data_source_digest_key(&data_source.owner, &data_source.digest);
            if txn.get_for_update_cf(&cf_digest, &digest_key, true)?.is_some() {
                return Err(AppError::IntegrityConflict(
                    "data source with this digest already exists for this owner".to_string(),
                ));
            }
            let bytes = serde_json::to_vec(data_source)
                .map_err(|e| AppError::Internal(format!("encoding data source: {e}")))?;
            txn.put_cf(&cf, keys::id_key(&data_source.id), &bytes)?;
            txn.put_cf(&cf_digest, &digest_key, keys::id_key(&data_source.id))?;
            Ok(())
        })
    }

    /// Registers a new [`Variation`], failing with [`AppError::DuplicateImport`]
    /// if this `(sample, digest)` pair already has one (spec.md §4.5).
    pub fn put_variation(&self, variation: &Variation, digest: &str) -> Result<(), AppError> {
        self.with_retries(|txn| {
            let cf = self.cf(CF_VARIATIONS)?;
            let cf_digest = self.cf(CF_VARIATIONS_BY_DIGEST)?;
            let digest_key = keys::sample_digest_key(&variation.sample, digest);
            if txn.get_for_update_cf(&cf_digest, &digest_key, true)?.is_some() {
                return Err(AppError::DuplicateImport);
            }
            let bytes = serde_json::to_vec(variation)
                .map_err(|e| AppError::Internal(format!("encoding variation: {e}")))?;
            txn.put_cf(&cf, keys::id_key(&variation.id), &bytes)?;
            txn.put_cf(&cf_digest, &digest_key, keys::id_key(&variation.id))?;
            Ok(())
        })
    }

    pub fn put_coverage(&self, coverage: &Coverage, digest: &str) -> Result<(), AppError> {
        self.with_retries(|txn| {
            let cf = self.cf(CF_COVERAGES)?;
            let cf_digest = self.cf(CF_COVERAGES_BY_DIGEST)?;
            let digest_key = keys::sample_digest_key(&coverage.sample, digest);
            if txn.get_for_update_cf(&cf_digest, &digest_key, true)?.is_some() {
                return Err(AppError::DuplicateImport);
            }
            let bytes = serde_json::to_vec(coverage)
                .map_err(|e| AppError::Internal(format!("encoding coverage: {e}")))?;
            txn.put_cf(&cf, keys::id_key(&coverage.id), &bytes)?;
            txn.put_cf(&cf_digest, &digest_key, keys::id_key(&coverage.id))?;
            Ok(())
        })
    }

    pub fn get_variation(&self, id: &Uuid) -> Result<Option<Variation>, AppError> {
        let cf = self.cf(CF_VARIATIONS)?;
        let Some(bytes) = self.db.get_cf(&cf, keys::id_key(id))? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&bytes).map_err(|e| {
            AppError::Internal(format!("decoding variation: {e}"))
        })?))
    }

    pub fn get_coverage(&self, id: &Uuid) -> Result<Option<Coverage>, AppError> {
        let cf = self.cf(CF_COVERAGES)?;
        let Some(bytes) = self.db.get_cf(&cf, keys::id_key(id))? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&bytes).map_err(|e| {
            AppError::Internal(format!("decoding coverage: {e}"))
        })?))
    }

    pub fn get_data_source(&self, id: &Uuid) -> Result<Option<DataSource>, AppError> {
        let cf = self.cf(CF_DATA_SOURCES)?;
        let Some(bytes) = self.db.get_cf(&cf, keys::id_key(id))? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&bytes).map_err(|e| {
            AppError::Internal(format!("decoding data source: {e}"))
        })?))
    }

    // ---- variants / observations / covered regions -------------------

    /// Returns the existing variant id for this identity, or inserts a new
    /// one, inside a single transaction (spec.md §4.4).
    pub fn upsert_variant(&self, variant: &Variant) -> Result<Uuid, AppError> {
        self.with_retries(|txn| {
            let cf = self.cf(CF_VARIANTS)?;
            let key = keys::variant_identity_key(
                &variant.chrom,
                variant.begin,
                variant.end,
                &variant.observed,
            );
            if let Some(existing) = txn.get_for_update_cf(&cf, &key, true)? {
                let bytes: [u8; 16] = existing
                    .try_into()
                    .map_err(|_| AppError::Internal("malformed variant id".to_string()))?;
                return Ok(Uuid::from_bytes(bytes));
            }
            let id = Uuid::new_v4();
            txn.put_cf(&cf, &key, keys::id_key(&id))?;
            Ok(id)
        })
    }

    /// Looks up a variant's id by identity without inserting one if
    /// absent, used by `crate::frequency` so an unobserved variant query
    /// never creates a row as a side effect.
    pub fn find_variant(&self, variant: &Variant) -> Result<Option<Uuid>, AppError> {
        let cf = self.cf(CF_VARIANTS)?;
        let key = keys::variant_identity_key(
            &variant.chrom,
            variant.begin,
            variant.end,
            &variant.observed,
        );
        let Some(bytes) = self.db.get_cf(&cf, &key)? else {
            return Ok(None);
        };
        let bytes: [u8; 16] = bytes
            .try_into()
            .map_err(|_| AppError::Internal("malformed variant id".to_string()))?;
        Ok(Some(Uuid::from_bytes(bytes)))
    }

    /// Appends `batch` to the Observation table (spec.md §4.4, append-only).
    pub fn add_observations(
        &self,
        variant_id: &Uuid,
        batch: &[(Uuid, Observation)],
    ) -> Result<(), AppError> {
        self.with_retries(|txn| {
            let cf = self.cf(CF_OBSERVATIONS)?;
            for (variation_id, observation) in batch {
                let key = keys::observation_key(variant_id, variation_id);
                let bytes = serde_json::to_vec(observation)
                    .map_err(|e| AppError::Internal(format!("encoding observation: {e}")))?;
                txn.put_cf(&cf, &key, bytes)?;
            }
            Ok(())
        })
    }

    /// Appends `batch` to the CoveredRegion table, with bins precomputed
    /// by the caller via [`crate::binning::assign`].
    pub fn add_regions(&self, coverage_id: &Uuid, batch: &[CoveredRegion]) -> Result<(), AppError> {
        self.with_retries(|txn| {
            let cf = self.cf(CF_COVERED_REGIONS)?;
            for region in batch {
                let key =
                    keys::covered_region_key(&region.chrom, region.bin, region.begin, coverage_id);
                let bytes = serde_json::to_vec(region)
                    .map_err(|e| AppError::Internal(format!("encoding covered region: {e}")))?;
                txn.put_cf(&cf, &key, bytes)?;
            }
            Ok(())
        })
    }

    fn sample_facts(&self, sample_id: &Uuid) -> Result<Option<SampleFacts>, AppError> {
        Ok(self.get_sample(sample_id)?.map(|s| SampleFacts {
            active: s.is_active(),
            coverage_profile: s.coverage_profile,
            pool_size: s.pool_size,
        }))
    }

    /// Evaluates whether `sample_id` matches `selection`, honoring the
    /// tautology rewrite (`active ∧ coverage_profile`) and group
    /// membership (spec.md §4.6).
    fn matches(&self, selection: &Selection, sample_id: &Uuid) -> Result<bool, AppError> {
        match selection {
            Selection::Tautology => Ok(self
                .sample_facts(sample_id)?
                .map(|f| f.active && f.coverage_profile)
                .unwrap_or(false)),
            Selection::Sample(id) => Ok(id.as_str() == sample_id.to_string()),
            Selection::Group(group_id) => Ok(self.group_members(group_id)?.contains(sample_id)),
            Selection::Not(inner) => Ok(!self.matches(inner, sample_id)?),
            Selection::And(lhs, rhs) => {
                Ok(self.matches(lhs, sample_id)? && self.matches(rhs, sample_id)?)
            }
            Selection::Or(lhs, rhs) => {
                Ok(self.matches(lhs, sample_id)? || self.matches(rhs, sample_id)?)
            }
        }
    }

    /// `count_observations(variant_id, selection)` (spec.md §4.4): the sum
    /// of `support` over observations whose variation's sample matches.
    pub fn count_observations(&self, variant_id: &Uuid, selection: &Selection) -> Result<u64, AppError> {
        let cf = self.cf(CF_OBSERVATIONS)?;
        let prefix = keys::observation_prefix(variant_id);
        let mut total = 0u64;
        for item in self.db.prefix_iterator_cf(&cf, &prefix) {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let variation_id_bytes: [u8; 16] = key[prefix.len()..]
                .try_into()
                .map_err(|_| AppError::Internal("malformed observation key".to_string()))?;
            let variation_id = Uuid::from_bytes(variation_id_bytes);
            let Some(variation) = self.get_variation(&variation_id)? else {
                continue;
            };
            if self.matches(selection, &variation.sample)? {
                let observation: Observation = serde_json::from_slice(&value)
                    .map_err(|e| AppError::Internal(format!("decoding observation: {e}")))?;
                total += observation.support as u64;
            }
        }
        Ok(total)
    }

    /// `count_covering_samples(chrom, pos, selection)` (spec.md §4.4): sum
    /// of `pool_size` over matching samples with either (i) a CoveredRegion
    /// spanning `pos`, or (ii) an explicit `sample:<id>` clause (§4.7(ii)).
    pub fn count_covering_samples(
        &self,
        chrom: &str,
        pos: i64,
        selection: &Selection,
    ) -> Result<u64, AppError> {
        let cf_coverages = self.cf(CF_COVERAGES)?;
        let mut covered_sample_ids = std::collections::HashSet::new();

        for bin in binning::overlapping(pos, pos)? {
            let cf = self.cf(CF_COVERED_REGIONS)?;
            let prefix = keys::covered_region_bin_prefix(chrom, bin);
            for item in self.db.prefix_iterator_cf(&cf, &prefix) {
                let (key, value) = item?;
                if !key.starts_with(&prefix) {
                    break;
                }
                let region: CoveredRegion = serde_json::from_slice(&value)
                    .map_err(|e| AppError::Internal(format!("decoding covered region: {e}")))?;
                if region.begin <= pos && pos <= region.end {
                    let coverage_id_bytes: [u8; 16] = key[key.len() - 16..]
                        .try_into()
                        .map_err(|_| AppError::Internal("malformed region key".to_string()))?;
                    let coverage_id = Uuid::from_bytes(coverage_id_bytes);
                    if let Some(bytes) = self.db.get_cf(&cf_coverages, keys::id_key(&coverage_id))? {
                        let coverage: Coverage = serde_json::from_slice(&bytes)
                            .map_err(|e| AppError::Internal(format!("decoding coverage: {e}")))?;
                        covered_sample_ids.insert(coverage.sample);
                    }
                }
            }
        }

        let mut total = 0u64;
        let mut counted = std::collections::HashSet::new();

        for sample_id in &covered_sample_ids {
            if !self.matches(selection, sample_id)? {
                continue;
            }
            if let Some(facts) = self.sample_facts(sample_id)? {
                total += facts.pool_size as u64;
                counted.insert(*sample_id);
            }
        }

        for sample_id_str in selection.explicit_samples() {
            let Ok(sample_id) = Uuid::parse_str(sample_id_str) else {
                continue;
            };
            if counted.contains(&sample_id) {
                continue;
            }
            if let Some(facts) = self.sample_facts(&sample_id)? {
                total += facts.pool_size as u64;
                counted.insert(sample_id);
            }
        }

        Ok(total)
    }

    // ---- tasks ---------------------------------------------------------

    pub fn put_task(&self, task: &Task) -> Result<(), AppError> {
        let cf = self.cf(CF_TASKS)?;
        let bytes = serde_json::to_vec(task)
            .map_err(|e| AppError::Internal(format!("encoding task: {e}")))?;
        self.db.put_cf(&cf, keys::id_key(&task.id), bytes)?;
        Ok(())
    }

    pub fn get_task(&self, id: &Uuid) -> Result<Option<Task>, AppError> {
        let cf = self.cf(CF_TASKS)?;
        let Some(bytes) = self.db.get_cf(&cf, keys::id_key(id))? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&bytes).map_err(|e| {
            AppError::Internal(format!("decoding task: {e}"))
        })?))
    }

    /// Claims `task_id` for execution, locking its row and rejecting a
    /// second claim against a non-`waiting` task (at-most-once, §4.9).
    pub fn claim_task(&self, task_id: &Uuid) -> Result<Task, AppError> {
        self.with_retries(|txn| {
            let cf = self.cf(CF_TASKS)?;
            let bytes = txn
                .get_for_update_cf(&cf, keys::id_key(task_id), true)?
                .ok_or_else(|| AppError::NotFound(format!("task {task_id}")))?;
            let mut task: Task = serde_json::from_slice(&bytes)
                .map_err(|e| AppError::Internal(format!("decoding task: {e}")))?;
            if task.state != TaskState::Waiting {
                return Err(AppError::IntegrityConflict(format!(
                    "task {task_id} is not waiting (state: {:?})",
                    task.state
                )));
            }
            task.state = TaskState::Running;
            let encoded = serde_json::to_vec(&task)
                .map_err(|e| AppError::Internal(format!("encoding task: {e}")))?;
            txn.put_cf(&cf, keys::id_key(task_id), encoded)?;
            Ok(task)
        })
    }

    pub fn checkpoint_task(
        &self,
        task_id: &Uuid,
        offset: u64,
        rows_accepted: u64,
        rows_rejected: u64,
        progress: u8,
    ) -> Result<bool, AppError> {
        self.with_retries(|txn| {
            let cf = self.cf(CF_TASKS)?;
            let bytes = txn
                .get_for_update_cf(&cf, keys::id_key(task_id), true)?
                .ok_or_else(|| AppError::NotFound(format!("task {task_id}")))?;
            let mut task: Task = serde_json::from_slice(&bytes)
                .map_err(|e| AppError::Internal(format!("decoding task: {e}")))?;
            task.checkpoint_offset = offset;
            task.rows_accepted = rows_accepted;
            task.rows_rejected = rows_rejected;
            task.progress = progress;
            let cancel = task.cancel_requested;
            let encoded = serde_json::to_vec(&task)
                .map_err(|e| AppError::Internal(format!("encoding task: {e}")))?;
            txn.put_cf(&cf, keys::id_key(task_id), encoded)?;
            Ok(cancel)
        })
    }

    pub fn finish_task(&self, task_id: &Uuid, error: Option<String>) -> Result<(), AppError> {
        self.with_retries(|txn| {
            let cf = self.cf(CF_TASKS)?;
            let bytes = txn
                .get_for_update_cf(&cf, keys::id_key(task_id), true)?
                .ok_or_else(|| AppError::NotFound(format!("task {task_id}")))?;
            let mut task: Task = serde_json::from_slice(&bytes)
                .map_err(|e| AppError::Internal(format!("decoding task: {e}")))?;
            task.state = match &error {
                Some(_) => TaskState::Failure,
                None => TaskState::Success,
            };
            task.error = error;
            if task.state == TaskState::Success {
                task.progress = 100;
            }
            let encoded = serde_json::to_vec(&task)
                .map_err(|e| AppError::Internal(format!("encoding task: {e}")))?;
            txn.put_cf(&cf, keys::id_key(task_id), encoded)?;
            Ok(())
        })
    }

    pub fn request_cancel(&self, task_id: &Uuid) -> Result<(), AppError> {
        self.with_retries(|txn| {
            let cf = self.cf(CF_TASKS)?;
            let bytes = txn
                .get_for_update_cf(&cf, keys::id_key(task_id), true)?
                .ok_or_else(|| AppError::NotFound(format!("task {task_id}")))?;
            let mut task: Task = serde_json::from_slice(&bytes)
                .map_err(|e| AppError::Internal(format!("decoding task: {e}")))?;
            task.cancel_requested = true;
            let encoded = serde_json::to_vec(&task)
                .map_err(|e| AppError::Internal(format!("encoding task: {e}")))?;
            txn.put_cf(&cf, keys::id_key(task_id), encoded)?;
            Ok(())
        })
    }

    /// Re-schedules a terminal task (admin action, spec.md §4.9).
    pub fn reschedule_task(&self, task_id: &Uuid) -> Result<(), AppError> {
        self.with_retries(|txn| {
            let cf = self.cf(CF_TASKS)?;
            let bytes = txn
                .get_for_update_cf(&cf, keys::id_key(task_id), true)?
                .ok_or_else(|| AppError::NotFound(format!("task {task_id}")))?;
            let mut task: Task = serde_json::from_slice(&bytes)
                .map_err(|e| AppError::Internal(format!("decoding task: {e}")))?;
            if !matches!(task.state, TaskState::Success | TaskState::Failure) {
                return Err(AppError::IntegrityConflict(format!(
                    "task {task_id} is not in a terminal state"
                )));
            }
            task.state = TaskState::Waiting;
            task.progress = 0;
            task.error = None;
            task.cancel_requested = false;
            let encoded = serde_json::to_vec(&task)
                .map_err(|e| AppError::Internal(format!("encoding task: {e}")))?;
            txn.put_cf(&cf, keys::id_key(task_id), encoded)?;
            Ok(())
        })
    }

    // ---- annotations ----------------------------------------------------

    pub fn put_annotation(&self, annotation: &Annotation) -> Result<(), AppError> {
        let cf = self.cf(CF_ANNOTATIONS)?;
        let bytes = serde_json::to_vec(annotation)
            .map_err(|e| AppError::Internal(format!("encoding annotation: {e}")))?;
        self.db.put_cf(&cf, keys::id_key(&annotation.id), bytes)?;
        Ok(())
    }

    pub fn get_annotation(&self, id: &Uuid) -> Result<Option<Annotation>, AppError> {
        let cf = self.cf(CF_ANNOTATIONS)?;
        let Some(bytes) = self.db.get_cf(&cf, keys::id_key(id))? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&bytes).map_err(|e| {
            AppError::Internal(format!("decoding annotation: {e}"))
        })?))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::{SampleState, TaskKind, Zygosity};

    fn open_tmp() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        (dir, store)
    }

    fn sample(id: Uuid, pool_size: u32, active: bool, coverage_profile: bool) -> Sample {
        Sample {
            id,
            owner: Uuid::new_v4(),
            name: "s".to_string(),
            pool_size,
            coverage_profile,
            public: false,
            state: if active { SampleState::Active } else { SampleState::Inactive },
            notes: String::new(),
        }
    }

    #[test]
    fn upsert_variant_is_idempotent() {
        let (_dir, store) = open_tmp();
        let variant = Variant {
            chrom: "19".to_string(),
            begin: 100,
            end: 100,
            observed: "G".to_string(),
        };
        let id1 = store.upsert_variant(&variant).unwrap();
        let id2 = store.upsert_variant(&variant).unwrap();
        assert_eq!(id1, id2);
    }

    #[test]
    fn duplicate_digest_variation_is_rejected() {
        let (_dir, store) = open_tmp();
        let sample_id = Uuid::new_v4();
        store.put_sample(&sample(sample_id, 1, false, true)).unwrap();
        let variation = Variation {
            id: Uuid::new_v4(),
            sample: sample_id,
            data_source: Uuid::new_v4(),
        };
        store.put_variation(&variation, "digest-a").unwrap();
        let second = Variation {
            id: Uuid::new_v4(),
            sample: sample_id,
            data_source: Uuid::new_v4(),
        };
        let err = store.put_variation(&second, "digest-a").unwrap_err();
        assert!(matches!(err, AppError::DuplicateImport));
    }

    #[test]
    fn sample_lock_rejects_a_second_holder_while_held() {
        let (_dir, store) = open_tmp();
        let sample_id = Uuid::new_v4();
        let first_task = Uuid::new_v4();
        let second_task = Uuid::new_v4();

        store.acquire_sample_lock(&sample_id, &first_task).unwrap();
        // Released only by release_sample_lock, so a concurrent acquire by
        // a different task would block (tested here via a quick conflict
        // check rather than a real blocking wait, to keep the suite fast).
        let cf = store.cf(CF_SAMPLE_LOCKS).unwrap();
        let held = store.db.get_cf(&cf, keys::id_key(&sample_id)).unwrap();
        assert_eq!(held.as_deref(), Some(first_task.as_bytes().as_slice()));

        store.release_sample_lock(&sample_id, &second_task).unwrap();
        let still_held = store.db.get_cf(&cf, keys::id_key(&sample_id)).unwrap();
        assert!(still_held.is_some(), "release by the wrong task must not clear the lock");

        store.release_sample_lock(&sample_id, &first_task).unwrap();
        let cleared = store.db.get_cf(&cf, keys::id_key(&sample_id)).unwrap();
        assert!(cleared.is_none());
    }

    #[test]
    fn sample_lock_is_reentrant_for_the_same_task() {
        let (_dir, store) = open_tmp();
        let sample_id = Uuid::new_v4();
        let task_id = Uuid::new_v4();
        store.acquire_sample_lock(&sample_id, &task_id).unwrap();
        store.acquire_sample_lock(&sample_id, &task_id).unwrap();
    }

    #[test]
    fn activate_sample_rejects_a_sample_locked_by_an_import() {
        let (_dir, store) = open_tmp();
        let sample_id = Uuid::new_v4();
        store.put_sample(&sample(sample_id, 1, false, false)).unwrap();
        let variation = Variation {
            id: Uuid::new_v4(),
            sample: sample_id,
            data_source: Uuid::new_v4(),
        };
        store.put_variation(&variation, "digest-lock").unwrap();

        let task_id = Uuid::new_v4();
        store.acquire_sample_lock(&sample_id, &task_id).unwrap();

        let err = store.activate_sample(&sample_id).unwrap_err();
        assert!(matches!(err, AppError::SampleStateConflict(_)));
    }

    #[test]
    fn count_observations_matches_tautology_for_active_covered_sample() {
        let (_dir, store) = open_tmp();
        let sample_id = Uuid::new_v4();
        store.put_sample(&sample(sample_id, 1, true, true)).unwrap();
        let variation = Variation {
            id: Uuid::new_v4(),
            sample: sample_id,
            data_source: Uuid::new_v4(),
        };
        store.put_variation(&variation, "digest-b").unwrap();

        let variant = Variant {
            chrom: "19".to_string(),
            begin: 100,
            end: 100,
            observed: "G".to_string(),
        };
        let variant_id = store.upsert_variant(&variant).unwrap();
        store
            .add_observations(
                &variant_id,
                &[(
                    variation.id,
                    Observation {
                        variation: variation.id,
                        support: 1,
                        zygosity: Zygosity::Het,
                    },
                )],
            )
            .unwrap();

        let selection = Selection::parse("*").unwrap();
        let count = store.count_observations(&variant_id, &selection).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn count_observations_excludes_inactive_samples_under_tautology() {
        let (_dir, store) = open_tmp();
        let sample_id = Uuid::new_v4();
        store.put_sample(&sample(sample_id, 1, false, true)).unwrap();
        let variation = Variation {
            id: Uuid::new_v4(),
            sample: sample_id,
            data_source: Uuid::new_v4(),
        };
        store.put_variation(&variation, "digest-c").unwrap();

        let variant = Variant {
            chrom: "19".to_string(),
            begin: 200,
            end: 200,
            observed: "T".to_string(),
        };
        let variant_id = store.upsert_variant(&variant).unwrap();
        store
            .add_observations(
                &variant_id,
                &[(
                    variation.id,
                    Observation {
                        variation: variation.id,
                        support: 1,
                        zygosity: Zygosity::Het,
                    },
                )],
            )
            .unwrap();

        let selection = Selection::parse("*").unwrap();
        let count = store.count_observations(&variant_id, &selection).unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn count_covering_samples_sees_region_spanning_position() {
        let (_dir, store) = open_tmp();
        let sample_id = Uuid::new_v4();
        store.put_sample(&sample(sample_id, 5, true, true)).unwrap();
        let coverage = Coverage {
            id: Uuid::new_v4(),
            sample: sample_id,
            data_source: Uuid::new_v4(),
        };
        store.put_coverage(&coverage, "digest-d").unwrap();

        let bin = crate::binning::assign(100, 200).unwrap();
        store
            .add_regions(
                &coverage.id,
                &[CoveredRegion {
                    coverage: coverage.id,
                    chrom: "19".to_string(),
                    begin: 100,
                    end: 200,
                    bin,
                }],
            )
            .unwrap();

        let selection = Selection::parse("*").unwrap();
        let covered = store.count_covering_samples("19", 150, &selection).unwrap();
        assert_eq!(covered, 5);

        let uncovered = store.count_covering_samples("19", 500, &selection).unwrap();
        assert_eq!(uncovered, 0);
    }

    #[test]
    fn activation_requires_a_variation() {
        let (_dir, store) = open_tmp();
        let sample_id = Uuid::new_v4();
        store.put_sample(&sample(sample_id, 1, false, false)).unwrap();
        let err = store.activate_sample(&sample_id).unwrap_err();
        assert!(matches!(err, AppError::SampleStateConflict(_)));
    }

    #[test]
    fn activation_succeeds_once_variation_exists() {
        let (_dir, store) = open_tmp();
        let sample_id = Uuid::new_v4();
        store.put_sample(&sample(sample_id, 1, false, false)).unwrap();
        let variation = Variation {
            id: Uuid::new_v4(),
            sample: sample_id,
            data_source: Uuid::new_v4(),
        };
        store.put_variation(&variation, "digest-e").unwrap();
        store.activate_sample(&sample_id).unwrap();
        let sample = store.get_sample(&sample_id).unwrap().unwrap();
        assert!(sample.is_active());
    }

    #[test]
    fn activation_blocked_by_pending_task() {
        let (_dir, store) = open_tmp();
        let sample_id = Uuid::new_v4();
        store.put_sample(&sample(sample_id, 1, false, false)).unwrap();
        let variation = Variation {
            id: Uuid::new_v4(),
            sample: sample_id,
            data_source: Uuid::new_v4(),
        };
        store.put_variation(&variation, "digest-f").unwrap();
        let task = Task::new(TaskKind::ImportVariation, sample_id);
        store.put_task(&task).unwrap();
        let err = store.activate_sample(&sample_id).unwrap_err();
        assert!(matches!(err, AppError::SampleStateConflict(_)));
    }

    #[test]
    fn claim_task_rejects_second_claim() {
        let (_dir, store) = open_tmp();
        let task = Task::new(TaskKind::ImportVariation, Uuid::new_v4());
        store.put_task(&task).unwrap();
        store.claim_task(&task.id).unwrap();
        let err = store.claim_task(&task.id).unwrap_err();
        assert!(matches!(err, AppError::IntegrityConflict(_)));
    }
}
