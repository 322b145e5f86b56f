//! Task orchestration (spec.md §4.9 / C9).
//!
//! Drives a claimed [`Task`] through the ingestion/annotation pipeline that
//! matches its kind, widening every outcome into the terminal `success` /
//! `failure` transition `Store::finish_task` performs. This is the "worker"
//! half of the broker/worker split spec.md §5 describes; the broker itself
//! (how a `waiting` task is handed to a worker process) is out of scope.

use uuid::Uuid;

use crate::annotate::{self, Queries};
use crate::blob::BlobStore;
use crate::err::AppError;
use crate::ingest::{coverage, variation};
use crate::model::{Annotation, DataSource, FileType, Task, TaskKind};
use crate::reference::ReferenceOracle;
use crate::store::Store;

/// Runs tasks to completion against a fixed set of collaborators. One
/// `TaskRunner` is shared by every worker thread in a pool; all state it
/// touches lives in `store`/`blob`, so the runner itself is `Send + Sync`.
pub struct TaskRunner<'a> {
    store: &'a Store,
    blob: &'a BlobStore,
    out_blob: &'a BlobStore,
    reference: Option<&'a dyn ReferenceOracle>,
    variation_options: variation::ImportOptions,
    coverage_options: coverage::ImportOptions,
}

impl<'a> TaskRunner<'a> {
    pub fn new(
        store: &'a Store,
        blob: &'a BlobStore,
        out_blob: &'a BlobStore,
        reference: Option<&'a dyn ReferenceOracle>,
    ) -> Self {
        Self {
            store,
            blob,
            out_blob,
            reference,
            variation_options: variation::ImportOptions::default(),
            coverage_options: coverage::ImportOptions::default(),
        }
    }

    pub fn with_variation_options(mut self, options: variation::ImportOptions) -> Self {
        self.variation_options = options;
        self
    }

    pub fn with_coverage_options(mut self, options: coverage::ImportOptions) -> Self {
        self.coverage_options = options;
        self
    }

    /// Claims `task_id` and runs it to a terminal state, returning the error
    /// that caused `failure` (if any) rather than swallowing it, so a caller
    /// can decide whether to log, retry, or propagate further.
    pub fn run(&self, task_id: &Uuid) -> Result<(), AppError> {
        let task = self.store.claim_task(task_id)?;
        let outcome = match task.kind {
            TaskKind::ImportVariation => self.run_import_variation(&task),
            TaskKind::ImportCoverage => self.run_import_coverage(&task),
            TaskKind::Annotate => self.run_annotate(&task),
        };
        match outcome {
            Ok(()) => {
                self.store.finish_task(&task.id, None)?;
                Ok(())
            }
            Err(AppError::Cancelled) => {
                self.store
                    .finish_task(&task.id, Some("cancelled".to_string()))?;
                Err(AppError::Cancelled)
            }
            Err(e) => {
                self.store.finish_task(&task.id, Some(e.to_string()))?;
                Err(e)
            }
        }
    }

    /// Serializes concurrent imports into the same Sample (spec.md §5) by
    /// holding the sample's advisory lock for the whole call to `body`,
    /// releasing it on every exit path including an error or cancellation.
    fn with_sample_lock<T>(
        &self,
        sample_id: &Uuid,
        task_id: &Uuid,
        body: impl FnOnce() -> Result<T, AppError>,
    ) -> Result<T, AppError> {
        self.store.acquire_sample_lock(sample_id, task_id)?;
        let result = body();
        self.store.release_sample_lock(sample_id, task_id)?;
        result
    }

    fn run_import_variation(&self, task: &Task) -> Result<(), AppError> {
        let variation_row = self
            .store
            .get_variation(&task.target)?
            .ok_or_else(|| AppError::NotFound(format!("variation {}", task.target)))?;
        let data_source = self
            .store
            .get_data_source(&variation_row.data_source)?
            .ok_or_else(|| AppError::NotFound(format!("data source {}", variation_row.data_source)))?;
        let owner = data_source.owner.to_string();
        self.with_sample_lock(&variation_row.sample, &task.id, || {
            variation::import_variation(
                self.store,
                self.blob,
                self.reference,
                task,
                &variation_row.id,
                &owner,
                &data_source,
                &self.variation_options,
            )
        })
    }

    fn run_import_coverage(&self, task: &Task) -> Result<(), AppError> {
        let coverage_row = self
            .store
            .get_coverage(&task.target)?
            .ok_or_else(|| AppError::NotFound(format!("coverage {}", task.target)))?;
        let data_source = self
            .store
            .get_data_source(&coverage_row.data_source)?
            .ok_or_else(|| AppError::NotFound(format!("data source {}", coverage_row.data_source)))?;
        let owner = data_source.owner.to_string();
        self.with_sample_lock(&coverage_row.sample, &task.id, || {
            coverage::import_coverage(
                self.store,
                self.blob,
                task,
                &coverage_row.id,
                &owner,
                &data_source,
                &self.coverage_options,
            )
        })
    }

    fn run_annotate(&self, task: &Task) -> Result<(), AppError> {
        let annotation = self
            .store
            .get_annotation(&task.target)?
            .ok_or_else(|| AppError::NotFound(format!("annotation {}", task.target)))?;
        let data_source = self
            .store
            .get_data_source(&annotation.original_data_source)?
            .ok_or_else(|| {
                AppError::NotFound(format!("data source {}", annotation.original_data_source))
            })?;
        let owner = data_source.owner.to_string();
        let queries: Queries = annotation.queries.clone();

        let digest = annotate::annotate(
            self.store,
            self.blob,
            self.out_blob,
            self.reference,
            task,
            &data_source,
            &owner,
            &queries,
        )?;

        let annotated = DataSource {
            id: Uuid::new_v4(),
            digest,
            filetype: FileType::Vcf,
            gzipped: false,
            owner: data_source.owner,
        };
        self.store.put_data_source(&annotated)?;

        let updated = Annotation {
            annotated_data_source: Some(annotated.id),
            ..annotation
        };
        self.store.put_annotation(&updated)
    }
}
