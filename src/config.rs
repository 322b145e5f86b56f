//! Process-wide configuration (spec.md §6 "Configuration (enumerated)").
//!
//! Mirrors the common CLI args pattern the teacher's worker uses
//! (`clap::Parser` with `#[command(flatten)]`), generalized so every
//! subcommand shares one parsed `DATA_DIR`/`GENOME`/... block instead of
//! threading loose strings through each command's own `Args`.

use std::path::PathBuf;

use clap::Parser;

use crate::blob::BlobStore;
use crate::variant::ReferenceMismatchPolicy;

/// Default upload ceiling: 1 GiB.
pub const DEFAULT_MAX_CONTENT_LENGTH: u64 = 1 << 30;

/// Engine-wide configuration, populated from the environment or flags
/// (`#[clap(env)]` on every field, following spec.md §6's enumerated keys).
#[derive(Debug, Clone, Parser)]
pub struct Config {
    /// Blob store root.
    #[clap(long, env = "DATA_DIR")]
    pub data_dir: PathBuf,

    /// Alternate read-only blob root, consulted when a digest is absent
    /// from `DATA_DIR`.
    #[clap(long, env = "SECONDARY_DATA_DIR")]
    pub secondary_data_dir: Option<PathBuf>,

    /// Whether `SECONDARY_DATA_DIR` is sharded by owner subdirectory.
    #[clap(long, env = "SECONDARY_DATA_BY_USER", default_value_t = false)]
    pub secondary_data_by_user: bool,

    /// Upload ceiling in bytes.
    #[clap(long, env = "MAX_CONTENT_LENGTH", default_value_t = DEFAULT_MAX_CONTENT_LENGTH)]
    pub max_content_length: u64,

    /// Reference FASTA path; when unset, reference validation (spec.md
    /// §4.3) is skipped entirely.
    #[clap(long, env = "GENOME")]
    pub genome: Option<PathBuf>,

    /// On a reference mismatch: abort the task (default) or drop the
    /// offending record and continue.
    #[clap(long, env = "REFERENCE_MISMATCH_ABORT", default_value_t = true)]
    pub reference_mismatch_abort: bool,

    /// Value of the CORS response header on the (out-of-scope) HTTP
    /// surface; carried here since it is part of the documented
    /// configuration surface.
    #[clap(long, env = "CORS_ALLOW_ORIGIN")]
    pub cors_allow_origin: Option<String>,

    /// Mount path for the (out-of-scope) HTTP surface.
    #[clap(long, env = "API_URL_PREFIX", default_value = "/")]
    pub api_url_prefix: String,

    /// The RocksDB directory backing `crate::store::Store`.
    #[clap(long, env = "STORE_DIR")]
    pub store_dir: PathBuf,

    /// Root under which annotated VCFs are written, distinct from
    /// `DATA_DIR` so annotation output never collides with ingested input.
    #[clap(long, env = "ANNOTATED_DATA_DIR")]
    pub annotated_data_dir: PathBuf,
}

impl Config {
    pub fn reference_mismatch_policy(&self) -> ReferenceMismatchPolicy {
        if self.reference_mismatch_abort {
            ReferenceMismatchPolicy::Abort
        } else {
            ReferenceMismatchPolicy::Drop
        }
    }

    pub fn blob_store(&self) -> BlobStore {
        let mut store = BlobStore::new(&self.data_dir);
        if let Some(secondary) = &self.secondary_data_dir {
            store = store.with_secondary(secondary, self.secondary_data_by_user);
        }
        store
    }

    pub fn annotated_blob_store(&self) -> BlobStore {
        BlobStore::new(&self.annotated_data_dir)
    }
}
