//! Central error taxonomy for the Varda engine.
//!
//! Library code returns `Result<T, AppError>` throughout; only truly
//! unexpected faults (a poisoned lock, a corrupt on-disk structure) are
//! allowed to panic. `main.rs` is the only place that widens `AppError`
//! into `anyhow::Error` for top-level reporting, mirroring how the
//! original worker's subcommands return `anyhow::Error` from `run()`.

use std::num::ParseIntError;

/// Error kinds from spec §7, plus the component-local errors named
/// throughout §4. Every variant maps onto one of the documented HTTP error
/// codes via [`AppError::code`], even though the HTTP surface itself is out
/// of scope here; keeping the mapping close to the error type is what lets
/// an (out-of-scope) HTTP layer implement the contract faithfully.
#[derive(thiserror::Error, Debug, Clone)]
pub enum AppError {
    /// Malformed request, VCF/BED line, or argument.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Principal is not authenticated.
    #[error("unauthorized")]
    Unauthorized,

    /// Principal is authenticated but lacks the required role.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Chromosome name not known to the reference oracle.
    #[error("unknown chromosome: {0}")]
    UnknownChromosome(String),

    /// Coordinate outside the defined range of a chromosome or bin tier.
    #[error("out of range: {0}")]
    OutOfRange(String),

    /// Claimed `ref` allele does not match the reference oracle.
    #[error("reference mismatch at {chrom}:{begin}-{end}: claimed {claimed:?}, actual {actual:?}")]
    ReferenceMismatch {
        chrom: String,
        begin: i64,
        end: i64,
        claimed: String,
        actual: String,
    },

    /// Duplicate digest / duplicate import / import into active sample, etc.
    #[error("integrity conflict: {0}")]
    IntegrityConflict(String),

    /// A data source with this digest has already been imported into this
    /// sample for this kind of data.
    #[error("duplicate import of data source into sample (digest already bound)")]
    DuplicateImport,

    /// Activation attempted while an import targets the sample, or similar.
    #[error("sample state conflict: {0}")]
    SampleStateConflict(String),

    /// Uploaded content exceeds `MAX_CONTENT_LENGTH`.
    #[error("entity too large")]
    EntityTooLarge,

    /// Requested `Range` cannot be satisfied.
    #[error("unsatisfiable range")]
    UnsatisfiableRange,

    /// A selection expression failed to parse or violates a grammar rule
    /// (e.g. bare `not *`).
    #[error("invalid selection: {0}")]
    InvalidSelection(String),

    /// Cooperative cancellation observed at a checkpoint.
    #[error("cancelled")]
    Cancelled,

    /// Not implemented in this engine (reserved for forward compatibility).
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Transient store failure that survived all retries.
    #[error("transient store failure after retries: {0}")]
    StoreRetriesExceeded(String),

    /// Wraps an underlying RocksDB error.
    #[error("store error: {0}")]
    Store(String),

    /// Wraps an underlying I/O error.
    #[error("I/O error: {0}")]
    Io(String),

    /// Anything else unexpected; kept distinct from a panic so that a task
    /// can still be marked `failure` with a message instead of aborting
    /// the whole worker process.
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// The `{error:{code, ...}}` code from spec.md §6, for an (out-of-scope)
    /// HTTP layer to surface verbatim.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::BadRequest(_) => "bad_request",
            AppError::Unauthorized => "unauthorized",
            AppError::Forbidden(_) => "forbidden",
            AppError::NotFound(_) => "not_found",
            AppError::UnknownChromosome(_) | AppError::OutOfRange(_) => "bad_request",
            AppError::ReferenceMismatch { .. } => "bad_request",
            AppError::IntegrityConflict(_)
            | AppError::DuplicateImport
            | AppError::SampleStateConflict(_) => "integrity_conflict",
            AppError::EntityTooLarge => "entity_too_large",
            AppError::UnsatisfiableRange => "unsatisfiable_range",
            AppError::InvalidSelection(_) => "bad_request",
            AppError::Cancelled => "internal_server_error",
            AppError::NotImplemented(_) => "not_implemented",
            AppError::StoreRetriesExceeded(_)
            | AppError::Store(_)
            | AppError::Io(_)
            | AppError::Internal(_) => "internal_server_error",
        }
    }
}

impl From<rocksdb::Error> for AppError {
    fn from(e: rocksdb::Error) -> Self {
        AppError::Store(e.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        AppError::Io(e.to_string())
    }
}

impl From<ParseIntError> for AppError {
    fn from(e: ParseIntError) -> Self {
        AppError::BadRequest(format!("invalid integer: {e}"))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn code_mapping_is_stable() {
        assert_eq!(AppError::Unauthorized.code(), "unauthorized");
        assert_eq!(AppError::DuplicateImport.code(), "integrity_conflict");
        assert_eq!(
            AppError::InvalidSelection("x".into()).code(),
            "bad_request"
        );
    }
}
