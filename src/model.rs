//! Core data model (spec.md §3).
//!
//! These types are the in-process representation of the entities the
//! store (`crate::store`) persists. They carry no storage-engine-specific
//! detail; encoding lives in `crate::store::keys`/`crate::store::codec`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A role a [`User`] principal may hold. Only used at the (out-of-scope)
/// HTTP boundary for authorization checks; kept here because the role set
/// is part of the shared data model.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Admin,
    Importer,
    Annotator,
    Trader,
    GroupAdmin,
    Querier,
}

/// Kind of payload carried by a [`DataSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Vcf,
    Bed,
    Csv,
}

/// An immutable blob plus its metadata (spec.md §3 `DataSource`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSource {
    pub id: Uuid,
    /// Content digest of the *decompressed* payload, hex-encoded.
    pub digest: String,
    pub filetype: FileType,
    pub gzipped: bool,
    pub owner: Uuid,
}

/// Lifecycle state of a [`Sample`] (spec.md §4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SampleState {
    Inactive,
    Active,
}

/// A logical container for observations and coverage (spec.md §3 `Sample`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub id: Uuid,
    pub owner: Uuid,
    pub name: String,
    /// Number of individuals pooled into this sample; must be `>= 1`.
    pub pool_size: u32,
    /// Whether per-locus sequencing coverage is available for this sample.
    pub coverage_profile: bool,
    pub public: bool,
    pub state: SampleState,
    pub notes: String,
}

impl Sample {
    pub fn is_active(&self) -> bool {
        matches!(self.state, SampleState::Active)
    }
}

/// One ingestion of variant observations into a [`Sample`] (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variation {
    pub id: Uuid,
    pub sample: Uuid,
    pub data_source: Uuid,
}

/// One ingestion of covered-region data into a [`Sample`] (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coverage {
    pub id: Uuid,
    pub sample: Uuid,
    pub data_source: Uuid,
}

/// Classification of a normalized variant (derived by `crate::variant`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum VariantKind {
    Snv,
    Insertion,
    Deletion,
    Mnv,
}

/// The canonical identity of a genomic event (spec.md §4.3).
///
/// `begin`/`end` are 1-based, inclusive, post-normalization coordinates.
/// For a pure insertion, `end = begin - 1` (an empty reference span).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Variant {
    pub chrom: String,
    pub begin: i64,
    pub end: i64,
    pub observed: String,
}

impl Variant {
    pub fn kind(&self, reference_len: usize) -> VariantKind {
        let obs_len = self.observed.len();
        if reference_len == 0 {
            VariantKind::Insertion
        } else if obs_len == 0 {
            VariantKind::Deletion
        } else if reference_len == 1 && obs_len == 1 {
            VariantKind::Snv
        } else {
            VariantKind::Mnv
        }
    }
}

/// Zygosity of an [`Observation`] (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Zygosity {
    Hom,
    Het,
    Unknown,
}

/// A [`Variant`] occurring within a particular [`Variation`] (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub variation: Uuid,
    /// Number of individuals in the variation contributing this observation.
    pub support: u32,
    pub zygosity: Zygosity,
}

/// One covered genomic interval from a [`Coverage`] ingestion (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoveredRegion {
    pub coverage: Uuid,
    pub chrom: String,
    /// 1-based, inclusive.
    pub begin: i64,
    /// 1-based, inclusive.
    pub end: i64,
    pub bin: u32,
}

/// Kind of a [`Task`] (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    ImportVariation,
    ImportCoverage,
    Annotate,
}

/// State of a [`Task`] (spec.md §4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Waiting,
    Running,
    Success,
    Failure,
}

/// A schedulable unit of work (spec.md §3, §4.9).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub kind: TaskKind,
    pub state: TaskState,
    /// `0..=100`.
    pub progress: u8,
    pub error: Option<String>,
    /// The entity this task operates on (a `Variation`, `Coverage`, or
    /// `Annotation` id).
    pub target: Uuid,
    /// Set when a caller requests cooperative cancellation.
    pub cancel_requested: bool,
    /// Byte offset into the uncompressed input stream, for resumption.
    pub checkpoint_offset: u64,
    pub rows_accepted: u64,
    pub rows_rejected: u64,
}

impl Task {
    pub fn new(kind: TaskKind, target: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            state: TaskState::Waiting,
            progress: 0,
            error: None,
            target,
            cancel_requested: false,
            checkpoint_offset: 0,
            rows_accepted: 0,
            rows_rejected: 0,
        }
    }
}

/// A derived [`DataSource`] obtained by annotating an input VCF/BED
/// (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    pub id: Uuid,
    pub original_data_source: Uuid,
    pub annotated_data_source: Option<Uuid>,
    /// `(slug, selection expression source)` pairs, in output order.
    pub queries: Vec<(String, String)>,
    pub task: Uuid,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn variant_kind_classification() {
        let snv = Variant {
            chrom: "1".into(),
            begin: 100,
            end: 100,
            observed: "G".into(),
        };
        assert_eq!(snv.kind(1), VariantKind::Snv);

        let ins = Variant {
            chrom: "1".into(),
            begin: 100,
            end: 99,
            observed: "AAA".into(),
        };
        assert_eq!(ins.kind(0), VariantKind::Insertion);

        let del = Variant {
            chrom: "1".into(),
            begin: 101,
            end: 104,
            observed: "".into(),
        };
        assert_eq!(del.kind(4), VariantKind::Deletion);

        let mnv = Variant {
            chrom: "1".into(),
            begin: 100,
            end: 102,
            observed: "GAT".into(),
        };
        assert_eq!(mnv.kind(3), VariantKind::Mnv);
    }
}
