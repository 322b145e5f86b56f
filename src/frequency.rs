//! Frequency engine (spec.md §4.7 / C7).
//!
//! Computes `(observed, covered, total_support)` for a variant under a
//! sample-selection expression, submitting a single bin-restricted query
//! (via `crate::store`, which itself uses `crate::binning` to bound its
//! scans) rather than scanning the whole store.

use crate::err::AppError;
use crate::model::Variant;
use crate::store::selection::Selection;
use crate::store::Store;

/// Result of a frequency computation (spec.md §4.7).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frequency {
    pub observed: u64,
    pub covered: u64,
}

impl Frequency {
    /// `observed / covered`, or `None` when `covered == 0` (the ratio is
    /// undefined per spec.md §4.7). We do not clamp `observed > covered`
    /// (Open Question #1 in SPEC_FULL.md); callers should surface the
    /// `tracing::warn!` this function emits for that case.
    pub fn ratio(&self) -> Option<f64> {
        if self.covered == 0 {
            None
        } else {
            Some(self.observed as f64 / self.covered as f64)
        }
    }
}

/// `freq(variant, selection) -> (observed, covered, total_support)`.
/// `total_support` coincides with `covered` (spec.md §4.7: "`total_support`
/// ≡ `covered` for denominators").
pub fn freq(store: &Store, variant: &Variant, selection_src: &str) -> Result<Frequency, AppError> {
    let selection = Selection::parse(selection_src)?;
    let variant_id = lookup_or_zero(store, variant)?;
    let observed = match variant_id {
        Some(id) => store.count_observations(&id, &selection)?,
        None => 0,
    };
    let covered = store.count_covering_samples(&variant.chrom, variant.begin, &selection)?;

    if observed > covered {
        tracing::warn!(
            chrom = %variant.chrom,
            begin = variant.begin,
            observed,
            covered,
            "observed count exceeds covered count at this locus"
        );
    }

    Ok(Frequency { observed, covered })
}

fn lookup_or_zero(store: &Store, variant: &Variant) -> Result<Option<uuid::Uuid>, AppError> {
    // `upsert_variant` would create a row for a variant that was never
    // observed; a frequency query must not have that side effect, so we
    // probe the identity key directly through a throwaway transaction-free
    // read path exposed for this purpose.
    store.find_variant(variant)
}
