//! Variant normalization and identity (spec.md §4.3 / C3).
//!
//! Trims the common suffix then the common prefix of `ref`/`obs`, the same
//! left-alignment-agnostic rule VCF tooling converges on so that two
//! differently-represented indels collapse to one canonical row in C5.

use crate::err::AppError;
use crate::model::Variant;
use crate::reference::ReferenceOracle;

/// How a reference mismatch during normalization should be handled,
/// mirroring `REFERENCE_MISMATCH_ABORT` (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceMismatchPolicy {
    /// Abort the whole task (the configured default).
    Abort,
    /// Drop this record and let the caller record a task warning.
    Drop,
}

/// Result of normalizing one input record.
pub enum Normalized {
    Accepted(Variant),
    /// Dropped due to a reference mismatch under [`ReferenceMismatchPolicy::Drop`].
    Dropped { reason: AppError },
}

/// Resolves `chrom` to its canonical spelling: through the oracle's own
/// alias table when one is present (so `Variant.chrom` matches whatever
/// spelling the loaded FASTA actually uses), or through
/// [`crate::common::build_chrom_map`]'s fixed alias table otherwise. Names
/// outside that table (alt contigs, scaffolds) pass through unchanged.
fn canonical_chrom(chrom: &str, oracle: Option<&dyn ReferenceOracle>) -> Result<String, AppError> {
    if let Some(oracle) = oracle {
        return oracle.canonical_name(chrom);
    }
    Ok(match crate::common::chrom_map().get(chrom) {
        Some(&idx) => crate::common::CHROMS[idx].to_string(),
        None => chrom.to_string(),
    })
}

/// Canonicalizes `(chrom, begin, ref, obs)` into a [`Variant`].
///
/// `begin` is the 1-based position of the first base of `reference`.
/// `reference`/`observed` may be empty strings (pure insertion/deletion).
/// `chrom` is canonicalized via [`canonical_chrom`] before it is stored, so
/// `"chr1"` and `"1"` produce the same `Variant.chrom`; the oracle (when
/// present) also rejects unknown names through `bases`.
pub fn normalize(
    chrom: &str,
    begin: i64,
    reference: &str,
    observed: &str,
    oracle: Option<&dyn ReferenceOracle>,
    policy: ReferenceMismatchPolicy,
) -> Result<Normalized, AppError> {
    let reference_bytes = reference.as_bytes();
    let observed_bytes = observed.as_bytes();

    let mut suffix_len = 0usize;
    while suffix_len < reference_bytes.len()
        && suffix_len < observed_bytes.len()
        && reference_bytes[reference_bytes.len() - 1 - suffix_len]
            == observed_bytes[observed_bytes.len() - 1 - suffix_len]
    {
        suffix_len += 1;
    }
    let ref_trimmed = &reference_bytes[..reference_bytes.len() - suffix_len];
    let obs_trimmed = &observed_bytes[..observed_bytes.len() - suffix_len];

    let mut prefix_len = 0usize;
    while prefix_len < ref_trimmed.len()
        && prefix_len < obs_trimmed.len()
        && ref_trimmed[prefix_len] == obs_trimmed[prefix_len]
    {
        prefix_len += 1;
    }

    let new_begin = begin + prefix_len as i64;
    let new_ref = &ref_trimmed[prefix_len..];
    let new_obs = &obs_trimmed[prefix_len..];
    let new_end = new_begin + new_ref.len() as i64 - 1;

    let new_ref = std::str::from_utf8(new_ref)
        .map_err(|e| AppError::BadRequest(format!("non-UTF8 reference allele: {e}")))?
        .to_ascii_uppercase();
    let new_obs = std::str::from_utf8(new_obs)
        .map_err(|e| AppError::BadRequest(format!("non-UTF8 observed allele: {e}")))?
        .to_ascii_uppercase();

    let chrom = canonical_chrom(chrom, oracle)?;

    if let Some(oracle) = oracle {
        if !new_ref.is_empty() {
            let actual = oracle.bases(&chrom, new_begin, new_end)?;
            if actual != new_ref {
                let mismatch = AppError::ReferenceMismatch {
                    chrom: chrom.clone(),
                    begin: new_begin,
                    end: new_end,
                    claimed: new_ref,
                    actual,
                };
                return match policy {
                    ReferenceMismatchPolicy::Abort => Err(mismatch),
                    ReferenceMismatchPolicy::Drop => Ok(Normalized::Dropped { reason: mismatch }),
                };
            }
        }
    }

    Ok(Normalized::Accepted(Variant {
        chrom,
        begin: new_begin,
        end: new_end,
        observed: new_obs,
    }))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::VariantKind;
    use rstest::rstest;

    fn normalize_no_ref(chrom: &str, begin: i64, reference: &str, observed: &str) -> Variant {
        match normalize(chrom, begin, reference, observed, None, ReferenceMismatchPolicy::Abort)
            .unwrap()
        {
            Normalized::Accepted(v) => v,
            Normalized::Dropped { .. } => panic!("unexpected drop"),
        }
    }

    #[test]
    fn snv_passes_through_unchanged() {
        let v = normalize_no_ref("chr19", 100, "A", "G");
        assert_eq!(v.chrom, "19");
        assert_eq!(v.begin, 100);
        assert_eq!(v.end, 100);
        assert_eq!(v.observed, "G");
    }

    #[test]
    fn chrom_is_canonicalized_with_or_without_an_oracle() {
        let bare = normalize_no_ref("1", 100, "A", "G");
        let prefixed = normalize_no_ref("chr1", 100, "A", "G");
        assert_eq!(bare.chrom, "1");
        assert_eq!(prefixed.chrom, "1");
    }

    #[test]
    fn deletion_trims_common_prefix_and_shifts_begin() {
        // chr19 100 . ACAAA A -> deletion of CAAA at 101-104
        let v = normalize_no_ref("chr19", 100, "ACAAA", "A");
        assert_eq!(v.begin, 101);
        assert_eq!(v.end, 104);
        assert_eq!(v.observed, "");
        assert_eq!(v.kind(4), VariantKind::Deletion);
    }

    #[test]
    fn right_and_left_shifted_indel_forms_collapse_to_one_identity() {
        // Equivalent representations of the same deletion at different
        // anchor points must normalize to the same canonical Variant.
        let left = normalize_no_ref("chr19", 100, "ACAAA", "A");
        let right = normalize_no_ref("chr19", 101, "CAAAC", "C");
        assert_eq!(left, right);
    }

    #[test]
    fn pure_insertion_has_empty_reference_span() {
        let v = normalize_no_ref("chr1", 50, "A", "ATT");
        assert_eq!(v.begin, 51);
        assert_eq!(v.end, 50);
        assert_eq!(v.observed, "TT");
        assert_eq!(v.kind(0), VariantKind::Insertion);
    }

    #[rstest]
    #[case("chr19", 100, "A", "G")]
    #[case("chr19", 100, "ACAAA", "A")]
    #[case("chr1", 50, "A", "ATT")]
    #[case("chr2", 10, "GATTACA", "GTTTACA")]
    fn normalization_is_idempotent(
        #[case] chrom: &str,
        #[case] begin: i64,
        #[case] reference: &str,
        #[case] observed: &str,
    ) {
        let once = normalize_no_ref(chrom, begin, reference, observed);
        let reference_len = once.end - once.begin + 1;
        let reference_len = reference_len.max(0) as usize;
        let twice = normalize_no_ref(&once.chrom, once.begin, &"N".repeat(reference_len), &once.observed);
        // Re-normalizing an already-canonical (begin,end,observed) with a
        // placeholder reference of the same length must not move begin/end
        // any further, since there is nothing left to trim.
        assert_eq!(once.begin, twice.begin);
        assert_eq!(once.end, twice.end);
        assert_eq!(once.observed, twice.observed);
    }

    struct FixedOracle {
        sequence: &'static str,
        start: i64,
    }

    impl ReferenceOracle for FixedOracle {
        fn chromosomes(&self) -> Vec<(String, i64)> {
            vec![("chr19".to_string(), 1_000)]
        }

        fn bases(&self, _chrom: &str, begin: i64, end: i64) -> Result<String, AppError> {
            let lo = (begin - self.start) as usize;
            let hi = (end - self.start + 1) as usize;
            Ok(self.sequence[lo..hi].to_string())
        }

        fn canonical_name(&self, chrom: &str) -> Result<String, AppError> {
            if chrom == "chr19" || chrom == "19" {
                Ok("chr19".to_string())
            } else {
                Err(AppError::UnknownChromosome(chrom.to_string()))
            }
        }
    }

    #[test]
    fn reference_match_is_accepted() {
        let oracle = FixedOracle {
            sequence: "ACGTACGT",
            start: 100,
        };
        let result = normalize(
            "chr19",
            100,
            "A",
            "G",
            Some(&oracle),
            ReferenceMismatchPolicy::Abort,
        )
        .unwrap();
        assert!(matches!(result, Normalized::Accepted(_)));
    }

    #[test]
    fn reference_mismatch_aborts_by_default() {
        let oracle = FixedOracle {
            sequence: "CCGTACGT",
            start: 100,
        };
        let err = normalize(
            "chr19",
            100,
            "A",
            "G",
            Some(&oracle),
            ReferenceMismatchPolicy::Abort,
        )
        .unwrap_err();
        assert!(matches!(err, AppError::ReferenceMismatch { .. }));
    }

    #[test]
    fn reference_mismatch_drops_when_configured() {
        let oracle = FixedOracle {
            sequence: "CCGTACGT",
            start: 100,
        };
        let result = normalize(
            "chr19",
            100,
            "A",
            "G",
            Some(&oracle),
            ReferenceMismatchPolicy::Drop,
        )
        .unwrap();
        assert!(matches!(result, Normalized::Dropped { .. }));
    }
}
