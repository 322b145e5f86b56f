//! UCSC-style hierarchical genomic interval binning (spec.md §4.1).
//!
//! Five tiers of exponentially shrinking bins let a range query restrict
//! a store scan to the handful of bins that could possibly overlap it,
//! instead of scanning every variant on a chromosome. The finest tier
//! covers 128 Kbp; each coarser tier covers 8x more, up to the top tier
//! that spans an entire chromosome arm.
//!
//! This is the same scheme the UCSC Genome Browser's `bin` SQL column
//! uses, and the one implementations in this space reach for when they
//! need fast overlap lookups without a spatial index: a small, fixed
//! offset table plus a shift per tier.

use crate::err::AppError;

/// Per-tier key offsets, finest tier first, so that bin numbers never
/// collide across tiers. The last entry (`0`) is the single top-level bin
/// spanning the whole addressable coordinate space.
const BIN_OFFSETS: [u32; 5] = [512 + 64 + 8 + 1, 64 + 8 + 1, 8 + 1, 1, 0];

/// `log2` of the finest bin size (2^17 = 131_072 bp).
const FIRST_SHIFT: u32 = 17;
const NEXT_SHIFT: u32 = 3;

/// Largest 1-based coordinate this scheme can address (2^29, ~536 Mbp,
/// enough for any human chromosome).
pub const MAX_COORDINATE: i64 = 1 << 29;

/// Assigns the single finest-tier bin containing a feature spanning
/// `[begin, end]` (1-based, inclusive). Mirrors UCSC's `binFromRangeStandard`.
///
/// # Errors
/// Returns [`AppError::OutOfRange`] if `begin > end` or either coordinate
/// falls outside `1..=MAX_COORDINATE`.
pub fn assign(begin: i64, end: i64) -> Result<u32, AppError> {
    validate_range(begin, end)?;
    let (begin, end) = (begin - 1, end - 1); // to 0-based for shifting
    let mut start_bin = begin >> FIRST_SHIFT;
    let mut end_bin = end >> FIRST_SHIFT;
    for &offset in BIN_OFFSETS.iter() {
        if start_bin == end_bin {
            return Ok(offset + start_bin as u32);
        }
        start_bin >>= NEXT_SHIFT;
        end_bin >>= NEXT_SHIFT;
    }
    // The loop's last offset is 0 and start_bin/end_bin both collapse to 0
    // by then (our max coordinate fits in 29 bits), so this is unreachable
    // in practice; kept as a safe fallback rather than a panic.
    Ok(BIN_OFFSETS[BIN_OFFSETS.len() - 1])
}

/// Returns every bin, across all tiers, that could contain a feature
/// overlapping `[begin, end]` (1-based, inclusive). Mirrors UCSC's
/// `binFromRangeStandard`-companion `binRangesStandard`: a query must
/// check every tier because a large feature stored in a coarse bin can
/// still overlap a small query window.
///
/// # Errors
/// Returns [`AppError::OutOfRange`] under the same conditions as [`assign`].
pub fn overlapping(begin: i64, end: i64) -> Result<Vec<u32>, AppError> {
    validate_range(begin, end)?;
    let (begin, end) = (begin - 1, end - 1);
    let mut bins = Vec::with_capacity(16);
    let mut start_bin = begin >> FIRST_SHIFT;
    let mut end_bin = end >> FIRST_SHIFT;
    for &offset in BIN_OFFSETS.iter() {
        for bin in start_bin..=end_bin {
            bins.push(offset + bin as u32);
        }
        start_bin >>= NEXT_SHIFT;
        end_bin >>= NEXT_SHIFT;
    }
    bins.sort_unstable();
    bins.dedup();
    Ok(bins)
}

fn validate_range(begin: i64, end: i64) -> Result<(), AppError> {
    if begin > end {
        return Err(AppError::OutOfRange(format!(
            "begin {begin} is greater than end {end}"
        )));
    }
    if begin < 1 || end > MAX_COORDINATE {
        return Err(AppError::OutOfRange(format!(
            "range {begin}-{end} falls outside 1..={MAX_COORDINATE}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    #[test]
    fn assign_rejects_inverted_range() {
        assert!(matches!(assign(100, 50), Err(AppError::OutOfRange(_))));
    }

    #[test]
    fn assign_rejects_coordinate_overflow() {
        assert!(matches!(
            assign(1, MAX_COORDINATE + 1),
            Err(AppError::OutOfRange(_))
        ));
    }

    #[rstest]
    #[case(1, 1)]
    #[case(1, 100)]
    #[case(1_000_000, 1_000_500)]
    #[case(100_000_000, 100_000_001)]
    fn assign_is_one_of_overlapping(#[case] begin: i64, #[case] end: i64) {
        let bin = assign(begin, end).unwrap();
        let bins = overlapping(begin, end).unwrap();
        assert!(
            bins.contains(&bin),
            "assign({begin},{end}) = {bin} not in overlapping set {bins:?}"
        );
    }

    #[test]
    fn overlapping_query_covers_contained_feature() {
        // A small feature at [5_000_000, 5_000_010] must appear in the
        // overlapping bin set of any query range that contains it.
        let feature_bin = assign(5_000_000, 5_000_010).unwrap();
        let query_bins = overlapping(4_900_000, 5_100_000).unwrap();
        assert!(query_bins.contains(&feature_bin));
    }

    #[test]
    fn overlapping_is_sorted_and_deduped() {
        let bins = overlapping(1, 10_000_000).unwrap();
        let mut sorted = bins.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(bins, sorted);
    }

    #[test]
    fn whole_chromosome_collapses_to_top_bin() {
        let bin = assign(1, MAX_COORDINATE).unwrap();
        assert_eq!(bin, BIN_OFFSETS[0]);
    }
}
