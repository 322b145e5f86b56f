//! RocksDB key encodings (spec.md §4.4 / C5).
//!
//! Chromosome names are folded into a sort key derived from
//! [`crate::common::build_chrom_map`]'s canonical ordering, so that keys
//! sort numerically (`"00"` before `"01"` ... before `"22"`, `"23"`, `"24"`)
//! instead of lexically (`"1"` before `"10"` before `"2"`), and share the
//! exact alias table `Variant::chrom` is already canonicalized against
//! (`crate::variant::normalize`) rather than a second, divergent scheme.
//! Everything downstream (variant identity keys, covered-region range keys)
//! builds on top of it.

use uuid::Uuid;

use crate::common::chrom_map;

/// Converts a chromosome name to its sort key. Names outside the standard
/// autosome/X/Y/MT set (alt contigs, scaffolds) fall back to their
/// upper-cased spelling, sorting after every standard chromosome.
pub fn chrom_name_to_key(name: &str) -> String {
    match chrom_map().get(name) {
        Some(idx) => format!("{idx:02}"),
        None => name.to_ascii_uppercase(),
    }
}

/// Key for the `variants` column family: canonical `(chrom, begin, end,
/// observed)` identity, used both to enforce the uniqueness constraint and
/// as the prefix-scan entry point from `variants_by_id`.
pub fn variant_identity_key(chrom: &str, begin: i64, end: i64, observed: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + 8 + 8 + observed.len() + 1);
    out.extend_from_slice(chrom_name_to_key(chrom).as_bytes());
    out.extend_from_slice(&begin.to_be_bytes());
    out.extend_from_slice(&end.to_be_bytes());
    out.push(b'>');
    out.extend_from_slice(observed.as_bytes());
    out
}

/// Key for the `observations` column family: `variant_id || variation_id`,
/// so a prefix scan on `variant_id` enumerates every observation of that
/// variant (one row per contributing variation).
pub fn observation_key(variant_id: &Uuid, variation_id: &Uuid) -> Vec<u8> {
    let mut out = Vec::with_capacity(32);
    out.extend_from_slice(variant_id.as_bytes());
    out.extend_from_slice(variation_id.as_bytes());
    out
}

pub fn observation_prefix(variant_id: &Uuid) -> Vec<u8> {
    variant_id.as_bytes().to_vec()
}

/// Key for the `covered_regions` column family:
/// `chrom || bin(BE) || begin(BE) || coverage_id`, so a scan restricted to
/// one bin's prefix visits only regions that could overlap a query point
/// in that bin.
pub fn covered_region_key(chrom: &str, bin: u32, begin: i64, coverage_id: &Uuid) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + 4 + 8 + 16);
    out.extend_from_slice(chrom_name_to_key(chrom).as_bytes());
    out.extend_from_slice(&bin.to_be_bytes());
    out.extend_from_slice(&begin.to_be_bytes());
    out.extend_from_slice(coverage_id.as_bytes());
    out
}

pub fn covered_region_bin_prefix(chrom: &str, bin: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(6);
    out.extend_from_slice(chrom_name_to_key(chrom).as_bytes());
    out.extend_from_slice(&bin.to_be_bytes());
    out
}

/// Key for `data_sources_by_digest`: `owner || digest`, enforcing the
/// per-owner digest uniqueness rule from spec.md §3.
pub fn data_source_digest_key(owner: &Uuid, digest: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + digest.len());
    out.extend_from_slice(owner.as_bytes());
    out.extend_from_slice(digest.as_bytes());
    out
}

/// Key for `variations_by_sample_digest` / `coverages_by_sample_digest`:
/// `sample_id || digest`, enforcing "unique per `(sample, digest)`".
pub fn sample_digest_key(sample_id: &Uuid, digest: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + digest.len());
    out.extend_from_slice(sample_id.as_bytes());
    out.extend_from_slice(digest.as_bytes());
    out
}

/// Key for `sample_group_members`: `group_id || sample_id`, so a prefix
/// scan on `group_id` enumerates its members.
pub fn group_member_key(group_id: &str, sample_id: &Uuid) -> Vec<u8> {
    let mut out = Vec::with_capacity(group_id.len() + 17);
    out.extend_from_slice(group_id.as_bytes());
    out.push(0); // separator: group ids are arbitrary strings, sample ids are fixed-width
    out.extend_from_slice(sample_id.as_bytes());
    out
}

pub fn group_member_prefix(group_id: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(group_id.len() + 1);
    out.extend_from_slice(group_id.as_bytes());
    out.push(0);
    out
}

/// Key for row-keyed column families (`samples`, `tasks`, `data_sources`,
/// `variations`, `coverages`, `annotations`): the entity's own id.
pub fn id_key(id: &Uuid) -> [u8; 16] {
    *id.as_bytes()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn chrom_keys_are_fixed_width_and_stable() {
        let mut keys: Vec<String> = ["chr2", "chr1", "chr10", "chrX", "chrY", "chrM"]
            .iter()
            .map(|c| chrom_name_to_key(c))
            .collect();
        assert!(keys.iter().all(|k| k.len() == 2));
        keys.sort();
        assert_eq!(keys, vec!["00", "01", "09", "22", "23", "24"]);
    }

    #[test]
    fn chrom_key_sorts_standard_chromosomes_before_alt_contigs() {
        assert!(chrom_name_to_key("22") < chrom_name_to_key("GL000001.1"));
    }

    #[test]
    fn chrom_key_accepts_bare_and_prefixed_names() {
        assert_eq!(chrom_name_to_key("X"), chrom_name_to_key("chrX"));
        assert_eq!(chrom_name_to_key("MT"), chrom_name_to_key("chrM"));
    }

    #[test]
    fn variant_identity_key_is_order_preserving_on_position() {
        let a = variant_identity_key("1", 100, 100, "G");
        let b = variant_identity_key("1", 200, 200, "G");
        assert!(a < b);
    }

    #[test]
    fn observation_prefix_matches_key_prefix() {
        let variant_id = Uuid::new_v4();
        let variation_id = Uuid::new_v4();
        let key = observation_key(&variant_id, &variation_id);
        let prefix = observation_prefix(&variant_id);
        assert!(key.starts_with(&prefix));
    }
}
