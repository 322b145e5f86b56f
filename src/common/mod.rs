//! Common functionality shared by the CLI subcommands.

use std::sync::OnceLock;

use byte_unit::Byte;
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use indexmap::IndexMap;

/// Commonly used command line arguments.
#[derive(Parser, Debug)]
pub struct Args {
    /// Verbosity of the program
    #[clap(flatten)]
    pub verbose: Verbosity<InfoLevel>,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            verbose: Verbosity::new(0, 0),
        }
    }
}

/// Helper to print the current memory resident set size via `tracing`.
pub fn trace_rss_now() {
    let me = procfs::process::Process::myself().unwrap();
    let page_size = procfs::page_size();
    tracing::debug!(
        "RSS now: {}",
        Byte::from_bytes((me.stat().unwrap().rss * page_size) as u128).get_appropriate_unit(true)
    );
}

/// Canonical chromosome names, used to build [`build_chrom_map`].
pub const CHROMS: &[&str] = &[
    "1", "2", "3", "4", "5", "6", "7", "8", "9", "10", "11", "12", "13", "14", "15", "16", "17",
    "18", "19", "20", "21", "22", "X", "Y", "M",
];

/// Maps every accepted spelling of a chromosome name (`chr1`, `1`, `chrX`,
/// `x`, `MT`, `m`, ...) to a stable numeric index, so the reference oracle
/// can treat `chr20` and `20` as the same contig.
pub fn build_chrom_map() -> IndexMap<String, usize> {
    let mut result = IndexMap::new();
    for (i, &chrom_name) in CHROMS.iter().enumerate() {
        result.insert(chrom_name.to_owned(), i);
        result.insert(format!("chr{chrom_name}").to_owned(), i);
    }
    result.insert("x".to_owned(), 22);
    result.insert("y".to_owned(), 23);
    result.insert("chrx".to_owned(), 22);
    result.insert("chry".to_owned(), 23);
    result.insert("mt".to_owned(), 24);
    result.insert("m".to_owned(), 24);
    result.insert("chrmt".to_owned(), 24);
    result.insert("chrm".to_owned(), 24);
    result.insert("MT".to_owned(), 24);
    result.insert("chrMT".to_owned(), 24);
    result
}

/// Cached [`build_chrom_map`]: canonicalizing a chromosome name is a
/// hot-path operation (every variant normalized, every key encoded), so it
/// is built once rather than reallocated per lookup.
pub fn chrom_map() -> &'static IndexMap<String, usize> {
    static MAP: OnceLock<IndexMap<String, usize>> = OnceLock::new();
    MAP.get_or_init(build_chrom_map)
}

/// The version of the `varda` package, also recorded in the store on open
/// (spec.md §4.4).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod test {
    #[test]
    fn trace_rss_now_smoke() {
        super::trace_rss_now();
    }

    #[test]
    fn build_chrom_map_covers_every_spelling() {
        let map = super::build_chrom_map();
        assert_eq!(map.get("chr1"), Some(&0));
        assert_eq!(map.get("1"), Some(&0));
        assert_eq!(map.get("X"), Some(&22));
        assert_eq!(map.get("chrx"), Some(&22));
        assert_eq!(map.get("MT"), Some(&24));
        assert_eq!(map.get("m"), Some(&24));
    }
}
