//! Reference oracle (spec.md §4.2 / C2).
//!
//! Wraps a FASTA file memory-mapped via `memmap2` behind a one-time offset
//! index, the same approach the teacher's sibling projects in this space
//! use for random-access reference lookups (bundling `noodles`'s `fasta`
//! support rather than a standalone parser). The index records each
//! contig's byte offset and line layout so that `bases()` is an O(1) slice
//! plus newline-strip, never a linear scan.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use memmap2::Mmap;

use crate::common::build_chrom_map;
use crate::err::AppError;

/// Read-only lookup of reference bases, safe to share across threads (all
/// operations are `&self`).
pub trait ReferenceOracle: Send + Sync {
    /// Every contig name known to the oracle, with its length in bases.
    fn chromosomes(&self) -> Vec<(String, i64)>;

    /// Reference bases at `[begin, end]`, 1-based inclusive, upper-cased.
    fn bases(&self, chrom: &str, begin: i64, end: i64) -> Result<String, AppError>;

    /// Canonical spelling of `chrom`, resolved through the same alias table
    /// `bases` uses, so `crate::variant::normalize` can store one identity
    /// for `chr1`/`1` instead of whichever spelling a caller passed in.
    fn canonical_name(&self, chrom: &str) -> Result<String, AppError>;
}

#[derive(Debug, Clone, Copy)]
struct ContigIndex {
    /// Byte offset of the first sequence base (past the header line).
    offset: u64,
    /// Total bases in the contig.
    length: i64,
    /// Bases per full line (FASTA files wrap at a fixed width).
    line_bases: u64,
    /// Bytes per full line including the line terminator.
    line_width: u64,
}

/// FASTA-backed [`ReferenceOracle`]. Chromosome names are canonicalized via
/// [`build_chrom_map`] so `chr20` and `20` resolve to the same contig.
pub struct FastaReference {
    mmap: Mmap,
    index: HashMap<String, ContigIndex>,
    canonical_names: HashMap<String, String>,
}

impl FastaReference {
    /// Opens `path`, memory-maps it, and builds the offset index with a
    /// single linear scan of the header/line-width structure.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        let (index, canonical_names) = build_index(&mmap)?;
        Ok(Self {
            mmap,
            index,
            canonical_names,
        })
    }

    fn resolve(&self, chrom: &str) -> Result<&str, AppError> {
        self.canonical_names
            .get(chrom)
            .map(String::as_str)
            .ok_or_else(|| AppError::UnknownChromosome(chrom.to_string()))
    }
}

impl ReferenceOracle for FastaReference {
    fn canonical_name(&self, chrom: &str) -> Result<String, AppError> {
        self.resolve(chrom).map(str::to_string)
    }

    fn chromosomes(&self) -> Vec<(String, i64)> {
        let mut out: Vec<(String, i64)> = self
            .index
            .iter()
            .map(|(name, idx)| (name.clone(), idx.length))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    fn bases(&self, chrom: &str, begin: i64, end: i64) -> Result<String, AppError> {
        if begin > end {
            return Err(AppError::OutOfRange(format!(
                "begin {begin} greater than end {end}"
            )));
        }
        let canonical = self.resolve(chrom)?;
        let contig = self.index[canonical];
        if begin < 1 || end > contig.length {
            return Err(AppError::OutOfRange(format!(
                "{chrom}:{begin}-{end} outside contig length {}",
                contig.length
            )));
        }

        let mut out = String::with_capacity((end - begin + 1) as usize);
        let mut pos = begin;
        while pos <= end {
            let line_idx = (pos - 1) as u64 / contig.line_bases;
            let col = (pos - 1) as u64 % contig.line_bases;
            let line_start = contig.offset + line_idx * contig.line_width;
            let byte_offset = (line_start + col) as usize;
            let run = ((contig.line_bases - col) as i64).min(end - pos + 1);
            let bytes = &self.mmap[byte_offset..byte_offset + run as usize];
            out.push_str(
                std::str::from_utf8(bytes)
                    .map_err(|e| AppError::Internal(format!("non-UTF8 FASTA bytes: {e}")))?,
            );
            pos += run;
        }
        Ok(out.to_ascii_uppercase())
    }
}

/// Scans the mapped bytes once, recording each `>`-header's contig name,
/// byte offset, and per-line layout, and derives the canonical-name map
/// from whichever contigs are actually present in the file.
fn build_index(mmap: &Mmap) -> Result<(HashMap<String, ContigIndex>, HashMap<String, String>), AppError> {
    let bytes: &[u8] = mmap;
    let mut index = HashMap::new();
    let mut pos = 0usize;
    while pos < bytes.len() {
        if bytes[pos] != b'>' {
            return Err(AppError::Internal(
                "malformed FASTA: expected '>' at contig start".to_string(),
            ));
        }
        let header_end = find_newline(bytes, pos).ok_or_else(|| {
            AppError::Internal("malformed FASTA: unterminated header line".to_string())
        })?;
        let header = std::str::from_utf8(&bytes[pos + 1..header_end])
            .map_err(|e| AppError::Internal(format!("non-UTF8 FASTA header: {e}")))?;
        let name = header.split_whitespace().next().unwrap_or(header).to_string();

        let seq_start = header_end + 1;
        let first_line_end = find_newline(bytes, seq_start);
        let (line_bases, line_width) = match first_line_end {
            Some(end) => {
                let width = (end + 1 - seq_start) as u64;
                (((end - seq_start) as u64).max(1), width)
            }
            None => (bytes.len() as u64 - seq_start as u64, bytes.len() as u64 - seq_start as u64),
        };

        let mut cursor = seq_start;
        let mut length: i64 = 0;
        loop {
            if cursor >= bytes.len() || bytes[cursor] == b'>' {
                break;
            }
            match find_newline(bytes, cursor) {
                Some(end) => {
                    length += (end - cursor) as i64;
                    cursor = end + 1;
                }
                None => {
                    length += (bytes.len() - cursor) as i64;
                    cursor = bytes.len();
                }
            }
        }

        index.insert(
            name.clone(),
            ContigIndex {
                offset: seq_start as u64,
                length,
                line_bases: line_bases.max(1),
                line_width: line_width.max(1),
            },
        );
        pos = cursor;
    }

    let chrom_map = build_chrom_map();
    let mut canonical_names = HashMap::new();
    for name in index.keys() {
        canonical_names.insert(name.clone(), name.clone());
        let stripped = name.strip_prefix("chr").unwrap_or(name);
        for (alias, _) in chrom_map.iter().filter(|(alias, _)| {
            alias.as_str() == stripped || alias.as_str() == name || alias.trim_start_matches("chr") == stripped
        }) {
            canonical_names.insert(alias.clone(), name.clone());
        }
    }
    Ok((index, canonical_names))
}

fn find_newline(bytes: &[u8], from: usize) -> Option<usize> {
    bytes[from..].iter().position(|&b| b == b'\n').map(|p| from + p)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    fn write_fasta(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn reads_bases_within_a_single_line() {
        let f = write_fasta(">chr1\nACGTACGTAC\nGTACGTACGT\n");
        let reference = FastaReference::open(f.path()).unwrap();
        assert_eq!(reference.bases("chr1", 1, 4).unwrap(), "ACGT");
        assert_eq!(reference.bases("chr1", 7, 10).unwrap(), "GTAC");
    }

    #[test]
    fn reads_bases_spanning_a_line_break() {
        let f = write_fasta(">chr1\nACGTACGTAC\nGTACGTACGT\n");
        let reference = FastaReference::open(f.path()).unwrap();
        assert_eq!(reference.bases("chr1", 9, 12).unwrap(), "ACGT");
    }

    #[test]
    fn canonicalizes_chr_prefixed_names() {
        let f = write_fasta(">chr1\nACGT\n");
        let reference = FastaReference::open(f.path()).unwrap();
        assert_eq!(reference.bases("1", 1, 4).unwrap(), "ACGT");
    }

    #[test]
    fn canonical_name_resolves_aliases_to_the_fasta_spelling() {
        let f = write_fasta(">chr1\nACGT\n");
        let reference = FastaReference::open(f.path()).unwrap();
        assert_eq!(reference.canonical_name("1").unwrap(), "chr1");
        assert_eq!(reference.canonical_name("chr1").unwrap(), "chr1");
    }

    #[test]
    fn unknown_chromosome_errors() {
        let f = write_fasta(">chr1\nACGT\n");
        let reference = FastaReference::open(f.path()).unwrap();
        assert!(matches!(
            reference.bases("chr99", 1, 1),
            Err(AppError::UnknownChromosome(_))
        ));
    }

    #[test]
    fn out_of_range_errors() {
        let f = write_fasta(">chr1\nACGT\n");
        let reference = FastaReference::open(f.path()).unwrap();
        assert!(matches!(
            reference.bases("chr1", 1, 100),
            Err(AppError::OutOfRange(_))
        ));
    }

    #[test]
    fn chromosomes_lists_every_contig_with_length() {
        let f = write_fasta(">chr1\nACGT\n>chr2\nACGTACGT\n");
        let reference = FastaReference::open(f.path()).unwrap();
        let mut chroms = reference.chromosomes();
        chroms.sort();
        assert_eq!(chroms, vec![("chr1".to_string(), 4), ("chr2".to_string(), 8)]);
    }
}
