//! Ingestion pipelines (spec.md §4.5 / C6).

pub mod checkpoint;
pub mod coverage;
pub mod variation;

use rayon::prelude::*;

use crate::err::AppError;

/// Expands `@path` arguments into the newline-delimited file list they
/// name, the same convention `seqvars aggregate --path-input` supports for
/// batch imports.
pub fn expand_path_args(paths: &[String]) -> Result<Vec<String>, AppError> {
    let mut out = Vec::new();
    for path in paths {
        if let Some(list_path) = path.strip_prefix('@') {
            let contents = std::fs::read_to_string(list_path)?;
            out.extend(
                contents
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(str::to_string),
            );
        } else {
            out.push(path.clone());
        }
    }
    Ok(out)
}

/// Runs `f` over `items` on the global Rayon pool, returning the first
/// error encountered (every item still runs; Rayon's `par_iter` does not
/// short-circuit). Used to parallelize import of many independent files
/// the way `seqvars::aggregate::vcf_import` parallelizes over
/// `path_input`, generalized here to any per-item fallible closure.
pub fn run_parallel<T, F>(items: &[T], f: F) -> Result<(), AppError>
where
    T: Sync,
    F: Fn(&T) -> Result<(), AppError> + Sync,
{
    items
        .par_iter()
        .map(&f)
        .collect::<Result<Vec<()>, AppError>>()
        .map(|_| ())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    #[test]
    fn expand_path_args_passes_through_plain_paths() {
        let result = expand_path_args(&["a.vcf".to_string(), "b.vcf".to_string()]).unwrap();
        assert_eq!(result, vec!["a.vcf".to_string(), "b.vcf".to_string()]);
    }

    #[test]
    fn expand_path_args_reads_at_file_lists() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "one.vcf").unwrap();
        writeln!(f, "  ").unwrap();
        writeln!(f, "two.vcf").unwrap();
        f.flush().unwrap();
        let arg = format!("@{}", f.path().display());
        let result = expand_path_args(&[arg]).unwrap();
        assert_eq!(result, vec!["one.vcf".to_string(), "two.vcf".to_string()]);
    }

    #[test]
    fn run_parallel_surfaces_first_error() {
        let items = vec![1, 2, 3];
        let result = run_parallel(&items, |i| {
            if *i == 2 {
                Err(AppError::BadRequest("boom".to_string()))
            } else {
                Ok(())
            }
        });
        assert!(result.is_err());
    }
}
