//! Varda engine command-line entry point.

mod annotate;
mod binning;
mod blob;
mod common;
mod config;
mod err;
mod frequency;
mod ingest;
mod model;
mod reference;
mod store;
mod task;
mod variant;

use std::io::Read as _;
use std::path::Path;

use clap::{Args, Parser, Subcommand};
use console::{Emoji, Term};
use uuid::Uuid;

use config::Config;
use err::AppError;
use model::{Coverage, DataSource, FileType, Task, TaskKind, Variation};
use reference::{FastaReference, ReferenceOracle};
use store::Store;

/// CLI parser based on clap.
#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Variant frequency database engine",
    long_about = "Ingests variant observations and covered regions, serves frequency queries, and annotates VCFs with per-query frequencies."
)]
struct Cli {
    /// Commonly used arguments.
    #[command(flatten)]
    common: common::Args,

    /// Engine-wide configuration (data/store directories, reference, ...).
    #[command(flatten)]
    config: Config,

    /// The sub command to run.
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingestion sub commands.
    Ingest(Ingest),
    /// Annotation sub commands.
    Annotate(AnnotateArgs),
    /// Task management sub commands.
    Task(TaskArgs),
    /// Sample lifecycle sub commands.
    Sample(SampleArgs),
    /// Frequency query sub commands.
    Query(QueryArgs),
}

#[derive(Debug, Args)]
#[command(args_conflicts_with_subcommands = true)]
struct Ingest {
    #[command(subcommand)]
    command: IngestCommands,
}

#[derive(Debug, Subcommand)]
enum IngestCommands {
    /// Import variant observations from one or more VCF files.
    Variation(IngestVariationArgs),
    /// Import covered regions from one or more BED files.
    Coverage(IngestCoverageArgs),
}

#[derive(Debug, clap::ValueEnum, Clone, Copy)]
enum ZygosityModeArg {
    Genotype,
    Likelihood,
}

#[derive(Debug, Args)]
struct IngestVariationArgs {
    /// Sample to import into.
    #[arg(long)]
    sample: Uuid,
    /// Owner of the resulting data source.
    #[arg(long)]
    owner: Uuid,
    /// How zygosity is derived from each record.
    #[arg(long, value_enum, default_value_t = ZygosityModeArg::Genotype)]
    zygosity_mode: ZygosityModeArg,
    /// Confidence threshold (phred units) for `--zygosity-mode likelihood`.
    #[arg(long, default_value_t = 20)]
    quality_threshold: u32,
    /// Input VCF paths; `@path` expands to a newline-delimited list of paths.
    #[arg(required = true)]
    inputs: Vec<String>,
}

#[derive(Debug, Args)]
struct IngestCoverageArgs {
    /// Sample to import into.
    #[arg(long)]
    sample: Uuid,
    /// Owner of the resulting data source.
    #[arg(long)]
    owner: Uuid,
    /// Input BED paths; `@path` expands to a newline-delimited list of paths.
    #[arg(required = true)]
    inputs: Vec<String>,
}

#[derive(Debug, Args)]
struct AnnotateArgs {
    /// Data source to annotate (must already exist).
    #[arg(long)]
    data_source: Uuid,
    /// Owner the data source belongs to.
    #[arg(long)]
    owner: Uuid,
    /// One or more `slug=selection` pairs; output order follows argument
    /// order (spec.md §4.8).
    #[arg(long = "query", required = true, value_parser = parse_query)]
    queries: Vec<(String, String)>,
}

fn parse_query(raw: &str) -> Result<(String, String), String> {
    let (slug, selection) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected slug=selection, got {raw:?}"))?;
    Ok((slug.to_string(), selection.to_string()))
}

#[derive(Debug, Args)]
#[command(args_conflicts_with_subcommands = true)]
struct TaskArgs {
    #[command(subcommand)]
    command: TaskCommands,
}

#[derive(Debug, Subcommand)]
enum TaskCommands {
    /// Re-schedules a terminal task and runs it to completion.
    Resume { task: Uuid },
    /// Requests cooperative cancellation of a running task.
    Cancel { task: Uuid },
}

#[derive(Debug, Args)]
#[command(args_conflicts_with_subcommands = true)]
struct SampleArgs {
    #[command(subcommand)]
    command: SampleCommands,
}

#[derive(Debug, Subcommand)]
enum SampleCommands {
    /// Activates a sample (spec.md §4.9 guard).
    Activate { sample: Uuid },
    /// Deactivates a sample (admin-only).
    Deactivate { sample: Uuid },
}

#[derive(Debug, Args)]
#[command(args_conflicts_with_subcommands = true)]
struct QueryArgs {
    #[command(subcommand)]
    command: QueryCommands,
}

#[derive(Debug, Subcommand)]
enum QueryCommands {
    /// Computes `(observed, covered)` for one variant under a selection.
    Freq(FreqArgs),
}

#[derive(Debug, Args)]
struct FreqArgs {
    #[arg(long)]
    chrom: String,
    #[arg(long)]
    begin: i64,
    #[arg(long)]
    end: i64,
    /// Normalized observed allele (empty string for a pure deletion).
    #[arg(long, default_value = "")]
    observed: String,
    #[arg(long)]
    selection: String,
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    let collector = tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(match cli.common.verbose.log_level() {
            Some(level) => match level {
                log::Level::Error => tracing::Level::ERROR,
                log::Level::Warn => tracing::Level::WARN,
                log::Level::Info => tracing::Level::INFO,
                log::Level::Debug => tracing::Level::DEBUG,
                log::Level::Trace => tracing::Level::TRACE,
            },
            None => tracing::Level::INFO,
        })
        .compact()
        .finish();

    let term = Term::stderr();
    tracing::subscriber::with_default(collector, || run(&cli))?;
    term.write_line(&format!("All done. Have a nice day!{}", Emoji(" 😃", "")))?;
    Ok(())
}

fn run(cli: &Cli) -> Result<(), anyhow::Error> {
    let store = Store::open(&cli.config.store_dir)?;
    let blob = cli.config.blob_store();
    let out_blob = cli.config.annotated_blob_store();
    let reference = cli
        .config
        .genome
        .as_ref()
        .map(FastaReference::open)
        .transpose()?;
    let reference_ref: Option<&dyn ReferenceOracle> =
        reference.as_ref().map(|r| r as &dyn ReferenceOracle);

    match &cli.command {
        Commands::Ingest(ingest) => match &ingest.command {
            IngestCommands::Variation(args) => run_ingest_variation(
                &store,
                &blob,
                reference_ref,
                cli.config.reference_mismatch_policy(),
                args,
            )?,
            IngestCommands::Coverage(args) => run_ingest_coverage(&store, &blob, args)?,
        },
        Commands::Annotate(args) => run_annotate(&store, &blob, &out_blob, reference_ref, args)?,
        Commands::Task(task_args) => match &task_args.command {
            TaskCommands::Resume { task } => {
                store.reschedule_task(task)?;
                let runner = task::TaskRunner::new(&store, &blob, &out_blob, reference_ref);
                runner.run(task)?;
            }
            TaskCommands::Cancel { task } => store.request_cancel(task)?,
        },
        Commands::Sample(sample_args) => match &sample_args.command {
            SampleCommands::Activate { sample } => store.activate_sample(sample)?,
            SampleCommands::Deactivate { sample } => store.deactivate_sample(sample)?,
        },
        Commands::Query(query_args) => match &query_args.command {
            QueryCommands::Freq(args) => run_query_freq(&store, args)?,
        },
    }

    Ok(())
}

fn run_ingest_variation(
    store: &Store,
    blob: &blob::BlobStore,
    reference: Option<&dyn ReferenceOracle>,
    reference_mismatch_policy: variant::ReferenceMismatchPolicy,
    args: &IngestVariationArgs,
) -> Result<(), AppError> {
    let paths = ingest::expand_path_args(&args.inputs)?;
    let zygosity_mode = match args.zygosity_mode {
        ZygosityModeArg::Genotype => ingest::variation::ZygosityMode::Genotype,
        ZygosityModeArg::Likelihood => ingest::variation::ZygosityMode::Likelihood {
            quality_threshold: args.quality_threshold,
        },
    };

    ingest::run_parallel(&paths, |path| {
        let (data_source, digest) = register_blob(store, blob, path, &args.owner, FileType::Vcf)?;
        let variation = Variation {
            id: Uuid::new_v4(),
            sample: args.sample,
            data_source: data_source.id,
        };
        store.put_variation(&variation, &digest)?;
        let task = Task::new(TaskKind::ImportVariation, variation.id);
        store.put_task(&task)?;
        tracing::info!(path, variation = %variation.id, "importing variation");

        let options = ingest::variation::ImportOptions {
            zygosity_mode,
            reference_mismatch_policy,
            ..ingest::variation::ImportOptions::default()
        };
        task::TaskRunner::new(store, blob, blob, reference)
            .with_variation_options(options)
            .run(&task.id)
    })
}

fn run_ingest_coverage(
    store: &Store,
    blob: &blob::BlobStore,
    args: &IngestCoverageArgs,
) -> Result<(), AppError> {
    let paths = ingest::expand_path_args(&args.inputs)?;
    ingest::run_parallel(&paths, |path| {
        let (data_source, digest) = register_blob(store, blob, path, &args.owner, FileType::Bed)?;
        let coverage = Coverage {
            id: Uuid::new_v4(),
            sample: args.sample,
            data_source: data_source.id,
        };
        store.put_coverage(&coverage, &digest)?;
        let task = Task::new(TaskKind::ImportCoverage, coverage.id);
        store.put_task(&task)?;
        tracing::info!(path, coverage = %coverage.id, "importing coverage");
        task::TaskRunner::new(store, blob, blob, None).run(&task.id)
    })
}

fn run_annotate(
    store: &Store,
    blob: &blob::BlobStore,
    out_blob: &blob::BlobStore,
    reference: Option<&dyn ReferenceOracle>,
    args: &AnnotateArgs,
) -> Result<(), AppError> {
    let data_source = store
        .get_data_source(&args.data_source)?
        .ok_or_else(|| AppError::NotFound(format!("data source {}", args.data_source)))?;
    if data_source.owner != args.owner {
        return Err(AppError::Forbidden(
            "data source does not belong to the specified owner".to_string(),
        ));
    }

    let annotation_id = Uuid::new_v4();
    let task = Task::new(TaskKind::Annotate, annotation_id);
    let annotation = model::Annotation {
        id: annotation_id,
        original_data_source: data_source.id,
        annotated_data_source: None,
        queries: args.queries.clone(),
        task: task.id,
    };
    store.put_annotation(&annotation)?;
    store.put_task(&task)?;

    let runner = task::TaskRunner::new(store, blob, out_blob, reference);
    runner.run(&task.id)?;

    let finished = store
        .get_annotation(&annotation.id)?
        .ok_or_else(|| AppError::Internal("annotation vanished after run".to_string()))?;
    tracing::info!(
        annotation = %finished.id,
        annotated_data_source = ?finished.annotated_data_source,
        "annotation complete"
    );
    Ok(())
}

fn run_query_freq(store: &Store, args: &FreqArgs) -> Result<(), AppError> {
    let variant = model::Variant {
        chrom: args.chrom.clone(),
        begin: args.begin,
        end: args.end,
        observed: args.observed.clone(),
    };
    let frequency = frequency::freq(store, &variant, &args.selection)?;
    println!(
        "{{\"observed\":{},\"covered\":{},\"ratio\":{}}}",
        frequency.observed,
        frequency.covered,
        frequency
            .ratio()
            .map(|r| r.to_string())
            .unwrap_or_else(|| "null".to_string())
    );
    Ok(())
}

/// Reads `path` (decompressing if gzip-magic-prefixed, since
/// [`blob::BlobStore::put`] stores decompressed content only), registers it
/// as a [`DataSource`] for `owner` if its digest is new, and returns the
/// resolved `DataSource` plus its digest.
fn register_blob(
    store: &Store,
    blob: &blob::BlobStore,
    path: &str,
    owner: &Uuid,
    filetype: FileType,
) -> Result<(DataSource, String), AppError> {
    let raw = std::fs::read(Path::new(path))?;
    let gzipped = raw.len() >= 2 && raw[0] == 0x1f && raw[1] == 0x8b;
    let decompressed = if gzipped {
        let mut decoder = flate2::read::MultiGzDecoder::new(raw.as_slice());
        let mut out = Vec::new();
        decoder.read_to_end(&mut out)?;
        out
    } else {
        raw
    };

    let digest = blob.put(&decompressed)?;
    if let Some(id) = store.data_source_by_digest(owner, &digest)? {
        let data_source = store
            .get_data_source(&id)?
            .ok_or_else(|| AppError::Internal("dangling data source digest index".to_string()))?;
        return Ok((data_source, digest));
    }

    let data_source = DataSource {
        id: Uuid::new_v4(),
        digest: digest.clone(),
        filetype,
        gzipped,
        owner: *owner,
    };
    store.put_data_source(&data_source)?;
    Ok((data_source, digest))
}
