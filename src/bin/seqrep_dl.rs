use std::process::ExitCode;

use clap::Parser;
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use seqrep_fasta_dl::app::{App, RunOptions, RunResult};
use seqrep_fasta_dl::config::{ConfigLoader, ConfigOverrides};
use seqrep_fasta_dl::domain::ErrorPolicy;
use seqrep_fasta_dl::ena::EnaHttpClient;
use seqrep_fasta_dl::error::SeqrepError;
use seqrep_fasta_dl::output::{JsonOutput, LogProgress, OutputMode};
use seqrep_fasta_dl::pipeline::CancelToken;
use seqrep_fasta_dl::store::Store;

#[derive(Parser)]
#[command(name = "seqrep-dl")]
#[command(about = "Download the chromosome FASTA of an ENA assembly in sequence report order")]
#[command(version, author)]
struct Cli {
    /// Assembly accession, e.g. GCA_000001405.10
    assembly: Option<String>,

    #[arg(long)]
    config: Option<String>,

    /// Local directory holding reports and artifacts
    #[arg(long)]
    root: Option<String>,

    #[arg(long)]
    concurrency: Option<usize>,

    #[arg(long)]
    queue_capacity: Option<usize>,

    #[arg(long, value_enum)]
    on_error: Option<ErrorPolicy>,

    #[arg(long)]
    force: bool,

    #[arg(long)]
    dry_run: bool,

    #[arg(long)]
    json: bool,

    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<SeqrepError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &SeqrepError) -> u8 {
    match error {
        SeqrepError::InvalidAssemblyAccession(_)
        | SeqrepError::Parse { .. }
        | SeqrepError::ConfigRead(_)
        | SeqrepError::ConfigParse(_)
        | SeqrepError::InvalidConfig(_) => 2,
        SeqrepError::Fetch { .. }
        | SeqrepError::FetchStatus { .. }
        | SeqrepError::Http(_)
        | SeqrepError::HttpStatus { .. } => 3,
        SeqrepError::Write(_)
        | SeqrepError::ProtocolViolation(_)
        | SeqrepError::Cancelled
        | SeqrepError::ArtifactLocked(_) => 4,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };

    let overrides = ConfigOverrides {
        assembly: cli.assembly,
        local_root: cli.root,
        concurrency: cli.concurrency,
        queue_capacity: cli.queue_capacity,
        error_policy: cli.on_error,
    };
    let resolved = ConfigLoader::resolve(cli.config.as_deref(), overrides)?;
    let Some(assembly) = resolved.assembly.clone() else {
        return Err(miette::Report::msg(
            "assembly accession required (argument or \"assembly\" in config)",
        ));
    };

    let store = Store::new(
        resolved.local_root.clone(),
        resolved.endpoints.report_suffix.clone(),
        resolved.fasta_extension.clone(),
    );
    let client = EnaHttpClient::new(resolved.endpoints.clone())?;
    let app = App::new(store, client, resolved.pipeline.clone(), resolved.filter.clone());
    let options = RunOptions {
        force: cli.force,
        dry_run: cli.dry_run,
    };

    match output_mode {
        OutputMode::Json => {
            let result = app.run(&assembly, options, &CancelToken::new(), &JsonOutput)?;
            JsonOutput::print_run(&result).into_diagnostic()?;
        }
        OutputMode::Human => {
            let result = app.run(&assembly, options, &CancelToken::new(), &LogProgress)?;
            print_summary(&result);
        }
    }
    Ok(())
}

fn print_summary(result: &RunResult) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let cyan = "\x1b[36m";
    let reset = "\x1b[0m";

    println!("{cyan}seqrep-dl {} ({}){reset}", result.assembly, result.action);
    println!("{green}sequences written: {} of {}{reset}", result.written_items, result.total_items);
    if !result.skipped_accessions.is_empty() {
        println!(
            "{yellow}skipped: {}{reset}",
            result.skipped_accessions.join(", ")
        );
    }
    println!("   report: {}", result.report_path);
    if let Some(path) = &result.artifact_path {
        println!("   fasta: {path} ({} bytes)", result.bytes_written);
    }
}
