mod catalog;
mod cfg;
mod classfile;
mod config;
mod descriptor;
mod error;
mod filter;
mod ir;
mod mapping;
mod opcodes;
mod pipeline;
mod risk;
mod scan;
mod weave;

use std::io;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::{Overrides, SettingsFile, WeaveConfig};
use crate::pipeline::Request;

/// CLI arguments for a methodtrace run.
#[derive(Parser, Debug)]
#[command(
    name = "methodtrace",
    about = "Insert method entry/exit trace probes into JVM class files and JAR files.",
    version
)]
struct Cli {
    /// Class directory, class file or JAR to instrument. Repeatable.
    #[arg(long, value_name = "PATH", required = true)]
    input: Vec<PathBuf>,
    /// Directory receiving the rewritten inputs.
    #[arg(long, value_name = "DIR")]
    output: PathBuf,
    /// ProGuard or R8 mapping file.
    #[arg(long, value_name = "PATH")]
    mapping: Option<PathBuf>,
    /// Filter directives file.
    #[arg(long, value_name = "PATH")]
    filter: Option<PathBuf>,
    /// Method catalog from an earlier build whose ids should be kept.
    #[arg(long, value_name = "PATH")]
    applied_method_map: Option<PathBuf>,
    #[arg(long, value_name = "DIR")]
    artifacts_dir: Option<PathBuf>,
    /// Dotted name of the application entry class.
    #[arg(long, value_name = "CLASS")]
    application: Option<String>,
    #[arg(long, value_name = "NAME")]
    variant: Option<String>,
    /// JSON map from input path to ADDED, CHANGED, REMOVED or NOTCHANGED.
    #[arg(long, value_name = "PATH")]
    changes: Option<PathBuf>,
    /// JSON settings file with the hook ABI and defaults.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, value_name = "N")]
    workers: Option<usize>,
    #[arg(long, conflicts_with = "verbose")]
    quiet: bool,
    #[arg(long)]
    verbose: bool,
    #[arg(long)]
    timing: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);
    run(cli)
}

fn init_tracing(cli: &Cli) {
    let default_level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let settings = match &cli.config {
        Some(path) => SettingsFile::load(path)?,
        None => SettingsFile::default(),
    };
    let config = WeaveConfig::resolve(
        settings,
        Overrides {
            application: cli.application,
            variant: cli.variant,
            workers: cli.workers,
            artifacts_dir: cli.artifacts_dir,
        },
    )?;
    let request = Request {
        inputs: cli.input,
        output: cli.output,
        mapping: cli.mapping,
        filter: cli.filter,
        applied_method_map: cli.applied_method_map,
        changes: cli.changes,
        timing: cli.timing,
    };

    let summary = pipeline::run(&request, &config)?;
    info!(
        classes = summary.classes,
        instrumented = summary.instrumented,
        ignored = summary.ignored,
        evil = summary.evil,
        rewritten = summary.weave.rewritten,
        passed_through = summary.weave.passed_through,
        "done"
    );
    if summary.skipped_classes > 0 {
        info!(skipped = summary.skipped_classes, "unreadable classes were copied unchanged");
    }
    Ok(())
}
