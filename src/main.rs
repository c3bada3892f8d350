use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use console::style;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use migrator::config::MigrateConfig;
use migrator::executor::RunMode;

mod cmd;

#[derive(Parser)]
#[command(name = "migrator")]
#[command(version, about = "Phased migration orchestrator with checkpoint/resume")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Write console logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Checkpoint directory. Overrides migrate.toml and MIGRATOR_CHECKPOINT_DIR.
    #[arg(long, global = true)]
    pub checkpoint_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute, resume, dry-run or validate the migration in .migrate/phases.json
    Run(RunArgs),
    /// Show the status of a run (defaults to the most recent)
    Status {
        run_id: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Print a status report periodically until the run finishes
    Watch {
        run_id: Option<String>,
        /// Seconds between reports (defaults to monitor.interval_secs)
        #[arg(short, long)]
        interval: Option<u64>,
        #[arg(long)]
        json: bool,
        /// Stop after this many reports
        #[arg(long)]
        count: Option<usize>,
    },
    /// List recorded runs, most recent first
    Runs {
        #[arg(long)]
        json: bool,
    },
    /// Ask a running migration to stop after its current phase
    Cancel { run_id: String },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Args, Clone, Debug)]
pub struct RunArgs {
    /// Run mode: execute, dry-run, validate, resume
    #[arg(short, long, default_value = "execute")]
    pub mode: RunMode,

    /// Run id (generated for new runs; defaults to the most recent run for resume)
    #[arg(long)]
    pub run_id: Option<String>,

    /// Run only this phase and the phases it depends on
    #[arg(short, long)]
    pub phase: Option<String>,

    /// Phases to skip (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub skip: Vec<String>,

    /// Environment label recorded on the run
    #[arg(short, long)]
    pub environment: Option<String>,

    /// UI output mode: full, minimal, json
    #[arg(long, default_value = "full")]
    pub ui: String,
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default migrate.toml and an example phases.json
    Init,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(&cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{} {:#}", style("error:").red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli) -> Result<u8> {
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    // only runs write a log file; observation commands leave the project untouched
    let log_dir = matches!(cli.command, Commands::Run(_)).then(|| MigrateConfig::log_dir(&project_dir));
    let _guard = init_tracing(cli.verbose, cli.log_json, log_dir.as_deref());

    match &cli.command {
        Commands::Run(args) => cmd::cmd_run(&project_dir, cli, args).await,
        Commands::Status { run_id, json } => cmd::cmd_status(&project_dir, cli, run_id.as_deref(), *json),
        Commands::Watch {
            run_id,
            interval,
            json,
            count,
        } => cmd::cmd_watch(&project_dir, cli, run_id.as_deref(), *interval, *json, *count).await,
        Commands::Runs { json } => cmd::cmd_runs(&project_dir, cli, *json),
        Commands::Cancel { run_id } => cmd::cmd_cancel(&project_dir, cli, run_id),
        Commands::Config { command } => cmd::cmd_config(&project_dir, cli, command.clone()),
    }
}

/// Console logs go to stderr, filtered by `MIGRATOR_LOG` (default `warn`, or
/// `debug` with `-v`). Runs also append JSON logs to `.migrate/logs/`.
fn init_tracing(verbose: bool, json: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let console_filter = || {
        EnvFilter::try_from_env("MIGRATOR_LOG").unwrap_or_else(|_| {
            EnvFilter::new(if verbose { "migrator=debug" } else { "migrator=warn" })
        })
    };
    let json_layer = json.then(|| {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_filter(console_filter())
    });
    let text_layer = (!json).then(|| {
        fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .with_filter(console_filter())
    });

    let (file_layer, guard) = match log_dir.map(|dir| (dir, std::fs::create_dir_all(dir))) {
        Some((dir, Ok(()))) => {
            let appender = tracing_appender::rolling::daily(dir, "migrator.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(EnvFilter::new(if verbose { "migrator=debug" } else { "migrator=info" }));
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(text_layer)
        .with(json_layer)
        .with(file_layer)
        .try_init();
    guard
}
