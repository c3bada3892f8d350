//! Migration execution: `migrator run` and `migrator cancel`.

use anyhow::Result;
use chrono::Utc;
use console::style;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use migrator::checkpoint::{
    CheckpointStore, FileCheckpointStore, generate_run_id, validate_run_id,
};
use migrator::config::MigrateConfig;
use migrator::errors::ExecutorError;
use migrator::executor::{PhaseExecutor, RunMode, RunOptions, RunOutcome};
use migrator::plan::PhasesFile;
use migrator::ui::icons::{CROSS, WARN};
use migrator::ui::{RunUI, UiMode};

use super::super::{Cli, RunArgs};

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub fn load_config(project_dir: &Path, cli: &Cli, environment: Option<String>) -> Result<MigrateConfig> {
    let config = MigrateConfig::new(project_dir.to_path_buf())?
        .with_cli_args(environment, cli.checkpoint_dir.clone());
    for warning in config.validate() {
        eprintln!("{}{}", WARN, warning);
    }
    Ok(config)
}

pub async fn cmd_run(project_dir: &Path, cli: &Cli, args: &RunArgs) -> Result<u8> {
    let config = load_config(project_dir, cli, args.environment.clone())?;

    let phases_path = config.phases_file();
    if !phases_path.exists() {
        anyhow::bail!(
            "No migration plan found at {}. Run 'migrator config init' to create an example.",
            phases_path.display()
        );
    }
    let phases = PhasesFile::load(&phases_path)?;
    let registry = phases.to_registry(&config.project_dir, &config.toml.run.transient_exit_codes)?;

    let store = Arc::new(FileCheckpointStore::new(config.checkpoint_dir()));
    let run_id = match (&args.run_id, args.mode) {
        (Some(run_id), _) => run_id.clone(),
        (None, RunMode::Resume) => match store.latest_run()? {
            Some(run_id) => run_id,
            None => {
                eprintln!("{}{}", CROSS, ExecutorError::NothingToResume { run_id: None });
                return Ok(1);
            }
        },
        (None, _) => generate_run_id(Utc::now()),
    };

    validate_run_id(&run_id)?;
    let writes_checkpoint = matches!(args.mode, RunMode::Execute | RunMode::Resume);
    if writes_checkpoint {
        // a marker left behind by an earlier, already finished run
        store.clear_cancel(&run_id)?;
    }

    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());
    let watcher = spawn_cancel_marker_watcher(Arc::clone(&store), run_id.clone(), cancel.clone());

    let ui_mode = UiMode::parse(&args.ui);
    let ui = RunUI::new(ui_mode, cli.verbose);
    let (tx, mut rx) = mpsc::channel(256);
    let ui_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            ui.handle_event(&event);
        }
        ui.finish();
    });

    let executor = PhaseExecutor::new(registry, store.clone(), config.toml.executor_config())
        .with_breakers(Arc::new(config.toml.breaker_registry()))
        .with_event_channel(tx);

    let mut options = RunOptions::new(config.environment())
        .with_skip(args.skip.clone())
        .with_cancel(cancel.clone());
    if let Some(phase) = &args.phase {
        options = options.with_target(phase);
    }

    let result = executor.run(&run_id, args.mode, &options).await;

    // closes the event channel
    drop(executor);
    let _ = ui_task.await;
    watcher.abort();
    if writes_checkpoint && let Err(e) = store.clear_cancel(&run_id) {
        tracing::warn!(run_id = %run_id, error = %e, "failed to remove cancel marker");
    }

    match result {
        Ok(outcome) => {
            if ui_mode != UiMode::Json {
                print_summary(&outcome);
            }
            Ok(outcome.exit_code())
        }
        Err(e) => {
            eprintln!("{}{}", CROSS, style(&e).red());
            if matches!(e, ExecutorError::PhaseFailed { .. }) {
                eprintln!(
                    "Fix the failure, then continue with: migrator run --mode resume --run-id {run_id}"
                );
            }
            Ok(e.exit_code())
        }
    }
}

pub fn cmd_cancel(project_dir: &Path, cli: &Cli, run_id: &str) -> Result<u8> {
    let config = load_config(project_dir, cli, None)?;
    let store = FileCheckpointStore::new(config.checkpoint_dir());

    let Some(checkpoint) = store.load(run_id)? else {
        anyhow::bail!("No checkpoint found for run '{}'", run_id);
    };
    if checkpoint.is_finished() {
        println!("Run {} already finished ({}).", run_id, checkpoint.status());
        return Ok(0);
    }

    let marker = store.request_cancel(run_id)?;
    println!(
        "Cancellation requested for run {}. It will stop after the current phase.",
        style(run_id).bold()
    );
    println!("Marker: {}", marker.display());
    Ok(0)
}

fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; stopping after the current phase");
            eprintln!("Interrupted: stopping after the current phase...");
            cancel.cancel();
        }
    });
}

fn spawn_cancel_marker_watcher(
    store: Arc<FileCheckpointStore>,
    run_id: String,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CANCEL_POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if store.cancel_requested(&run_id) {
                        tracing::info!(run_id = %run_id, "cancel marker found");
                        cancel.cancel();
                        break;
                    }
                }
            }
        }
    })
}

fn print_summary(outcome: &RunOutcome) {
    println!();
    match outcome.mode {
        RunMode::ValidateOnly => {
            let failed: Vec<_> = outcome.validation.iter().filter(|f| !f.passed).collect();
            if failed.is_empty() {
                println!("All {} phases passed validation.", outcome.validation.len());
            } else {
                println!(
                    "{} of {} phases failed validation:",
                    failed.len(),
                    outcome.validation.len()
                );
                for finding in failed {
                    println!(
                        "  - {}: {}",
                        finding.phase,
                        finding.error.as_deref().unwrap_or("precondition not met")
                    );
                }
            }
        }
        RunMode::DryRun => {
            println!(
                "Dry run of {}: would execute {} phase(s): {}",
                outcome.run_id,
                outcome.executed.len(),
                outcome.executed.join(", ")
            );
        }
        RunMode::Execute | RunMode::Resume => {
            println!(
                "Run {}: {} ({} phase(s) executed)",
                style(&outcome.run_id).bold(),
                if outcome.cancelled {
                    "cancelled".to_string()
                } else {
                    outcome.status.to_string()
                },
                outcome.executed.len()
            );
            if outcome.cancelled {
                println!(
                    "Continue with: migrator run --mode resume --run-id {}",
                    outcome.run_id
                );
            }
        }
    }
}
