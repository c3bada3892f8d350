//! Read-only observation commands: `migrator status`, `migrator watch`, `migrator runs`.

use anyhow::Result;
use console::{Term, style};
use futures::StreamExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use migrator::checkpoint::{CheckpointStore, FileCheckpointStore};
use migrator::config::MigrateConfig;
use migrator::monitor::{MigrationMonitor, StatusReport};

use super::super::Cli;
use super::run::load_config;

fn open_monitor(config: &MigrateConfig) -> (Arc<FileCheckpointStore>, MigrationMonitor) {
    let store = Arc::new(FileCheckpointStore::new(config.checkpoint_dir()));
    let monitor = MigrationMonitor::new(store.clone()).with_conflict_window(config.toml.conflict_window());
    (store, monitor)
}

fn resolve_run_id(store: &FileCheckpointStore, run_id: Option<&str>) -> Result<String> {
    if let Some(run_id) = run_id {
        return Ok(run_id.to_string());
    }
    store.latest_run()?.ok_or_else(|| {
        anyhow::anyhow!("No runs recorded in {}", store.dir().display())
    })
}

/// 0 when the run could be read, 1 otherwise.
fn report_exit_code(report: &StatusReport) -> u8 {
    if report.status.is_some() { 0 } else { 1 }
}

fn print_report(report: &StatusReport, json: bool) -> Result<()> {
    if json {
        // one object per line so `watch --json` output can be streamed
        println!("{}", serde_json::to_string(report)?);
    } else {
        print!("{}", report.render_text());
    }
    Ok(())
}

pub fn cmd_status(project_dir: &Path, cli: &Cli, run_id: Option<&str>, json: bool) -> Result<u8> {
    let config = load_config(project_dir, cli, None)?;
    let (store, monitor) = open_monitor(&config);
    let run_id = resolve_run_id(&store, run_id)?;

    let report = monitor.status(&run_id);
    if json {
        println!("{}", report.to_json()?);
    } else {
        print_report(&report, false)?;
    }
    Ok(report_exit_code(&report))
}

pub async fn cmd_watch(
    project_dir: &Path,
    cli: &Cli,
    run_id: Option<&str>,
    interval: Option<u64>,
    json: bool,
    count: Option<usize>,
) -> Result<u8> {
    let config = load_config(project_dir, cli, None)?;
    let (store, monitor) = open_monitor(&config);
    let run_id = resolve_run_id(&store, run_id)?;
    let interval = interval
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.toml.monitor_interval());

    let term = Term::stdout();
    let reports = monitor.watch(&run_id, interval);
    let mut reports = Box::pin(reports.take(count.unwrap_or(usize::MAX)));
    let mut last_code = 0;

    loop {
        let report = tokio::select! {
            report = reports.next() => report,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(report) = report else {
            break;
        };

        if !json && term.is_term() {
            let _ = term.clear_screen();
        }
        print_report(&report, json)?;
        last_code = report_exit_code(&report);

        if report.is_finished() {
            if !json {
                println!();
                println!("{}", style("Run finished.").dim());
            }
            break;
        }
    }
    Ok(last_code)
}

pub fn cmd_runs(project_dir: &Path, cli: &Cli, json: bool) -> Result<u8> {
    let config = load_config(project_dir, cli, None)?;
    let (store, monitor) = open_monitor(&config);
    let runs = monitor.runs();

    if json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(0);
    }

    if runs.is_empty() {
        println!("No runs recorded in {}", store.dir().display());
        return Ok(0);
    }

    let width = runs.iter().map(|r| r.run_id.len()).max().unwrap_or(6).max(6);
    println!();
    println!(
        "{:<width$}  {:<12} {:<12} {:>8}  Started",
        "Run", "Environment", "Status", "Revision"
    );
    for run in &runs {
        let status = if run.cancelled && run.ended_at.is_some() {
            "cancelled".to_string()
        } else {
            run.status.to_string()
        };
        println!(
            "{:<width$}  {:<12} {:<12} {:>8}  {}",
            run.run_id,
            run.environment,
            status,
            run.revision,
            run.started_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    println!();
    Ok(0)
}
