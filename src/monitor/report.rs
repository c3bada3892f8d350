//! Status reports: the structured view of a run and its two renderings.

use chrono::{DateTime, Utc};
use console::style;
use serde::{Deserialize, Serialize};
use std::fmt::Write;

use crate::checkpoint::{Checkpoint, RunStatus, WriterId};
use crate::phase::{PhaseRecord, PhaseStatus, SkipReason};

/// Something the monitor noticed. Reported, never raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Anomaly {
    ConcurrentRunConflict { reason: String },
    RunNotFound,
    CheckpointUnreadable { error: String },
}

impl std::fmt::Display for Anomaly {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Anomaly::ConcurrentRunConflict { reason } => {
                write!(f, "concurrent run conflict: {reason}")
            }
            Anomaly::RunNotFound => write!(f, "no checkpoint found for this run"),
            Anomaly::CheckpointUnreadable { error } => {
                write!(f, "checkpoint unreadable: {error}")
            }
        }
    }
}

/// One line of the phase table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRow {
    pub name: String,
    pub status: PhaseStatus,
    pub required: bool,
    pub attempts: u32,
    pub breaker_rejections: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Elapsed so far for a running phase.
    pub duration_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
}

impl PhaseRow {
    fn from_record(name: &str, record: &PhaseRecord, now: DateTime<Utc>) -> Self {
        let duration = match (record.started_at, record.ended_at) {
            (Some(start), Some(end)) => Some(end - start),
            (Some(start), None) if record.status == PhaseStatus::InProgress => Some(now - start),
            _ => None,
        };
        Self {
            name: name.to_string(),
            status: record.status,
            required: record.required,
            attempts: record.attempts,
            breaker_rejections: record.breaker_rejections,
            started_at: record.started_at,
            ended_at: record.ended_at,
            duration_secs: duration.map(|d| d.num_milliseconds() as f64 / 1000.0),
            error: record.error.clone(),
            skip_reason: record.skip_reason.clone(),
        }
    }
}

/// A point-in-time view of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub run_id: String,
    pub generated_at: DateTime<Utc>,
    /// `None` when the checkpoint could not be read.
    pub status: Option<RunStatus>,
    pub environment: Option<String>,
    pub revision: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub elapsed_secs: Option<i64>,
    pub cancelled: bool,
    pub writer: Option<WriterId>,
    pub phases: Vec<PhaseRow>,
    pub anomalies: Vec<Anomaly>,
}

impl StatusReport {
    pub(crate) fn from_checkpoint(checkpoint: &Checkpoint, now: DateTime<Utc>) -> Self {
        Self {
            run_id: checkpoint.run_id.clone(),
            generated_at: now,
            status: Some(checkpoint.status()),
            environment: Some(checkpoint.environment.clone()),
            revision: Some(checkpoint.revision),
            started_at: Some(checkpoint.started_at),
            ended_at: checkpoint.ended_at,
            elapsed_secs: Some(checkpoint.elapsed(now).num_seconds()),
            cancelled: checkpoint.cancelled,
            writer: checkpoint.writer.clone(),
            phases: checkpoint
                .ordered_phases()
                .into_iter()
                .map(|(name, record)| PhaseRow::from_record(name, record, now))
                .collect(),
            anomalies: Vec::new(),
        }
    }

    pub(crate) fn unavailable(run_id: &str, anomaly: Anomaly, now: DateTime<Utc>) -> Self {
        Self {
            run_id: run_id.to_string(),
            generated_at: now,
            status: None,
            environment: None,
            revision: None,
            started_at: None,
            ended_at: None,
            elapsed_secs: None,
            cancelled: false,
            writer: None,
            phases: Vec::new(),
            anomalies: vec![anomaly],
        }
    }

    pub fn has_conflict(&self) -> bool {
        self.anomalies
            .iter()
            .any(|a| matches!(a, Anomaly::ConcurrentRunConflict { .. }))
    }

    pub fn is_finished(&self) -> bool {
        self.ended_at.is_some()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Terminal rendering with a phase table. Styling is dropped automatically
    /// when the output is not a terminal.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let status = match self.status {
            Some(RunStatus::Completed) => style("COMPLETED").green().bold(),
            Some(RunStatus::Failed) => style("FAILED").red().bold(),
            Some(RunStatus::InProgress) if self.cancelled => style("CANCELLED").yellow().bold(),
            Some(RunStatus::InProgress) => style("IN PROGRESS").cyan().bold(),
            None => style("UNKNOWN").dim(),
        };

        let _ = writeln!(out, "Run {}: {}", style(&self.run_id).bold(), status);
        if let Some(environment) = &self.environment {
            let _ = writeln!(out, "Environment: {environment}");
        }
        if let Some(revision) = self.revision {
            let _ = write!(out, "Revision: {revision}");
            if let Some(writer) = &self.writer {
                let _ = write!(out, " (written by {writer})");
            }
            out.push('\n');
        }
        if let Some(elapsed) = self.elapsed_secs {
            let _ = writeln!(out, "Elapsed: {}", format_secs(elapsed as f64));
        }

        if !self.phases.is_empty() {
            let width = self
                .phases
                .iter()
                .map(|p| p.name.len())
                .max()
                .unwrap_or(5)
                .max(5);
            out.push('\n');
            let _ = writeln!(
                out,
                "  {:<width$}  {:<12} {:>8}  Notes",
                "Phase", "Status", "Duration"
            );
            for row in &self.phases {
                let _ = writeln!(
                    out,
                    "  {:<width$}  {:<12} {:>8}  {}",
                    row.name,
                    styled_status(row.status),
                    row.duration_secs.map(format_secs).unwrap_or_default(),
                    notes(row)
                );
            }
        }

        if !self.anomalies.is_empty() {
            out.push('\n');
            let _ = writeln!(out, "{}", style("Anomalies:").yellow().bold());
            for anomaly in &self.anomalies {
                let _ = writeln!(out, "  ! {anomaly}");
            }
        }
        out
    }
}

fn styled_status(status: PhaseStatus) -> console::StyledObject<&'static str> {
    let text = status.as_str();
    match status {
        PhaseStatus::Completed => style(text).green(),
        PhaseStatus::Failed => style(text).red(),
        PhaseStatus::InProgress => style(text).cyan(),
        PhaseStatus::Skipped => style(text).yellow(),
        PhaseStatus::NotStarted => style(text).dim(),
    }
}

fn notes(row: &PhaseRow) -> String {
    let mut notes = Vec::new();
    if !row.required {
        notes.push("optional".to_string());
    }
    if row.attempts > 1 {
        notes.push(format!("{} attempts", row.attempts));
    }
    if row.breaker_rejections > 0 {
        notes.push(format!("{} breaker rejections", row.breaker_rejections));
    }
    match &row.skip_reason {
        Some(SkipReason::Operator) => notes.push("skipped by operator".to_string()),
        Some(SkipReason::Blocked { by }) => notes.push(format!("blocked by {by}")),
        None => {}
    }
    if let Some(error) = &row.error {
        notes.push(error.clone());
    }
    notes.join("; ")
}

fn format_secs(secs: f64) -> String {
    if secs < 60.0 {
        format!("{secs:.1}s")
    } else {
        let total = secs as u64;
        let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
        if hours > 0 {
            format!("{hours}h{minutes:02}m")
        } else {
            format!("{minutes}m{seconds:02}s")
        }
    }
}
