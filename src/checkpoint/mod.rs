//! Durable run state: the checkpoint document and the stores that hold it.
//!
//! A [`Checkpoint`] is written after every phase transition. Every save must
//! carry `revision == stored_revision + 1`; anything else is rejected as stale,
//! which is how two processes racing on one run id are told apart.
//!
//! Stores:
//! - [`FileCheckpointStore`] writes `<dir>/<run_id>.json` atomically
//! - [`MemoryCheckpointStore`] keeps checkpoints in process (dry runs, tests)

mod file;
mod memory;

pub use file::FileCheckpointStore;
pub use memory::MemoryCheckpointStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::errors::CheckpointError;
use crate::phase::{Metadata, PhaseRecord, PhaseStatus, SkipReason};

/// Overall status of a run, derived from its phase records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    InProgress,
    Completed,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::InProgress => write!(f, "in_progress"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Identity of the process that wrote a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterId {
    /// Random per executor instance.
    pub instance: Uuid,
    pub pid: u32,
    /// Empty when the host name could not be determined.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,
}

impl WriterId {
    /// A fresh identity for this process.
    pub fn current() -> Self {
        Self {
            instance: Uuid::new_v4(),
            pid: std::process::id(),
            host: host_name().unwrap_or_default(),
        }
    }
}

fn host_name() -> Option<String> {
    ["/proc/sys/kernel/hostname", "/etc/hostname"]
        .iter()
        .filter_map(|path| std::fs::read_to_string(path).ok())
        .chain(std::env::var("HOSTNAME").ok())
        .map(|name| name.trim().to_string())
        .find(|name| !name.is_empty())
}

impl std::fmt::Display for WriterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.is_empty() {
            write!(f, "pid {} ({})", self.pid, self.instance)
        } else {
            write!(f, "{}@{} ({})", self.pid, self.host, self.instance)
        }
    }
}

/// Persisted state of one migration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: String,
    /// Strictly increasing; bumped on every save.
    pub revision: u64,
    #[serde(default)]
    pub environment: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    /// Set when the run stopped on a cancellation request.
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub writer: Option<WriterId>,
    /// Phase names in execution order.
    #[serde(default)]
    pub order: Vec<String>,
    pub phases: BTreeMap<String, PhaseRecord>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    /// A revision-0 checkpoint with every phase `NotStarted`.
    ///
    /// `phases` yields `(name, required)` in execution order.
    pub fn new<'a, I>(run_id: impl Into<String>, environment: impl Into<String>, phases: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, bool)>,
    {
        let now = Utc::now();
        let mut order = Vec::new();
        let mut records = BTreeMap::new();
        for (name, required) in phases {
            order.push(name.to_string());
            records.insert(name.to_string(), PhaseRecord::new(required));
        }
        Self {
            run_id: run_id.into(),
            revision: 0,
            environment: environment.into(),
            started_at: now,
            ended_at: None,
            cancelled: false,
            writer: None,
            order,
            phases: records,
            updated_at: now,
        }
    }

    pub fn phase(&self, name: &str) -> Option<&PhaseRecord> {
        self.phases.get(name)
    }

    /// Overall status.
    ///
    /// Failed if any required phase failed; Completed if every required phase
    /// completed or was skipped by the operator; InProgress otherwise.
    pub fn status(&self) -> RunStatus {
        let mut required = self.phases.values().filter(|r| r.required).peekable();
        if required.peek().is_none() {
            return RunStatus::Completed;
        }
        let mut all_done = true;
        for record in required {
            if record.status == PhaseStatus::Failed {
                return RunStatus::Failed;
            }
            if !record.is_done() {
                all_done = false;
            }
        }
        if all_done {
            RunStatus::Completed
        } else {
            RunStatus::InProgress
        }
    }

    pub fn is_finished(&self) -> bool {
        self.ended_at.is_some()
    }

    /// Phase names in execution order, followed by any record missing from `order`.
    pub fn ordered_phases(&self) -> Vec<(&str, &PhaseRecord)> {
        let mut rows: Vec<(&str, &PhaseRecord)> = self
            .order
            .iter()
            .filter_map(|name| self.phases.get_key_value(name))
            .map(|(name, record)| (name.as_str(), record))
            .collect();
        for (name, record) in &self.phases {
            if !self.order.iter().any(|n| n == name) {
                rows.push((name.as_str(), record));
            }
        }
        rows
    }

    /// Metadata of every completed phase, by name.
    pub fn prior_results(&self) -> BTreeMap<String, Metadata> {
        self.phases
            .iter()
            .filter(|(_, record)| record.status == PhaseStatus::Completed)
            .map(|(name, record)| (name.clone(), record.metadata.clone()))
            .collect()
    }

    pub fn count(&self, status: PhaseStatus) -> usize {
        self.phases.values().filter(|r| r.status == status).count()
    }

    /// Wall-clock time from start to end, or to `now` while running.
    pub fn elapsed(&self, now: DateTime<Utc>) -> chrono::Duration {
        self.ended_at.unwrap_or(now) - self.started_at
    }

    /// Sum of breaker rejections over all phases.
    pub fn breaker_rejections(&self) -> u32 {
        self.phases.values().map(|r| r.breaker_rejections).sum()
    }

    /// Name of the first failed phase, in execution order.
    pub fn failed_phase(&self) -> Option<&str> {
        self.ordered_phases()
            .into_iter()
            .find(|(_, r)| r.status == PhaseStatus::Failed)
            .map(|(name, _)| name)
    }

    /// Phases skipped because something upstream failed.
    pub fn blocked_phases(&self) -> Vec<&str> {
        self.ordered_phases()
            .into_iter()
            .filter(|(_, r)| matches!(r.skip_reason, Some(SkipReason::Blocked { .. })))
            .map(|(name, _)| name)
            .collect()
    }
}

/// Durable storage for checkpoints, keyed by run id.
pub trait CheckpointStore: Send + Sync {
    /// The latest saved checkpoint, or `None` if the run was never saved.
    fn load(&self, run_id: &str) -> Result<Option<Checkpoint>, CheckpointError>;

    /// Persist `checkpoint`. Fails with `Stale` unless
    /// `checkpoint.revision` is exactly one past the stored revision
    /// (a run that was never saved is at revision 0).
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    /// Ids of all stored runs, sorted.
    fn list_runs(&self) -> Result<Vec<String>, CheckpointError>;

    /// The most recently started run.
    fn latest_run(&self) -> Result<Option<String>, CheckpointError> {
        let mut latest: Option<(DateTime<Utc>, String)> = None;
        for run_id in self.list_runs()? {
            let Some(checkpoint) = self.load(&run_id)? else {
                continue;
            };
            let candidate = (checkpoint.started_at, run_id);
            if latest.as_ref().is_none_or(|current| candidate > *current) {
                latest = Some(candidate);
            }
        }
        Ok(latest.map(|(_, run_id)| run_id))
    }
}

/// Run ids become file names: non-empty, `[A-Za-z0-9._-]` only, not starting with `.`.
pub fn validate_run_id(run_id: &str) -> Result<(), CheckpointError> {
    let valid = !run_id.is_empty()
        && !run_id.starts_with('.')
        && run_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(CheckpointError::InvalidRunId(run_id.to_string()))
    }
}

/// Default run id for a run started at `now`.
pub fn generate_run_id(now: DateTime<Utc>) -> String {
    format!("run-{}", now.format("%Y%m%dT%H%M%SZ"))
}
