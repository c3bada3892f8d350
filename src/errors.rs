//! Typed error hierarchy for the migration orchestrator.
//!
//! One enum per subsystem:
//! - `RegistryError`: phase graph configuration (duplicates, unknown deps, cycles)
//! - `CheckpointError`: durable checkpoint storage
//! - `ExecutorError`: terminal outcomes of `PhaseExecutor::run`
//!
//! plus the breaker's own `BreakerOpenError` and the `CallError` wrapper
//! returned by `CircuitBreaker::call`.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::operation::OperationError;

/// Returned by a circuit breaker instead of invoking the wrapped operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("circuit breaker '{name}' is open (retry in {retry_after:?})")]
pub struct BreakerOpenError {
    pub name: String,
    /// Time left until the breaker admits a trial call.
    pub retry_after: Duration,
}

/// Outcome of a call routed through a circuit breaker.
#[derive(Debug, Error)]
pub enum CallError<E> {
    #[error(transparent)]
    Open(BreakerOpenError),

    #[error("{0}")]
    Operation(E),
}

impl<E> CallError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, CallError::Open(_))
    }
}

/// Errors in the phase graph. All of these are fatal configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Duplicate phase name: {0}")]
    DuplicatePhase(String),

    #[error("Unknown dependency '{dependency}' in phase '{phase}': no phase with that name exists")]
    UnknownDependency { phase: String, dependency: String },

    #[error("Cycle detected in phase dependencies. Involved phases: {0:?}")]
    Cycle(Vec<String>),

    #[error("Unknown phase: {0}")]
    UnknownPhase(String),
}

/// Errors from checkpoint persistence.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed checkpoint at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Another writer advanced the run since this process last saved it.
    #[error(
        "Stale checkpoint for run '{run_id}': tried to write revision {attempted} but store is at revision {current}"
    )]
    Stale {
        run_id: String,
        attempted: u64,
        current: u64,
    },

    #[error("Invalid run id '{0}': must be non-empty and contain only [A-Za-z0-9._-]")]
    InvalidRunId(String),

    #[error("Checkpoint store lock poisoned")]
    LockPoisoned,
}

impl CheckpointError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CheckpointError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Terminal errors of a migration run.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Invalid phase configuration: {0}")]
    Config(#[from] RegistryError),

    /// Always fatal for this process; never retried.
    #[error(
        "Run '{run_id}' was advanced by another process (revision {attempted} rejected, store at {current})"
    )]
    StaleCheckpoint {
        run_id: String,
        attempted: u64,
        current: u64,
    },

    #[error(transparent)]
    Checkpoint(CheckpointError),

    #[error("Phase '{phase}' failed: {cause}")]
    PhaseFailed {
        phase: String,
        #[source]
        cause: OperationError,
    },

    #[error("No checkpoint to resume{}", run_id.as_deref().map(|id| format!(" for run '{id}'")).unwrap_or_default())]
    NothingToResume { run_id: Option<String> },

    #[error("Run '{run_id}' already has a checkpoint; use resume to continue it")]
    RunExists { run_id: String },
}

impl From<CheckpointError> for ExecutorError {
    fn from(err: CheckpointError) -> Self {
        match err {
            CheckpointError::Stale {
                run_id,
                attempted,
                current,
            } => ExecutorError::StaleCheckpoint {
                run_id,
                attempted,
                current,
            },
            other => ExecutorError::Checkpoint(other),
        }
    }
}

impl ExecutorError {
    /// Process exit code for this error: 2 for concurrent-writer conflicts, 1 otherwise.
    pub fn exit_code(&self) -> u8 {
        match self {
            ExecutorError::StaleCheckpoint { .. } => 2,
            _ => 1,
        }
    }

    /// Name of the phase that terminated the run, if any.
    pub fn failed_phase(&self) -> Option<&str> {
        match self {
            ExecutorError::PhaseFailed { phase, .. } => Some(phase),
            _ => None,
        }
    }
}
