//! Progress events emitted while a run walks its phases.

use serde::{Deserialize, Serialize};

use super::RunMode;
use crate::checkpoint::RunStatus;
use crate::phase::SkipReason;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutorEvent {
    /// The walk is about to start over `phases`, in order.
    RunStarted {
        run_id: String,
        mode: RunMode,
        phases: Vec<String>,
    },
    /// Already completed in an earlier attempt of this run; not invoked again.
    PhaseAlreadyDone { phase: String },
    PhaseStarted { phase: String },
    /// A retryable failure; the next attempt starts after `delay_ms`.
    PhaseRetrying {
        phase: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    PhaseCompleted { phase: String, duration_ms: u64 },
    PhaseFailed { phase: String, error: String },
    PhaseSkipped { phase: String, reason: SkipReason },
    /// Result of a validate-only precondition check.
    PhaseValidated {
        phase: String,
        passed: bool,
        error: Option<String>,
    },
    RunFinished {
        run_id: String,
        status: RunStatus,
        cancelled: bool,
    },
}

impl ExecutorEvent {
    /// The phase this event is about, if any.
    pub fn phase(&self) -> Option<&str> {
        match self {
            ExecutorEvent::PhaseAlreadyDone { phase }
            | ExecutorEvent::PhaseStarted { phase }
            | ExecutorEvent::PhaseRetrying { phase, .. }
            | ExecutorEvent::PhaseCompleted { phase, .. }
            | ExecutorEvent::PhaseFailed { phase, .. }
            | ExecutorEvent::PhaseSkipped { phase, .. }
            | ExecutorEvent::PhaseValidated { phase, .. } => Some(phase),
            ExecutorEvent::RunStarted { .. } | ExecutorEvent::RunFinished { .. } => None,
        }
    }
}
