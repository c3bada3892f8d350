//! Phase status and the per-phase record persisted in checkpoints.
//!
//! This module provides:
//! - `PhaseStatus`, the five-state lifecycle of a phase within one run
//! - `SkipReason`, distinguishing operator skips from phases blocked by a failure
//! - `PhaseRecord`, the `{status, started_at, ended_at, metadata}` entry of a checkpoint

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Free-form result metadata attached to a phase.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Lifecycle status of a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    NotStarted,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseStatus::NotStarted => "not_started",
            PhaseStatus::InProgress => "in_progress",
            PhaseStatus::Completed => "completed",
            PhaseStatus::Failed => "failed",
            PhaseStatus::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a phase ended up `Skipped`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    /// Skipped on request. Satisfies dependents.
    Operator,
    /// Not attempted because an upstream phase failed. Does not satisfy dependents
    /// and is retried on resume.
    Blocked { by: String },
}

/// Persisted state of one phase within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub status: PhaseStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Metadata,
    /// Whether this phase counts toward the overall run status.
    #[serde(default = "default_required")]
    pub required: bool,
    /// Tries in the latest attempt of this phase, counting retries and breaker rejections.
    #[serde(default)]
    pub attempts: u32,
    /// Calls refused by an open circuit breaker, counted apart from operation failures.
    #[serde(default)]
    pub breaker_rejections: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
}

fn default_required() -> bool {
    true
}

impl Default for PhaseRecord {
    fn default() -> Self {
        Self::new(true)
    }
}

impl PhaseRecord {
    pub fn new(required: bool) -> Self {
        Self {
            status: PhaseStatus::NotStarted,
            started_at: None,
            ended_at: None,
            metadata: Metadata::new(),
            required,
            attempts: 0,
            breaker_rejections: 0,
            error: None,
            skip_reason: None,
        }
    }

    /// A dependency in this state lets its dependents start.
    pub fn satisfies_dependents(&self) -> bool {
        match self.status {
            PhaseStatus::Completed => true,
            PhaseStatus::Skipped => !self.is_blocked(),
            _ => false,
        }
    }

    /// Completed or operator-skipped: nothing left to do on resume.
    pub fn is_done(&self) -> bool {
        self.satisfies_dependents()
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self.skip_reason, Some(SkipReason::Blocked { .. }))
    }

    /// Failed, or skipped because something upstream failed.
    pub fn blocks_dependents(&self) -> bool {
        self.status == PhaseStatus::Failed || self.is_blocked()
    }

    pub(crate) fn start(&mut self, now: DateTime<Utc>) {
        self.status = PhaseStatus::InProgress;
        self.started_at = Some(now);
        self.ended_at = None;
        self.error = None;
        self.skip_reason = None;
        self.attempts = 0;
        self.breaker_rejections = 0;
    }

    pub(crate) fn complete(&mut self, metadata: Metadata, now: DateTime<Utc>) {
        self.status = PhaseStatus::Completed;
        self.metadata = metadata;
        self.ended_at = Some(now);
        self.error = None;
    }

    pub(crate) fn fail(&mut self, error: String, now: DateTime<Utc>) {
        self.status = PhaseStatus::Failed;
        self.ended_at = Some(now);
        self.error = Some(error);
    }

    pub(crate) fn skip(&mut self, reason: SkipReason, now: DateTime<Utc>) {
        self.status = PhaseStatus::Skipped;
        self.skip_reason = Some(reason);
        self.started_at = None;
        self.ended_at = Some(now);
        self.error = None;
    }

    /// Wall-clock duration of the last attempt, if it finished.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&PhaseStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
        let back: PhaseStatus = serde_json::from_str("\"not_started\"").unwrap();
        assert_eq!(back, PhaseStatus::NotStarted);
    }

    #[test]
    fn test_operator_skip_satisfies_dependents() {
        let mut record = PhaseRecord::new(true);
        record.skip(SkipReason::Operator, Utc::now());
        assert!(record.satisfies_dependents());
        assert!(record.is_done());
        assert!(!record.blocks_dependents());
    }

    #[test]
    fn test_blocked_skip_does_not_satisfy_dependents() {
        let mut record = PhaseRecord::new(true);
        record.skip(
            SkipReason::Blocked {
                by: "services".into(),
            },
            Utc::now(),
        );
        assert_eq!(record.status, PhaseStatus::Skipped);
        assert!(!record.satisfies_dependents());
        assert!(record.blocks_dependents());
    }

    #[test]
    fn test_start_resets_previous_failure() {
        let mut record = PhaseRecord::new(true);
        record.attempts = 3;
        record.fail("boom".into(), Utc::now());
        assert!(record.blocks_dependents());

        record.start(Utc::now());
        assert_eq!(record.status, PhaseStatus::InProgress);
        assert!(record.error.is_none());
        assert!(record.ended_at.is_none());
        assert_eq!(record.attempts, 0);
    }

    #[test]
    fn test_missing_optional_fields_use_defaults() {
        let record: PhaseRecord = serde_json::from_str(
            r#"{"status":"completed","started_at":null,"ended_at":null,"metadata":{}}"#,
        )
        .unwrap();
        assert!(record.required);
        assert_eq!(record.attempts, 0);
        assert!(record.skip_reason.is_none());
    }

    #[test]
    fn test_duration() {
        let start = Utc::now();
        let mut record = PhaseRecord::new(true);
        record.start(start);
        assert!(record.duration().is_none());
        record.complete(Metadata::new(), start + chrono::Duration::seconds(7));
        assert_eq!(record.duration(), Some(chrono::Duration::seconds(7)));
    }
}
