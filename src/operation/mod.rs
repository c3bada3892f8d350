//! The boundary between the orchestration core and the work it drives.
//!
//! Every phase is bound to an [`Operation`]: an async callable that receives an
//! [`OperationContext`] and returns result metadata or a classified
//! [`OperationError`]. The core never inspects what an operation does.

pub mod command;

pub use command::CommandOperation;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::errors::BreakerOpenError;
use crate::phase::Metadata;

/// Failure classification driving retry and halt decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network blip, rate limit, temporary unavailability. Retried with backoff.
    Transient,
    /// Invalid configuration, authorization failure. Never retried; halts the run.
    Fatal,
    /// The operation exceeded its time budget. Retried like `Transient`.
    Timeout,
    /// The phase's circuit breaker refused the call. Retried like `Transient`,
    /// reported separately.
    BreakerOpen,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Transient => write!(f, "transient"),
            ErrorKind::Fatal => write!(f, "fatal"),
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::BreakerOpen => write!(f, "breaker open"),
        }
    }
}

/// Typed error returned by an operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} error: {message}")]
pub struct OperationError {
    pub kind: ErrorKind,
    pub message: String,
}

impl OperationError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(ErrorKind::Timeout, format!("operation timed out after {after:?}"))
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self.kind, ErrorKind::Fatal)
    }

    /// Promote a retryable error to fatal once the retry budget is spent.
    pub fn exhausted(self, attempts: u32) -> Self {
        if self.kind == ErrorKind::Fatal {
            return self;
        }
        Self::fatal(format!(
            "gave up after {attempts} attempt(s); last error was {}",
            self
        ))
    }
}

impl From<BreakerOpenError> for OperationError {
    fn from(err: BreakerOpenError) -> Self {
        Self::new(ErrorKind::BreakerOpen, err.to_string())
    }
}

/// What an operation is told about the run it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationContext {
    pub run_id: String,
    pub environment: String,
    pub phase: String,
    /// 1-based attempt number within the current run.
    pub attempt: u32,
    /// Metadata of every phase completed so far, by phase name.
    pub prior_results: BTreeMap<String, Metadata>,
}

/// A unit of work bound to a phase.
#[async_trait]
pub trait Operation: Send + Sync {
    /// Perform the phase's work. Should be idempotent: resumed runs may repeat it.
    async fn execute(&self, ctx: &OperationContext) -> Result<Metadata, OperationError>;

    /// Check preconditions without side effects. Used by validate-only runs.
    async fn validate(&self, _ctx: &OperationContext) -> Result<(), OperationError> {
        Ok(())
    }
}

/// Stand-in used by dry runs. Succeeds immediately and touches nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopOperation;

#[async_trait]
impl Operation for NoopOperation {
    async fn execute(&self, _ctx: &OperationContext) -> Result<Metadata, OperationError> {
        let mut metadata = Metadata::new();
        metadata.insert("dry_run".to_string(), serde_json::Value::Bool(true));
        Ok(metadata)
    }
}

/// Adapts an async closure into an [`Operation`].
pub struct FnOperation<F> {
    f: F,
}

impl<F> FnOperation<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Operation for FnOperation<F>
where
    F: Fn(OperationContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Metadata, OperationError>> + Send,
{
    async fn execute(&self, ctx: &OperationContext) -> Result<Metadata, OperationError> {
        (self.f)(ctx.clone()).await
    }
}
