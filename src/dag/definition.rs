//! Phase definitions: a named node bound to an operation.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::operation::Operation;

/// A phase as registered into the [`PhaseRegistry`](super::PhaseRegistry).
#[derive(Clone)]
pub struct PhaseDefinition {
    pub name: String,
    /// Phase names that must be completed (or skipped by the operator) first.
    pub depends_on: Vec<String>,
    pub operation: Arc<dyn Operation>,
    /// Circuit breaker guarding the operation; phases naming the same breaker share it.
    pub breaker: Option<String>,
    /// Per-call timeout, overriding the executor default.
    pub timeout: Option<Duration>,
    /// Whether the phase counts toward the overall run status.
    pub required: bool,
}

impl PhaseDefinition {
    pub fn new<I, S>(name: impl Into<String>, depends_on: I, operation: Arc<dyn Operation>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            depends_on: depends_on.into_iter().map(Into::into).collect(),
            operation,
            breaker: None,
            timeout: None,
            required: true,
        }
    }

    pub fn with_breaker(mut self, breaker: impl Into<String>) -> Self {
        self.breaker = Some(breaker.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Mark the phase optional: its failure neither fails nor halts the run.
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

impl fmt::Debug for PhaseDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhaseDefinition")
            .field("name", &self.name)
            .field("depends_on", &self.depends_on)
            .field("breaker", &self.breaker)
            .field("timeout", &self.timeout)
            .field("required", &self.required)
            .finish_non_exhaustive()
    }
}
