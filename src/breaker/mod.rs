//! Circuit breaker protecting calls to slow or unreliable external services.
//!
//! ```text
//! CLOSED ──(failures >= threshold)──▶ OPEN
//! OPEN ──(recovery timeout elapsed)──▶ HALF_OPEN
//! HALF_OPEN ──(trial succeeds)──▶ CLOSED
//! HALF_OPEN ──(trial fails)──▶ OPEN
//! ```
//!
//! While OPEN the wrapped operation is never invoked; callers get a
//! [`BreakerOpenError`] immediately. HALF_OPEN admits exactly one trial call;
//! concurrent callers are refused until the trial settles.
//!
//! Every state read and transition happens under one mutex per breaker, and
//! the lock is never held across the wrapped operation's `.await`. Each
//! admitted call remembers the generation it was admitted under; an outcome
//! that settles after the breaker has since opened is ignored, and only the
//! HALF_OPEN trial may close the breaker.
//!
//! Time is measured with `tokio::time::Instant` so tests can drive the
//! recovery timeout with a paused clock.

mod registry;

pub use registry::BreakerRegistry;

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use crate::errors::{BreakerOpenError, CallError};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Thresholds for one breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker. Always at least 1.
    pub failure_threshold: u32,
    /// Time the breaker stays open before admitting a trial call.
    pub recovery_timeout: Duration,
}

impl BreakerConfig {
    pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
    pub const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self::new(
            Self::DEFAULT_FAILURE_THRESHOLD,
            Self::DEFAULT_RECOVERY_TIMEOUT,
        )
    }
}

/// Point-in-time view of a breaker, for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: BreakerState,
    pub failure_count: u32,
    pub rejected_calls: u64,
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failures: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
    rejected: u64,
    /// Bumped on every transition to OPEN.
    generation: u64,
}

/// A circuit breaker bound to one named operation.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: 0,
                last_failure: None,
                trial_in_flight: false,
                rejected: 0,
                generation: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> BreakerConfig {
        self.config
    }

    /// Current state, moving OPEN to HALF_OPEN if the recovery timeout has elapsed.
    pub fn state(&self) -> BreakerState {
        let mut inner = self.lock();
        self.refresh(&mut inner, Instant::now());
        inner.state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failures
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut inner = self.lock();
        self.refresh(&mut inner, Instant::now());
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failures,
            rejected_calls: inner.rejected,
            failure_threshold: self.config.failure_threshold,
            recovery_timeout_secs: self.config.recovery_timeout.as_secs(),
        }
    }

    /// Run `operation` through the breaker.
    ///
    /// Returns `CallError::Open` without invoking `operation` when the breaker
    /// refuses the call; otherwise the operation's own result, recording its
    /// outcome. Every operation error counts as a failure.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.acquire().map_err(CallError::Open)?;
        match operation().await {
            Ok(value) => {
                permit.succeed();
                Ok(value)
            }
            Err(err) => {
                permit.fail();
                Err(CallError::Operation(err))
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn refresh(&self, inner: &mut Inner, now: Instant) {
        if inner.state != BreakerState::Open {
            return;
        }
        let elapsed = inner
            .last_failure
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or(self.config.recovery_timeout);
        if elapsed >= self.config.recovery_timeout {
            inner.state = BreakerState::HalfOpen;
            inner.trial_in_flight = false;
            tracing::info!(breaker = %self.name, "circuit breaker half-open, admitting one trial call");
        }
    }

    fn acquire(&self) -> Result<Permit<'_>, BreakerOpenError> {
        let now = Instant::now();
        let mut inner = self.lock();
        self.refresh(&mut inner, now);

        match inner.state {
            BreakerState::Closed => Ok(Permit::new(self, false, inner.generation)),
            BreakerState::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                Ok(Permit::new(self, true, inner.generation))
            }
            BreakerState::HalfOpen => {
                inner.rejected += 1;
                Err(self.open_error(Duration::ZERO))
            }
            BreakerState::Open => {
                inner.rejected += 1;
                let elapsed = inner
                    .last_failure
                    .map(|at| now.saturating_duration_since(at))
                    .unwrap_or_default();
                let retry_after = self.config.recovery_timeout.saturating_sub(elapsed);
                tracing::debug!(breaker = %self.name, ?retry_after, "circuit breaker refused call");
                Err(self.open_error(retry_after))
            }
        }
    }

    fn open_error(&self, retry_after: Duration) -> BreakerOpenError {
        BreakerOpenError {
            name: self.name.clone(),
            retry_after,
        }
    }

    fn record_success(&self, trial: bool, generation: u64) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }
        match (inner.state, trial) {
            (BreakerState::HalfOpen, true) => {
                inner.failures = 0;
                inner.trial_in_flight = false;
                inner.state = BreakerState::Closed;
                tracing::info!(breaker = %self.name, "circuit breaker closed");
            }
            (BreakerState::Closed, false) => inner.failures = 0,
            _ => {}
        }
    }

    fn record_failure(&self, trial: bool, generation: u64) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }
        let reopen = match (inner.state, trial) {
            (BreakerState::HalfOpen, true) => {
                inner.trial_in_flight = false;
                inner.failures = inner.failures.saturating_add(1);
                true
            }
            (BreakerState::Closed, false) => {
                inner.failures = inner.failures.saturating_add(1);
                inner.failures >= self.config.failure_threshold
            }
            _ => return,
        };
        inner.last_failure = Some(Instant::now());
        if reopen {
            inner.state = BreakerState::Open;
            inner.generation += 1;
            tracing::warn!(
                breaker = %self.name,
                failures = inner.failures,
                recovery_timeout = ?self.config.recovery_timeout,
                "circuit breaker opened"
            );
        }
    }

    fn release_trial(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.generation == generation && inner.state == BreakerState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }
}

/// Admission to call the wrapped operation. A trial permit dropped without an
/// outcome (e.g. the caller's future was cancelled) releases the trial slot.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    generation: u64,
    settled: bool,
}

impl<'a> Permit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool, generation: u64) -> Self {
        Self {
            breaker,
            trial,
            generation,
            settled: false,
        }
    }

    fn succeed(mut self) {
        self.settled = true;
        self.breaker.record_success(self.trial, self.generation);
    }

    fn fail(mut self) {
        self.settled = true;
        self.breaker.record_failure(self.trial, self.generation);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.breaker.release_trial(self.generation);
        }
    }
}
