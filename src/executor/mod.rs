//! The phase executor: walks the registry in dependency order, one phase at a
//! time, writing the checkpoint after every transition.
//!
//! Modes:
//! - `Execute` starts a new run
//! - `Resume` continues a stored run, never re-invoking completed phases
//! - `DryRun` walks the graph with a no-op stand-in against an in-memory store
//! - `ValidateOnly` checks every phase's preconditions and records nothing
//!
//! Transient failures, timeouts and breaker rejections are retried with
//! exponential backoff. A fatal failure of a required phase halts the walk:
//! its dependents are marked blocked and the error is returned to the caller.

mod events;

pub use events::ExecutorEvent;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::breaker::BreakerRegistry;
use crate::checkpoint::{
    Checkpoint, CheckpointStore, MemoryCheckpointStore, RunStatus, WriterId, validate_run_id,
};
use crate::dag::{PhaseDefinition, PhaseRegistry};
use crate::errors::{CallError, CheckpointError, ExecutorError, RegistryError};
use crate::operation::{NoopOperation, Operation, OperationContext, OperationError};
use crate::phase::{Metadata, PhaseRecord, SkipReason};
use crate::retry::RetryConfig;

/// How a run treats its phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    Execute,
    DryRun,
    #[serde(rename = "validate")]
    ValidateOnly,
    Resume,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunMode::Execute => write!(f, "execute"),
            RunMode::DryRun => write!(f, "dry-run"),
            RunMode::ValidateOnly => write!(f, "validate"),
            RunMode::Resume => write!(f, "resume"),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown run mode '{0}' (expected execute, dry-run, validate or resume)")]
pub struct ParseRunModeError(String);

impl std::str::FromStr for RunMode {
    type Err = ParseRunModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "execute" => Ok(RunMode::Execute),
            "dry-run" | "dryrun" => Ok(RunMode::DryRun),
            "validate" | "validate-only" => Ok(RunMode::ValidateOnly),
            "resume" => Ok(RunMode::Resume),
            _ => Err(ParseRunModeError(s.to_string())),
        }
    }
}

/// Per-run knobs supplied by the caller.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Environment label recorded on new runs.
    pub environment: String,
    /// Restrict the run to this phase and its dependency closure.
    pub target: Option<String>,
    /// Phases to skip on request. They satisfy their dependents.
    pub skip: Vec<String>,
    /// Checked before each phase starts.
    pub cancel: CancellationToken,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            environment: "default".to_string(),
            target: None,
            skip: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }
}

impl RunOptions {
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
            ..Self::default()
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_skip(mut self, skip: Vec<String>) -> Self {
        self.skip = skip;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExecutorConfig {
    pub retry: RetryConfig,
    /// Time budget per operation call, unless the phase sets its own.
    pub phase_timeout: Duration,
}

impl ExecutorConfig {
    pub const DEFAULT_PHASE_TIMEOUT: Duration = Duration::from_secs(600);
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::DEFAULT,
            phase_timeout: Self::DEFAULT_PHASE_TIMEOUT,
        }
    }
}

/// Outcome of one validate-only precondition check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationFinding {
    pub phase: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What a run that did not end in a terminal error looks like.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub mode: RunMode,
    pub status: RunStatus,
    pub cancelled: bool,
    /// Final checkpoint (in-memory only for dry and validate-only runs).
    pub checkpoint: Checkpoint,
    /// Phases whose operation ran during this call, in order.
    pub executed: Vec<String>,
    pub validation: Vec<ValidationFinding>,
}

impl RunOutcome {
    /// 0 on success, 1 on a failed or incomplete run, 3 when cancelled.
    pub fn exit_code(&self) -> u8 {
        if self.cancelled {
            return 3;
        }
        match self.mode {
            RunMode::ValidateOnly => {
                if self.validation.iter().all(|f| f.passed) {
                    0
                } else {
                    1
                }
            }
            _ if self.status == RunStatus::Completed => 0,
            _ => 1,
        }
    }
}

/// Sequential, checkpointing phase walker.
pub struct PhaseExecutor {
    registry: PhaseRegistry,
    store: Arc<dyn CheckpointStore>,
    breakers: Arc<BreakerRegistry>,
    config: ExecutorConfig,
    writer: WriterId,
    event_tx: Option<mpsc::Sender<ExecutorEvent>>,
}

impl PhaseExecutor {
    pub fn new(
        registry: PhaseRegistry,
        store: Arc<dyn CheckpointStore>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            registry,
            store,
            breakers: Arc::new(BreakerRegistry::default()),
            config,
            writer: WriterId::current(),
            event_tx: None,
        }
    }

    pub fn with_breakers(mut self, breakers: Arc<BreakerRegistry>) -> Self {
        self.breakers = breakers;
        self
    }

    /// Set an event channel for progress updates.
    pub fn with_event_channel(mut self, tx: mpsc::Sender<ExecutorEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn registry(&self) -> &PhaseRegistry {
        &self.registry
    }

    pub fn writer(&self) -> &WriterId {
        &self.writer
    }

    /// Resume the most recently started run in the store.
    pub async fn resume_latest(&self, options: &RunOptions) -> Result<RunOutcome, ExecutorError> {
        let run_id = self
            .store
            .latest_run()?
            .ok_or(ExecutorError::NothingToResume { run_id: None })?;
        self.run(&run_id, RunMode::Resume, options).await
    }

    /// Run (or resume, dry-run, validate) `run_id`.
    ///
    /// The phase graph is validated before anything is invoked or written.
    /// A fatal failure of a required phase is returned as
    /// [`ExecutorError::PhaseFailed`] after the checkpoint records it.
    pub async fn run(
        &self,
        run_id: &str,
        mode: RunMode,
        options: &RunOptions,
    ) -> Result<RunOutcome, ExecutorError> {
        validate_run_id(run_id)?;
        let plan = self.plan(options)?;
        info!(run_id, %mode, phases = plan.len(), "starting run");

        match mode {
            RunMode::ValidateOnly => self.validate_only(run_id, &plan, options).await,
            RunMode::DryRun => {
                let store = MemoryCheckpointStore::new();
                let checkpoint = new_checkpoint(run_id, &options.environment, &plan);
                self.walk(&store, checkpoint, &plan, mode, options).await
            }
            RunMode::Execute => {
                if self.store.load(run_id)?.is_some() {
                    return Err(ExecutorError::RunExists {
                        run_id: run_id.to_string(),
                    });
                }
                let checkpoint = new_checkpoint(run_id, &options.environment, &plan);
                self.walk(self.store.as_ref(), checkpoint, &plan, mode, options)
                    .await
            }
            RunMode::Resume => {
                let mut checkpoint =
                    self.store
                        .load(run_id)?
                        .ok_or_else(|| ExecutorError::NothingToResume {
                            run_id: Some(run_id.to_string()),
                        })?;
                reopen(&mut checkpoint, &plan);
                self.walk(self.store.as_ref(), checkpoint, &plan, mode, options)
                    .await
            }
        }
    }

    /// Phases to walk, in execution order, after applying the target filter.
    fn plan(&self, options: &RunOptions) -> Result<Vec<&PhaseDefinition>, RegistryError> {
        let order = self.registry.execution_order()?;
        for name in &options.skip {
            if !self.registry.contains(name) {
                return Err(RegistryError::UnknownPhase(name.clone()));
            }
        }
        match &options.target {
            None => Ok(order),
            Some(target) => {
                let closure = self.registry.dependency_closure(target)?;
                Ok(order
                    .into_iter()
                    .filter(|phase| closure.contains(&phase.name))
                    .collect())
            }
        }
    }

    async fn walk(
        &self,
        store: &dyn CheckpointStore,
        mut checkpoint: Checkpoint,
        plan: &[&PhaseDefinition],
        mode: RunMode,
        options: &RunOptions,
    ) -> Result<RunOutcome, ExecutorError> {
        let run_id = checkpoint.run_id.clone();
        self.persist(store, &mut checkpoint)?;
        self.emit(ExecutorEvent::RunStarted {
            run_id: run_id.clone(),
            mode,
            phases: plan.iter().map(|p| p.name.clone()).collect(),
        })
        .await;

        let mut executed = Vec::new();
        for phase in plan {
            if options.cancel.is_cancelled() {
                info!(run_id = %run_id, phase = %phase.name, "cancellation requested, halting before phase");
                checkpoint.cancelled = true;
                break;
            }

            let name = phase.name.as_str();
            let Some(record) = checkpoint.phases.get(name) else {
                continue;
            };
            if record.is_done() {
                debug!(run_id = %run_id, phase = name, status = %record.status, "phase already done");
                self.emit(ExecutorEvent::PhaseAlreadyDone {
                    phase: name.to_string(),
                })
                .await;
                continue;
            }

            let skip = if options.skip.iter().any(|s| s == name) {
                Some(SkipReason::Operator)
            } else {
                unmet_dependency(&checkpoint, phase).map(|by| SkipReason::Blocked { by })
            };
            if let Some(reason) = skip {
                info!(run_id = %run_id, phase = name, ?reason, "skipping phase");
                record_mut(&mut checkpoint, name).skip(reason.clone(), Utc::now());
                self.persist(store, &mut checkpoint)?;
                self.emit(ExecutorEvent::PhaseSkipped {
                    phase: name.to_string(),
                    reason,
                })
                .await;
                continue;
            }

            let prior_results = checkpoint.prior_results();
            record_mut(&mut checkpoint, name).start(Utc::now());
            self.persist(store, &mut checkpoint)?;
            self.emit(ExecutorEvent::PhaseStarted {
                phase: name.to_string(),
            })
            .await;
            info!(run_id = %run_id, phase = name, "phase started");

            let ctx = OperationContext {
                run_id: run_id.clone(),
                environment: checkpoint.environment.clone(),
                phase: name.to_string(),
                attempt: 1,
                prior_results,
            };
            let result = self
                .invoke(phase, mode, ctx, record_mut(&mut checkpoint, name))
                .await;
            executed.push(name.to_string());

            match result {
                Ok(metadata) => {
                    let record = record_mut(&mut checkpoint, name);
                    record.complete(metadata, Utc::now());
                    let duration_ms = record
                        .duration()
                        .and_then(|d| d.to_std().ok())
                        .map(|d| d.as_millis() as u64)
                        .unwrap_or(0);
                    self.persist(store, &mut checkpoint)?;
                    info!(run_id = %run_id, phase = name, duration_ms, "phase completed");
                    self.emit(ExecutorEvent::PhaseCompleted {
                        phase: name.to_string(),
                        duration_ms,
                    })
                    .await;
                }
                Err(cause) => {
                    record_mut(&mut checkpoint, name).fail(cause.to_string(), Utc::now());
                    self.persist(store, &mut checkpoint)?;
                    warn!(run_id = %run_id, phase = name, error = %cause, required = phase.required, "phase failed");
                    self.emit(ExecutorEvent::PhaseFailed {
                        phase: name.to_string(),
                        error: cause.to_string(),
                    })
                    .await;

                    if phase.required {
                        let blocked = block_dependents(&mut checkpoint, plan, name);
                        checkpoint.ended_at = Some(Utc::now());
                        self.persist(store, &mut checkpoint)?;
                        for blocked_phase in blocked {
                            self.emit(ExecutorEvent::PhaseSkipped {
                                phase: blocked_phase,
                                reason: SkipReason::Blocked {
                                    by: name.to_string(),
                                },
                            })
                            .await;
                        }
                        self.emit(ExecutorEvent::RunFinished {
                            run_id: run_id.clone(),
                            status: checkpoint.status(),
                            cancelled: false,
                        })
                        .await;
                        return Err(ExecutorError::PhaseFailed {
                            phase: name.to_string(),
                            cause,
                        });
                    }
                }
            }
        }

        checkpoint.ended_at = Some(Utc::now());
        self.persist(store, &mut checkpoint)?;
        let status = checkpoint.status();
        info!(run_id = %run_id, %status, cancelled = checkpoint.cancelled, "run finished");
        self.emit(ExecutorEvent::RunFinished {
            run_id: run_id.clone(),
            status,
            cancelled: checkpoint.cancelled,
        })
        .await;

        Ok(RunOutcome {
            run_id,
            mode,
            status,
            cancelled: checkpoint.cancelled,
            checkpoint,
            executed,
            validation: Vec::new(),
        })
    }

    /// Call the phase's operation until it succeeds, fails fatally, or the
    /// retry budget runs out. Attempts and breaker rejections land on `record`.
    async fn invoke(
        &self,
        phase: &PhaseDefinition,
        mode: RunMode,
        mut ctx: OperationContext,
        record: &mut PhaseRecord,
    ) -> Result<Metadata, OperationError> {
        let dry_run = mode == RunMode::DryRun;
        let operation: &dyn Operation = if dry_run {
            &NoopOperation
        } else {
            phase.operation.as_ref()
        };
        let breaker = match (&phase.breaker, dry_run) {
            (Some(name), false) => Some(self.breakers.get(name)),
            _ => None,
        };
        let limit = phase.timeout.unwrap_or(self.config.phase_timeout);
        let retry = self.config.retry;

        loop {
            record.attempts = ctx.attempt;
            let result = match &breaker {
                Some(breaker) => breaker
                    .call(|| call_with_timeout(operation, &ctx, limit))
                    .await
                    .map_err(|err| match err {
                        CallError::Open(open) => {
                            record.breaker_rejections += 1;
                            OperationError::from(open)
                        }
                        CallError::Operation(err) => err,
                    }),
                None => call_with_timeout(operation, &ctx, limit).await,
            };

            let err = match result {
                Ok(metadata) => return Ok(metadata),
                Err(err) => err,
            };
            if !err.is_retryable() {
                return Err(err);
            }
            let retries_used = ctx.attempt - 1;
            if retries_used >= retry.max_retries {
                return Err(err.exhausted(ctx.attempt));
            }

            let delay = retry.delay_for_attempt(retries_used);
            warn!(
                run_id = %ctx.run_id,
                phase = %ctx.phase,
                attempt = ctx.attempt,
                breaker = ?phase.breaker,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retryable failure, backing off"
            );
            self.emit(ExecutorEvent::PhaseRetrying {
                phase: ctx.phase.clone(),
                attempt: ctx.attempt,
                delay_ms: delay.as_millis() as u64,
                error: err.to_string(),
            })
            .await;
            tokio::time::sleep(delay).await;
            ctx.attempt += 1;
        }
    }

    async fn validate_only(
        &self,
        run_id: &str,
        plan: &[&PhaseDefinition],
        options: &RunOptions,
    ) -> Result<RunOutcome, ExecutorError> {
        let checkpoint = new_checkpoint(run_id, &options.environment, plan);
        self.emit(ExecutorEvent::RunStarted {
            run_id: run_id.to_string(),
            mode: RunMode::ValidateOnly,
            phases: plan.iter().map(|p| p.name.clone()).collect(),
        })
        .await;

        let mut cancelled = false;
        let mut validation = Vec::new();
        for phase in plan {
            if options.cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            let ctx = OperationContext {
                run_id: run_id.to_string(),
                environment: options.environment.clone(),
                phase: phase.name.clone(),
                attempt: 1,
                prior_results: Default::default(),
            };
            let limit = phase.timeout.unwrap_or(self.config.phase_timeout);
            let result = match tokio::time::timeout(limit, phase.operation.validate(&ctx)).await {
                Ok(result) => result,
                Err(_) => Err(OperationError::timeout(limit)),
            };
            let finding = ValidationFinding {
                phase: phase.name.clone(),
                passed: result.is_ok(),
                error: result.err().map(|e| e.to_string()),
            };
            match &finding.error {
                None => info!(run_id, phase = %phase.name, "preconditions satisfied"),
                Some(error) => warn!(run_id, phase = %phase.name, error = %error, "precondition check failed"),
            }
            self.emit(ExecutorEvent::PhaseValidated {
                phase: finding.phase.clone(),
                passed: finding.passed,
                error: finding.error.clone(),
            })
            .await;
            validation.push(finding);
        }

        let status = checkpoint.status();
        self.emit(ExecutorEvent::RunFinished {
            run_id: run_id.to_string(),
            status,
            cancelled,
        })
        .await;
        Ok(RunOutcome {
            run_id: run_id.to_string(),
            mode: RunMode::ValidateOnly,
            status,
            cancelled,
            checkpoint,
            executed: Vec::new(),
            validation,
        })
    }

    /// Advance the revision, stamp the writer and save.
    fn persist(
        &self,
        store: &dyn CheckpointStore,
        checkpoint: &mut Checkpoint,
    ) -> Result<(), CheckpointError> {
        checkpoint.revision += 1;
        checkpoint.updated_at = Utc::now();
        checkpoint.writer = Some(self.writer.clone());
        store.save(checkpoint).inspect_err(|err| {
            warn!(run_id = %checkpoint.run_id, revision = checkpoint.revision, error = %err, "checkpoint save failed");
        })
    }

    async fn emit(&self, event: ExecutorEvent) {
        if let Some(ref tx) = self.event_tx {
            tx.send(event).await.ok();
        }
    }
}

async fn call_with_timeout(
    operation: &dyn Operation,
    ctx: &OperationContext,
    limit: Duration,
) -> Result<Metadata, OperationError> {
    match tokio::time::timeout(limit, operation.execute(ctx)).await {
        Ok(result) => result,
        Err(_) => Err(OperationError::timeout(limit)),
    }
}

fn new_checkpoint(run_id: &str, environment: &str, plan: &[&PhaseDefinition]) -> Checkpoint {
    Checkpoint::new(
        run_id,
        environment,
        plan.iter().map(|p| (p.name.as_str(), p.required)),
    )
}

/// Prepare a stored run for another walk: add records for phases it has not
/// seen, refresh `required` flags and clear the end marker.
fn reopen(checkpoint: &mut Checkpoint, plan: &[&PhaseDefinition]) {
    for phase in plan {
        checkpoint
            .phases
            .entry(phase.name.clone())
            .and_modify(|record| record.required = phase.required)
            .or_insert_with(|| PhaseRecord::new(phase.required));
        if !checkpoint.order.contains(&phase.name) {
            checkpoint.order.push(phase.name.clone());
        }
    }
    checkpoint.ended_at = None;
    checkpoint.cancelled = false;
}

fn record_mut<'a>(checkpoint: &'a mut Checkpoint, name: &str) -> &'a mut PhaseRecord {
    checkpoint
        .phases
        .entry(name.to_string())
        .or_insert_with(PhaseRecord::default)
}

/// First dependency that does not let `phase` start.
fn unmet_dependency(checkpoint: &Checkpoint, phase: &PhaseDefinition) -> Option<String> {
    phase
        .depends_on
        .iter()
        .find(|dep| {
            !checkpoint
                .phase(dep)
                .is_some_and(PhaseRecord::satisfies_dependents)
        })
        .cloned()
}

/// Mark every transitive dependent of `failed` in `plan` as blocked.
fn block_dependents(
    checkpoint: &mut Checkpoint,
    plan: &[&PhaseDefinition],
    failed: &str,
) -> Vec<String> {
    let now = Utc::now();
    let mut tainted: HashSet<&str> = HashSet::from([failed]);
    let mut blocked = Vec::new();
    for phase in plan {
        if !phase.depends_on.iter().any(|d| tainted.contains(d.as_str())) {
            continue;
        }
        tainted.insert(phase.name.as_str());
        let record = record_mut(checkpoint, &phase.name);
        if record.is_done() {
            continue;
        }
        record.skip(
            SkipReason::Blocked {
                by: failed.to_string(),
            },
            now,
        );
        blocked.push(phase.name.clone());
    }
    blocked
}
