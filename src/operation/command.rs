//! Shell-command operations, the binding used by phases loaded from `phases.json`.
//!
//! The command runs under `sh -c` with:
//! - the [`OperationContext`] as JSON on stdin
//! - `MIGRATOR_RUN_ID`, `MIGRATOR_PHASE`, `MIGRATOR_ENVIRONMENT`, `MIGRATOR_ATTEMPT`
//!   and `MIGRATOR_PRIOR_RESULTS` (JSON) in the environment
//!
//! Exit 0 is success. The last stdout line that parses as a JSON object becomes
//! the phase metadata. Exit codes listed as transient (75, `EX_TEMPFAIL`, by
//! default) are retried; every other non-zero exit is fatal.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{Operation, OperationContext, OperationError};
use crate::phase::Metadata;

pub const DEFAULT_TRANSIENT_EXIT_CODES: &[i32] = &[75];

const OUTPUT_TAIL_CHARS: usize = 400;

#[derive(Debug, Clone)]
pub struct CommandOperation {
    command: String,
    validate_command: Option<String>,
    working_dir: PathBuf,
    transient_exit_codes: Vec<i32>,
}

impl CommandOperation {
    pub fn new(command: impl Into<String>, working_dir: impl AsRef<Path>) -> Self {
        Self {
            command: command.into(),
            validate_command: None,
            working_dir: working_dir.as_ref().to_path_buf(),
            transient_exit_codes: DEFAULT_TRANSIENT_EXIT_CODES.to_vec(),
        }
    }

    /// Command run by validate-only runs; non-zero exit means a precondition is unmet.
    pub fn with_validate_command(mut self, command: Option<String>) -> Self {
        self.validate_command = command;
        self
    }

    pub fn with_transient_exit_codes(mut self, codes: Vec<i32>) -> Self {
        self.transient_exit_codes = codes;
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    async fn run_shell(&self, command: &str, ctx: &OperationContext) -> Result<Output, OperationError> {
        let context_json = serde_json::to_string(ctx)
            .map_err(|e| OperationError::fatal(format!("failed to serialize context: {e}")))?;
        let prior_json = serde_json::to_string(&ctx.prior_results)
            .map_err(|e| OperationError::fatal(format!("failed to serialize prior results: {e}")))?;

        tracing::debug!(phase = %ctx.phase, attempt = ctx.attempt, command, "spawning phase command");

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("MIGRATOR_RUN_ID", &ctx.run_id)
            .env("MIGRATOR_PHASE", &ctx.phase)
            .env("MIGRATOR_ENVIRONMENT", &ctx.environment)
            .env("MIGRATOR_ATTEMPT", ctx.attempt.to_string())
            .env("MIGRATOR_PRIOR_RESULTS", prior_json)
            // a timed-out call drops this future; take the child down with it
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| OperationError::fatal(format!("failed to spawn `{command}`: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            // commands are free to ignore stdin
            let _ = stdin.write_all(context_json.as_bytes()).await;
        }

        child
            .wait_with_output()
            .await
            .map_err(|e| OperationError::transient(format!("failed to wait for `{command}`: {e}")))
    }

    fn classify_failure(&self, command: &str, output: &Output) -> OperationError {
        let stderr = tail(&String::from_utf8_lossy(&output.stderr));
        match output.status.code() {
            Some(code) if self.transient_exit_codes.contains(&code) => OperationError::transient(
                format!("`{command}` exited with {code}: {stderr}"),
            ),
            Some(code) => {
                OperationError::fatal(format!("`{command}` exited with {code}: {stderr}"))
            }
            None => OperationError::transient(format!("`{command}` was terminated by a signal")),
        }
    }
}

#[async_trait]
impl Operation for CommandOperation {
    async fn execute(&self, ctx: &OperationContext) -> Result<Metadata, OperationError> {
        let output = self.run_shell(&self.command, ctx).await?;
        if !output.status.success() {
            return Err(self.classify_failure(&self.command, &output));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_metadata(&stdout).unwrap_or_else(|| {
            let mut metadata = Metadata::new();
            metadata.insert("exit_code".into(), 0.into());
            let stdout_tail = tail(&stdout);
            if !stdout_tail.is_empty() {
                metadata.insert("stdout_tail".into(), stdout_tail.into());
            }
            metadata
        }))
    }

    async fn validate(&self, ctx: &OperationContext) -> Result<(), OperationError> {
        let Some(command) = self.validate_command.as_deref() else {
            return Ok(());
        };
        let output = self.run_shell(command, ctx).await?;
        if output.status.success() {
            Ok(())
        } else {
            let err = self.classify_failure(command, &output);
            Err(OperationError::new(
                err.kind,
                format!("precondition check failed: {}", err.message),
            ))
        }
    }
}

/// Last stdout line holding a JSON object, as metadata.
fn parse_metadata(stdout: &str) -> Option<Metadata> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{') && line.ends_with('}'))
        .find_map(|line| serde_json::from_str::<Metadata>(line).ok())
}

fn tail(text: &str) -> String {
    let trimmed = text.trim();
    let count = trimmed.chars().count();
    if count <= OUTPUT_TAIL_CHARS {
        trimmed.to_string()
    } else {
        trimmed.chars().skip(count - OUTPUT_TAIL_CHARS).collect()
    }
}
