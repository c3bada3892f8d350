//! Layered configuration: `.migrate/migrate.toml` → environment → CLI.
//!
//! # Configuration File Format
//!
//! ```toml
//! [run]
//! environment = "staging"
//! phase_timeout_secs = 600
//! transient_exit_codes = [75]
//!
//! [checkpoint]
//! dir = ".migrate/checkpoints"
//!
//! [breaker]
//! failure_threshold = 5
//! recovery_timeout_secs = 30
//!
//! [breakers."cloud-api"]
//! failure_threshold = 2
//!
//! [retry]
//! max_retries = 3
//! initial_delay_ms = 2000
//! max_delay_ms = 30000
//! backoff_multiplier = 2.0
//!
//! [monitor]
//! interval_secs = 5
//! conflict_window_secs = 60
//! ```
//!
//! Every field is optional. Environment overrides:
//! `MIGRATOR_ENVIRONMENT`, `MIGRATOR_CHECKPOINT_DIR`,
//! `MIGRATOR_FAILURE_THRESHOLD`, `MIGRATOR_RECOVERY_TIMEOUT_SECS`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::breaker::{BreakerConfig, BreakerRegistry};
use crate::executor::ExecutorConfig;
use crate::operation::command::DEFAULT_TRANSIENT_EXIT_CODES;
use crate::retry::RetryConfig;

/// Name of the per-project state directory.
pub const MIGRATE_DIR: &str = ".migrate";

/// `[run]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSection {
    /// Environment label recorded on new runs
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Time budget per operation call
    #[serde(default = "default_phase_timeout_secs")]
    pub phase_timeout_secs: u64,
    /// Command exit codes treated as transient failures
    #[serde(default = "default_transient_exit_codes")]
    pub transient_exit_codes: Vec<i32>,
}

fn default_environment() -> String {
    "default".to_string()
}

fn default_phase_timeout_secs() -> u64 {
    ExecutorConfig::DEFAULT_PHASE_TIMEOUT.as_secs()
}

fn default_transient_exit_codes() -> Vec<i32> {
    DEFAULT_TRANSIENT_EXIT_CODES.to_vec()
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            phase_timeout_secs: default_phase_timeout_secs(),
            transient_exit_codes: default_transient_exit_codes(),
        }
    }
}

/// `[checkpoint]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSection {
    /// Checkpoint directory, relative to the project directory unless absolute
    #[serde(default = "default_checkpoint_dir")]
    pub dir: PathBuf,
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from(MIGRATE_DIR).join("checkpoints")
}

impl Default for CheckpointSection {
    fn default() -> Self {
        Self {
            dir: default_checkpoint_dir(),
        }
    }
}

/// `[breaker]` section: defaults for every circuit breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSection {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
}

fn default_failure_threshold() -> u32 {
    BreakerConfig::DEFAULT_FAILURE_THRESHOLD
}

fn default_recovery_timeout_secs() -> u64 {
    BreakerConfig::DEFAULT_RECOVERY_TIMEOUT.as_secs()
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
        }
    }
}

impl BreakerSection {
    pub fn to_breaker_config(&self) -> BreakerConfig {
        BreakerConfig::new(
            self.failure_threshold,
            Duration::from_secs(self.recovery_timeout_secs),
        )
    }
}

/// `[breakers."name"]`: per-breaker overrides of the `[breaker]` defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BreakerOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_timeout_secs: Option<u64>,
}

/// `[retry]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_retries() -> u32 {
    RetryConfig::DEFAULT.max_retries
}

fn default_initial_delay_ms() -> u64 {
    RetryConfig::DEFAULT.initial_delay.as_millis() as u64
}

fn default_max_delay_ms() -> u64 {
    RetryConfig::DEFAULT.max_delay.as_millis() as u64
}

fn default_backoff_multiplier() -> f64 {
    RetryConfig::DEFAULT.backoff_multiplier
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

/// `[monitor]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorSection {
    /// Seconds between reports in `migrator watch`
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Saves by two writers this close together are flagged as a conflict
    #[serde(default = "default_conflict_window_secs")]
    pub conflict_window_secs: u64,
}

fn default_interval_secs() -> u64 {
    5
}

fn default_conflict_window_secs() -> u64 {
    60
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            conflict_window_secs: default_conflict_window_secs(),
        }
    }
}

/// Parsed `migrate.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MigrateToml {
    #[serde(default)]
    pub run: RunSection,
    #[serde(default)]
    pub checkpoint: CheckpointSection,
    #[serde(default)]
    pub breaker: BreakerSection,
    #[serde(default)]
    pub breakers: BTreeMap<String, BreakerOverride>,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub monitor: MonitorSection,
}

impl MigrateToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse migrate.toml")
    }

    /// Load `<migrate_dir>/migrate.toml`, or defaults if it doesn't exist.
    pub fn load_or_default(migrate_dir: &Path) -> Result<Self> {
        let config_path = migrate_dir.join("migrate.toml");
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize migrate.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `MIGRATOR_*` overrides from `lookup` (normally `std::env::var`).
    /// Unparseable values are ignored and reported as warnings.
    pub fn apply_env<F>(&mut self, lookup: F) -> Vec<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut warnings = Vec::new();
        if let Some(environment) = lookup("MIGRATOR_ENVIRONMENT").filter(|v| !v.is_empty()) {
            self.run.environment = environment;
        }
        if let Some(dir) = lookup("MIGRATOR_CHECKPOINT_DIR").filter(|v| !v.is_empty()) {
            self.checkpoint.dir = PathBuf::from(dir);
        }
        if let Some(raw) = lookup("MIGRATOR_FAILURE_THRESHOLD") {
            match raw.parse() {
                Ok(threshold) => self.breaker.failure_threshold = threshold,
                Err(_) => warnings.push(format!(
                    "Ignoring MIGRATOR_FAILURE_THRESHOLD='{raw}': not a non-negative integer"
                )),
            }
        }
        if let Some(raw) = lookup("MIGRATOR_RECOVERY_TIMEOUT_SECS") {
            match raw.parse() {
                Ok(secs) => self.breaker.recovery_timeout_secs = secs,
                Err(_) => warnings.push(format!(
                    "Ignoring MIGRATOR_RECOVERY_TIMEOUT_SECS='{raw}': not a non-negative integer"
                )),
            }
        }
        warnings
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.breaker.failure_threshold == 0 {
            warnings.push("breaker.failure_threshold is 0; it will be treated as 1".to_string());
        }
        for (name, override_cfg) in &self.breakers {
            if override_cfg.failure_threshold == Some(0) {
                warnings.push(format!(
                    "breakers.\"{name}\".failure_threshold is 0; it will be treated as 1"
                ));
            }
        }
        if self.retry.backoff_multiplier < 1.0 {
            warnings.push(format!(
                "retry.backoff_multiplier {} is below 1.0; delays will not grow",
                self.retry.backoff_multiplier
            ));
        }
        if self.retry.max_delay_ms < self.retry.initial_delay_ms {
            warnings.push(format!(
                "retry.max_delay_ms ({}) is below retry.initial_delay_ms ({})",
                self.retry.max_delay_ms, self.retry.initial_delay_ms
            ));
        }
        if self.run.phase_timeout_secs == 0 {
            warnings.push("run.phase_timeout_secs is 0; every operation will time out".to_string());
        }
        if self.monitor.interval_secs == 0 {
            warnings.push("monitor.interval_secs is 0; watch will poll continuously".to_string());
        }

        warnings
    }

    /// Effective config for the named breaker: `[breaker]` with any override applied.
    pub fn breaker_config(&self, name: &str) -> BreakerConfig {
        let mut section = self.breaker.clone();
        if let Some(override_cfg) = self.breakers.get(name) {
            if let Some(threshold) = override_cfg.failure_threshold {
                section.failure_threshold = threshold;
            }
            if let Some(secs) = override_cfg.recovery_timeout_secs {
                section.recovery_timeout_secs = secs;
            }
        }
        section.to_breaker_config()
    }

    /// Breaker registry with the configured defaults and per-name overrides.
    pub fn breaker_registry(&self) -> BreakerRegistry {
        self.breakers.keys().fold(
            BreakerRegistry::new(self.breaker.to_breaker_config()),
            |registry, name| registry.with_override(name.clone(), self.breaker_config(name)),
        )
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new(
            self.retry.max_retries,
            Duration::from_millis(self.retry.initial_delay_ms),
            Duration::from_millis(self.retry.max_delay_ms),
            self.retry.backoff_multiplier,
        )
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            retry: self.retry_config(),
            phase_timeout: Duration::from_secs(self.run.phase_timeout_secs),
        }
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor.interval_secs)
    }

    pub fn conflict_window(&self) -> Duration {
        Duration::from_secs(self.monitor.conflict_window_secs)
    }
}

/// Effective configuration for one project directory.
#[derive(Debug, Clone)]
pub struct MigrateConfig {
    pub project_dir: PathBuf,
    pub migrate_dir: PathBuf,
    /// File settings with environment overrides applied
    pub toml: MigrateToml,
    /// Warnings from environment overrides
    pub env_warnings: Vec<String>,
}

impl MigrateConfig {
    /// Load configuration for `project_dir` from the file and the process environment.
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        Self::with_env(project_dir, |key| std::env::var(key).ok())
    }

    /// Like [`MigrateConfig::new`] with an explicit environment lookup.
    pub fn with_env<F>(project_dir: PathBuf, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let migrate_dir = project_dir.join(MIGRATE_DIR);
        let mut toml = MigrateToml::load_or_default(&migrate_dir)?;
        let env_warnings = toml.apply_env(lookup);
        Ok(Self {
            project_dir,
            migrate_dir,
            toml,
            env_warnings,
        })
    }

    /// Apply CLI overrides.
    pub fn with_cli_args(mut self, environment: Option<String>, checkpoint_dir: Option<PathBuf>) -> Self {
        if let Some(environment) = environment {
            self.toml.run.environment = environment;
        }
        if let Some(dir) = checkpoint_dir {
            self.toml.checkpoint.dir = dir;
        }
        self
    }

    pub fn config_file(&self) -> PathBuf {
        self.migrate_dir.join("migrate.toml")
    }

    pub fn phases_file(&self) -> PathBuf {
        self.migrate_dir.join("phases.json")
    }

    /// Run log directory. Resolved from the project dir alone so logging can
    /// start before the configuration is loaded.
    pub fn log_dir(project_dir: &Path) -> PathBuf {
        project_dir.join(MIGRATE_DIR).join("logs")
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        if self.toml.checkpoint.dir.is_absolute() {
            self.toml.checkpoint.dir.clone()
        } else {
            self.project_dir.join(&self.toml.checkpoint.dir)
        }
    }

    pub fn environment(&self) -> &str {
        &self.toml.run.environment
    }

    /// File and environment warnings together.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = self.env_warnings.clone();
        warnings.extend(self.toml.validate());
        warnings
    }
}
