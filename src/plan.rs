//! The `phases.json` migration plan and its conversion into a [`PhaseRegistry`].
//!
//! ```json
//! {
//!   "phases": [
//!     { "name": "init", "command": "./scripts/init.sh" },
//!     {
//!       "name": "infra",
//!       "depends_on": ["init"],
//!       "command": "terraform apply -auto-approve",
//!       "validate_command": "terraform plan -detailed-exitcode",
//!       "breaker": "cloud-api",
//!       "timeout_secs": 1800
//!     },
//!     { "name": "smoke", "depends_on": ["infra"], "command": "./smoke.sh", "required": false }
//!   ]
//! }
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::dag::{PhaseDefinition, PhaseRegistry};
use crate::errors::RegistryError;
use crate::operation::command::CommandOperation;

/// One phase as written in `phases.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Shell command run under `sh -c`
    pub command: String,
    /// Precondition check used by validate-only runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validate_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breaker: Option<String>,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

impl PhaseSpec {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            depends_on: Vec::new(),
            command: command.into(),
            validate_command: None,
            timeout_secs: None,
            breaker: None,
            required: true,
        }
    }

    fn to_definition(&self, working_dir: &Path, transient_exit_codes: &[i32]) -> PhaseDefinition {
        let operation = CommandOperation::new(&self.command, working_dir)
            .with_validate_command(self.validate_command.clone())
            .with_transient_exit_codes(transient_exit_codes.to_vec());
        let mut definition =
            PhaseDefinition::new(&self.name, &self.depends_on, Arc::new(operation));
        if let Some(breaker) = &self.breaker {
            definition = definition.with_breaker(breaker);
        }
        if let Some(secs) = self.timeout_secs {
            definition = definition.with_timeout(Duration::from_secs(secs));
        }
        if !self.required {
            definition = definition.optional();
        }
        definition
    }
}

/// Container for the migration plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhasesFile {
    pub phases: Vec<PhaseSpec>,
}

impl PhasesFile {
    /// Load phases from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read phases file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse phases JSON: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let phases_file: PhasesFile = serde_json::from_str(content)?;
        Ok(phases_file)
    }

    /// Save phases to a JSON file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            serde_json::to_string_pretty(self).context("Failed to serialize phases to JSON")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write phases file: {}", path.display()))?;
        Ok(())
    }

    pub fn get_phase(&self, name: &str) -> Option<&PhaseSpec> {
        self.phases.iter().find(|p| p.name == name)
    }

    /// Register every phase as a shell-command operation run from `working_dir`.
    ///
    /// Only duplicate names are rejected here; unknown dependencies and cycles
    /// surface when the executor computes the execution order.
    pub fn to_registry(
        &self,
        working_dir: &Path,
        transient_exit_codes: &[i32],
    ) -> Result<PhaseRegistry, RegistryError> {
        let mut registry = PhaseRegistry::new();
        for spec in &self.phases {
            registry.add(spec.to_definition(working_dir, transient_exit_codes))?;
        }
        Ok(registry)
    }
}
