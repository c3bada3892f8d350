//! Configuration view and validation commands: `migrator config`.

use anyhow::{Context, Result};
use std::path::Path;

use migrator::config::{MIGRATE_DIR, MigrateConfig, MigrateToml};
use migrator::plan::{PhaseSpec, PhasesFile};

use super::super::{Cli, ConfigCommands};

pub fn cmd_config(project_dir: &Path, cli: &Cli, command: Option<ConfigCommands>) -> Result<u8> {
    let migrate_dir = project_dir.join(MIGRATE_DIR);
    let config_path = migrate_dir.join("migrate.toml");

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No migrate.toml found at {}; using defaults.", config_path.display());
            }
            println!();

            let config = MigrateConfig::new(project_dir.to_path_buf())?
                .with_cli_args(None, cli.checkpoint_dir.clone());
            let settings = &config.toml;
            print!(
                "{}",
                toml::to_string_pretty(settings).context("Failed to render configuration")?
            );
            println!();

            println!("Effective values (with env overrides):");
            println!("  environment = \"{}\"", config.environment());
            println!("  checkpoint dir = {}", config.checkpoint_dir().display());
            println!("  phases file = {}", config.phases_file().display());
            let retry = settings.retry_config();
            println!(
                "  retry delays = {:?} (at most {:?} waiting)",
                retry.delays().collect::<Vec<_>>(),
                retry.total_max_wait()
            );
            for name in settings.breakers.keys() {
                let breaker = settings.breaker_config(name);
                println!(
                    "  breaker \"{}\" = {} failures / {}s recovery",
                    name,
                    breaker.failure_threshold,
                    breaker.recovery_timeout.as_secs()
                );
            }
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let config = MigrateConfig::new(project_dir.to_path_buf())?
                .with_cli_args(None, cli.checkpoint_dir.clone());
            let mut warnings = config.validate();

            let phases_path = config.phases_file();
            if phases_path.exists() {
                let phases = PhasesFile::load(&phases_path)?;
                match phases.to_registry(&config.project_dir, &config.toml.run.transient_exit_codes) {
                    Ok(registry) => {
                        if let Err(e) = registry.execution_order() {
                            warnings.push(format!("phases.json: {e}"));
                        }
                    }
                    Err(e) => warnings.push(format!("phases.json: {e}")),
                }
            } else {
                warnings.push(format!("No phases.json found at {}", phases_path.display()));
            }

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in &warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
            return Ok(if warnings.is_empty() { 0 } else { 1 });
        }
        Some(ConfigCommands::Init) => {
            if !migrate_dir.exists() {
                std::fs::create_dir_all(&migrate_dir)
                    .with_context(|| format!("Failed to create {}", migrate_dir.display()))?;
            }

            if config_path.exists() {
                println!("migrate.toml already exists at {}", config_path.display());
            } else {
                MigrateToml::default().save(&config_path)?;
                println!("Created migrate.toml at {}", config_path.display());
            }

            let phases_path = migrate_dir.join("phases.json");
            if phases_path.exists() {
                println!("phases.json already exists at {}", phases_path.display());
            } else {
                example_plan().save(&phases_path)?;
                println!("Created example phases.json at {}", phases_path.display());
            }

            println!();
            println!("You can now customize:");
            println!("  - [run] environment, phase_timeout_secs, transient_exit_codes");
            println!("  - [breaker] and [breakers.\"name\"] failure thresholds");
            println!("  - [retry] backoff settings");
            println!("  - phases.json with your migration phases");
            println!();
        }
    }

    Ok(0)
}

fn example_plan() -> PhasesFile {
    let mut infra = PhaseSpec::new("infra", "echo '{\"provisioned\": true}'");
    infra.depends_on = vec!["init".to_string()];
    infra.breaker = Some("cloud-api".to_string());

    let mut services = PhaseSpec::new("services", "echo deploying services");
    services.depends_on = vec!["infra".to_string()];

    let mut validate = PhaseSpec::new("validate", "echo validating");
    validate.depends_on = vec!["services".to_string()];

    PhasesFile {
        phases: vec![
            PhaseSpec::new("init", "echo initializing"),
            infra,
            services,
            validate,
        ],
    }
}
