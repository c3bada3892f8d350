//! Integration tests for the migrator CLI
//!
//! These drive the binary against temporary projects whose phases are small
//! shell commands.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use serde_json::Value;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// Helper to create a migrator Command isolated from the caller's environment
fn migrator(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("migrator");
    cmd.current_dir(dir.path())
        .env_remove("MIGRATOR_ENVIRONMENT")
        .env_remove("MIGRATOR_CHECKPOINT_DIR")
        .env_remove("MIGRATOR_FAILURE_THRESHOLD")
        .env_remove("MIGRATOR_RECOVERY_TIMEOUT_SECS")
        .env_remove("MIGRATOR_LOG");
    cmd
}

fn create_temp_project() -> TempDir {
    TempDir::new().unwrap()
}

/// Write `.migrate/phases.json` and a migrate.toml with fast retries.
fn write_plan(dir: &TempDir, phases: Value) {
    let migrate_dir = dir.path().join(".migrate");
    fs::create_dir_all(&migrate_dir).unwrap();
    fs::write(
        migrate_dir.join("phases.json"),
        serde_json::to_string_pretty(&phases).unwrap(),
    )
    .unwrap();
    fs::write(
        migrate_dir.join("migrate.toml"),
        "[retry]\nmax_retries = 2\ninitial_delay_ms = 10\nmax_delay_ms = 50\n",
    )
    .unwrap();
}

fn status_json(dir: &TempDir, run_id: &str) -> Value {
    let output = migrator(dir)
        .args(["status", run_id, "--json"])
        .output()
        .unwrap();
    serde_json::from_slice(&output.stdout).unwrap()
}

fn phase_row<'a>(report: &'a Value, name: &str) -> &'a Value {
    report["phases"]
        .as_array()
        .unwrap()
        .iter()
        .find(|row| row["name"] == name)
        .unwrap()
}

fn line_count(path: &Path) -> usize {
    fs::read_to_string(path)
        .map(|s| s.lines().count())
        .unwrap_or(0)
}

fn three_phase_plan() -> Value {
    serde_json::json!({
        "phases": [
            { "name": "init", "command": "echo init >> init.log" },
            { "name": "infra", "depends_on": ["init"], "command": "test -f fixed" },
            { "name": "services", "depends_on": ["infra"], "command": "echo services >> services.log" }
        ]
    })
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        cargo_bin_cmd!("migrator").arg("--help").assert().success();
    }

    #[test]
    fn test_version() {
        cargo_bin_cmd!("migrator").arg("--version").assert().success();
    }

    #[test]
    fn test_config_init_creates_files() {
        let dir = create_temp_project();
        migrator(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created migrate.toml"));

        assert!(dir.path().join(".migrate/migrate.toml").exists());
        assert!(dir.path().join(".migrate/phases.json").exists());

        migrator(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid."));
    }

    #[test]
    fn test_config_show_uses_checkpoint_dir_flag() {
        let dir = create_temp_project();
        migrator(&dir)
            .args(["--checkpoint-dir", "state/ckpt", "config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::is_match(r"checkpoint dir = .*state/ckpt").unwrap());
    }

    #[test]
    fn test_run_without_plan_fails() {
        let dir = create_temp_project();
        migrator(&dir)
            .arg("run")
            .assert()
            .failure()
            .stderr(predicate::str::contains("No migration plan found"));
    }

    #[test]
    fn test_invalid_mode_is_rejected() {
        let dir = create_temp_project();
        migrator(&dir)
            .args(["run", "--mode", "sideways"])
            .assert()
            .failure();
    }
}

// =============================================================================
// Execution
// =============================================================================

mod execution {
    use super::*;

    #[test]
    fn test_example_plan_runs_to_completion() {
        let dir = create_temp_project();
        migrator(&dir).args(["config", "init"]).assert().success();

        migrator(&dir)
            .args(["run", "--run-id", "first", "--ui", "minimal"])
            .assert()
            .code(0)
            .stdout(predicate::str::contains("ok validate"));

        let report = status_json(&dir, "first");
        assert_eq!(report["status"], "completed");
        assert_eq!(report["phases"].as_array().unwrap().len(), 4);
        assert!(dir.path().join(".migrate/logs").exists());
    }

    #[test]
    fn test_failure_then_resume() {
        let dir = create_temp_project();
        write_plan(&dir, three_phase_plan());

        migrator(&dir)
            .args(["run", "--run-id", "r1", "--environment", "staging", "--ui", "minimal"])
            .assert()
            .code(1)
            .stderr(predicate::str::contains("Phase 'infra' failed"))
            .stderr(predicate::str::contains("--mode resume --run-id r1"));

        let report = status_json(&dir, "r1");
        assert_eq!(report["status"], "failed");
        assert_eq!(report["environment"], "staging");
        assert_eq!(phase_row(&report, "init")["status"], "completed");
        assert_eq!(phase_row(&report, "infra")["status"], "failed");
        assert_eq!(phase_row(&report, "services")["status"], "skipped");
        assert_eq!(phase_row(&report, "services")["skip_reason"]["by"], "infra");

        fs::write(dir.path().join("fixed"), "").unwrap();
        migrator(&dir)
            .args(["run", "--mode", "resume", "--run-id", "r1", "--ui", "minimal"])
            .assert()
            .code(0);

        let report = status_json(&dir, "r1");
        assert_eq!(report["status"], "completed");
        // completed phases are never re-run
        assert_eq!(line_count(&dir.path().join("init.log")), 1);
        assert_eq!(line_count(&dir.path().join("services.log")), 1);
    }

    #[test]
    fn test_resume_defaults_to_latest_run() {
        let dir = create_temp_project();
        write_plan(&dir, three_phase_plan());

        migrator(&dir)
            .args(["run", "--run-id", "r1", "--ui", "minimal"])
            .assert()
            .code(1);
        fs::write(dir.path().join("fixed"), "").unwrap();
        migrator(&dir)
            .args(["run", "--mode", "resume", "--ui", "minimal"])
            .assert()
            .code(0);

        assert_eq!(status_json(&dir, "r1")["status"], "completed");
    }

    #[test]
    fn test_resume_without_runs_fails() {
        let dir = create_temp_project();
        write_plan(&dir, three_phase_plan());
        migrator(&dir)
            .args(["run", "--mode", "resume"])
            .assert()
            .code(1)
            .stderr(predicate::str::contains("No checkpoint to resume"));
    }

    #[test]
    fn test_existing_run_id_is_rejected() {
        let dir = create_temp_project();
        fs::write(dir.path().join("fixed"), "").unwrap();
        write_plan(&dir, three_phase_plan());

        migrator(&dir)
            .args(["run", "--run-id", "r1", "--ui", "minimal"])
            .assert()
            .code(0);
        migrator(&dir)
            .args(["run", "--run-id", "r1", "--ui", "minimal"])
            .assert()
            .code(1)
            .stderr(predicate::str::contains("already has a checkpoint"));
    }

    #[test]
    fn test_transient_exit_code_is_retried() {
        let dir = create_temp_project();
        write_plan(
            &dir,
            serde_json::json!({
                "phases": [{
                    "name": "flaky",
                    "command": "if [ -f attempted ]; then echo '{\"rows\": 3}'; else touch attempted; exit 75; fi"
                }]
            }),
        );

        migrator(&dir)
            .args(["run", "--run-id", "r1", "--ui", "minimal"])
            .assert()
            .code(0);

        let report = status_json(&dir, "r1");
        assert_eq!(phase_row(&report, "flaky")["attempts"], 2);

        let checkpoint: Value = serde_json::from_str(
            &fs::read_to_string(dir.path().join(".migrate/checkpoints/r1.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(checkpoint["phases"]["flaky"]["metadata"]["rows"], 3);
    }

    #[test]
    fn test_target_phase_runs_only_its_dependencies() {
        let dir = create_temp_project();
        fs::write(dir.path().join("fixed"), "").unwrap();
        write_plan(&dir, three_phase_plan());

        migrator(&dir)
            .args(["run", "--run-id", "r1", "--phase", "infra", "--ui", "minimal"])
            .assert()
            .code(0);

        let report = status_json(&dir, "r1");
        let names: Vec<_> = report["phases"]
            .as_array()
            .unwrap()
            .iter()
            .map(|row| row["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["init", "infra"]);
        assert!(!dir.path().join("services.log").exists());
    }

    #[test]
    fn test_cycle_is_rejected_before_running() {
        let dir = create_temp_project();
        write_plan(
            &dir,
            serde_json::json!({
                "phases": [
                    { "name": "a", "depends_on": ["b"], "command": "echo a >> a.log" },
                    { "name": "b", "depends_on": ["a"], "command": "echo b >> b.log" }
                ]
            }),
        );

        migrator(&dir)
            .args(["run", "--run-id", "r1"])
            .assert()
            .code(1)
            .stderr(predicate::str::contains("Cycle detected"));
        assert!(!dir.path().join("a.log").exists());
        assert!(!dir.path().join(".migrate/checkpoints/r1.json").exists());
    }
}

// =============================================================================
// Dry Run and Validation
// =============================================================================

mod modes {
    use super::*;

    #[test]
    fn test_dry_run_writes_nothing() {
        let dir = create_temp_project();
        write_plan(&dir, three_phase_plan());

        migrator(&dir)
            .args(["run", "--mode", "dry-run", "--run-id", "r1", "--ui", "minimal"])
            .assert()
            .code(0)
            .stdout(predicate::str::contains("would execute 3 phase(s)"));

        assert!(!dir.path().join("init.log").exists());
        assert!(!dir.path().join(".migrate/checkpoints/r1.json").exists());
    }

    #[test]
    fn test_validate_reports_unmet_preconditions() {
        let dir = create_temp_project();
        write_plan(
            &dir,
            serde_json::json!({
                "phases": [
                    { "name": "init", "command": "echo init >> init.log", "validate_command": "true" },
                    { "name": "infra", "depends_on": ["init"], "command": "true", "validate_command": "test -f creds" }
                ]
            }),
        );

        migrator(&dir)
            .args(["run", "--mode", "validate", "--run-id", "r1", "--ui", "minimal"])
            .assert()
            .code(1)
            .stdout(predicate::str::contains("1 of 2 phases failed validation"));

        fs::write(dir.path().join("creds"), "").unwrap();
        migrator(&dir)
            .args(["run", "--mode", "validate", "--run-id", "r1", "--ui", "minimal"])
            .assert()
            .code(0);

        assert!(!dir.path().join("init.log").exists());
        assert!(!dir.path().join(".migrate/checkpoints/r1.json").exists());
    }
}

// =============================================================================
// Observation
// =============================================================================

mod observation {
    use super::*;

    #[test]
    fn test_status_without_runs_fails() {
        let dir = create_temp_project();
        migrator(&dir)
            .arg("status")
            .assert()
            .failure()
            .stderr(predicate::str::contains("No runs recorded"));
    }

    #[test]
    fn test_status_of_unknown_run() {
        let dir = create_temp_project();
        migrator(&dir)
            .args(["status", "nope"])
            .assert()
            .code(1)
            .stdout(predicate::str::contains("no checkpoint found"));
    }

    #[test]
    fn test_status_text_and_runs_listing() {
        let dir = create_temp_project();
        fs::write(dir.path().join("fixed"), "").unwrap();
        write_plan(&dir, three_phase_plan());
        migrator(&dir)
            .args(["run", "--run-id", "r1", "--ui", "minimal"])
            .assert()
            .code(0);

        migrator(&dir)
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("Run r1: COMPLETED"));

        let output = migrator(&dir).args(["runs", "--json"]).output().unwrap();
        let runs: Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(runs[0]["run_id"], "r1");
        assert_eq!(runs[0]["status"], "completed");
    }

    #[test]
    fn test_watch_stops_when_run_is_finished() {
        let dir = create_temp_project();
        fs::write(dir.path().join("fixed"), "").unwrap();
        write_plan(&dir, three_phase_plan());
        migrator(&dir)
            .args(["run", "--run-id", "r1", "--ui", "minimal"])
            .assert()
            .code(0);

        migrator(&dir)
            .args(["watch", "r1", "--json", "--interval", "1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"status\":\"completed\""));
    }

    #[test]
    fn test_cancel_of_unknown_run_fails() {
        let dir = create_temp_project();
        migrator(&dir)
            .args(["cancel", "nope"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("No checkpoint found"));
    }

    #[test]
    fn test_cancel_of_finished_run_is_noop() {
        let dir = create_temp_project();
        fs::write(dir.path().join("fixed"), "").unwrap();
        write_plan(&dir, three_phase_plan());
        migrator(&dir)
            .args(["run", "--run-id", "r1", "--ui", "minimal"])
            .assert()
            .code(0);

        migrator(&dir)
            .args(["cancel", "r1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already finished"));
        assert!(!dir.path().join(".migrate/checkpoints/r1.cancel").exists());
    }
}
