//! Run progress UI.
//!
//! Renders [`ExecutorEvent`]s as they arrive. Output modes:
//! - `full`: progress bar with per-phase lines
//! - `minimal`: one plain line per finished phase
//! - `json`: one JSON event per line, for machine consumption

use console::{Term, style};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::Write;
use std::time::Duration;

use crate::checkpoint::RunStatus;
use crate::executor::ExecutorEvent;
use crate::phase::SkipReason;
use crate::ui::icons::{
    BLOCKER, CHECK, CROSS, RETRY, REVIEW, RUNNING, SKIP, SPARKLE, STOP, WARN,
};

/// Output mode for the run UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UiMode {
    #[default]
    Full,
    Minimal,
    Json,
}

impl std::str::FromStr for UiMode {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "json" => Self::Json,
            "minimal" => Self::Minimal,
            _ => Self::Full,
        })
    }
}

impl UiMode {
    pub fn parse(s: &str) -> Self {
        s.parse().unwrap_or_default()
    }
}

/// Terminal view of one run.
pub struct RunUI {
    mode: UiMode,
    bar: ProgressBar,
    term: Term,
    verbose: bool,
}

impl RunUI {
    pub fn new(mode: UiMode, verbose: bool) -> Self {
        let bar = match mode {
            UiMode::Full => {
                let bar = ProgressBar::new(0);
                if let Ok(bar_style) = ProgressStyle::default_bar()
                    .template("{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                {
                    bar.set_style(bar_style.progress_chars("█▓▒░"));
                }
                bar.set_prefix("Phases");
                bar
            }
            UiMode::Minimal | UiMode::Json => ProgressBar::hidden(),
        };
        Self {
            mode,
            bar,
            term: Term::stdout(),
            verbose,
        }
    }

    pub fn handle_event(&self, event: &ExecutorEvent) {
        match self.mode {
            UiMode::Json => self.handle_json(event),
            UiMode::Minimal => self.handle_minimal(event),
            UiMode::Full => self.handle_full(event),
        }
    }

    /// Stop the progress bar, leaving its last state on screen.
    pub fn finish(&self) {
        if !self.bar.is_finished() {
            self.bar.abandon();
        }
    }

    fn handle_json(&self, event: &ExecutorEvent) {
        if let Ok(json) = serde_json::to_string(event) {
            let _ = writeln!(&self.term, "{json}");
        }
    }

    fn handle_minimal(&self, event: &ExecutorEvent) {
        let line = match event {
            ExecutorEvent::PhaseCompleted { phase, duration_ms } => {
                format!("ok {phase} ({})", format_ms(*duration_ms))
            }
            ExecutorEvent::PhaseFailed { phase, error } => format!("failed {phase}: {error}"),
            ExecutorEvent::PhaseSkipped { phase, reason } => {
                format!("skipped {phase} ({})", describe_skip(reason))
            }
            ExecutorEvent::PhaseValidated { phase, passed, error } => match error {
                Some(error) if !passed => format!("invalid {phase}: {error}"),
                _ => format!("valid {phase}"),
            },
            ExecutorEvent::RunFinished {
                run_id,
                status,
                cancelled,
            } => format!("run {run_id}: {}", describe_status(*status, *cancelled)),
            _ => return,
        };
        let _ = writeln!(&self.term, "{line}");
    }

    fn handle_full(&self, event: &ExecutorEvent) {
        match event {
            ExecutorEvent::RunStarted {
                run_id,
                mode,
                phases,
            } => {
                self.bar.set_length(phases.len() as u64);
                self.bar.set_position(0);
                self.println(format!(
                    "{}Run {} ({mode}): {} phases",
                    SPARKLE,
                    style(run_id).bold(),
                    phases.len()
                ));
            }
            ExecutorEvent::PhaseAlreadyDone { phase } => {
                self.bar.inc(1);
                if self.verbose {
                    self.println(format!(
                        "{}{} {}",
                        CHECK,
                        phase,
                        style("(already done)").dim()
                    ));
                }
            }
            ExecutorEvent::PhaseStarted { phase } => {
                self.bar.set_message(format!("{}{}", RUNNING, style(phase).yellow()));
                self.bar.enable_steady_tick(Duration::from_millis(100));
            }
            ExecutorEvent::PhaseRetrying {
                phase,
                attempt,
                delay_ms,
                error,
            } => {
                self.println(format!(
                    "{}{} attempt {} failed, retrying in {}: {}",
                    RETRY,
                    style(phase).yellow(),
                    attempt,
                    format_ms(*delay_ms),
                    style(error).dim()
                ));
            }
            ExecutorEvent::PhaseCompleted { phase, duration_ms } => {
                self.bar.inc(1);
                self.println(format!(
                    "{}{} {}",
                    CHECK,
                    style(phase).green(),
                    style(format_ms(*duration_ms)).dim()
                ));
            }
            ExecutorEvent::PhaseFailed { phase, error } => {
                self.bar.inc(1);
                self.println(format!("{}{}: {}", CROSS, style(phase).red().bold(), error));
            }
            ExecutorEvent::PhaseSkipped { phase, reason } => {
                self.bar.inc(1);
                let icon = match reason {
                    SkipReason::Blocked { .. } => &BLOCKER,
                    SkipReason::Operator => &SKIP,
                };
                self.println(format!(
                    "{}{} {}",
                    icon,
                    style(phase).dim(),
                    style(format!("({})", describe_skip(reason))).dim()
                ));
            }
            ExecutorEvent::PhaseValidated {
                phase,
                passed,
                error,
            } => {
                self.bar.inc(1);
                if *passed {
                    self.println(format!("{}{}", REVIEW, style(phase).green()));
                } else {
                    self.println(format!(
                        "{}{}: {}",
                        WARN,
                        style(phase).red(),
                        error.as_deref().unwrap_or("precondition not met")
                    ));
                }
            }
            ExecutorEvent::RunFinished {
                status, cancelled, ..
            } => {
                self.bar.disable_steady_tick();
                let icon = match (status, cancelled) {
                    (_, true) => &STOP,
                    (RunStatus::Completed, _) => &CHECK,
                    _ => &CROSS,
                };
                self.println(format!("{}{}", icon, describe_status(*status, *cancelled)));
                self.bar.abandon_with_message(describe_status(*status, *cancelled));
            }
        }
    }

    /// Print above the bar, or straight to stdout when the bar is not drawn.
    fn println(&self, msg: impl AsRef<str>) {
        if self.bar.is_hidden() {
            let _ = writeln!(&self.term, "{}", msg.as_ref());
        } else {
            self.bar.println(msg.as_ref());
        }
    }
}

fn describe_skip(reason: &SkipReason) -> String {
    match reason {
        SkipReason::Operator => "skipped by operator".to_string(),
        SkipReason::Blocked { by } => format!("blocked by {by}"),
    }
}

fn describe_status(status: RunStatus, cancelled: bool) -> String {
    if cancelled {
        return "cancelled".to_string();
    }
    match status {
        RunStatus::Completed => "completed".to_string(),
        RunStatus::Failed => "failed".to_string(),
        RunStatus::InProgress => "incomplete".to_string(),
    }
}

fn format_ms(ms: u64) -> String {
    if ms < 1000 {
        format!("{ms}ms")
    } else {
        format!("{:.1}s", ms as f64 / 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ui_mode_parse() {
        assert_eq!(UiMode::parse("json"), UiMode::Json);
        assert_eq!(UiMode::parse("MINIMAL"), UiMode::Minimal);
        assert_eq!(UiMode::parse("anything"), UiMode::Full);
    }

    #[test]
    fn test_describe_status() {
        assert_eq!(describe_status(RunStatus::Completed, false), "completed");
        assert_eq!(describe_status(RunStatus::Completed, true), "cancelled");
        assert_eq!(describe_status(RunStatus::InProgress, false), "incomplete");
    }

    #[test]
    fn test_describe_skip() {
        assert_eq!(describe_skip(&SkipReason::Operator), "skipped by operator");
        assert_eq!(
            describe_skip(&SkipReason::Blocked { by: "infra".into() }),
            "blocked by infra"
        );
    }

    #[test]
    fn test_format_ms() {
        assert_eq!(format_ms(250), "250ms");
        assert_eq!(format_ms(1500), "1.5s");
    }

    #[test]
    fn test_handle_events_in_every_mode() {
        let events = [
            ExecutorEvent::RunStarted {
                run_id: "run-1".into(),
                mode: crate::executor::RunMode::Execute,
                phases: vec!["init".into()],
            },
            ExecutorEvent::PhaseStarted {
                phase: "init".into(),
            },
            ExecutorEvent::PhaseCompleted {
                phase: "init".into(),
                duration_ms: 12,
            },
            ExecutorEvent::RunFinished {
                run_id: "run-1".into(),
                status: RunStatus::Completed,
                cancelled: false,
            },
        ];
        for mode in [UiMode::Full, UiMode::Minimal, UiMode::Json] {
            let ui = RunUI::new(mode, true);
            for event in &events {
                ui.handle_event(event);
            }
            ui.finish();
        }
    }
}
