//! Read-only observation of runs.
//!
//! The monitor reads checkpoints, never logs, and never writes anything. It
//! cannot fail: missing or unreadable checkpoints and concurrent writers are
//! reported as [`Anomaly`] entries on the [`StatusReport`].

mod conflict;
mod report;

pub use conflict::ConflictDetector;
pub use report::{Anomaly, PhaseRow, StatusReport};

use chrono::{DateTime, Utc};
use futures::Stream;
use futures::stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::{Interval, MissedTickBehavior};

use crate::checkpoint::{CheckpointStore, RunStatus};

/// One line of `migrator runs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub environment: String,
    pub status: RunStatus,
    pub revision: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub cancelled: bool,
}

pub struct MigrationMonitor {
    store: Arc<dyn CheckpointStore>,
    conflict_window: Duration,
    /// Last observation per run, for `status` calls.
    detectors: Mutex<HashMap<String, ConflictDetector>>,
}

impl MigrationMonitor {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            store,
            conflict_window: ConflictDetector::DEFAULT_WINDOW,
            detectors: Mutex::new(HashMap::new()),
        }
    }

    /// How close together two different writers' saves must be to count as a conflict.
    pub fn with_conflict_window(mut self, window: Duration) -> Self {
        self.conflict_window = window;
        self
    }

    /// Current state of `run_id`.
    ///
    /// Successive calls on the same monitor compare against the previous
    /// snapshot, so conflicts show up from the second call onward.
    pub fn status(&self, run_id: &str) -> StatusReport {
        let mut detectors = self
            .detectors
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let detector = detectors
            .entry(run_id.to_string())
            .or_insert_with(|| ConflictDetector::new(self.conflict_window));
        snapshot(self.store.as_ref(), run_id, detector)
    }

    /// A report every `interval`, starting immediately. The stream never ends;
    /// drop it to stop watching. Each call starts a fresh conflict history.
    pub fn watch(&self, run_id: &str, interval: Duration) -> impl Stream<Item = StatusReport> + Send + 'static {
        let store = Arc::clone(&self.store);
        let run_id = run_id.to_string();
        let period = interval.max(Duration::from_millis(1));
        let detector = ConflictDetector::new(self.conflict_window);

        stream::unfold(
            (None::<Interval>, detector),
            move |(ticker, mut detector)| {
                let store = Arc::clone(&store);
                let run_id = run_id.clone();
                async move {
                    let mut ticker = ticker.unwrap_or_else(|| {
                        let mut ticker = tokio::time::interval(period);
                        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                        ticker
                    });
                    ticker.tick().await;
                    let report = snapshot(store.as_ref(), &run_id, &mut detector);
                    Some((report, (Some(ticker), detector)))
                }
            },
        )
    }

    /// Every stored run, most recent first. Unreadable runs are left out.
    pub fn runs(&self) -> Vec<RunSummary> {
        let run_ids = match self.store.list_runs() {
            Ok(run_ids) => run_ids,
            Err(e) => {
                tracing::warn!(error = %e, "failed to list runs");
                return Vec::new();
            }
        };
        let mut runs: Vec<RunSummary> = run_ids
            .iter()
            .filter_map(|run_id| match self.store.load(run_id) {
                Ok(Some(cp)) => Some(RunSummary {
                    run_id: cp.run_id.clone(),
                    environment: cp.environment.clone(),
                    status: cp.status(),
                    revision: cp.revision,
                    started_at: cp.started_at,
                    ended_at: cp.ended_at,
                    cancelled: cp.cancelled,
                }),
                Ok(None) => None,
                Err(e) => {
                    tracing::warn!(run_id = %run_id, error = %e, "skipping unreadable checkpoint");
                    None
                }
            })
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs
    }
}

fn snapshot(
    store: &dyn CheckpointStore,
    run_id: &str,
    detector: &mut ConflictDetector,
) -> StatusReport {
    let now = Utc::now();
    match store.load(run_id) {
        Ok(Some(checkpoint)) => {
            let mut report = StatusReport::from_checkpoint(&checkpoint, now);
            if let Some(reason) = detector.observe(&checkpoint) {
                tracing::warn!(run_id, %reason, "concurrent run conflict");
                report
                    .anomalies
                    .push(Anomaly::ConcurrentRunConflict { reason });
            }
            report
        }
        Ok(None) => StatusReport::unavailable(run_id, Anomaly::RunNotFound, now),
        Err(e) => StatusReport::unavailable(
            run_id,
            Anomaly::CheckpointUnreadable {
                error: e.to_string(),
            },
            now,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{Checkpoint, FileCheckpointStore, MemoryCheckpointStore, WriterId};
    use futures::StreamExt;
    use tempfile::tempdir;

    fn save(store: &dyn CheckpointStore, revision: u64, writer: &WriterId) -> Checkpoint {
        let mut cp = Checkpoint::new("run-1", "staging", [("init", true), ("infra", true)]);
        cp.revision = revision;
        cp.writer = Some(writer.clone());
        store.save(&cp).unwrap();
        cp
    }

    #[test]
    fn test_status_of_missing_run() {
        let monitor = MigrationMonitor::new(Arc::new(MemoryCheckpointStore::new()));
        let report = monitor.status("nope");
        assert_eq!(report.anomalies, vec![Anomaly::RunNotFound]);
        assert!(report.status.is_none());
    }

    #[test]
    fn test_status_of_unreadable_run() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("run-1.json"), "garbage").unwrap();
        let monitor = MigrationMonitor::new(Arc::new(FileCheckpointStore::new(dir.path())));
        let report = monitor.status("run-1");
        assert!(matches!(
            report.anomalies.as_slice(),
            [Anomaly::CheckpointUnreadable { .. }]
        ));
    }

    #[test]
    fn test_status_reports_phase_table() {
        let store = Arc::new(MemoryCheckpointStore::new());
        save(store.as_ref(), 1, &WriterId::current());
        let report = MigrationMonitor::new(store).status("run-1");
        assert_eq!(report.status, Some(RunStatus::InProgress));
        assert_eq!(report.phases.len(), 2);
        assert!(report.anomalies.is_empty());
    }

    #[test]
    fn test_status_flags_second_writer() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let monitor = MigrationMonitor::new(store.clone());
        save(store.as_ref(), 1, &WriterId::current());
        assert!(!monitor.status("run-1").has_conflict());

        // a different process takes over the run moments later
        save(store.as_ref(), 2, &WriterId::current());
        let report = monitor.status("run-1");
        assert!(report.has_conflict());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_emits_reports_until_dropped() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let writer = WriterId::current();
        save(store.as_ref(), 1, &writer);
        let monitor = MigrationMonitor::new(store.clone());

        let mut reports = Box::pin(monitor.watch("run-1", Duration::from_secs(5)));
        let first = reports.next().await.unwrap();
        assert_eq!(first.revision, Some(1));

        save(store.as_ref(), 2, &writer);
        let second = reports.next().await.unwrap();
        assert_eq!(second.revision, Some(2));
        assert!(!second.has_conflict());
        assert!(second.generated_at >= first.generated_at);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_detects_conflicting_writer() {
        let store = Arc::new(MemoryCheckpointStore::new());
        save(store.as_ref(), 1, &WriterId::current());
        let monitor = MigrationMonitor::new(store.clone());

        let reports: Vec<_> = {
            let stream = monitor.watch("run-1", Duration::from_secs(1));
            let mut stream = Box::pin(stream);
            let mut reports = vec![stream.next().await.unwrap()];
            save(store.as_ref(), 2, &WriterId::current());
            reports.push(stream.next().await.unwrap());
            reports
        };
        assert!(!reports[0].has_conflict());
        assert!(reports[1].has_conflict());
    }

    #[test]
    fn test_runs_most_recent_first() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let mut old = Checkpoint::new("a-old", "prod", [("init", true)]);
        old.revision = 1;
        old.started_at = Utc::now() - chrono::Duration::hours(3);
        store.save(&old).unwrap();
        save(store.as_ref(), 1, &WriterId::current());

        let runs = MigrationMonitor::new(store).runs();
        let ids: Vec<_> = runs.iter().map(|r| r.run_id.as_str()).collect();
        assert_eq!(ids, vec!["run-1", "a-old"]);
        assert_eq!(runs[1].environment, "prod");
    }
}
