//! Detection of two processes writing the same run.
//!
//! The detector remembers the last checkpoint it saw for a run and compares
//! each new one against it. Flags are raised when:
//! - the revision went backwards
//! - the revision is unchanged but the writer is not
//! - a different writer instance saved within the conflict window of the
//!   previous save, while the previous writer had not finished the run

use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

use crate::checkpoint::Checkpoint;

#[derive(Debug, Clone)]
struct Observation {
    revision: u64,
    writer: Option<Uuid>,
    updated_at: DateTime<Utc>,
    finished: bool,
}

impl Observation {
    fn of(checkpoint: &Checkpoint) -> Self {
        Self {
            revision: checkpoint.revision,
            writer: checkpoint.writer.as_ref().map(|w| w.instance),
            updated_at: checkpoint.updated_at,
            finished: checkpoint.is_finished(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConflictDetector {
    window: Duration,
    last: Option<Observation>,
}

impl ConflictDetector {
    pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

    pub fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    /// Compare `checkpoint` with the previous observation and remember it.
    /// Returns a description of the conflict, if any.
    pub fn observe(&mut self, checkpoint: &Checkpoint) -> Option<String> {
        let current = Observation::of(checkpoint);
        let conflict = self
            .last
            .as_ref()
            .and_then(|last| self.compare(last, &current));
        self.last = Some(current);
        conflict
    }

    fn compare(&self, last: &Observation, current: &Observation) -> Option<String> {
        if current.revision < last.revision {
            return Some(format!(
                "revision went backwards from {} to {}",
                last.revision, current.revision
            ));
        }

        let (Some(previous_writer), Some(writer)) = (last.writer, current.writer) else {
            return None;
        };
        if previous_writer == writer {
            return None;
        }

        if current.revision == last.revision {
            return Some(format!(
                "revision {} was written by two writers ({previous_writer} and {writer})",
                current.revision
            ));
        }

        let gap = (current.updated_at - last.updated_at)
            .abs()
            .to_std()
            .unwrap_or(Duration::MAX);
        if !last.finished && gap <= self.window {
            return Some(format!(
                "writers {previous_writer} and {writer} both saved within {}s",
                gap.as_secs()
            ));
        }
        None
    }
}

impl Default for ConflictDetector {
    fn default() -> Self {
        Self::new(Self::DEFAULT_WINDOW)
    }
}
