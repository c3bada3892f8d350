//! In-process checkpoint store, used for dry runs and tests.

use std::collections::BTreeMap;
use std::sync::Mutex;

use super::{Checkpoint, CheckpointStore, validate_run_id};
use crate::errors::CheckpointError;

#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    runs: Mutex<BTreeMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored runs.
    pub fn len(&self) -> usize {
        self.runs.lock().map(|runs| runs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self, run_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let runs = self.runs.lock().map_err(|_| CheckpointError::LockPoisoned)?;
        Ok(runs.get(run_id).cloned())
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        validate_run_id(&checkpoint.run_id)?;
        let mut runs = self.runs.lock().map_err(|_| CheckpointError::LockPoisoned)?;
        let current = runs
            .get(&checkpoint.run_id)
            .map(|stored| stored.revision)
            .unwrap_or(0);
        if checkpoint.revision != current + 1 {
            return Err(CheckpointError::Stale {
                run_id: checkpoint.run_id.clone(),
                attempted: checkpoint.revision,
                current,
            });
        }
        runs.insert(checkpoint.run_id.clone(), checkpoint.clone());
        Ok(())
    }

    fn list_runs(&self) -> Result<Vec<String>, CheckpointError> {
        let runs = self.runs.lock().map_err(|_| CheckpointError::LockPoisoned)?;
        Ok(runs.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};

    fn checkpoint(revision: u64) -> Checkpoint {
        let mut cp = Checkpoint::new("run-1", "test", [("init", true)]);
        cp.revision = revision;
        cp
    }

    #[test]
    fn test_revision_check() {
        let store = MemoryCheckpointStore::new();
        assert!(store.is_empty());
        store.save(&checkpoint(1)).unwrap();
        assert!(store.save(&checkpoint(1)).is_err());
        store.save(&checkpoint(2)).unwrap();
        assert_eq!(store.load("run-1").unwrap().unwrap().revision, 2);
        assert_eq!(store.list_runs().unwrap(), vec!["run-1"]);
    }

    #[test]
    fn test_concurrent_saves_have_one_winner() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let barrier = Arc::new(Barrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    store.save(&checkpoint(1)).is_ok()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
