//! One JSON file per run under a checkpoint directory.
//!
//! Layout:
//! - `<run_id>.json`: the checkpoint
//! - `<run_id>.lock`: advisory lock held for the read-check-write of a save
//! - `.<run_id>.json.tmp`: in-flight write, renamed over the checkpoint
//! - `<run_id>.cancel`: cancellation request for a running executor
//!
//! Saves are atomic: write the temp file, fsync it, rename, fsync the directory.
//! Readers never take the lock; they always see a complete document.

use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use super::{Checkpoint, CheckpointStore, validate_run_id};
use crate::errors::CheckpointError;

#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    /// A store rooted at `dir`. The directory is created on first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn checkpoint_path(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{run_id}.json"))
    }

    fn lock_path(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{run_id}.lock"))
    }

    fn temp_path(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!(".{run_id}.json.tmp"))
    }

    pub fn cancel_marker_path(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{run_id}.cancel"))
    }

    /// Ask the executor working on `run_id` to stop before its next phase.
    pub fn request_cancel(&self, run_id: &str) -> Result<PathBuf, CheckpointError> {
        validate_run_id(run_id)?;
        fs::create_dir_all(&self.dir).map_err(|e| CheckpointError::io(&self.dir, e))?;
        let path = self.cancel_marker_path(run_id);
        fs::write(&path, chrono::Utc::now().to_rfc3339())
            .map_err(|e| CheckpointError::io(&path, e))?;
        Ok(path)
    }

    pub fn cancel_requested(&self, run_id: &str) -> bool {
        self.cancel_marker_path(run_id).exists()
    }

    pub fn clear_cancel(&self, run_id: &str) -> Result<(), CheckpointError> {
        let path = self.cancel_marker_path(run_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CheckpointError::io(path, e)),
        }
    }

    fn read(&self, path: &Path) -> Result<Option<Checkpoint>, CheckpointError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CheckpointError::io(path, e)),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| CheckpointError::Json {
                path: path.to_path_buf(),
                source,
            })
    }

    fn write_atomic(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let path = self.checkpoint_path(&checkpoint.run_id);
        let tmp = self.temp_path(&checkpoint.run_id);

        let json = serde_json::to_vec_pretty(checkpoint).map_err(|source| CheckpointError::Json {
            path: path.clone(),
            source,
        })?;

        let mut file = File::create(&tmp).map_err(|e| CheckpointError::io(&tmp, e))?;
        file.write_all(&json)
            .and_then(|()| file.sync_all())
            .map_err(|e| CheckpointError::io(&tmp, e))?;
        drop(file);

        fs::rename(&tmp, &path).map_err(|e| CheckpointError::io(&path, e))?;
        fsync_dir(&self.dir).map_err(|e| CheckpointError::io(&self.dir, e))
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self, run_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        validate_run_id(run_id)?;
        self.read(&self.checkpoint_path(run_id))
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let run_id = checkpoint.run_id.as_str();
        validate_run_id(run_id)?;
        fs::create_dir_all(&self.dir).map_err(|e| CheckpointError::io(&self.dir, e))?;

        let lock_path = self.lock_path(run_id);
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| CheckpointError::io(&lock_path, e))?;
        FileExt::lock_exclusive(&lock).map_err(|e| CheckpointError::io(&lock_path, e))?;

        let current = self
            .read(&self.checkpoint_path(run_id))?
            .map(|stored| stored.revision)
            .unwrap_or(0);
        let result = if checkpoint.revision != current + 1 {
            Err(CheckpointError::Stale {
                run_id: run_id.to_string(),
                attempted: checkpoint.revision,
                current,
            })
        } else {
            self.write_atomic(checkpoint)
        };

        // closing the handle releases the lock as well; unlock errors are not actionable
        let _ = FileExt::unlock(&lock);
        if result.is_ok() {
            tracing::trace!(run_id, revision = checkpoint.revision, "checkpoint saved");
        }
        result
    }

    fn list_runs(&self) -> Result<Vec<String>, CheckpointError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CheckpointError::io(&self.dir, e)),
        };

        let mut runs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| CheckpointError::io(&self.dir, e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str())
                && validate_run_id(stem).is_ok()
            {
                runs.push(stem.to_string());
            }
        }
        runs.sort();
        Ok(runs)
    }
}

/// Make the rename durable: directory entries need their own fsync.
fn fsync_dir(dir: &Path) -> io::Result<()> {
    OpenOptions::new().read(true).open(dir)?.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::WriterId;
    use crate::checkpoint::tests::every_phase_status;
    use crate::phase::Metadata;
    use chrono::Utc;
    use std::sync::{Arc, Barrier};
    use tempfile::tempdir;

    fn checkpoint(run_id: &str, revision: u64) -> Checkpoint {
        let mut cp = Checkpoint::new(run_id, "test", [("init", true), ("infra", true)]);
        cp.revision = revision;
        cp
    }

    #[test]
    fn test_load_missing_returns_none() {
        let dir = tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("checkpoints"));
        assert!(store.load("nope").unwrap().is_none());
        assert!(store.list_runs().unwrap().is_empty());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());

        let mut cp = checkpoint("run-1", 1);
        let mut metadata = Metadata::new();
        metadata.insert("vpc".into(), serde_json::json!({"id": "vpc-1", "cidr": "10.0.0.0/16"}));
        cp.phases.get_mut("init").unwrap().start(Utc::now());
        cp.phases.get_mut("init").unwrap().complete(metadata, Utc::now());
        cp.writer = Some(WriterId::current());
        store.save(&cp).unwrap();

        let loaded = store.load("run-1").unwrap().unwrap();
        assert_eq!(loaded, cp);
        assert!(!dir.path().join(".run-1.json.tmp").exists());

        let mut mixed = every_phase_status("run-2");
        mixed.revision = 1;
        store.save(&mixed).unwrap();
        assert_eq!(store.load("run-2").unwrap().unwrap(), mixed);
    }

    #[test]
    fn test_first_save_must_be_revision_one() {
        let dir = tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        let err = store.save(&checkpoint("run-1", 2)).unwrap_err();
        assert!(matches!(
            err,
            CheckpointError::Stale {
                attempted: 2,
                current: 0,
                ..
            }
        ));
    }

    #[test]
    fn test_revision_must_advance_by_one() {
        let dir = tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        store.save(&checkpoint("run-1", 1)).unwrap();
        store.save(&checkpoint("run-1", 2)).unwrap();

        // replaying an old revision is stale
        let err = store.save(&checkpoint("run-1", 2)).unwrap_err();
        assert!(matches!(
            err,
            CheckpointError::Stale {
                attempted: 2,
                current: 2,
                ..
            }
        ));
        // skipping ahead is stale too
        assert!(store.save(&checkpoint("run-1", 5)).is_err());

        assert_eq!(store.load("run-1").unwrap().unwrap().revision, 2);
    }

    #[test]
    fn test_concurrent_saves_have_one_winner() {
        let dir = tempdir().unwrap();
        let store = Arc::new(FileCheckpointStore::new(dir.path()));
        store.save(&checkpoint("run-1", 1)).unwrap();

        let writers = 8;
        let barrier = Arc::new(Barrier::new(writers));
        let handles: Vec<_> = (0..writers)
            .map(|i| {
                let store = Arc::clone(&store);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let mut cp = checkpoint("run-1", 2);
                    cp.environment = format!("writer-{i}");
                    barrier.wait();
                    store.save(&cp)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);
        assert!(
            results
                .iter()
                .filter_map(|r| r.as_ref().err())
                .all(|e| matches!(e, CheckpointError::Stale { .. }))
        );
        assert_eq!(store.load("run-1").unwrap().unwrap().revision, 2);
    }

    #[test]
    fn test_list_runs_sorted_and_filtered() {
        let dir = tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        store.save(&checkpoint("b-run", 1)).unwrap();
        store.save(&checkpoint("a-run", 1)).unwrap();
        fs::write(dir.path().join("notes.txt"), "x").unwrap();
        store.request_cancel("a-run").unwrap();
        assert_eq!(store.list_runs().unwrap(), vec!["a-run", "b-run"]);
    }

    #[test]
    fn test_latest_run_by_start_time() {
        let dir = tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        let mut older = checkpoint("z-old", 1);
        older.started_at = Utc::now() - chrono::Duration::hours(1);
        store.save(&older).unwrap();
        store.save(&checkpoint("a-new", 1)).unwrap();
        assert_eq!(store.latest_run().unwrap().as_deref(), Some("a-new"));
    }

    #[test]
    fn test_malformed_checkpoint_is_json_error() {
        let dir = tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        fs::write(dir.path().join("run-1.json"), "{ not json").unwrap();
        assert!(matches!(
            store.load("run-1"),
            Err(CheckpointError::Json { .. })
        ));
    }

    #[test]
    fn test_invalid_run_id_rejected() {
        let dir = tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        assert!(matches!(
            store.load("../escape"),
            Err(CheckpointError::InvalidRunId(_))
        ));
        assert!(store.save(&checkpoint("bad/id", 1)).is_err());
    }

    #[test]
    fn test_cancel_marker_lifecycle() {
        let dir = tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("cp"));
        assert!(!store.cancel_requested("run-1"));
        store.request_cancel("run-1").unwrap();
        assert!(store.cancel_requested("run-1"));
        store.clear_cancel("run-1").unwrap();
        assert!(!store.cancel_requested("run-1"));
        // clearing twice is fine
        store.clear_cancel("run-1").unwrap();
    }
}
