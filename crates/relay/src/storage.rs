//! Job log storage.
//!
//! Every job is one JSON snapshot under `<state_dir>/jobs/<source_tx_hash>.json`,
//! rewritten at each transition. The watcher's scan position lives next to it in
//! `<state_dir>/cursor.json`.

use std::path::{Path, PathBuf};

use alloy_primitives::B256;
use serde::{Deserialize, Serialize};
use tracing::warn;
use zkbridge_types::RelayJob;

use crate::error::Result;

/// Persisted scan position of the source watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchCursor {
    /// First source block not scanned yet.
    pub next_block: u64,
}

/// Manages the job log on disk.
#[derive(Debug, Clone)]
pub struct JobStore {
    state_dir: PathBuf,
}

impl JobStore {
    /// Open (and create if needed) a job store rooted at `state_dir`.
    pub fn open(state_dir: impl Into<PathBuf>) -> Result<Self> {
        let store = Self {
            state_dir: state_dir.into(),
        };
        std::fs::create_dir_all(store.jobs_dir())?;
        Ok(store)
    }

    /// Directory holding the job snapshots.
    pub fn jobs_dir(&self) -> PathBuf {
        self.state_dir.join("jobs")
    }

    /// Path of the snapshot for a source transaction.
    pub fn job_path(&self, source_tx_hash: &B256) -> PathBuf {
        self.jobs_dir().join(format!("{source_tx_hash}.json"))
    }

    /// Write the snapshot of a job, replacing the previous one.
    pub fn save(&self, job: &RelayJob) -> Result<()> {
        let data = serde_json::to_vec_pretty(job)?;
        write_atomic(&self.job_path(&job.source_tx_hash), &data)
    }

    /// Write the snapshot of a job unless the log already holds one for its source
    /// transaction. Returns `true` if it was written.
    pub fn insert_new(&self, job: &RelayJob) -> Result<bool> {
        if self.job_path(&job.source_tx_hash).exists() {
            return Ok(false);
        }
        self.save(job)?;
        Ok(true)
    }

    /// Load the snapshot of a job, if one exists.
    pub fn load(&self, source_tx_hash: &B256) -> Result<Option<RelayJob>> {
        let path = self.job_path(source_tx_hash);
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read(&path)?;
        Ok(Some(serde_json::from_slice(&content)?))
    }

    /// Load every job in the log, oldest first.
    ///
    /// Snapshots that fail to parse are logged and skipped.
    pub fn load_all(&self) -> Result<Vec<RelayJob>> {
        let mut jobs = Vec::new();

        for entry in std::fs::read_dir(self.jobs_dir())? {
            let path = entry?.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }

            let content = std::fs::read(&path)?;
            match serde_json::from_slice::<RelayJob>(&content) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable job snapshot"),
            }
        }

        jobs.sort_by_key(|job| (job.created_at, job.event.log_block_number, job.event.log_index));
        Ok(jobs)
    }

    /// Load the watcher cursor.
    pub fn load_cursor(&self) -> Result<Option<WatchCursor>> {
        let path = self.cursor_path();
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read(&path)?;
        Ok(Some(serde_json::from_slice(&content)?))
    }

    /// Persist the watcher cursor.
    pub fn save_cursor(&self, cursor: WatchCursor) -> Result<()> {
        let data = serde_json::to_vec(&cursor)?;
        write_atomic(&self.cursor_path(), &data)
    }

    fn cursor_path(&self) -> PathBuf {
        self.state_dir.join("cursor.json")
    }
}

/// Write through a temporary sibling and rename it over `path`.
fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use alloy_primitives::{B256, U256};
    use zkbridge_types::{Commitment, LockEvent, RelayJob, Stage};

    use super::{JobStore, WatchCursor};

    fn job(tx: u8, created_at: u64) -> RelayJob {
        RelayJob::new(
            LockEvent {
                encrypted_data: U256::from(7u64),
                block_number: 10,
                timestamp: 20,
                nonce_hash: B256::repeat_byte(0xaa),
                source_tx_hash: B256::repeat_byte(tx),
                log_block_number: 10,
                log_index: 0,
            },
            created_at,
        )
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::open(dir.path()).unwrap();

        let mut job = job(1, 100);
        store.save(&job).unwrap();
        assert_eq!(store.load(&job.source_tx_hash).unwrap(), Some(job.clone()));

        job.commitment_ready(Commitment::from_root(B256::ZERO), 101);
        store.save(&job).unwrap();
        let loaded = store.load(&job.source_tx_hash).unwrap().unwrap();
        assert_eq!(loaded.stage, Stage::CommitmentReady);

        assert_eq!(store.load(&B256::repeat_byte(9)).unwrap(), None);
    }

    #[test]
    fn test_insert_new_keeps_existing_job() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::open(dir.path()).unwrap();

        let mut existing = job(2, 100);
        existing.commitment_ready(Commitment::from_root(B256::ZERO), 101);
        store.save(&existing).unwrap();

        assert!(!store.insert_new(&job(2, 200)).unwrap());
        let loaded = store.load(&existing.source_tx_hash).unwrap().unwrap();
        assert_eq!(loaded.stage, Stage::CommitmentReady);

        assert!(store.insert_new(&job(3, 200)).unwrap());
        let loaded = store.load(&B256::repeat_byte(3)).unwrap().unwrap();
        assert_eq!(loaded.stage, Stage::Observed);
    }

    #[test]
    fn test_load_all_skips_garbage_and_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::open(dir.path()).unwrap();

        store.save(&job(2, 200)).unwrap();
        store.save(&job(1, 100)).unwrap();
        std::fs::write(store.jobs_dir().join("broken.json"), b"{not json").unwrap();
        std::fs::write(store.jobs_dir().join("x.json.tmp"), b"{}").unwrap();

        let jobs = store.load_all().unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].source_tx_hash, B256::repeat_byte(1));
        assert!(!store.jobs_dir().join(format!("{}.json.tmp", B256::repeat_byte(1))).exists());
    }

    #[test]
    fn test_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::open(dir.path()).unwrap();

        assert_eq!(store.load_cursor().unwrap(), None);
        store.save_cursor(WatchCursor { next_block: 42 }).unwrap();
        assert_eq!(store.load_cursor().unwrap(), Some(WatchCursor { next_block: 42 }));
    }
}
