//! Resource governor (§4.6): a coarse in-flight-LLM-call counter plus
//! per-file write locks, one `locks/{hash(path)}.lock` per contended path.
//! The lock file itself reuses `lock::FileLock`'s acquire/release/Drop
//! discipline; this module adds the `{path, worker_id}` payload shape and
//! the cross-worker conflict scan the coordinator surfaces to the UI.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::lock::FileLock;
use crate::types::{ConflictType, FileConflict};

/// Throttles concurrent model calls under a configured ceiling. Workers
/// consult `try_acquire`/`release` before/after spawning a generation.
pub struct LlmSlotGovernor {
    ceiling: usize,
    in_flight: Mutex<usize>,
}

impl LlmSlotGovernor {
    pub fn new(ceiling: usize) -> Self {
        Self { ceiling, in_flight: Mutex::new(0) }
    }

    pub fn try_acquire(&self) -> bool {
        let mut guard = self.in_flight.lock().expect("lock poisoned");
        if *guard < self.ceiling {
            *guard += 1;
            true
        } else {
            false
        }
    }

    pub fn release(&self) {
        let mut guard = self.in_flight.lock().expect("lock poisoned");
        *guard = guard.saturating_sub(1);
    }

    pub fn in_flight(&self) -> usize {
        *self.in_flight.lock().expect("lock poisoned")
    }
}

/// Derives a recommended worker count from available system resources and
/// the LLM ceiling: never more workers than there are LLM slots to serve
/// them, and never more than roughly one worker per two CPUs or one worker
/// per GB of available memory, whichever is scarcer.
pub fn recommend_worker_count(cpu_count: usize, available_memory_mb: u64, llm_ceiling: usize) -> usize {
    let cpu_bound = (cpu_count / 2).max(1);
    let memory_bound = (available_memory_mb / 1024).max(1) as usize;
    cpu_bound.min(memory_bound).min(llm_ceiling.max(1)).max(1)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileLockRecord {
    pub path: String,
    pub worker_id: u32,
}

pub fn lock_file_path(locks_dir: &Path, file_path: &str) -> PathBuf {
    let mut hasher = Sha256::new();
    hasher.update(file_path.as_bytes());
    let hash = hex::encode(hasher.finalize());
    locks_dir.join(format!("{}.lock", &hash[..16]))
}

/// A held per-file write lock; releases on `Drop`. The lock file itself
/// stays in `FileLock`'s own `LockInfo` shape so stale-lock detection keeps
/// working; the `{path, worker_id}` record lives in a sibling `.meta` file
/// so conflict scanning doesn't have to parse two different shapes from
/// one path.
pub struct FileWriteLock {
    _inner: FileLock,
    meta_path: PathBuf,
}

impl Drop for FileWriteLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.meta_path);
    }
}

pub fn acquire_file_lock(locks_dir: &Path, file_path: &str, worker_id: u32, stale_timeout: Duration) -> Result<FileWriteLock> {
    let lock_path = lock_file_path(locks_dir, file_path);
    let inner = FileLock::acquire(&lock_path, &worker_id.to_string(), stale_timeout)?;
    let meta_path = lock_path.with_extension("meta");
    write_record(&meta_path, &FileLockRecord { path: file_path.to_string(), worker_id })?;
    Ok(FileWriteLock { _inner: inner, meta_path })
}

fn write_record(meta_path: &Path, record: &FileLockRecord) -> Result<()> {
    let json = serde_json::to_string(record).context("failed to serialize lock record")?;
    std::fs::write(meta_path, json).with_context(|| format!("failed to write lock record to {}", meta_path.display()))
}

/// Scans `locks_dir` for paths referenced by more than one live worker —
/// i.e. `.meta` files left by locks currently held (or stale ones never
/// cleaned up) that name overlapping paths.
pub fn detect_conflicts(locks_dir: &Path) -> Vec<FileConflict> {
    let Ok(entries) = std::fs::read_dir(locks_dir) else { return Vec::new() };

    let mut by_path: BTreeMap<String, Vec<u32>> = BTreeMap::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("meta") {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(&path) else { continue };
        let Ok(record) = serde_json::from_str::<FileLockRecord>(&content) else { continue };
        by_path.entry(record.path).or_default().push(record.worker_id);
    }

    by_path
        .into_iter()
        .filter(|(_, workers)| workers.len() > 1)
        .map(|(path, workers)| FileConflict { path, worker_a: workers[0], worker_b: workers[1], conflict_type: ConflictType::LockContention })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn llm_governor_blocks_beyond_ceiling() {
        let governor = LlmSlotGovernor::new(2);
        assert!(governor.try_acquire());
        assert!(governor.try_acquire());
        assert!(!governor.try_acquire());
        governor.release();
        assert!(governor.try_acquire());
    }

    #[test]
    fn recommend_worker_count_respects_llm_ceiling() {
        assert_eq!(recommend_worker_count(64, 65536, 2), 2);
    }

    #[test]
    fn recommend_worker_count_never_below_one() {
        assert_eq!(recommend_worker_count(1, 100, 1), 1);
    }

    #[test]
    fn single_lock_reports_no_conflict() {
        let td = tempdir().unwrap();
        std::fs::create_dir_all(td.path()).unwrap();
        let _lock = acquire_file_lock(td.path(), "src/lib.rs", 1, Duration::from_secs(60)).unwrap();
        assert!(detect_conflicts(td.path()).is_empty());
    }

    #[test]
    fn two_workers_same_path_is_a_conflict() {
        let td = tempdir().unwrap();
        write_record(&td.path().join("a.meta"), &FileLockRecord { path: "src/lib.rs".into(), worker_id: 1 }).unwrap();
        write_record(&td.path().join("b.meta"), &FileLockRecord { path: "src/lib.rs".into(), worker_id: 2 }).unwrap();
        let conflicts = detect_conflicts(td.path());
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].path, "src/lib.rs");
    }

    #[test]
    fn drop_releases_the_file_lock() {
        let td = tempdir().unwrap();
        let lock_path = lock_file_path(td.path(), "src/lib.rs");
        {
            let _lock = acquire_file_lock(td.path(), "src/lib.rs", 1, Duration::from_secs(60)).unwrap();
            assert!(lock_path.exists());
        }
        assert!(!lock_path.exists());
    }
}
