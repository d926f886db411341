//! RAII file locks. Generalized from the teacher's `lock.rs`: the same
//! acquire/stale-detection/drop-release shape, parameterized over an
//! arbitrary lock path and an owner id, so it serves both the backlog's
//! single exclusive-access channel (§4.5) and per-file write locks (§4.6).

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub owner: String,
    pub pid: u32,
    pub hostname: String,
    pub acquired_at: DateTime<Utc>,
}

/// A held lock. Releases on `Drop` as a best-effort safety net; callers
/// should still call `release()` explicitly at the natural release point.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    released: bool,
}

impl FileLock {
    /// Acquire the lock at `path`, failing if one is already held and not stale.
    pub fn acquire(path: &Path, owner: &str, stale_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
        }

        if path.exists() {
            match read_lock_info(path) {
                Ok(info) => {
                    let age = Utc::now() - info.acquired_at;
                    if age.num_seconds().unsigned_abs() > stale_timeout.as_secs() {
                        fs::remove_file(path).with_context(|| format!("failed to remove stale lock {}", path.display()))?;
                    } else {
                        bail!(
                            "lock {} already held by {} (pid {}) since {}",
                            path.display(),
                            info.owner,
                            info.pid,
                            info.acquired_at
                        );
                    }
                }
                Err(_) => {
                    fs::remove_file(path).with_context(|| format!("failed to remove corrupt lock {}", path.display()))?;
                }
            }
        }

        let info = LockInfo {
            owner: owner.to_string(),
            pid: std::process::id(),
            hostname: gethostname::gethostname().to_string_lossy().to_string(),
            acquired_at: Utc::now(),
        };
        write_lock_info(path, &info)?;

        Ok(Self { path: path.to_path_buf(), released: false })
    }

    pub fn release(&mut self) -> Result<()> {
        if !self.released && self.path.exists() {
            fs::remove_file(&self.path).with_context(|| format!("failed to release lock {}", self.path.display()))?;
        }
        self.released = true;
        Ok(())
    }

    pub fn is_held(path: &Path) -> bool {
        path.exists()
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

fn write_lock_info(path: &Path, info: &LockInfo) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let json = serde_json::to_string_pretty(info).context("failed to serialize lock info")?;
    {
        let mut f = File::create(&tmp).with_context(|| format!("failed to create {}", tmp.display()))?;
        f.write_all(json.as_bytes())
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        f.sync_all().ok();
    }
    fs::rename(&tmp, path).with_context(|| format!("failed to rename lock into place at {}", path.display()))?;
    Ok(())
}

pub fn read_lock_info(path: &Path) -> Result<LockInfo> {
    let content = fs::read_to_string(path).with_context(|| format!("failed to read lock {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("failed to parse lock {}", path.display()))
}
