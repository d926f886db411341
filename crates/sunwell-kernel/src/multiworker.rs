//! Multi-worker coordination (§4.5): setup, spawn/monitor, branch merge,
//! cleanup. Grounded on `coordinator.py`'s `Coordinator` phase sequence;
//! process spawning itself is a host concern (workers are out-of-process),
//! so this module owns everything the original coordinator did *besides*
//! `multiprocessing.Process` management — heartbeat staleness, crash
//! recovery via `Backlog::unclaim_worker`, deterministic branch merging via
//! `git.rs`, and UI-state assembly.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};

use crate::git;
use crate::governor;
use crate::types::{Backlog, CoordinatorUiState, WorkerHeartbeat, WorkerStatus};

#[derive(Debug, Clone, Default)]
pub struct MergeResult {
    pub merged: Vec<String>,
    pub conflicts: Vec<String>,
}

/// One worker's contribution to the merge pass: its branch name and
/// whether it completed any goals (branches with zero completions are
/// skipped, matching the teacher's `goals_completed > 0` guard).
#[derive(Debug, Clone)]
pub struct WorkerMergeCandidate {
    pub branch: String,
    pub goals_completed: u32,
}

/// Records the working directory as clean and on a known base branch
/// before workers are allowed to spawn (§4.5 setup phase).
pub fn setup(repo: &Path) -> Result<String> {
    if !git::is_working_dir_clean(repo)? {
        bail!("working directory not clean; commit or stash changes before starting workers");
    }
    git::get_current_branch(repo)
}

/// A worker counts as stuck once its last heartbeat is older than
/// `heartbeat_interval * 12`, matching `coordinator.py`'s `stuck_threshold`.
pub fn stuck_workers(heartbeats: &[WorkerHeartbeat], heartbeat_interval: Duration, now: DateTime<Utc>) -> Vec<u32> {
    let threshold = chrono::Duration::seconds(heartbeat_interval.as_secs() as i64 * 12);
    heartbeats
        .iter()
        .filter(|h| now - h.last_heartbeat > threshold)
        .map(|h| h.worker_id)
        .collect()
}

/// Releases every goal a crashed or stuck worker held, so the backlog can
/// redistribute it (§4.5, §8 invariant 6).
pub fn recover_worker(backlog: &mut Backlog, worker_id: u32) -> Vec<String> {
    backlog.unclaim_worker(worker_id)
}

/// Merges worker branches back onto `base_branch`, in ascending order of
/// first-commit timestamp for a deterministic, reproducible merge order.
/// A rebase conflict aborts cleanly and records the branch as unmerged
/// rather than leaving the repository mid-rebase.
pub fn merge_branches(repo: &Path, base_branch: &str, candidates: &[WorkerMergeCandidate]) -> Result<MergeResult> {
    git::checkout_branch(repo, base_branch, false)?;

    let mut timed: Vec<(String, DateTime<Utc>)> = Vec::new();
    for candidate in candidates {
        if candidate.goals_completed == 0 {
            continue;
        }
        if let Some(ts) = git::branch_first_commit_time(repo, &candidate.branch, base_branch)? {
            timed.push((candidate.branch.clone(), ts));
        }
    }
    timed.sort_by_key(|(_, ts)| *ts);

    let mut merged = Vec::new();
    let mut conflicts = Vec::new();

    for (branch, _) in timed {
        git::checkout_branch(repo, &branch, false)?;
        let rebase_result = git::rebase_branch(repo, base_branch);

        match rebase_result {
            Ok(()) => {
                git::checkout_branch(repo, base_branch, false)?;
                git::merge_ff_only(repo, &branch)?;
                merged.push(branch);
            }
            Err(_) => {
                git::abort_rebase(repo)?;
                git::checkout_branch(repo, base_branch, false)?;
                conflicts.push(branch);
            }
        }
    }

    Ok(MergeResult { merged, conflicts })
}

pub fn cleanup_branches(repo: &Path, branches: &[String]) -> Result<()> {
    for branch in branches {
        git::delete_branch(repo, branch, true).with_context(|| format!("failed to delete branch {branch}"))?;
    }
    Ok(())
}

/// Assembles a UI snapshot from live worker heartbeats and the lock-file
/// conflict scan (§4.5's `get_ui_state`).
pub fn ui_state(heartbeats: Vec<WorkerHeartbeat>, locks_dir: &Path, any_running: bool) -> CoordinatorUiState {
    let workers: Vec<WorkerStatus> = heartbeats.into_iter().map(WorkerStatus::from).collect();
    let conflicts = governor::detect_conflicts(locks_dir);

    let completed: u32 = workers.iter().map(|w| w.goals_completed).sum();
    let failed: u32 = workers.iter().map(|w| w.goals_failed).sum();
    let in_progress = workers.iter().filter(|w| w.current_goal_id.is_some()).count() as u32;
    let total = completed + failed + in_progress;
    let total_progress = if total > 0 { completed as f64 / total as f64 } else { 0.0 };

    CoordinatorUiState { workers, conflicts, total_progress, is_running: any_running }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GoalStatus, Goal, WorkerState};
    use tempfile::tempdir;

    fn init_repo(root: &Path) {
        let run = |args: &[&str]| {
            std::process::Command::new("git").args(args).current_dir(root).output().unwrap();
        };
        run(&["init", "-q", "-b", "main"]);
        run(&["config", "user.email", "test@example.com"]);
        run(&["config", "user.name", "Test"]);
        std::fs::write(root.join("README.md"), "root\n").unwrap();
        run(&["add", "."]);
        run(&["commit", "-q", "-m", "initial"]);
    }

    #[test]
    fn setup_rejects_dirty_working_directory() {
        let td = tempdir().unwrap();
        init_repo(td.path());
        std::fs::write(td.path().join("scratch.txt"), "x").unwrap();
        assert!(setup(td.path()).is_err());
    }

    #[test]
    fn setup_returns_current_branch_when_clean() {
        let td = tempdir().unwrap();
        init_repo(td.path());
        assert_eq!(setup(td.path()).unwrap(), "main");
    }

    #[test]
    fn stuck_worker_detected_past_twelve_intervals() {
        let hb = WorkerHeartbeat {
            worker_id: 1,
            pid: 100,
            state: WorkerState::Running,
            branch: "sunwell/worker-1".into(),
            current_goal_id: None,
            goals_completed: 0,
            goals_failed: 0,
            last_heartbeat: Utc::now() - chrono::Duration::seconds(120),
        };
        let stuck = stuck_workers(&[hb], Duration::from_secs(5), Utc::now());
        assert_eq!(stuck, vec![1]);
    }

    #[test]
    fn fresh_heartbeat_is_not_stuck() {
        let hb = WorkerHeartbeat {
            worker_id: 1,
            pid: 100,
            state: WorkerState::Running,
            branch: "sunwell/worker-1".into(),
            current_goal_id: None,
            goals_completed: 0,
            goals_failed: 0,
            last_heartbeat: Utc::now(),
        };
        assert!(stuck_workers(&[hb], Duration::from_secs(5), Utc::now()).is_empty());
    }

    #[test]
    fn recover_worker_returns_claimed_goals_to_backlog() {
        let mut backlog = Backlog::default();
        backlog.goals.insert(
            "g1".into(),
            Goal { id: "g1".into(), title: "t".into(), description: "d".into(), claimed_by: Some(3), claimed_at: Some(Utc::now()), status: GoalStatus::Claimed },
        );
        let released = recover_worker(&mut backlog, 3);
        assert_eq!(released, vec!["g1".to_string()]);
        assert_eq!(backlog.goals["g1"].status, GoalStatus::Open);
    }

    #[test]
    fn clean_merge_of_two_non_conflicting_branches_in_commit_order() {
        let td = tempdir().unwrap();
        init_repo(td.path());

        git::checkout_branch(td.path(), "sunwell/worker-2", true).unwrap();
        std::fs::write(td.path().join("b.txt"), "b").unwrap();
        std::process::Command::new("git").args(["add", "."]).current_dir(td.path()).output().unwrap();
        std::process::Command::new("git").args(["commit", "-q", "-m", "worker 2"]).current_dir(td.path()).output().unwrap();

        git::checkout_branch(td.path(), "main", false).unwrap();
        git::checkout_branch(td.path(), "sunwell/worker-1", true).unwrap();
        std::fs::write(td.path().join("a.txt"), "a").unwrap();
        std::process::Command::new("git").args(["add", "."]).current_dir(td.path()).output().unwrap();
        std::process::Command::new("git").args(["commit", "-q", "-m", "worker 1"]).current_dir(td.path()).output().unwrap();

        git::checkout_branch(td.path(), "main", false).unwrap();

        let candidates = vec![
            WorkerMergeCandidate { branch: "sunwell/worker-1".into(), goals_completed: 1 },
            WorkerMergeCandidate { branch: "sunwell/worker-2".into(), goals_completed: 1 },
        ];
        let result = merge_branches(td.path(), "main", &candidates).unwrap();
        assert_eq!(result.merged.len(), 2);
        assert!(result.conflicts.is_empty());
        assert!(td.path().join("a.txt").exists());
        assert!(td.path().join("b.txt").exists());
    }

    #[test]
    fn branch_with_no_completions_is_skipped() {
        let td = tempdir().unwrap();
        init_repo(td.path());
        git::checkout_branch(td.path(), "sunwell/worker-1", true).unwrap();
        git::checkout_branch(td.path(), "main", false).unwrap();

        let candidates = vec![WorkerMergeCandidate { branch: "sunwell/worker-1".into(), goals_completed: 0 }];
        let result = merge_branches(td.path(), "main", &candidates).unwrap();
        assert!(result.merged.is_empty());
        assert!(result.conflicts.is_empty());
    }

    #[test]
    fn ui_state_computes_progress_from_heartbeats() {
        let heartbeats = vec![WorkerHeartbeat {
            worker_id: 1,
            pid: 1,
            state: WorkerState::Idle,
            branch: "sunwell/worker-1".into(),
            current_goal_id: None,
            goals_completed: 3,
            goals_failed: 1,
            last_heartbeat: Utc::now(),
        }];
        let td = tempdir().unwrap();
        let state = ui_state(heartbeats, td.path(), false);
        assert_eq!(state.total_progress, 0.75);
        assert!(!state.is_running);
    }
}
