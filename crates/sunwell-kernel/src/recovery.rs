//! Recovery state (§4.8): the snapshot persisted when a run cannot
//! self-heal, and the healing context rebuilt from it to prime a retry.
//! Grounded on `persist::atomic_write_json`/`load_json` for the on-disk
//! discipline (one file per `goal_hash` under `recovery/`, same
//! tmp-write/fsync/rename path every other document in the state root
//! uses) and on `state.rs`'s receipt-store shape for the list/load/delete
//! operations.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::persist::{atomic_write_json, load_json};
use crate::types::RecoveryState;

fn recovery_dir(state_root: &Path) -> PathBuf {
    state_root.join("recovery")
}

fn recovery_path(state_root: &Path, goal_hash: &str) -> PathBuf {
    recovery_dir(state_root).join(format!("{goal_hash}.json"))
}

/// Persists `state` atomically, keyed by its own `goal_hash` (§4.8).
pub fn save(state_root: &Path, state: &RecoveryState) -> Result<()> {
    atomic_write_json(&recovery_path(state_root, &state.goal_hash), state)
}

/// Persists a copy of `state` with `failed`/`error_details` cleared, for
/// callers that only want to preserve what succeeded (§4.8 "write
/// passed-only" operation) — e.g. an explicit partial-accept of a run the
/// human doesn't want to retry in full.
pub fn save_passed_only(state_root: &Path, state: &RecoveryState) -> Result<()> {
    let passed_only = RecoveryState { failed: Vec::new(), error_details: None, ..state.clone() };
    save(state_root, &passed_only)
}

/// Lists every pending recovery state under the state root, in `goal_hash`
/// order.
pub fn list_pending(state_root: &Path) -> Result<Vec<RecoveryState>> {
    let dir = recovery_dir(state_root);
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut states = Vec::new();
    for entry in fs::read_dir(&dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("json")
            && let Some(state) = load_json::<RecoveryState>(&path)?
        {
            states.push(state);
        }
    }
    states.sort_by(|a, b| a.goal_hash.cmp(&b.goal_hash));
    Ok(states)
}

/// Loads a recovery state by exact `goal_hash` or by unambiguous prefix
/// (§4.8 "load by id with prefix match"). An exact filename match always
/// wins even if other hashes share its prefix.
pub fn load(state_root: &Path, goal_hash_or_prefix: &str) -> Result<Option<RecoveryState>> {
    if let Some(exact) = load_json::<RecoveryState>(&recovery_path(state_root, goal_hash_or_prefix))? {
        return Ok(Some(exact));
    }

    let matches: Vec<RecoveryState> =
        list_pending(state_root)?.into_iter().filter(|s| s.goal_hash.starts_with(goal_hash_or_prefix)).collect();

    match matches.len() {
        0 => Ok(None),
        1 => Ok(Some(matches.into_iter().next().unwrap())),
        n => bail!("goal hash prefix {goal_hash_or_prefix} is ambiguous, matches {n} recovery states"),
    }
}

/// Deletes a resolved recovery state (successful resume). No-op if absent.
pub fn mark_resolved(state_root: &Path, goal_hash: &str) -> Result<()> {
    let path = recovery_path(state_root, goal_hash);
    if path.exists() {
        fs::remove_file(&path).with_context(|| format!("failed to delete {}", path.display()))?;
    }
    Ok(())
}

/// Deletes a recovery state unconditionally, representing an explicit
/// human abort of the run rather than a successful resume. `confirmed`
/// gates the deletion so a caller can't abort by accident from a bare
/// `load` result.
pub fn abort(state_root: &Path, goal_hash: &str, confirmed: bool) -> Result<()> {
    if !confirmed {
        bail!("abort of recovery state {goal_hash} requires explicit confirmation");
    }
    mark_resolved(state_root, goal_hash)
}

/// Rebuilds the structured retry prompt prefix from a `RecoveryState`: the
/// goal, one block per failed artifact with its last error excerpt, and an
/// optional human-supplied hint (§4.8).
pub fn build_healing_context(state: &RecoveryState, hint: Option<&str>) -> String {
    let mut out = String::new();
    out.push_str("# Resuming a previously interrupted goal\n\n");
    out.push_str(&format!("Goal: {}\n", state.goal));
    out.push_str(&format!("Failure reason: {}\n\n", state.failure_reason));

    if !state.passed.is_empty() {
        out.push_str("## Already completed (do not redo)\n");
        for path in &state.passed {
            out.push_str(&format!("- {path}\n"));
        }
        out.push('\n');
    }

    if !state.failed.is_empty() {
        out.push_str("## Failed artifacts\n");
        for failed in &state.failed {
            out.push_str(&format!("### {}\n", failed.path));
            for error in &failed.errors {
                out.push_str(&format!("- {error}\n"));
            }
        }
        out.push('\n');
    }

    if !state.waiting.is_empty() {
        out.push_str("## Still waiting on dependencies\n");
        for path in &state.waiting {
            out.push_str(&format!("- {path}\n"));
        }
        out.push('\n');
    }

    if let Some(hint) = hint {
        out.push_str(&format!("## Human hint\n{hint}\n"));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FailedArtifact;
    use tempfile::tempdir;

    fn state(goal_hash: &str) -> RecoveryState {
        RecoveryState {
            goal_hash: goal_hash.to_string(),
            goal: "add a login page".into(),
            run_id: "r1".into(),
            failure_reason: "gate failure".into(),
            passed: vec!["router.rs".into()],
            failed: vec![FailedArtifact { path: "login.rs".into(), errors: vec!["missing handler".into()] }],
            waiting: vec!["tests.rs".into()],
            error_details: None,
            summary: "1/3 artifacts failed".into(),
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let td = tempdir().unwrap();
        save(td.path(), &state("abc123")).unwrap();
        let loaded = load(td.path(), "abc123").unwrap().unwrap();
        assert_eq!(loaded.goal, "add a login page");
    }

    #[test]
    fn load_resolves_unambiguous_prefix() {
        let td = tempdir().unwrap();
        save(td.path(), &state("abc123")).unwrap();
        let loaded = load(td.path(), "abc1").unwrap().unwrap();
        assert_eq!(loaded.goal_hash, "abc123");
    }

    #[test]
    fn load_rejects_ambiguous_prefix() {
        let td = tempdir().unwrap();
        save(td.path(), &state("abc111")).unwrap();
        save(td.path(), &state("abc222")).unwrap();
        assert!(load(td.path(), "abc").unwrap_err().to_string().contains("ambiguous"));
    }

    #[test]
    fn mark_resolved_deletes_the_state() {
        let td = tempdir().unwrap();
        save(td.path(), &state("abc123")).unwrap();
        mark_resolved(td.path(), "abc123").unwrap();
        assert!(load(td.path(), "abc123").unwrap().is_none());
    }

    #[test]
    fn abort_requires_confirmation() {
        let td = tempdir().unwrap();
        save(td.path(), &state("abc123")).unwrap();
        assert!(abort(td.path(), "abc123", false).is_err());
        assert!(load(td.path(), "abc123").unwrap().is_some());
        abort(td.path(), "abc123", true).unwrap();
        assert!(load(td.path(), "abc123").unwrap().is_none());
    }

    #[test]
    fn healing_context_includes_goal_and_failed_artifact_errors() {
        let ctx = build_healing_context(&state("abc123"), Some("prefer the existing Router type"));
        assert!(ctx.contains("add a login page"));
        assert!(ctx.contains("login.rs"));
        assert!(ctx.contains("missing handler"));
        assert!(ctx.contains("prefer the existing Router type"));
    }

    #[test]
    fn list_pending_is_empty_when_no_recovery_dir_exists() {
        let td = tempdir().unwrap();
        assert!(list_pending(td.path()).unwrap().is_empty());
    }
}
