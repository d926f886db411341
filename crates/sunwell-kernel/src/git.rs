//! Git subprocess plumbing for the multi-worker coordinator (§4.5, §1B).
//!
//! Generalized from the teacher's `git.rs` cleanliness-check style: shell out
//! to the `git` binary (never `git2`), resolve the binary through an
//! env-var override for hermetic testing, and surface failures as `anyhow`
//! errors carrying `git`'s own stderr.

use std::env;
use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};

fn git_program() -> String {
    env::var("SUNWELL_GIT_BIN").unwrap_or_else(|_| "git".to_string())
}

fn run(repo: &Path, args: &[&str]) -> Result<String> {
    let out = Command::new(git_program())
        .args(args)
        .current_dir(repo)
        .output()
        .with_context(|| format!("failed to execute git {}", args.join(" ")))?;

    if !out.status.success() {
        bail!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&out.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
}

pub fn get_current_branch(repo: &Path) -> Result<String> {
    run(repo, &["rev-parse", "--abbrev-ref", "HEAD"])
}

pub fn is_working_dir_clean(repo: &Path) -> Result<bool> {
    Ok(run(repo, &["status", "--porcelain"])?.is_empty())
}

pub fn checkout_branch(repo: &Path, branch: &str, create_if_absent: bool) -> Result<()> {
    let exists = run(repo, &["branch", "--list", branch])?.contains(branch);
    if exists {
        run(repo, &["checkout", branch])?;
    } else if create_if_absent {
        run(repo, &["checkout", "-b", branch])?;
    } else {
        bail!("branch {branch} does not exist and create_if_absent is false");
    }
    Ok(())
}

pub fn rebase_branch(repo: &Path, onto: &str) -> Result<()> {
    run(repo, &["rebase", onto]).map(|_| ())
}

pub fn abort_rebase(repo: &Path) -> Result<()> {
    let _ = run(repo, &["rebase", "--abort"]);
    Ok(())
}

pub fn merge_ff_only(repo: &Path, branch: &str) -> Result<()> {
    run(repo, &["merge", "--ff-only", branch]).map(|_| ())
}

pub fn delete_branch(repo: &Path, branch: &str, force: bool) -> Result<()> {
    let flag = if force { "-D" } else { "-d" };
    run(repo, &["branch", flag, branch]).map(|_| ())
}

/// `None` if the branch carries no commits ahead of `base` (nothing to merge).
pub fn branch_first_commit_time(repo: &Path, branch: &str, base: &str) -> Result<Option<DateTime<Utc>>> {
    let out = run(
        repo,
        &["log", &format!("{base}..{branch}"), "--reverse", "--format=%aI", "-1"],
    )?;
    if out.is_empty() {
        return Ok(None);
    }
    let ts = DateTime::parse_from_rfc3339(&out)
        .with_context(|| format!("failed to parse commit timestamp {out}"))?
        .with_timezone(&Utc);
    Ok(Some(ts))
}

pub fn branch_has_commits_ahead(repo: &Path, branch: &str, base: &str) -> Result<bool> {
    Ok(branch_first_commit_time(repo, branch, base)?.is_some())
}
