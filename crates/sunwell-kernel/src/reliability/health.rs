//! Pre-flight health checks (§4.7): before a run starts, confirm the
//! workspace is writable and any required tools are on `PATH`. Model
//! reachability is a host concern (the kernel has no bundled model client),
//! so the model check here is reduced to "was a non-empty model name
//! configured" — a placeholder the host can replace by constructing
//! `HealthStatus` directly. Grounded on `check_health`/`HealthStatus` as
//! re-exported from `agent/reliability/__init__.py`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Owns the pre-flight check's inputs so `ReliabilityContext` can hold one
/// alongside the breaker/budget/intervention/calibrator instead of the host
/// having to thread `workspace`/`required_tools` through on every call.
pub struct HealthChecker {
    workspace: PathBuf,
    required_tools: Vec<String>,
}

impl HealthChecker {
    pub fn new(workspace: PathBuf, required_tools: Vec<String>) -> Self {
        Self { workspace, required_tools }
    }

    pub fn run(&self) -> HealthStatus {
        let tools: Vec<&str> = self.required_tools.iter().map(String::as_str).collect();
        check_health(&self.workspace, &tools)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub failed_checks: Vec<String>,
}

impl HealthStatus {
    fn ok() -> Self {
        Self { healthy: true, failed_checks: Vec::new() }
    }
}

/// Runs the kernel's pre-flight checks: workspace writability and presence
/// of every tool named in `required_tools` on `PATH`.
pub fn check_health(workspace: &Path, required_tools: &[&str]) -> HealthStatus {
    let mut failed = Vec::new();

    if !workspace_is_writable(workspace) {
        failed.push(format!("workspace not writable: {}", workspace.display()));
    }

    for tool in required_tools {
        if which(tool).is_none() {
            failed.push(format!("required tool not found on PATH: {tool}"));
        }
    }

    if failed.is_empty() {
        HealthStatus::ok()
    } else {
        HealthStatus { healthy: false, failed_checks: failed }
    }
}

fn workspace_is_writable(workspace: &Path) -> bool {
    let probe = workspace.join(".sunwell-health-probe");
    match std::fs::write(&probe, b"x") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

fn which(program: &str) -> Option<std::path::PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var).map(|dir| dir.join(program)).find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn writable_workspace_with_known_tool_is_healthy() {
        let td = tempdir().unwrap();
        let status = check_health(td.path(), &["cargo"]);
        assert!(status.healthy, "{:?}", status.failed_checks);
    }

    #[test]
    fn missing_tool_is_reported() {
        let td = tempdir().unwrap();
        let status = check_health(td.path(), &["definitely-not-a-real-tool-xyz"]);
        assert!(!status.healthy);
        assert_eq!(status.failed_checks.len(), 1);
    }

    #[test]
    fn health_checker_delegates_to_check_health() {
        let td = tempdir().unwrap();
        let checker = HealthChecker::new(td.path().to_path_buf(), vec!["cargo".to_string()]);
        assert!(checker.run().healthy);
    }

    #[test]
    fn nonexistent_workspace_is_reported() {
        let status = check_health(Path::new("/nonexistent/does-not-exist-xyz"), &[]);
        assert!(!status.healthy);
    }
}
