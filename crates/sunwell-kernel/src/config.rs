//! `.sunwell/kernel.toml` configuration, merged over built-in defaults.
//! Follows the teacher's `.shipper.toml`-loading shape (`config.rs`):
//! `#[serde(default)]` everywhere so a partial file is valid, with a
//! `load_from_workspace` entry point returning `None` when absent.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE: &str = ".sunwell/kernel.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub workers: WorkerConfig,
    pub budget: BudgetConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub contract_verifier: ContractVerifierConfig,
    pub planning: PlanningConfig,
    pub trust_level: TrustLevel,
    pub governor: GovernorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub count: usize,
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    pub rebase_strategy: RebaseStrategy,
    pub cleanup_branches: bool,
    pub parallel_failure_mode: ParallelFailureMode,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: 1,
            heartbeat_interval: Duration::from_secs(5),
            rebase_strategy: RebaseStrategy::Rebase,
            cleanup_branches: true,
            parallel_failure_mode: ParallelFailureMode::Complete,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebaseStrategy {
    #[default]
    Rebase,
    Merge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParallelFailureMode {
    #[default]
    Complete,
    Cancel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub max_tokens: u64,
    pub max_dollars: f64,
    pub warning_threshold: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self { max_tokens: 1_000_000, max_dollars: 50.0, warning_threshold: 0.8 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    #[serde(with = "humantime_serde")]
    pub open_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, open_duration: Duration::from_secs(30) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContractVerifierConfig {
    pub skip_llm: bool,
    #[serde(with = "humantime_serde")]
    pub type_check_timeout: Duration,
}

impl Default for ContractVerifierConfig {
    fn default() -> Self {
        Self { skip_llm: false, type_check_timeout: Duration::from_secs(30) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanningConfig {
    pub candidate_count: u32,
    pub refinement_rounds: u32,
}

impl Default for PlanningConfig {
    fn default() -> Self {
        Self { candidate_count: 1, refinement_rounds: 0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    /// Ceiling on in-flight model calls, consulted by `LlmSlotGovernor`.
    pub llm_ceiling: usize,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self { llm_ceiling: 4 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    #[default]
    None,
    Workspace,
    Shell,
}

impl KernelConfig {
    pub fn load_from_workspace(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from_file(&path)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: KernelConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers.count == 0 {
            bail!("workers.count must be greater than 0");
        }
        if !(0.0..=1.0).contains(&self.budget.warning_threshold) {
            bail!("budget.warning_threshold must be within [0.0, 1.0]");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        KernelConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let toml = r#"
            [workers]
            count = 4
        "#;
        let cfg: KernelConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.workers.count, 4);
        assert_eq!(cfg.budget.max_tokens, 1_000_000);
    }

    #[test]
    fn zero_workers_fails_validation() {
        let mut cfg = KernelConfig::default();
        cfg.workers.count = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn missing_config_file_yields_defaults() {
        let td = tempfile::tempdir().unwrap();
        let cfg = KernelConfig::load_from_workspace(td.path()).unwrap();
        assert_eq!(cfg.workers.count, 1);
    }
}
