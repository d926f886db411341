//! Post-task acceptance gates (§4.9): a small, ordered sequence of checks a
//! completed task's declared artifacts must clear before the graph marks it
//! done. Modeled as a trait so the built-in sequence can be extended without
//! touching the coordinator, mirroring how the teacher keeps `ReleaseStep`
//! and verification concerns behind small composable units in `plan.rs`.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::contracts::{ContractVerificationResult, ContractVerifier};
use crate::events::EventKind;
use crate::lineage::content_hash;
use crate::types::Task;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateOutcome {
    pub gate: String,
    pub passed: bool,
    pub errors: Vec<String>,
}

impl GateOutcome {
    fn pass(gate: &str) -> Self {
        Self { gate: gate.to_string(), passed: true, errors: Vec::new() }
    }

    fn fail(gate: &str, errors: Vec<String>) -> Self {
        Self { gate: gate.to_string(), passed: false, errors }
    }
}

pub trait Gate {
    fn name(&self) -> &str;
    fn check(&self, task: &Task, workspace: &Path) -> GateOutcome;
}

/// Every declared `produces` artifact must exist on disk after the task runs.
pub struct ArtifactExistsGate;

impl Gate for ArtifactExistsGate {
    fn name(&self) -> &str {
        "artifact-exists"
    }

    fn check(&self, task: &Task, workspace: &Path) -> GateOutcome {
        let missing: Vec<String> = task
            .produces
            .iter()
            .filter(|name| !workspace.join(name).exists())
            .cloned()
            .collect();
        if missing.is_empty() {
            GateOutcome::pass(self.name())
        } else {
            GateOutcome::fail(self.name(), missing.into_iter().map(|p| format!("artifact not found: {p}")).collect())
        }
    }
}

/// Checks a declared artifact's on-disk content hash against an expected
/// value, catching a task that silently wrote nothing or a stale copy.
pub struct ContentHashMatchesGate<'a> {
    pub expected: &'a std::collections::BTreeMap<String, String>,
}

impl Gate for ContentHashMatchesGate<'_> {
    fn name(&self) -> &str {
        "content-hash-matches"
    }

    fn check(&self, task: &Task, workspace: &Path) -> GateOutcome {
        let mut errors = Vec::new();
        for path in &task.produces {
            let Some(expected_hash) = self.expected.get(path) else { continue };
            match std::fs::read(workspace.join(path)) {
                Ok(content) => {
                    let actual = content_hash(&content);
                    if &actual != expected_hash {
                        errors.push(format!("{path}: content hash mismatch"));
                    }
                }
                Err(e) => errors.push(format!("{path}: failed to read ({e})")),
            }
        }
        if errors.is_empty() {
            GateOutcome::pass(self.name())
        } else {
            GateOutcome::fail(self.name(), errors)
        }
    }
}

/// Runs `ContractVerifier` when the task declares a `contract` to satisfy.
pub struct ContractSatisfiedGate<'a> {
    pub verifier: &'a ContractVerifier<'a>,
    pub contract_file: &'a Path,
    pub impl_type_name: &'a str,
}

impl Gate for ContractSatisfiedGate<'_> {
    fn name(&self) -> &str {
        "contract-satisfied"
    }

    fn check(&self, task: &Task, _workspace: &Path) -> GateOutcome {
        let Some(contract_name) = &task.contract else { return GateOutcome::pass(self.name()) };
        let Some(target_path) = &task.target_path else {
            return GateOutcome::fail(self.name(), vec!["task declares a contract but no target_path".into()]);
        };

        let result: ContractVerificationResult = match self.verifier.verify(
            Path::new(target_path),
            self.contract_file,
            contract_name,
            self.impl_type_name,
        ) {
            Ok(r) => r,
            Err(e) => return GateOutcome::fail(self.name(), vec![format!("contract verification error: {e}")]),
        };

        if result.passed() {
            GateOutcome::pass(self.name())
        } else {
            let errors = result
                .tier_results
                .iter()
                .flat_map(|t| t.mismatches.iter().map(|m| format!("{}: {}", m.method_name, m.issue)))
                .collect();
            GateOutcome::fail(self.name(), errors)
        }
    }
}

/// Runs `gates` in order against `task`, emitting start/pass/fail events and
/// stopping at the first failure (later gates assume earlier ones held).
pub fn run_gates(gates: &[&dyn Gate], task: &Task, workspace: &Path, emit: &mut impl FnMut(EventKind)) -> Vec<GateOutcome> {
    let mut outcomes = Vec::new();
    for gate in gates {
        emit(EventKind::GateStart { task_id: task.id.clone(), gate: gate.name().to_string() });
        let outcome = gate.check(task, workspace);
        if outcome.passed {
            emit(EventKind::GatePass { task_id: task.id.clone(), gate: gate.name().to_string() });
        } else {
            emit(EventKind::GateFail { task_id: task.id.clone(), gate: gate.name().to_string(), errors: outcome.errors.clone() });
            outcomes.push(outcome);
            return outcomes;
        }
        outcomes.push(outcome);
    }
    outcomes
}

pub fn all_passed(outcomes: &[GateOutcome]) -> bool {
    outcomes.iter().all(|o| o.passed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskMode;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn task_producing(name: &str) -> Task {
        let mut t = Task::new("t1", "produce a file", TaskMode::Generate);
        t.produces.insert(name.to_string());
        t
    }

    #[test]
    fn artifact_exists_gate_fails_when_file_absent() {
        let td = tempdir().unwrap();
        let task = task_producing("out.rs");
        let outcome = ArtifactExistsGate.check(&task, td.path());
        assert!(!outcome.passed);
    }

    #[test]
    fn artifact_exists_gate_passes_when_file_present() {
        let td = tempdir().unwrap();
        std::fs::write(td.path().join("out.rs"), "fn main() {}").unwrap();
        let task = task_producing("out.rs");
        let outcome = ArtifactExistsGate.check(&task, td.path());
        assert!(outcome.passed);
    }

    #[test]
    fn content_hash_gate_detects_mismatch() {
        let td = tempdir().unwrap();
        std::fs::write(td.path().join("out.rs"), "actual").unwrap();
        let mut expected = BTreeMap::new();
        expected.insert("out.rs".to_string(), content_hash(b"expected"));
        let gate = ContentHashMatchesGate { expected: &expected };
        let task = task_producing("out.rs");
        let outcome = gate.check(&task, td.path());
        assert!(!outcome.passed);
    }

    #[test]
    fn content_hash_gate_passes_on_match() {
        let td = tempdir().unwrap();
        std::fs::write(td.path().join("out.rs"), "actual").unwrap();
        let mut expected = BTreeMap::new();
        expected.insert("out.rs".to_string(), content_hash(b"actual"));
        let gate = ContentHashMatchesGate { expected: &expected };
        let task = task_producing("out.rs");
        let outcome = gate.check(&task, td.path());
        assert!(outcome.passed);
    }

    #[test]
    fn run_gates_stops_at_first_failure() {
        let td = tempdir().unwrap();
        let task = task_producing("missing.rs");
        let mut events = Vec::new();
        let outcomes = run_gates(&[&ArtifactExistsGate, &ArtifactExistsGate], &task, td.path(), &mut |k| events.push(k));
        assert_eq!(outcomes.len(), 1);
        assert!(!all_passed(&outcomes));
        assert_eq!(events.len(), 2); // gate_start + gate_fail, second gate never starts
    }

    #[test]
    fn contract_less_task_skips_contract_gate() {
        let td = tempdir().unwrap();
        let verifier = ContractVerifier::new(td.path().to_path_buf(), true, std::time::Duration::from_secs(5), &crate::contracts::NoSemanticVerifier);
        let gate = ContractSatisfiedGate { verifier: &verifier, contract_file: Path::new("contract.rs"), impl_type_name: "Impl" };
        let task = Task::new("t1", "no contract", TaskMode::Generate);
        let outcome = gate.check(&task, td.path());
        assert!(outcome.passed);
    }
}
