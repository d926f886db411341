//! Learning extraction (§4.10): turns a finished run into a `LearningBatch`
//! the host can hand to its own Memory store (out of core scope per §1).
//! Grounded on `agent/learning.py`'s per-store extraction passes, replacing
//! its embedding-similarity dedup with normalized-text equality per §4.10's
//! note that the kernel has no embedding model of its own to call.

use std::collections::BTreeSet;

use crate::task_graph::TaskGraph;
use crate::types::{LearningBatch, LearningItem, RecoveryState, TaskMode, TaskStatus};

/// Everything `extract` needs about a finished run: the graph in its
/// terminal state, the recovery state if the run ended in one, and the
/// goal id learnings should be attributed to.
pub struct ExecutionReport<'a> {
    pub goal_id: &'a str,
    pub graph: &'a TaskGraph,
    pub recovery: Option<&'a RecoveryState>,
}

impl ExecutionReport<'_> {
    fn succeeded(&self) -> bool {
        self.recovery.is_none() && self.graph.tasks().all(|t| matches!(t.status, TaskStatus::Completed | TaskStatus::Skipped))
    }
}

fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// Appends `item` unless its normalized text already appears in `into`,
/// the byte-level stand-in for the original's embedding-similarity dedup.
fn push_deduped(into: &mut Vec<LearningItem>, seen: &mut BTreeSet<String>, item: LearningItem) {
    let key = normalize(&item.text);
    if seen.insert(key) {
        into.push(item);
    }
}

/// Extracts a `LearningBatch` from a finished run, per §4.10's two-pass
/// design: a success pass deriving templates/heuristics, a failure pass
/// deriving dead-ends/constraints, and a facts pass from RESEARCH outputs
/// that runs either way.
pub fn extract(report: &ExecutionReport<'_>) -> LearningBatch {
    let mut batch = LearningBatch::default();
    let mut fact_seen = BTreeSet::new();

    for task in report.graph.tasks() {
        if task.mode == TaskMode::Research
            && task.status == TaskStatus::Completed
            && let Some(output) = &task.output
            && !output.trim().is_empty()
        {
            push_deduped(
                &mut batch.facts,
                &mut fact_seen,
                LearningItem { text: output.clone(), confidence: 0.7, source_goal_id: Some(report.goal_id.to_string()) },
            );
        }
    }

    if report.succeeded() {
        extract_success(report, &mut batch);
    } else {
        extract_failure(report, &mut batch);
    }

    batch
}

/// Success pass: a `description → produces` pair for every cleanly
/// completed task becomes a reusable template; a parallel group that hit a
/// high `parallelization_ratio` becomes a heuristic worth repeating.
fn extract_success(report: &ExecutionReport<'_>, batch: &mut LearningBatch) {
    let mut template_seen = BTreeSet::new();
    for task in report.graph.tasks() {
        if task.status != TaskStatus::Completed || task.produces.is_empty() {
            continue;
        }
        let produces: Vec<&str> = task.produces.iter().map(String::as_str).collect();
        let text = format!("\"{}\" -> produces {}", task.description.trim(), produces.join(", "));
        push_deduped(&mut batch.templates, &mut template_seen, LearningItem { text, confidence: 0.6, source_goal_id: Some(report.goal_id.to_string()) });
    }

    let ratio = report.graph.parallelization_ratio();
    if ratio >= 1.5 {
        let groups: BTreeSet<&str> =
            report.graph.tasks().filter(|t| t.status == TaskStatus::Completed).filter_map(|t| t.parallel_group.as_deref()).collect();
        if !groups.is_empty() {
            let modes: BTreeSet<String> = report
                .graph
                .tasks()
                .filter(|t| t.parallel_group.is_some())
                .map(|t| format!("{:?}", t.mode).to_lowercase())
                .collect();
            batch.heuristics.push(LearningItem {
                text: format!(
                    "parallel groups {:?} combining modes {:?} achieved parallelization ratio {:.2}",
                    groups, modes, ratio
                ),
                confidence: (ratio / (ratio + 1.0)).min(0.95),
                source_goal_id: Some(report.goal_id.to_string()),
            });
        }
    }
}

/// Failure pass: a failed task's `description` is a dead end worth not
/// retrying verbatim; its `error` becomes a constraint for the planner.
fn extract_failure(report: &ExecutionReport<'_>, batch: &mut LearningBatch) {
    let mut dead_end_seen = BTreeSet::new();
    let mut constraint_seen = BTreeSet::new();

    for task in report.graph.tasks() {
        if task.status != TaskStatus::Failed {
            continue;
        }
        push_deduped(
            &mut batch.dead_ends,
            &mut dead_end_seen,
            LearningItem { text: task.description.clone(), confidence: 0.5, source_goal_id: Some(report.goal_id.to_string()) },
        );
        if let Some(error) = &task.error
            && !error.trim().is_empty()
        {
            push_deduped(
                &mut batch.constraints,
                &mut constraint_seen,
                LearningItem { text: error.clone(), confidence: 0.6, source_goal_id: Some(report.goal_id.to_string()) },
            );
        }
    }

    if let Some(recovery) = report.recovery {
        for failed in &recovery.failed {
            for error in &failed.errors {
                push_deduped(
                    &mut batch.constraints,
                    &mut constraint_seen,
                    LearningItem { text: error.clone(), confidence: 0.6, source_goal_id: Some(report.goal_id.to_string()) },
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Effort, FailedArtifact, Task};

    fn task(id: &str, mode: TaskMode, status: TaskStatus) -> Task {
        let mut t = Task::new(id, format!("do {id}"), mode);
        t.effort = Effort::Small;
        t.status = status;
        t
    }

    #[test]
    fn successful_run_emits_templates_not_dead_ends() {
        let mut t1 = task("t1", TaskMode::Generate, TaskStatus::Completed);
        t1.produces.insert("out.rs".into());
        let graph = TaskGraph::build(vec![t1]).unwrap();
        let report = ExecutionReport { goal_id: "g1", graph: &graph, recovery: None };

        let batch = extract(&report);
        assert_eq!(batch.templates.len(), 1);
        assert!(batch.dead_ends.is_empty());
    }

    #[test]
    fn failed_run_emits_dead_ends_and_constraints() {
        let mut t1 = task("t1", TaskMode::Generate, TaskStatus::Failed);
        t1.error = Some("gate content-hash-matches failed".into());
        let graph = TaskGraph::build(vec![t1]).unwrap();
        let recovery = RecoveryState {
            goal_hash: "h1".into(),
            goal: "do the thing".into(),
            run_id: "r1".into(),
            failure_reason: "gate failure".into(),
            passed: Vec::new(),
            failed: vec![FailedArtifact { path: "out.rs".into(), errors: vec!["gate content-hash-matches failed".into()] }],
            waiting: Vec::new(),
            error_details: None,
            summary: "1 task failed".into(),
        };
        let report = ExecutionReport { goal_id: "g1", graph: &graph, recovery: Some(&recovery) };

        let batch = extract(&report);
        assert_eq!(batch.dead_ends.len(), 1);
        // the task error and the recovery-state error are the same text, deduped to one constraint
        assert_eq!(batch.constraints.len(), 1);
    }

    #[test]
    fn research_output_becomes_a_fact_regardless_of_outcome() {
        let mut t1 = task("t1", TaskMode::Research, TaskStatus::Completed);
        t1.output = Some("the codebase uses axum for HTTP".into());
        let mut t2 = task("t2", TaskMode::Generate, TaskStatus::Failed);
        t2.depends_on.insert("t1".into());
        let graph = TaskGraph::build(vec![t1, t2]).unwrap();
        let report = ExecutionReport { goal_id: "g1", graph: &graph, recovery: None };

        let batch = extract(&report);
        assert_eq!(batch.facts.len(), 1);
        assert_eq!(batch.facts[0].text, "the codebase uses axum for HTTP");
    }

    #[test]
    fn duplicate_facts_are_deduped_by_normalized_text() {
        let mut t1 = task("t1", TaskMode::Research, TaskStatus::Completed);
        t1.output = Some("Uses   Axum".into());
        let mut t2 = task("t2", TaskMode::Research, TaskStatus::Completed);
        t2.output = Some("uses axum".into());
        let graph = TaskGraph::build(vec![t1, t2]).unwrap();
        let report = ExecutionReport { goal_id: "g1", graph: &graph, recovery: None };

        let batch = extract(&report);
        assert_eq!(batch.facts.len(), 1);
    }
}
