//! Task graph construction, readiness, parallel grouping, and analytics
//! (§4.1). Construction-time validation is grounded in `plan::build_plan`'s
//! `bail!`-on-cycle style; the Kahn's-algorithm topological walk over a
//! `BTreeSet<(name, id)>` ready-queue mirrors `plan.rs`'s `topo_sort`.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use anyhow::{Result, bail};

use crate::types::{Task, TaskStatus};

#[derive(Debug, Clone)]
pub struct TaskGraph {
    tasks: BTreeMap<String, Task>,
}

impl TaskGraph {
    /// Builds a graph, rejecting it at construction per §4.1's invariants:
    /// acyclic `depends_on`, every referenced id/artifact exists, `produces`
    /// names are disjoint across tasks, and any `contract` name is declared
    /// by exactly one task.
    pub fn build(tasks: Vec<Task>) -> Result<Self> {
        let by_id: BTreeMap<String, Task> = tasks.into_iter().map(|t| (t.id.clone(), t)).collect();

        for task in by_id.values() {
            for dep in &task.depends_on {
                if !by_id.contains_key(dep) {
                    bail!("task {} depends on unknown task id {}", task.id, dep);
                }
            }
        }

        let mut produced_by: HashMap<&str, &str> = HashMap::new();
        for task in by_id.values() {
            for name in &task.produces {
                if let Some(existing) = produced_by.insert(name.as_str(), task.id.as_str()) {
                    bail!("artifact {name} produced by both {existing} and {}", task.id);
                }
            }
        }

        for task in by_id.values() {
            for name in &task.requires {
                if !produced_by.contains_key(name.as_str()) {
                    bail!("task {} requires artifact {name} that no task produces", task.id);
                }
            }
        }

        let mut contract_declarers: HashMap<&str, Vec<&str>> = HashMap::new();
        for task in by_id.values() {
            if task.is_contract {
                for name in &task.produces {
                    contract_declarers.entry(name.as_str()).or_default().push(task.id.as_str());
                }
            }
        }
        for task in by_id.values() {
            if let Some(contract) = &task.contract {
                let declarers = contract_declarers.get(contract.as_str()).map(|v| v.len()).unwrap_or(0);
                if declarers != 1 {
                    bail!(
                        "contract {contract} referenced by {} must be declared by exactly one task, found {declarers}",
                        task.id
                    );
                }
            }
        }

        let graph = Self { tasks: by_id };
        graph.check_acyclic()?;
        Ok(graph)
    }

    fn check_acyclic(&self) -> Result<()> {
        let mut indegree: BTreeMap<&str, usize> =
            self.tasks.keys().map(|id| (id.as_str(), 0)).collect();
        for task in self.tasks.values() {
            for _dep in &task.depends_on {
                *indegree.get_mut(task.id.as_str()).unwrap() += 1;
            }
        }

        let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for task in self.tasks.values() {
            for dep in &task.depends_on {
                dependents.entry(dep.as_str()).or_default().push(task.id.as_str());
            }
        }

        let mut ready: BTreeSet<&str> =
            indegree.iter().filter(|(_, d)| **d == 0).map(|(id, _)| *id).collect();
        let mut visited = 0usize;

        while let Some(id) = ready.iter().next().copied() {
            ready.remove(id);
            visited += 1;
            if let Some(deps) = dependents.get(id) {
                for dep in deps {
                    let d = indegree.get_mut(dep).unwrap();
                    *d -= 1;
                    if *d == 0 {
                        ready.insert(dep);
                    }
                }
            }
        }

        if visited != self.tasks.len() {
            bail!("dependency cycle detected in task graph");
        }
        Ok(())
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn set_status(&mut self, id: &str, status: TaskStatus) {
        if let Some(task) = self.tasks.get_mut(id) {
            task.status = status;
        }
    }

    pub fn set_output(&mut self, id: &str, output: Option<String>, error: Option<String>) {
        if let Some(task) = self.tasks.get_mut(id) {
            task.output = output;
            task.error = error;
        }
    }

    /// Tasks whose dependencies and artifact requirements are satisfied and
    /// which are still `pending`.
    pub fn ready(&self, completed_ids: &BTreeSet<String>, completed_artifacts: &BTreeSet<String>) -> Vec<&Task> {
        self.tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Pending
                    && t.depends_on.is_subset(completed_ids)
                    && t.requires.is_subset(completed_artifacts)
            })
            .collect()
    }

    /// True iff there is a non-empty pending set, nothing is ready, and
    /// nothing is currently running — the graph has stalled.
    pub fn detect_deadlock(&self, completed_ids: &BTreeSet<String>, completed_artifacts: &BTreeSet<String>) -> bool {
        let pending: Vec<&Task> = self.tasks.values().filter(|t| t.status == TaskStatus::Pending).collect();
        if pending.is_empty() {
            return false;
        }
        let running = self.tasks.values().any(|t| t.status == TaskStatus::Running);
        if running {
            return false;
        }
        self.ready(completed_ids, completed_artifacts).is_empty()
    }

    /// Longest chain of `depends_on` edges, in task count.
    pub fn critical_path_length(&self) -> usize {
        let mut memo: HashMap<&str, usize> = HashMap::new();
        fn depth<'a>(
            id: &'a str,
            tasks: &'a BTreeMap<String, Task>,
            memo: &mut HashMap<&'a str, usize>,
        ) -> usize {
            if let Some(d) = memo.get(id) {
                return *d;
            }
            let task = &tasks[id];
            let d = 1 + task
                .depends_on
                .iter()
                .map(|dep| depth(dep.as_str(), tasks, memo))
                .max()
                .unwrap_or(0);
            memo.insert(id, d);
            d
        }
        self.tasks.keys().map(|id| depth(id, &self.tasks, &mut memo)).max().unwrap_or(0)
    }

    /// Max number of tasks sharing a topological level (longest-path level
    /// assignment: a task's level is 1 + max(dependency levels)).
    pub fn max_parallel_width(&self) -> usize {
        let mut memo: HashMap<&str, usize> = HashMap::new();
        fn level<'a>(id: &'a str, tasks: &'a BTreeMap<String, Task>, memo: &mut HashMap<&'a str, usize>) -> usize {
            if let Some(l) = memo.get(id) {
                return *l;
            }
            let task = &tasks[id];
            let l = task.depends_on.iter().map(|dep| level(dep.as_str(), tasks, memo)).max().map(|m| m + 1).unwrap_or(0);
            memo.insert(id, l);
            l
        }
        let mut counts: HashMap<usize, usize> = HashMap::new();
        for id in self.tasks.keys() {
            let l = level(id, &self.tasks, &mut memo);
            *counts.entry(l).or_default() += 1;
        }
        counts.values().copied().max().unwrap_or(0)
    }

    pub fn parallelization_ratio(&self) -> f64 {
        let critical = self.critical_path_length();
        if critical == 0 {
            return 0.0;
        }
        self.tasks.len() as f64 / critical as f64
    }

    /// Pairs of ready tasks whose `modifies` sets overlap.
    pub fn conflicts(&self, ready: &[&Task]) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for i in 0..ready.len() {
            for j in (i + 1)..ready.len() {
                if !ready[i].modifies.is_disjoint(&ready[j].modifies) {
                    out.push((ready[i].id.clone(), ready[j].id.clone()));
                }
            }
        }
        out
    }

    /// Partitions ready tasks into concurrent batches: same-`parallel_group`
    /// tasks batch together iff their `modifies` sets are pairwise disjoint;
    /// on conflict the whole group splits into singletons; ungrouped tasks
    /// are always singletons.
    pub fn group_parallel<'a>(&self, ready: &[&'a Task]) -> Vec<Vec<&'a Task>> {
        let mut by_group: BTreeMap<&str, Vec<&Task>> = BTreeMap::new();
        let mut singletons: Vec<&Task> = Vec::new();

        for task in ready {
            match &task.parallel_group {
                Some(group) => by_group.entry(group.as_str()).or_default().push(task),
                None => singletons.push(task),
            }
        }

        let mut batches: Vec<Vec<&Task>> = Vec::new();
        for group in by_group.into_values() {
            if pairwise_disjoint(&group) {
                batches.push(group);
            } else {
                for task in group {
                    batches.push(vec![task]);
                }
            }
        }
        for task in singletons {
            batches.push(vec![task]);
        }
        batches
    }
}

fn pairwise_disjoint(tasks: &[&Task]) -> bool {
    for i in 0..tasks.len() {
        for j in (i + 1)..tasks.len() {
            if !tasks[i].modifies.is_disjoint(&tasks[j].modifies) {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskMode;

    fn task(id: &str, mode: TaskMode) -> Task {
        Task::new(id, format!("do {id}"), mode)
    }

    #[test]
    fn cyclic_depends_on_is_rejected_at_construction() {
        let mut a = task("a", TaskMode::Generate);
        a.depends_on.insert("b".into());
        let mut b = task("b", TaskMode::Generate);
        b.depends_on.insert("a".into());
        let err = TaskGraph::build(vec![a, b]).unwrap_err();
        assert!(format!("{err}").contains("cycle"));
    }

    #[test]
    fn duplicate_produces_name_is_rejected() {
        let mut a = task("a", TaskMode::Generate);
        a.produces.insert("x".into());
        let mut b = task("b", TaskMode::Generate);
        b.produces.insert("x".into());
        let err = TaskGraph::build(vec![a, b]).unwrap_err();
        assert!(format!("{err}").contains("produced by both"));
    }

    #[test]
    fn requires_with_no_producer_is_rejected() {
        let mut a = task("a", TaskMode::Generate);
        a.requires.insert("missing".into());
        let err = TaskGraph::build(vec![a]).unwrap_err();
        assert!(format!("{err}").contains("no task produces"));
    }

    #[test]
    fn contract_with_no_declarer_is_rejected() {
        let mut a = task("a", TaskMode::Generate);
        a.contract = Some("Proto".into());
        let err = TaskGraph::build(vec![a]).unwrap_err();
        assert!(format!("{err}").contains("exactly one task"));
    }

    #[test]
    fn contract_scenario_a_ready_order() {
        let mut t1 = task("proto", TaskMode::Generate);
        t1.is_contract = true;
        t1.produces.insert("UserProtocol".into());
        t1.modifies.insert("protocols.py".into());

        let mut t2 = task("impl", TaskMode::Generate);
        t2.depends_on.insert("proto".into());
        t2.contract = Some("UserProtocol".into());
        t2.modifies.insert("user.py".into());

        let graph = TaskGraph::build(vec![t1, t2]).unwrap();
        let completed_ids = BTreeSet::new();
        let completed_artifacts = BTreeSet::new();
        let ready = graph.ready(&completed_ids, &completed_artifacts);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, "proto");
    }

    #[test]
    fn conflicting_parallel_group_splits_into_singletons() {
        let mut t1 = task("t1", TaskMode::Generate);
        t1.parallel_group = Some("g".into());
        t1.modifies.insert("a.py".into());
        let mut t2 = task("t2", TaskMode::Generate);
        t2.parallel_group = Some("g".into());
        t2.modifies.insert("a.py".into());

        let graph = TaskGraph::build(vec![t1, t2]).unwrap();
        let ready: Vec<&Task> = graph.tasks().collect();
        let batches = graph.group_parallel(&ready);
        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(|b| b.len() == 1));
    }

    #[test]
    fn disjoint_parallel_group_batches_together() {
        let mut t1 = task("t1", TaskMode::Generate);
        t1.parallel_group = Some("g".into());
        t1.modifies.insert("a.py".into());
        let mut t2 = task("t2", TaskMode::Generate);
        t2.parallel_group = Some("g".into());
        t2.modifies.insert("b.py".into());

        let graph = TaskGraph::build(vec![t1, t2]).unwrap();
        let ready: Vec<&Task> = graph.tasks().collect();
        let batches = graph.group_parallel(&ready);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
    }

    #[test]
    fn deadlock_detected_when_mutually_requiring_artifacts() {
        let mut t1 = task("t1", TaskMode::Generate);
        t1.requires.insert("from_t2".into());
        t1.produces.insert("from_t1".into());
        let mut t2 = task("t2", TaskMode::Generate);
        t2.requires.insert("from_t1".into());
        t2.produces.insert("from_t2".into());

        // Bypass construction-time validation to exercise the runtime deadlock path.
        let graph = TaskGraph { tasks: [("t1".to_string(), t1), ("t2".to_string(), t2)].into_iter().collect() };
        let empty_ids = BTreeSet::new();
        let empty_artifacts = BTreeSet::new();
        assert!(graph.detect_deadlock(&empty_ids, &empty_artifacts));
    }

    #[test]
    fn serde_round_trip_preserves_graph_shape() {
        let mut t1 = task("t1", TaskMode::Generate);
        t1.modifies.insert("a.rs".into());
        let graph = TaskGraph::build(vec![t1]).unwrap();
        let tasks: Vec<Task> = graph.tasks().cloned().collect();
        let json = serde_json::to_string(&tasks).unwrap();
        let back: Vec<Task> = serde_json::from_str(&json).unwrap();
        assert_eq!(back.len(), tasks.len());
        assert_eq!(back[0].modifies, tasks[0].modifies);
    }

    #[test]
    fn all_completed_graph_yields_empty_ready_set() {
        let mut t1 = task("t1", TaskMode::Generate);
        t1.status = crate::types::TaskStatus::Completed;
        let graph = TaskGraph::build(vec![t1]).unwrap();
        let completed_ids: BTreeSet<String> = ["t1".to_string()].into_iter().collect();
        assert!(graph.ready(&completed_ids, &BTreeSet::new()).is_empty());
    }
}
