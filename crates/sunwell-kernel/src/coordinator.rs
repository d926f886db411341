//! Execution coordinator (§4.3): drives a `TaskGraph` to a terminal state.
//! Grounded on `execution.py`'s `ExecutionCoordinator.execute_task_graph`
//! main loop, with its dispatch-by-mode `if/elif` chain replaced by an
//! exhaustive `match` over `TaskMode` per the closed-tagged-union REDESIGN
//! FLAG (§9): each mode calls into a pluggable `TaskExecutor` the host
//! supplies (the model/tool plumbing itself is out of this kernel's scope).
//!
//! A single worker's cooperative scheduling runs on tokio's current-thread
//! runtime (§1A): `TaskExecutor` methods return boxed futures, a batch's
//! tasks are polled concurrently through a hand-rolled join combinator
//! (`JoinAll` below, not the `futures` crate), and a retryable failure backs
//! off and retries in place via `sunwell-backoff`'s formula before the
//! coordinator gives up on it. `run`'s public surface stays synchronous: it
//! builds the runtime and blocks on the async driver itself.

use std::collections::BTreeSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use crate::backoff::{RetryPolicy, RetryStrategyConfig, calculate_delay};
use crate::contracts::ContractVerifier;
use crate::error::{ErrorClass, classify_subprocess_failure};
use crate::events::EventKind;
use crate::gates::{self, ArtifactExistsGate, ContentHashMatchesGate, ContractSatisfiedGate, Gate};
use crate::governor::LlmSlotGovernor;
use crate::task_graph::TaskGraph;
use crate::types::{Task, TaskMode, TaskStatus};

/// A future boxed and pinned for one task dispatch. `!Send` on purpose: the
/// coordinator drives everything from a single thread, so an executor is
/// free to use non-`Send` state (e.g. `Rc`, non-atomic counters).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;

/// Outcome a `TaskExecutor` reports back for a single task.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub status: TaskStatus,
    pub output: Option<String>,
    pub error: Option<String>,
    pub produces: BTreeSet<String>,
    /// Content hash of each produced artifact, as the executor wrote it.
    /// Checked by `ContentHashMatchesGate`; paths the executor doesn't
    /// report here are skipped by that gate, not failed.
    pub content_hashes: std::collections::BTreeMap<String, String>,
}

impl Default for TaskOutcome {
    fn default() -> Self {
        Self {
            status: TaskStatus::Pending,
            output: None,
            error: None,
            produces: BTreeSet::new(),
            content_hashes: std::collections::BTreeMap::new(),
        }
    }
}

impl TaskOutcome {
    pub fn completed(output: impl Into<String>) -> Self {
        Self { status: TaskStatus::Completed, output: Some(output.into()), ..Default::default() }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self { status: TaskStatus::Failed, error: Some(error.into()), ..Default::default() }
    }

    pub fn with_produces(mut self, produces: BTreeSet<String>) -> Self {
        self.produces = produces;
        self
    }

    pub fn with_content_hashes(mut self, content_hashes: std::collections::BTreeMap<String, String>) -> Self {
        self.content_hashes = content_hashes;
        self
    }
}

/// Mode-specific execution, supplied by the host (RESEARCH/COMMAND
/// invoke tools, GENERATE/VERIFY invoke models). `MODIFY` dispatches
/// through `generate` and `EXECUTE` through `command`, per §4.3's note
/// that they share implementations and differ only in prompt framing.
///
/// Methods take `&self`, not `&mut self`: the coordinator dispatches a
/// batch concurrently, and no host executor needs to mutate shared state
/// to answer a single task (anything stateful belongs behind interior
/// mutability, the same discipline `governor::LlmSlotGovernor` uses).
pub trait TaskExecutor {
    fn research<'a>(&'a self, task: &'a Task) -> BoxFuture<'a, TaskOutcome>;
    fn command<'a>(&'a self, task: &'a Task) -> BoxFuture<'a, TaskOutcome>;
    fn generate<'a>(&'a self, task: &'a Task) -> BoxFuture<'a, TaskOutcome>;
    fn verify<'a>(&'a self, task: &'a Task) -> BoxFuture<'a, TaskOutcome>;
    /// Delegated to the outer loop; the coordinator treats it as a no-op
    /// that always completes, per §4.3.
    fn self_improve<'a>(&'a self, _task: &'a Task) -> BoxFuture<'a, TaskOutcome> {
        Box::pin(async { TaskOutcome::completed("delegated to outer loop") })
    }
}

fn dispatch<'a>(executor: &'a dyn TaskExecutor, task: &'a Task) -> BoxFuture<'a, TaskOutcome> {
    match task.mode {
        TaskMode::Research => executor.research(task),
        TaskMode::Command | TaskMode::Execute => executor.command(task),
        TaskMode::Generate | TaskMode::Modify => executor.generate(task),
        TaskMode::Verify => executor.verify(task),
        TaskMode::SelfImprove => executor.self_improve(task),
    }
}

/// Holds a `LlmSlotGovernor` slot for GENERATE/MODIFY/VERIFY dispatch and
/// releases it on drop, the same RAII shape `governor::FileWriteLock` uses.
struct GovernorSlot<'a>(&'a LlmSlotGovernor);

impl Drop for GovernorSlot<'_> {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// Dispatches one task, acquiring a governor slot first if its mode
/// consumes a model call, and retrying a `Retryable`-classified failure
/// (per `error::classify_subprocess_failure`) under `retry_policy`'s
/// backoff formula until it succeeds or attempts run out.
async fn run_one(
    executor: &dyn TaskExecutor,
    task: &Task,
    governor: Option<&LlmSlotGovernor>,
    retry_policy: Option<&RetryStrategyConfig>,
) -> TaskOutcome {
    let wants_slot = matches!(task.mode, TaskMode::Generate | TaskMode::Modify | TaskMode::Verify);
    let _slot = if wants_slot {
        if let Some(g) = governor {
            while !g.try_acquire() {
                tokio::task::yield_now().await;
            }
            Some(GovernorSlot(g))
        } else {
            None
        }
    } else {
        None
    };

    let mut attempt: u32 = 1;
    loop {
        let outcome = dispatch(executor, task).await;
        if outcome.status != TaskStatus::Failed {
            return outcome;
        }
        let Some(policy) = retry_policy else { return outcome };
        let (class, _) = classify_subprocess_failure(outcome.error.as_deref().unwrap_or(""), "");
        if class != ErrorClass::Retryable || attempt >= policy.max_attempts {
            return outcome;
        }
        tokio::time::sleep(calculate_delay(policy, attempt)).await;
        attempt += 1;
    }
}

/// Polls a fixed set of boxed futures to completion, returning their
/// outputs in input order once every one of them is `Ready`. Hand-rolled
/// rather than pulled from the `futures` crate: this is the whole of the
/// "concurrently dispatch and await all" requirement for one batch.
struct JoinAll<'a, T> {
    slots: Vec<JoinSlot<'a, T>>,
}

enum JoinSlot<'a, T> {
    Pending(BoxFuture<'a, T>),
    Done(T),
    Taken,
}

impl<'a, T: Unpin> Future for JoinAll<'a, T> {
    type Output = Vec<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut all_ready = true;
        for slot in this.slots.iter_mut() {
            if let JoinSlot::Pending(fut) = slot {
                match fut.as_mut().poll(cx) {
                    Poll::Ready(value) => *slot = JoinSlot::Done(value),
                    Poll::Pending => all_ready = false,
                }
            }
        }
        if !all_ready {
            return Poll::Pending;
        }
        Poll::Ready(
            this.slots
                .iter_mut()
                .map(|slot| match std::mem::replace(slot, JoinSlot::Taken) {
                    JoinSlot::Done(value) => value,
                    _ => unreachable!("all slots settled before this point"),
                })
                .collect(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Deadlocked,
    TimedOut,
    BudgetExhausted,
}

pub struct ExecutionCoordinator<'a> {
    executor: &'a dyn TaskExecutor,
    workspace: PathBuf,
    contract_verifier: Option<&'a ContractVerifier<'a>>,
    governor: Option<&'a LlmSlotGovernor>,
    retry_policy: Option<RetryStrategyConfig>,
}

impl<'a> ExecutionCoordinator<'a> {
    pub fn new(executor: &'a dyn TaskExecutor, workspace: impl Into<PathBuf>) -> Self {
        Self {
            executor,
            workspace: workspace.into(),
            contract_verifier: None,
            governor: None,
            retry_policy: Some(RetryPolicy::Default.to_config()),
        }
    }

    /// Wires a `ContractVerifier` into the per-task `contract-satisfied`
    /// gate; without one, tasks that declare a contract skip that gate
    /// (the host is expected to run `validate_contracts` separately instead).
    pub fn with_contract_verifier(mut self, verifier: &'a ContractVerifier<'a>) -> Self {
        self.contract_verifier = Some(verifier);
        self
    }

    /// Wires an `LlmSlotGovernor` so GENERATE/MODIFY/VERIFY dispatch waits
    /// for a free slot before running.
    pub fn with_governor(mut self, governor: &'a LlmSlotGovernor) -> Self {
        self.governor = Some(governor);
        self
    }

    /// Overrides the default retry policy (`RetryPolicy::Default`). `None`
    /// disables retries entirely: a `Retryable`-classified failure is
    /// reported on the first attempt.
    pub fn with_retry_policy(mut self, policy: Option<RetryStrategyConfig>) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Drives `graph` to completion, calling `emit` for every event and
    /// `budget_exhausted` before each new batch is dispatched (lets the
    /// host stop dispatching new work while in-flight tasks still finish,
    /// per §4.3's failure semantics). Synchronous on the surface: a
    /// single-threaded tokio runtime drives the async dispatch underneath.
    pub fn run(
        &mut self,
        graph: &mut TaskGraph,
        max_wall_time: Duration,
        budget_exhausted: impl FnMut() -> bool,
        emit: impl FnMut(EventKind),
    ) -> RunOutcome {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("failed to build the coordinator's cooperative runtime");
        runtime.block_on(self.run_async(graph, max_wall_time, budget_exhausted, emit))
    }

    async fn run_async(
        &mut self,
        graph: &mut TaskGraph,
        max_wall_time: Duration,
        mut budget_exhausted: impl FnMut() -> bool,
        mut emit: impl FnMut(EventKind),
    ) -> RunOutcome {
        let start = Instant::now();
        let mut completed_ids: BTreeSet<String> = BTreeSet::new();
        let mut completed_artifacts: BTreeSet<String> = BTreeSet::new();

        loop {
            if start.elapsed() > max_wall_time {
                return RunOutcome::TimedOut;
            }

            let ready_ids: Vec<String> = graph.ready(&completed_ids, &completed_artifacts).into_iter().map(|t| t.id.clone()).collect();

            if ready_ids.is_empty() {
                let any_pending = graph.tasks().any(|t| t.status == TaskStatus::Pending);
                if !any_pending {
                    return RunOutcome::Completed;
                }
                if graph.detect_deadlock(&completed_ids, &completed_artifacts) {
                    let pending_ids: Vec<String> =
                        graph.tasks().filter(|t| t.status == TaskStatus::Pending).map(|t| t.id.clone()).collect();
                    for id in pending_ids {
                        graph.set_status(&id, TaskStatus::Failed);
                        emit(EventKind::TaskFailed { task_id: id, reason: "deadlock: unmet dependency or artifact requirement".into() });
                    }
                    return RunOutcome::Deadlocked;
                }
                continue;
            }

            if budget_exhausted() {
                return RunOutcome::BudgetExhausted;
            }

            let ready: Vec<&Task> = graph.ready(&completed_ids, &completed_artifacts);
            let batches: Vec<Vec<String>> = graph.group_parallel(&ready).into_iter().map(|b| b.iter().map(|t| t.id.clone()).collect()).collect();

            for batch in batches {
                for id in &batch {
                    graph.set_status(id, TaskStatus::Running);
                    emit(EventKind::TaskStart { task_id: id.clone() });
                }

                let tasks: Vec<Task> = batch.iter().map(|id| graph.task(id).expect("task present").clone()).collect();
                let joiner = JoinAll {
                    slots: tasks
                        .iter()
                        .map(|task| {
                            let fut: BoxFuture<'_, TaskOutcome> = Box::pin(run_one(self.executor, task, self.governor, self.retry_policy.as_ref()));
                            JoinSlot::Pending(fut)
                        })
                        .collect(),
                };
                let results = joiner.await;
                let outcomes: Vec<(String, TaskOutcome)> = batch.into_iter().zip(results).collect();

                for (id, outcome) in outcomes {
                    graph.set_output(&id, outcome.output.clone(), outcome.error.clone());
                    match outcome.status {
                        TaskStatus::Completed => {
                            self.finish_completed_task(graph, &id, outcome, &mut completed_ids, &mut completed_artifacts, &mut emit);
                        }
                        TaskStatus::Failed => {
                            graph.set_status(&id, TaskStatus::Failed);
                            emit(EventKind::TaskFailed { task_id: id, reason: outcome.error.unwrap_or_default() });
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    /// Runs the post-dispatch gate sequence (§4.9) for a task whose
    /// executor reported `Completed`, and only then commits it to the
    /// completed set — a gate failure flips the task back to `Failed`
    /// instead.
    fn finish_completed_task(
        &self,
        graph: &mut TaskGraph,
        id: &str,
        outcome: TaskOutcome,
        completed_ids: &mut BTreeSet<String>,
        completed_artifacts: &mut BTreeSet<String>,
        emit: &mut impl FnMut(EventKind),
    ) {
        let task = graph.task(id).expect("task present").clone();

        let contract_ctx = match contract_gate_context(graph, &task) {
            Ok(ctx) => ctx,
            Err(reason) => {
                graph.set_status(id, TaskStatus::Failed);
                graph.set_output(id, outcome.output.clone(), Some(reason.clone()));
                emit(EventKind::TaskFailed { task_id: id.to_string(), reason });
                return;
            }
        };

        let artifact_gate = ArtifactExistsGate;
        let hash_gate = ContentHashMatchesGate { expected: &outcome.content_hashes };
        let mut gate_refs: Vec<&dyn Gate> = vec![&artifact_gate, &hash_gate];

        let contract_gate = match (self.contract_verifier, &contract_ctx) {
            (Some(verifier), Some((contract_file, impl_type_name))) => {
                Some(ContractSatisfiedGate { verifier, contract_file: Path::new(contract_file.as_str()), impl_type_name: impl_type_name.as_str() })
            }
            _ => None,
        };
        if let Some(ref gate) = contract_gate {
            gate_refs.push(gate);
        }

        let gate_outcomes = gates::run_gates(&gate_refs, &task, &self.workspace, emit);

        if gates::all_passed(&gate_outcomes) {
            graph.set_status(id, TaskStatus::Completed);
            completed_ids.insert(id.to_string());
            completed_artifacts.extend(outcome.produces.iter().cloned());
            emit(EventKind::TaskComplete { task_id: id.to_string() });
        } else {
            let reason = gate_outcomes.iter().flat_map(|g| g.errors.iter().cloned()).collect::<Vec<_>>().join("; ");
            graph.set_status(id, TaskStatus::Failed);
            graph.set_output(id, outcome.output.clone(), Some(reason.clone()));
            emit(EventKind::TaskFailed { task_id: id.to_string(), reason });
        }
    }
}

fn find_contract_file(graph: &TaskGraph, contract_name: &str) -> Option<String> {
    graph.tasks().find(|t| t.is_contract && t.produces.contains(contract_name)).and_then(|t| t.target_path.clone())
}

/// Resolves the `(contract_file, impl_type_name)` a completed task's
/// declared contract needs checked against, or `None` if it declares none.
/// `Err` means the task's contract declaration is itself malformed (no
/// contract-declaring task found, or no `target_path` to check).
fn contract_gate_context(graph: &TaskGraph, task: &Task) -> Result<Option<(String, String)>, String> {
    let Some(contract_name) = &task.contract else { return Ok(None) };
    let Some(contract_file) = find_contract_file(graph, contract_name) else {
        return Err(format!("no contract-declaring task found for {contract_name}"));
    };
    let Some(target_path) = &task.target_path else {
        return Err("task declares a contract but no target_path".into());
    };
    let impl_type_name = target_path.rsplit('/').next().unwrap_or(target_path).trim_end_matches(".rs").to_string();
    Ok(Some((contract_file, impl_type_name)))
}

/// Runs contract validation over every completed task that declared one,
/// per §4.3's post-graph-completion pass. Complements (doesn't replace) the
/// per-task `contract-satisfied` gate `ExecutionCoordinator` runs inline:
/// this whole-graph pass still catches a contract left unsatisfied by a
/// coordinator run with no `ContractVerifier` wired in. Returns the
/// contract names that failed verification.
pub fn validate_contracts(graph: &TaskGraph, verifier: &ContractVerifier<'_>) -> Vec<(String, String)> {
    let mut failures = Vec::new();
    for task in graph.tasks() {
        if task.status != TaskStatus::Completed {
            continue;
        }
        let (Some(contract_name), Some(target_path)) = (&task.contract, &task.target_path) else { continue };
        let Some(contract_file) = graph
            .tasks()
            .find(|t| t.is_contract && t.produces.contains(contract_name))
            .and_then(|t| t.target_path.clone())
        else {
            failures.push((task.id.clone(), format!("no contract-declaring task found for {contract_name}")));
            continue;
        };

        let impl_type_name = target_path.rsplit('/').next().unwrap_or(target_path).trim_end_matches(".rs");
        match verifier.verify(std::path::Path::new(target_path), std::path::Path::new(&contract_file), contract_name, impl_type_name) {
            Ok(result) if !result.passed() => failures.push((task.id.clone(), format!("contract {contract_name} not satisfied"))),
            Ok(_) => {}
            Err(e) => failures.push((task.id.clone(), format!("contract verification error: {e}"))),
        }
    }
    failures
}
