use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use sunwell_kernel::config::KernelConfig;
use sunwell_kernel::contracts::{ContractVerifier, NoSemanticVerifier};
use sunwell_kernel::coordinator::{BoxFuture, ExecutionCoordinator, RunOutcome, TaskExecutor, TaskOutcome};
use sunwell_kernel::events::EventKind;
use sunwell_kernel::governor::{LlmSlotGovernor, recommend_worker_count};
use sunwell_kernel::learning::{self, ExecutionReport};
use sunwell_kernel::recovery;
use sunwell_kernel::reliability::health::check_health;
use sunwell_kernel::reliability::{BudgetCheck, ReliabilityContext};
use sunwell_kernel::task_graph::TaskGraph;
use sunwell_kernel::types::{FailedArtifact, RecoveryState, Task, TaskStatus};

#[derive(Parser, Debug)]
#[command(name = "sunwell", version)]
#[command(about = "Harness for the Sunwell planning and execution kernel")]
struct Cli {
    /// Workspace root the task graph writes artifacts into.
    #[arg(long, default_value = ".")]
    workspace: PathBuf,

    /// Directory for kernel state (lineage, recovery, budget, locks).
    #[arg(long, default_value = ".sunwell/state")]
    state_dir: PathBuf,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print dependency analytics for a task graph (critical path, width, conflicts).
    Graph {
        /// Path to a JSON file holding a `Vec<Task>`.
        graph: PathBuf,
    },
    /// Run the kernel's pre-flight health check against the workspace.
    Health {
        /// Tool binaries that must be on PATH (repeatable).
        #[arg(long = "tool")]
        tools: Vec<String>,
    },
    /// Drive a task graph to completion, printing the event stream.
    Run {
        /// Path to a JSON file holding a `Vec<Task>`.
        graph: PathBuf,
        /// Goal id, used to key recovery state and attribute learnings.
        #[arg(long, default_value = "goal-1")]
        goal_id: String,
        #[arg(long, value_parser = humantime::parse_duration, default_value = "5m")]
        max_wall_time: Duration,
    },
    /// Recovery-state operations (§4.8).
    Recovery {
        #[command(subcommand)]
        cmd: RecoveryCommands,
    },
    /// Print environment diagnostics (git, required tool versions).
    Doctor,
}

#[derive(Subcommand, Debug)]
enum RecoveryCommands {
    /// List pending recovery states.
    List,
    /// Show a recovery state's healing context by goal-hash (prefix allowed).
    Show {
        goal_hash: String,
        #[arg(long)]
        hint: Option<String>,
    },
    /// Delete a recovery state after a successful resume.
    Resolve { goal_hash: String },
    /// Delete a recovery state unconditionally.
    Abort { goal_hash: String },
}

/// Stand-in `TaskExecutor` exercising the coordinator without a real model
/// or tool backend (both are out-of-core per spec §1): every mode
/// "succeeds" by writing an empty placeholder for each declared `produces`
/// path, unless the task's own description contains the literal word
/// "fail" — a deterministic hook for driving failure paths from a static
/// graph file without a scripting language.
struct PlaceholderExecutor<'a> {
    workspace: &'a std::path::Path,
}

impl PlaceholderExecutor<'_> {
    fn run(&self, task: &Task) -> TaskOutcome {
        if task.description.to_lowercase().contains("fail") {
            return TaskOutcome::failed(format!("task {} scripted to fail via its description", task.id));
        }
        for path in &task.produces {
            let full = self.workspace.join(path);
            if let Some(parent) = full.parent() {
                let _ = fs::create_dir_all(parent);
            }
            let _ = fs::write(&full, format!("// produced by task {}\n", task.id));
        }
        TaskOutcome::completed(format!("{} ran in placeholder mode", task.id)).with_produces(task.produces.clone())
    }
}

impl TaskExecutor for PlaceholderExecutor<'_> {
    fn research<'a>(&'a self, task: &'a Task) -> BoxFuture<'a, TaskOutcome> {
        Box::pin(async move { self.run(task) })
    }
    fn command<'a>(&'a self, task: &'a Task) -> BoxFuture<'a, TaskOutcome> {
        Box::pin(async move { self.run(task) })
    }
    fn generate<'a>(&'a self, task: &'a Task) -> BoxFuture<'a, TaskOutcome> {
        Box::pin(async move { self.run(task) })
    }
    fn verify<'a>(&'a self, task: &'a Task) -> BoxFuture<'a, TaskOutcome> {
        Box::pin(async move { self.run(task) })
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.cmd {
        Commands::Graph { graph } => cmd_graph(graph),
        Commands::Health { tools } => cmd_health(&cli.workspace, tools),
        Commands::Run { graph, goal_id, max_wall_time } => cmd_run(&cli, graph, goal_id, *max_wall_time),
        Commands::Recovery { cmd } => cmd_recovery(&cli.state_dir, cmd),
        Commands::Doctor => cmd_doctor(&cli),
    }
}

fn load_graph(path: &std::path::Path) -> Result<TaskGraph> {
    let content = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let tasks: Vec<Task> = serde_json::from_str(&content).with_context(|| format!("failed to parse task graph {}", path.display()))?;
    TaskGraph::build(tasks)
}

fn cmd_graph(path: &std::path::Path) -> Result<()> {
    let graph = load_graph(path)?;
    println!("tasks: {}", graph.tasks().count());
    println!("critical_path_length: {}", graph.critical_path_length());
    println!("max_parallel_width: {}", graph.max_parallel_width());
    println!("parallelization_ratio: {:.2}", graph.parallelization_ratio());

    let all: Vec<&Task> = graph.tasks().collect();
    let conflicts = graph.conflicts(&all);
    if conflicts.is_empty() {
        println!("modifies_conflicts: none");
    } else {
        println!("modifies_conflicts:");
        for (a, b) in conflicts {
            println!("  {a} <-> {b}");
        }
    }
    Ok(())
}

fn cmd_health(workspace: &std::path::Path, tools: &[String]) -> Result<()> {
    let tool_refs: Vec<&str> = tools.iter().map(String::as_str).collect();
    let status = check_health(workspace, &tool_refs);
    println!("healthy: {}", status.healthy);
    for check in &status.failed_checks {
        println!("  failed: {check}");
    }
    if !status.healthy {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_run(cli: &Cli, graph_path: &std::path::Path, goal_id: &str, max_wall_time: Duration) -> Result<()> {
    fs::create_dir_all(&cli.workspace).with_context(|| format!("failed to create workspace {}", cli.workspace.display()))?;
    let config = KernelConfig::load_from_workspace(&cli.workspace)?;
    let mut graph = load_graph(graph_path)?;

    let reliability = ReliabilityContext::new(
        config.budget.clone(),
        config.circuit_breaker.clone(),
        3,
        cli.workspace.clone(),
        Vec::new(),
    );
    let health = reliability.health.run();
    if !health.healthy {
        for check in &health.failed_checks {
            print_event(&EventKind::ReliabilityWarning { message: check.clone() });
        }
    }

    let executor = PlaceholderExecutor { workspace: &cli.workspace };
    let semantic = NoSemanticVerifier;
    let verifier = ContractVerifier::new(cli.workspace.clone(), config.contract_verifier.skip_llm, config.contract_verifier.type_check_timeout, &semantic);
    let governor = LlmSlotGovernor::new(config.governor.llm_ceiling);

    let mut coordinator = ExecutionCoordinator::new(&executor, cli.workspace.clone())
        .with_contract_verifier(&verifier)
        .with_governor(&governor);

    let outcome = coordinator.run(
        &mut graph,
        max_wall_time,
        || matches!(reliability.budget.check(), BudgetCheck::Exhausted),
        |event| print_event(&event),
    );

    println!("outcome: {outcome:?}");

    let contract_failures = sunwell_kernel::coordinator::validate_contracts(&graph, &verifier);
    for (task_id, reason) in &contract_failures {
        println!("contract_failure: {task_id}: {reason}");
    }

    let any_failed = graph.tasks().any(|t| t.status == TaskStatus::Failed) || !contract_failures.is_empty();

    if any_failed || outcome != RunOutcome::Completed {
        let recovery_state = build_recovery_state(goal_id, &graph, &outcome, &contract_failures);
        recovery::save(&cli.state_dir, &recovery_state)?;
        println!("recovery_state_saved: {}", recovery_state.goal_hash);
    }

    let report = ExecutionReport { goal_id, graph: &graph, recovery: None };
    let batch = learning::extract(&report);
    println!(
        "learning_batch: facts={} constraints={} dead_ends={} templates={} heuristics={}",
        batch.facts.len(),
        batch.constraints.len(),
        batch.dead_ends.len(),
        batch.templates.len(),
        batch.heuristics.len()
    );

    if any_failed {
        std::process::exit(1);
    }
    Ok(())
}

fn build_recovery_state(
    goal_id: &str,
    graph: &TaskGraph,
    outcome: &RunOutcome,
    contract_failures: &[(String, String)],
) -> RecoveryState {
    let mut passed = Vec::new();
    let mut failed = Vec::new();
    let mut waiting = Vec::new();

    for task in graph.tasks() {
        match task.status {
            TaskStatus::Completed => passed.extend(task.produces.iter().cloned()),
            TaskStatus::Failed => {
                let mut errors: Vec<String> = task.error.clone().into_iter().collect();
                errors.extend(contract_failures.iter().filter(|(id, _)| id == &task.id).map(|(_, reason)| reason.clone()));
                let target = task.produces.iter().next().cloned().unwrap_or_else(|| task.id.clone());
                failed.push(FailedArtifact { path: target, errors });
            }
            TaskStatus::Pending | TaskStatus::Running => waiting.extend(task.produces.iter().cloned()),
            TaskStatus::Skipped => {}
        }
    }

    let goal_hash = content_hash_of(goal_id);
    RecoveryState {
        goal_hash,
        goal: goal_id.to_string(),
        run_id: uuid::Uuid::new_v4().to_string(),
        failure_reason: format!("{outcome:?}"),
        passed,
        failed,
        waiting,
        error_details: None,
        summary: format!("run ended with {outcome:?}"),
    }
}

fn content_hash_of(text: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())[..12].to_string()
}

fn cmd_recovery(state_dir: &std::path::Path, cmd: &RecoveryCommands) -> Result<()> {
    match cmd {
        RecoveryCommands::List => {
            let pending = recovery::list_pending(state_dir)?;
            if pending.is_empty() {
                println!("no pending recovery states");
            }
            for state in pending {
                println!("{}: {} ({})", state.goal_hash, state.goal, state.failure_reason);
            }
        }
        RecoveryCommands::Show { goal_hash, hint } => {
            let Some(state) = recovery::load(state_dir, goal_hash)? else { bail!("no recovery state matching {goal_hash}") };
            println!("{}", recovery::build_healing_context(&state, hint.as_deref()));
        }
        RecoveryCommands::Resolve { goal_hash } => {
            recovery::mark_resolved(state_dir, goal_hash)?;
            println!("resolved {goal_hash}");
        }
        RecoveryCommands::Abort { goal_hash } => {
            recovery::abort(state_dir, goal_hash, true)?;
            println!("aborted {goal_hash}");
        }
    }
    Ok(())
}

fn cmd_doctor(cli: &Cli) -> Result<()> {
    println!("workspace: {}", cli.workspace.display());
    println!("state_dir: {}", cli.state_dir.display());
    print_cmd_version("git");
    print_cmd_version("cargo");

    let config = KernelConfig::load_from_workspace(&cli.workspace)?;
    let cpu_count = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    let available_memory_mb = available_memory_mb().unwrap_or(1024);
    let recommended = recommend_worker_count(cpu_count, available_memory_mb, config.governor.llm_ceiling);
    println!("cpu_count: {cpu_count}");
    println!("available_memory_mb: {available_memory_mb}");
    println!("recommended_worker_count: {recommended}");
    Ok(())
}

/// Reads `MemAvailable` out of `/proc/meminfo`. Linux-only; `None` anywhere
/// else or if the file can't be parsed, leaving the caller to fall back.
fn available_memory_mb() -> Option<u64> {
    let content = fs::read_to_string("/proc/meminfo").ok()?;
    let line = content.lines().find(|l| l.starts_with("MemAvailable:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb / 1024)
}

fn print_cmd_version(cmd: &str) {
    match Command::new(cmd).arg("--version").output() {
        Ok(o) if o.status.success() => println!("{cmd}: {}", String::from_utf8_lossy(&o.stdout).trim()),
        Ok(o) => eprintln!("[warn] {cmd} --version failed: {}", String::from_utf8_lossy(&o.stderr).trim()),
        Err(e) => eprintln!("[warn] unable to run {cmd} --version: {e}"),
    }
}

fn print_event(event: &EventKind) {
    match event {
        EventKind::TaskStart { task_id } => println!("task_start: {task_id}"),
        EventKind::TaskComplete { task_id } => println!("task_complete: {task_id}"),
        EventKind::TaskFailed { task_id, reason } => println!("task_failed: {task_id}: {reason}"),
        EventKind::TaskProgress { task_id, message } => println!("task_progress: {task_id}: {message}"),
        EventKind::ToolStart { task_id, tool } => println!("tool_start: {task_id}: {tool}"),
        EventKind::ToolComplete { task_id, tool, duration_ms } => println!("tool_complete: {task_id}: {tool} ({duration_ms}ms)"),
        EventKind::ToolError { task_id, tool, message } => println!("tool_error: {task_id}: {tool}: {message}"),
        EventKind::GateStart { task_id, gate } => println!("gate_start: {task_id}: {gate}"),
        EventKind::GatePass { task_id, gate } => println!("gate_pass: {task_id}: {gate}"),
        EventKind::GateFail { task_id, gate, errors } => println!("gate_fail: {task_id}: {gate}: {}", errors.join("; ")),
        EventKind::PlanStart { goal_id } => println!("plan_start: {goal_id}"),
        EventKind::PlanWinner { goal_id, candidate } => println!("plan_winner: {goal_id}: candidate {candidate}"),
        EventKind::ConvergenceIterationComplete { iteration } => println!("convergence_iteration_complete: {iteration}"),
        EventKind::ConvergenceStable => println!("convergence_stable"),
        EventKind::ConvergenceTimeout => println!("convergence_timeout"),
        EventKind::ConvergenceStuck => println!("convergence_stuck"),
        EventKind::RecoverySaved { goal_hash } => println!("recovery_saved: {goal_hash}"),
        EventKind::RecoveryResolved { goal_hash } => println!("recovery_resolved: {goal_hash}"),
        EventKind::BudgetWarning { used_fraction } => println!("budget_warning: {:.0}%", used_fraction * 100.0),
        EventKind::BudgetExhausted => println!("budget_exhausted"),
        EventKind::CircuitBreakerOpen { resource } => println!("circuit_breaker_open: {resource}"),
        EventKind::ReliabilityWarning { message } => println!("reliability_warning: {message}"),
    }
}
