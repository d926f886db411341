//! Core domain types (spec §3). Mirrors the teacher's `types.rs` in spirit —
//! one file of plain serde structs/enums the rest of the crate builds on —
//! but the shapes themselves are Sunwell's, not the teacher's publish domain.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const LINEAGE_SCHEMA_VERSION: &str = "sunwell.lineage.v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskMode {
    Research,
    Command,
    Generate,
    Verify,
    SelfImprove,
    Modify,
    Execute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effort {
    Trivial,
    Small,
    Medium,
    Large,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub mode: TaskMode,
    pub effort: Effort,
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    #[serde(default)]
    pub requires: BTreeSet<String>,
    #[serde(default)]
    pub produces: BTreeSet<String>,
    #[serde(default)]
    pub modifies: BTreeSet<String>,
    #[serde(default)]
    pub tools: BTreeSet<String>,
    #[serde(default)]
    pub parallel_group: Option<String>,
    #[serde(default)]
    pub contract: Option<String>,
    #[serde(default)]
    pub is_contract: bool,
    #[serde(default)]
    pub target_path: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    pub status: TaskStatus,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Task {
    pub fn new(id: impl Into<String>, description: impl Into<String>, mode: TaskMode) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            mode,
            effort: Effort::Medium,
            depends_on: BTreeSet::new(),
            requires: BTreeSet::new(),
            produces: BTreeSet::new(),
            modifies: BTreeSet::new(),
            tools: BTreeSet::new(),
            parallel_group: None,
            contract: None,
            is_contract: false,
            target_path: None,
            domain: None,
            status: TaskStatus::Pending,
            output: None,
            error: None,
        }
    }
}

/// An artifact's stable identity: `"{uuid}:{content_hash_prefix}"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub artifact_id: String,
    pub path: String,
    pub content_hash: String,
    pub created_by_goal: Option<String>,
    pub created_by_task: Option<String>,
    pub created_at: DateTime<Utc>,
    pub model: Option<String>,
    pub human_edited: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditType {
    Create,
    Modify,
    Rename,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditSource {
    Sunwell,
    Human,
    External,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactEdit {
    pub edit_id: String,
    pub artifact_id: String,
    pub goal_id: Option<String>,
    pub task_id: Option<String>,
    pub lines_added: u64,
    pub lines_removed: u64,
    pub edit_type: EditType,
    pub source: EditSource,
    pub timestamp: DateTime<Utc>,
    pub content_hash: String,
}

/// Aggregate, copy-on-write view over an artifact (§4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactLineage {
    pub artifact: Artifact,
    pub edits: Vec<ArtifactEdit>,
    pub imports: BTreeSet<String>,
    pub imported_by: BTreeSet<String>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedArtifact {
    pub path: String,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryState {
    pub goal_hash: String,
    pub goal: String,
    pub run_id: String,
    pub failure_reason: String,
    pub passed: Vec<String>,
    pub failed: Vec<FailedArtifact>,
    pub waiting: Vec<String>,
    #[serde(default)]
    pub error_details: Option<String>,
    pub summary: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BriefingStatus {
    #[default]
    NotStarted,
    InProgress,
    Blocked,
    Complete,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Briefing {
    pub mission: String,
    pub status: BriefingStatus,
    pub progress: String,
    pub hot_files: Vec<String>,
    pub hazards: Vec<String>,
    pub predicted_skills: Vec<String>,
    pub complexity_estimate: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    Open,
    Claimed,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    pub id: String,
    pub title: String,
    pub description: String,
    pub claimed_by: Option<u32>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub status: GoalStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Backlog {
    pub goals: BTreeMap<String, Goal>,
    pub completed: BTreeSet<String>,
}

impl Backlog {
    pub fn claimable(&self) -> impl Iterator<Item = &Goal> {
        self.goals.values().filter(|g| g.status == GoalStatus::Open)
    }

    pub fn claim(&mut self, goal_id: &str, worker_id: u32) -> bool {
        if let Some(goal) = self.goals.get_mut(goal_id)
            && goal.status == GoalStatus::Open
        {
            goal.status = GoalStatus::Claimed;
            goal.claimed_by = Some(worker_id);
            goal.claimed_at = Some(Utc::now());
            return true;
        }
        false
    }

    pub fn complete(&mut self, goal_id: &str) {
        if let Some(goal) = self.goals.get_mut(goal_id) {
            goal.status = GoalStatus::Completed;
        }
        self.completed.insert(goal_id.to_string());
    }

    /// Releases every goal claimed by `worker_id` back to `Open` — used by
    /// crash/stuck-worker recovery (§4.5).
    pub fn unclaim_worker(&mut self, worker_id: u32) -> Vec<String> {
        let mut released = Vec::new();
        for (id, goal) in self.goals.iter_mut() {
            if goal.claimed_by == Some(worker_id) && goal.status == GoalStatus::Claimed {
                goal.status = GoalStatus::Open;
                goal.claimed_by = None;
                goal.claimed_at = None;
                released.push(id.clone());
            }
        }
        released
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Starting,
    Running,
    Idle,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub worker_id: u32,
    pub pid: u32,
    pub state: WorkerState,
    pub branch: String,
    pub current_goal_id: Option<String>,
    pub goals_completed: u32,
    pub goals_failed: u32,
    pub last_heartbeat: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub worker_id: u32,
    pub pid: u32,
    pub state: WorkerState,
    pub branch: String,
    pub current_goal_id: Option<String>,
    pub goals_completed: u32,
    pub goals_failed: u32,
    pub last_heartbeat: DateTime<Utc>,
}

impl From<WorkerHeartbeat> for WorkerStatus {
    fn from(h: WorkerHeartbeat) -> Self {
        Self {
            worker_id: h.worker_id,
            pid: h.pid,
            state: h.state,
            branch: h.branch,
            current_goal_id: h.current_goal_id,
            goals_completed: h.goals_completed,
            goals_failed: h.goals_failed,
            last_heartbeat: h.last_heartbeat,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    LockContention,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConflict {
    pub path: String,
    pub worker_a: u32,
    pub worker_b: u32,
    pub conflict_type: ConflictType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorUiState {
    pub workers: Vec<WorkerStatus>,
    pub conflicts: Vec<FileConflict>,
    pub total_progress: f64,
    pub is_running: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningItem {
    pub text: String,
    pub confidence: f64,
    pub source_goal_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LearningBatch {
    pub facts: Vec<LearningItem>,
    pub constraints: Vec<LearningItem>,
    pub dead_ends: Vec<LearningItem>,
    pub templates: Vec<LearningItem>,
    pub heuristics: Vec<LearningItem>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_graph_serde_round_trip_preserves_structure() {
        let mut t = Task::new("t1", "do a thing", TaskMode::Generate);
        t.depends_on.insert("t0".into());
        t.modifies.insert("a.rs".into());
        let json = serde_json::to_string(&t).unwrap();
        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, t.id);
        assert_eq!(back.depends_on, t.depends_on);
        assert_eq!(back.modifies, t.modifies);
    }

    #[test]
    fn claim_then_unclaim_worker_returns_goal_to_open() {
        let mut backlog = Backlog::default();
        backlog.goals.insert(
            "g1".into(),
            Goal {
                id: "g1".into(),
                title: "t".into(),
                description: "d".into(),
                claimed_by: None,
                claimed_at: None,
                status: GoalStatus::Open,
            },
        );
        assert!(backlog.claim("g1", 1));
        assert_eq!(backlog.goals["g1"].status, GoalStatus::Claimed);

        let released = backlog.unclaim_worker(1);
        assert_eq!(released, vec!["g1".to_string()]);
        assert_eq!(backlog.goals["g1"].status, GoalStatus::Open);
    }
}
