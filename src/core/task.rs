//! Task data model for the Task Board.
//!
//! Tasks are the atomic units of work handed to workers. Each task
//! tracks its role, layer, dependencies, status, and result payload.

use crate::core::role::Role;
use crate::orchestration::WorkerId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// Unique identifier for a task within a run.
///
/// Task ids are chosen by whoever builds the plan so that dependencies
/// can be written down by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    /// Create a task identifier from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random identifier for tasks that have no natural name.
    pub fn generate() -> Self {
        Self(format!("task-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Task status in its lifecycle.
///
/// `Done`, `Failed` and `Cancelled` are terminal: a task never leaves them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Created, waiting on dependencies or on the layer floor.
    #[default]
    Pending,
    /// Dependencies done and layer open; waiting for a worker.
    Runnable,
    /// Assigned to a worker.
    InProgress,
    /// Finished successfully; the result payload is set.
    Done,
    /// Finished with an error reported by the worker.
    Failed {
        /// Failure reason.
        reason: String,
    },
    /// Abandoned by the coordinator.
    Cancelled {
        /// Why the task was cancelled.
        reason: String,
    },
}

impl TaskStatus {
    /// Check if the status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Failed { .. } | TaskStatus::Cancelled { .. }
        )
    }

    /// Terminal and not blocking layer advancement.
    pub fn is_settled(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Cancelled { .. })
    }

    /// Short name without the attached reason.
    pub fn name(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Runnable => "runnable",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Done => "done",
            TaskStatus::Failed { .. } => "failed",
            TaskStatus::Cancelled { .. } => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Failed { reason } => write!(f, "failed: {}", reason),
            TaskStatus::Cancelled { reason } => write!(f, "cancelled: {}", reason),
            other => f.write_str(other.name()),
        }
    }
}

/// A single task on the board.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier for this task.
    pub id: TaskId,
    /// Logical worker role that should execute this task.
    pub owner_role: Role,
    /// Synchronization generation; layer N+1 waits for layer N.
    pub layer: u32,
    /// Tasks that must be done before this one can run.
    #[serde(default)]
    pub depends_on: BTreeSet<TaskId>,
    /// Resource globs the executing worker may mutate. Empty means the
    /// role's default contract applies.
    #[serde(default)]
    pub ownership: Vec<String>,
    /// Prompt or context handed to the worker.
    #[serde(default)]
    pub context: Value,
    /// Current execution status.
    #[serde(default)]
    pub status: TaskStatus,
    /// Payload produced by the worker on completion.
    #[serde(default)]
    pub result: Option<Value>,
    /// Worker currently (or last) assigned to this task.
    #[serde(default)]
    pub worker_id: Option<WorkerId>,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// When the task started execution.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal state.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a pending layer-0 task with no dependencies.
    pub fn new(id: impl Into<TaskId>, role: Role) -> Self {
        Self {
            id: id.into(),
            owner_role: role,
            layer: 0,
            depends_on: BTreeSet::new(),
            ownership: Vec::new(),
            context: Value::Null,
            status: TaskStatus::Pending,
            result: None,
            worker_id: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_layer(mut self, layer: u32) -> Self {
        self.layer = layer;
        self
    }

    pub fn with_dependencies<I, T>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn with_ownership<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ownership.extend(patterns.into_iter().map(Into::into));
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    /// Ownership patterns the worker for this task must claim.
    ///
    /// Falls back to the role's default contract when the task declares none.
    pub fn effective_ownership(&self) -> Vec<String> {
        if self.ownership.is_empty() {
            self.owner_role
                .default_ownership()
                .iter()
                .map(|p| p.to_string())
                .collect()
        } else {
            self.ownership.clone()
        }
    }

    pub(crate) fn start(&mut self, worker: WorkerId) {
        self.status = TaskStatus::InProgress;
        self.worker_id = Some(worker);
        self.started_at = Some(Utc::now());
    }

    pub(crate) fn complete(&mut self, result: Value) {
        self.status = TaskStatus::Done;
        self.result = Some(result);
        self.completed_at = Some(Utc::now());
    }

    pub(crate) fn fail(&mut self, reason: &str) {
        self.status = TaskStatus::Failed {
            reason: reason.to_string(),
        };
        self.completed_at = Some(Utc::now());
    }

    pub(crate) fn cancel(&mut self, reason: &str) {
        self.status = TaskStatus::Cancelled {
            reason: reason.to_string(),
        };
        self.completed_at = Some(Utc::now());
    }

    /// Check if the task is in a terminal state.
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}
