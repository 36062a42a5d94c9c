//! Run results: per-task outcomes, anomalies, and the synthesized summary.

use crate::core::{Role, Task, TaskId, TaskStatus};
use crate::orchestration::chain::FollowUpRecord;
use crate::orchestration::health::Escalation;
use crate::orchestration::mode::OrchestrationMode;
use crate::orchestration::router::Address;
use crate::orchestration::worker::WorkerId;
use crate::workflow::RunId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;

/// Final state of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub role: Role,
    pub layer: u32,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<WorkerId>,
}

impl From<Task> for TaskOutcome {
    fn from(task: Task) -> Self {
        Self {
            task_id: task.id,
            role: task.owner_role,
            layer: task.layer,
            status: task.status,
            result: task.result,
            worker_id: task.worker_id,
        }
    }
}

/// Something unusual that happened during a run without ending it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Anomaly {
    ForcedTermination {
        worker_id: WorkerId,
    },
    GapDetected {
        from: Address,
        to: Address,
        expected: u64,
        received: u64,
    },
    MessageDropped {
        from: Address,
        to: Address,
        received: u64,
    },
    DeferredSpawn {
        task_id: TaskId,
        conflicting_worker_id: WorkerId,
        pattern: String,
    },
    StallEscalation {
        worker_id: WorkerId,
        task_ids: Vec<TaskId>,
        step: Escalation,
        consecutive_stalls: u32,
    },
    TaskRetried {
        task_id: TaskId,
        attempt: u32,
        error: String,
    },
    /// A follow-up the board refused, or one past the run's budget.
    FollowUpRejected {
        task_id: TaskId,
        triggered_by: TaskId,
        reason: String,
    },
}

/// Why a run was aborted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "cause")]
pub enum AbortCause {
    TaskFailed {
        task_ids: Vec<TaskId>,
    },
    OwnershipConflict {
        task_id: TaskId,
        conflicting_worker_id: WorkerId,
        pattern: String,
    },
    Stalled {
        worker_id: WorkerId,
        task_ids: Vec<TaskId>,
    },
    GapDetected {
        from: Address,
        to: Address,
        expected: u64,
        received: u64,
    },
    Timeout {
        after: Duration,
    },
    Structural {
        message: String,
    },
}

impl std::fmt::Display for AbortCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortCause::TaskFailed { task_ids } => {
                let ids: Vec<&str> = task_ids.iter().map(|t| t.as_str()).collect();
                write!(f, "task(s) failed: {}", ids.join(", "))
            }
            AbortCause::OwnershipConflict {
                task_id,
                conflicting_worker_id,
                pattern,
            } => write!(
                f,
                "task {} cannot claim ownership: {} is held by worker {}",
                task_id,
                pattern,
                conflicting_worker_id.short()
            ),
            AbortCause::Stalled {
                worker_id,
                task_ids,
            } => {
                let ids: Vec<&str> = task_ids.iter().map(|t| t.as_str()).collect();
                write!(
                    f,
                    "worker {} stalled past its budget on {}",
                    worker_id.short(),
                    ids.join(", ")
                )
            }
            AbortCause::GapDetected {
                from,
                to,
                expected,
                received,
            } => write!(
                f,
                "message gap from {} to {}: expected #{}, received #{}",
                from, to, expected, received
            ),
            AbortCause::Timeout { after } => write!(f, "run timed out after {:?}", after),
            AbortCause::Structural { message } => write!(f, "{}", message),
        }
    }
}

/// Combines task results into the run's summary.
///
/// Semantic conflicts between results (two workers recommending
/// different things) are the synthesizer's to resolve.
pub trait Synthesizer: Send + Sync {
    fn synthesize(&self, goal: &str, outcomes: &[TaskOutcome]) -> Value;
}

/// Collects every completed task's result into an object keyed by task id.
#[derive(Debug, Clone, Copy, Default)]
pub struct CollectSynthesizer;

impl Synthesizer for CollectSynthesizer {
    fn synthesize(&self, _goal: &str, outcomes: &[TaskOutcome]) -> Value {
        let mut map = Map::new();
        for outcome in outcomes {
            if outcome.status == TaskStatus::Done {
                map.insert(
                    outcome.task_id.to_string(),
                    outcome.result.clone().unwrap_or(Value::Null),
                );
            }
        }
        Value::Object(map)
    }
}

/// Structured report of a run, complete or partial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesizedResult {
    pub run_id: RunId,
    pub goal: String,
    pub mode: OrchestrationMode,
    pub completed: Vec<TaskOutcome>,
    pub failed: Vec<TaskOutcome>,
    pub cancelled: Vec<TaskOutcome>,
    pub anomalies: Vec<Anomaly>,
    /// Tasks added during the run because of another task's result.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub follow_ups: Vec<FollowUpRecord>,
    pub summary: Value,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Set when the run was aborted and this is the partial result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted: Option<AbortCause>,
}

impl SynthesizedResult {
    /// Sort final task states into completed, failed and cancelled, then
    /// run the synthesizer over them.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        run_id: RunId,
        goal: &str,
        mode: OrchestrationMode,
        tasks: Vec<Task>,
        anomalies: Vec<Anomaly>,
        synthesizer: &dyn Synthesizer,
        started_at: DateTime<Utc>,
        aborted: Option<AbortCause>,
    ) -> Self {
        let outcomes: Vec<TaskOutcome> = tasks.into_iter().map(TaskOutcome::from).collect();
        let summary = synthesizer.synthesize(goal, &outcomes);

        let mut completed = Vec::new();
        let mut failed = Vec::new();
        let mut cancelled = Vec::new();
        for outcome in outcomes {
            match outcome.status {
                TaskStatus::Done => completed.push(outcome),
                TaskStatus::Failed { .. } => failed.push(outcome),
                _ => cancelled.push(outcome),
            }
        }

        Self {
            run_id,
            goal: goal.to_string(),
            mode,
            completed,
            failed,
            cancelled,
            anomalies,
            follow_ups: Vec::new(),
            summary,
            started_at,
            finished_at: Utc::now(),
            aborted,
        }
    }

    pub fn with_follow_ups(mut self, follow_ups: Vec<FollowUpRecord>) -> Self {
        self.follow_ups = follow_ups;
        self
    }

    /// Wall-clock duration of the run.
    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }

    /// No task failed and the run was not aborted.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.aborted.is_none()
    }

    /// Result payloads of completed tasks, keyed by task id.
    pub fn results(&self) -> BTreeMap<TaskId, Value> {
        self.completed
            .iter()
            .map(|o| (o.task_id.clone(), o.result.clone().unwrap_or(Value::Null)))
            .collect()
    }

    pub fn outcome(&self, task_id: &TaskId) -> Option<&TaskOutcome> {
        self.completed
            .iter()
            .chain(&self.failed)
            .chain(&self.cancelled)
            .find(|o| &o.task_id == task_id)
    }
}
