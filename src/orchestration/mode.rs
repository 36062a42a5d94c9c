//! Mode Selector: concurrent team orchestration or sequential delegation.

use serde::{Deserialize, Serialize};
use tracing::info;

/// Distinct roles a goal must need before running a team pays off.
pub const MIN_CONCURRENT_ROLES: usize = 3;

/// How a run executes its tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationMode {
    /// Workers run in parallel under the layer barrier.
    Concurrent,
    /// The coordinator runs one task at a time itself.
    Sequential,
}

impl std::fmt::Display for OrchestrationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrchestrationMode::Concurrent => write!(f, "concurrent"),
            OrchestrationMode::Sequential => write!(f, "sequential"),
        }
    }
}

/// Mode requested by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModePreference {
    #[default]
    Auto,
    Concurrent,
    Sequential,
}

impl std::str::FromStr for ModePreference {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "auto" => Ok(ModePreference::Auto),
            "concurrent" | "team" => Ok(ModePreference::Concurrent),
            "sequential" => Ok(ModePreference::Sequential),
            other => Err(format!("unknown mode: {}", other)),
        }
    }
}

/// What the runtime hosting the workers can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub can_spawn_workers: bool,
    pub can_pass_messages: bool,
}

impl Capabilities {
    /// An in-process tokio runtime can do both.
    pub fn full() -> Self {
        Self {
            can_spawn_workers: true,
            can_pass_messages: true,
        }
    }

    pub fn none() -> Self {
        Self {
            can_spawn_workers: false,
            can_pass_messages: false,
        }
    }

    fn supports_team(&self) -> bool {
        self.can_spawn_workers && self.can_pass_messages
    }
}

/// Size of the problem, as far as mode selection cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TaskEstimate {
    pub tasks: usize,
    pub distinct_roles: usize,
}

/// The chosen mode and a human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModeDecision {
    pub mode: OrchestrationMode,
    pub reason: String,
}

/// Pick a mode for a run.
///
/// Concurrent mode requires worker spawning, message passing, and at
/// least [`MIN_CONCURRENT_ROLES`] distinct roles. An explicit preference
/// overrides the role count but never the capabilities.
pub fn select(
    capabilities: Capabilities,
    estimate: TaskEstimate,
    preference: ModePreference,
) -> ModeDecision {
    let decision = decide(capabilities, estimate, preference);
    info!(
        mode = %decision.mode,
        tasks = estimate.tasks,
        distinct_roles = estimate.distinct_roles,
        reason = %decision.reason,
        "Orchestration mode selected"
    );
    decision
}

fn decide(
    capabilities: Capabilities,
    estimate: TaskEstimate,
    preference: ModePreference,
) -> ModeDecision {
    let sequential = |reason: String| ModeDecision {
        mode: OrchestrationMode::Sequential,
        reason,
    };

    if preference == ModePreference::Sequential {
        return sequential("sequential mode requested".to_string());
    }
    if !capabilities.supports_team() {
        return sequential(
            "runtime cannot spawn workers or pass messages; falling back to sequential".to_string(),
        );
    }
    if preference == ModePreference::Concurrent {
        return ModeDecision {
            mode: OrchestrationMode::Concurrent,
            reason: "concurrent mode requested".to_string(),
        };
    }
    if estimate.distinct_roles < MIN_CONCURRENT_ROLES {
        return sequential(format!(
            "{} distinct role(s) needed, fewer than {}",
            estimate.distinct_roles, MIN_CONCURRENT_ROLES
        ));
    }
    ModeDecision {
        mode: OrchestrationMode::Concurrent,
        reason: format!(
            "{} distinct roles across {} tasks",
            estimate.distinct_roles, estimate.tasks
        ),
    }
}
