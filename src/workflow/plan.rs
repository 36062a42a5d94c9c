//! Plan files: a goal decomposed into tasks, stored as TOML.
//!
//! ```toml
//! goal = "Add rate limiting to the API"
//!
//! [[task]]
//! id = "survey"
//! role = "researcher"
//!
//! [[task]]
//! id = "implement"
//! role = "technical-impl"
//! layer = 1
//! depends_on = ["survey"]
//! prompt = "Implement the limiter"
//! command = ["cargo", "build"]
//! ```

use crate::core::{Role, Task, TaskId};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use tracing::debug;

/// One `[[task]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanTask {
    pub id: TaskId,
    pub role: Role,
    #[serde(default)]
    pub layer: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<TaskId>,
    /// Empty means the role's default ownership.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ownership: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Program and arguments the command executor runs for this task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
}

impl PlanTask {
    pub fn new(id: impl Into<TaskId>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
            layer: 0,
            depends_on: Vec::new(),
            ownership: Vec::new(),
            prompt: None,
            command: None,
        }
    }
}

/// A goal and the tasks that achieve it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub goal: String,
    #[serde(default, rename = "task")]
    pub tasks: Vec<PlanTask>,
}

impl Plan {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            tasks: Vec::new(),
        }
    }

    /// Load and validate a plan file.
    pub fn load(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Loading plan");
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let plan: Self = toml::from_str(s)?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Write the plan to a file.
    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    /// Checks that do not need the task board: a goal, at least one task,
    /// and well-formed commands. Graph problems are the board's to report.
    pub fn validate(&self) -> Result<()> {
        if self.goal.trim().is_empty() {
            return Err(Error::Validation("plan has no goal".to_string()));
        }
        if self.tasks.is_empty() {
            return Err(Error::Validation("plan has no tasks".to_string()));
        }
        for task in &self.tasks {
            if task.id.as_str().trim().is_empty() {
                return Err(Error::Validation("task with an empty id".to_string()));
            }
            if matches!(&task.command, Some(cmd) if cmd.is_empty()) {
                return Err(Error::Validation(format!(
                    "task {} has an empty command",
                    task.id
                )));
            }
        }
        Ok(())
    }

    /// Number of different roles the plan needs.
    pub fn distinct_roles(&self) -> usize {
        self.tasks
            .iter()
            .map(|t| &t.role)
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// Convert into board tasks.
    ///
    /// Each task's context carries its prompt (the goal when none is given)
    /// and its command, if any.
    pub fn into_tasks(self) -> Vec<Task> {
        let goal = self.goal;
        self.tasks
            .into_iter()
            .map(|pt| {
                let mut context = Map::new();
                context.insert(
                    "prompt".to_string(),
                    Value::String(pt.prompt.unwrap_or_else(|| goal.clone())),
                );
                if let Some(command) = pt.command {
                    context.insert(
                        "command".to_string(),
                        Value::Array(command.into_iter().map(Value::String).collect()),
                    );
                }
                Task::new(pt.id, pt.role)
                    .with_layer(pt.layer)
                    .with_dependencies(pt.depends_on)
                    .with_ownership(pt.ownership)
                    .with_context(Value::Object(context))
            })
            .collect()
    }
}
