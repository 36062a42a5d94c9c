//! Follow-up chaining: tasks a run adds because of another task's result.
//!
//! After every completed task the coordinator asks its [`FollowUp`] source
//! for more work. Returned tasks go through `TaskBoard::create_task` like
//! any other, so a follow-up aimed at a layer that already closed is
//! rejected rather than run out of order.

use crate::core::{Role, Task, TaskId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Decides which tasks a completed task's result calls for.
pub trait FollowUp: Send + Sync {
    fn follow_ups(&self, task: &Task, result: &Value) -> Vec<Task>;
}

/// Never adds anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFollowUps;

impl FollowUp for NoFollowUps {
    fn follow_ups(&self, _task: &Task, _result: &Value) -> Vec<Task> {
        Vec::new()
    }
}

/// A task added by a follow-up rule, as recorded in the run result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowUpRecord {
    pub task_id: TaskId,
    pub triggered_by: TaskId,
    pub role: Role,
    pub layer: u32,
}

/// Built-in rules keyed on the finishing task's role.
///
/// Rules only look at well-known result fields; a result without them adds
/// nothing. Every follow-up lands one layer above its trigger and depends
/// on it. Ids are `<trigger>.<role>`, so the same rule never fires twice
/// for one trigger.
///
/// | Role | Field | Adds |
/// |---|---|---|
/// | researcher | `issues_found` with `issue_types` quality/complexity | refactorer |
/// | | ... `missing_tests` | qa-verifier |
/// | | ... `security` | security-auditor |
/// | | `issues_found: false` | docs-maintainer |
/// | security-auditor | a `critical` finding | technical-impl |
/// | | a `critical` or `high` finding | docs-maintainer |
/// | | `code_changes_suggested` | refactorer |
/// | qa-verifier | `tests_written > 0` | refactorer |
/// | | `implementation_complete` or `coverage_increased` | docs-maintainer |
/// | docs-maintainer | `api_changes` | researcher |
/// | refactorer | `refactored` | docs-maintainer |
#[derive(Debug, Clone, Copy, Default)]
pub struct ResultRules;

impl ResultRules {
    fn roles_for(role: &Role, result: &Value) -> Vec<Role> {
        let flag = |key: &str| result.get(key).and_then(Value::as_bool) == Some(true);
        let mut next = Vec::new();

        match role {
            Role::Researcher => match result.get("issues_found").and_then(Value::as_bool) {
                Some(true) => {
                    let types: Vec<&str> = result
                        .get("issue_types")
                        .and_then(Value::as_array)
                        .map(|a| a.iter().filter_map(Value::as_str).collect())
                        .unwrap_or_default();
                    if types.iter().any(|t| *t == "quality" || *t == "complexity") {
                        next.push(Role::Refactorer);
                    }
                    if types.contains(&"missing_tests") {
                        next.push(Role::QaVerifier);
                    }
                    if types.contains(&"security") {
                        next.push(Role::SecurityAuditor);
                    }
                }
                Some(false) => next.push(Role::DocsMaintainer),
                None => {}
            },
            Role::SecurityAuditor => {
                let severities: Vec<&str> = result
                    .get("findings")
                    .and_then(Value::as_array)
                    .map(|a| {
                        a.iter()
                            .filter_map(|f| f.get("severity").and_then(Value::as_str))
                            .collect()
                    })
                    .unwrap_or_default();
                let critical = severities.contains(&"critical");
                if critical {
                    next.push(Role::TechnicalImpl);
                }
                if critical || severities.contains(&"high") {
                    next.push(Role::DocsMaintainer);
                }
                if flag("code_changes_suggested") {
                    next.push(Role::Refactorer);
                }
            }
            Role::QaVerifier => {
                if result.get("tests_written").and_then(Value::as_u64).unwrap_or(0) > 0 {
                    next.push(Role::Refactorer);
                }
                if flag("implementation_complete") || flag("coverage_increased") {
                    next.push(Role::DocsMaintainer);
                }
            }
            Role::DocsMaintainer => {
                if flag("api_changes") {
                    next.push(Role::Researcher);
                }
            }
            Role::Refactorer => {
                if flag("refactored") {
                    next.push(Role::DocsMaintainer);
                }
            }
            Role::TechnicalImpl | Role::Custom(_) => {}
        }
        next
    }
}

impl FollowUp for ResultRules {
    fn follow_ups(&self, task: &Task, result: &Value) -> Vec<Task> {
        Self::roles_for(&task.owner_role, result)
            .into_iter()
            .map(|role| {
                let id = format!("{}.{}", task.id, role);
                let context = json!({
                    "prompt": format!("Follow up on {} as {}", task.id, role),
                    "triggered_by": task.id,
                    "trigger_result": result,
                });
                Task::new(id, role)
                    .with_layer(task.layer + 1)
                    .with_dependencies([task.id.clone()])
                    .with_context(context)
            })
            .collect()
    }
}
