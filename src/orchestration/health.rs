//! Stall escalation policy.
//!
//! A stalled worker is not killed on sight. The coordinator escalates
//! through three steps, decided purely from counters:
//! - `Guide` while the worker's consecutive stalls stay within the guide budget
//! - `Replace` its task onto a fresh worker while the task has replacements left
//! - `Cancel` the worker's tasks otherwise

use crate::core::TaskId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default number of stalled checks answered with guidance.
pub const DEFAULT_GUIDE_ATTEMPTS: u32 = 2;

/// Default number of replacement workers per task.
pub const DEFAULT_MAX_REPLACEMENTS: u32 = 1;

/// What to do about a stalled worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Escalation {
    /// Send a guidance message and keep waiting.
    Guide,
    /// Terminate the worker and hand its task to a new one.
    Replace,
    /// Terminate the worker and cancel its tasks.
    Cancel,
}

impl std::fmt::Display for Escalation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Escalation::Guide => write!(f, "guide"),
            Escalation::Replace => write!(f, "replace"),
            Escalation::Cancel => write!(f, "cancel"),
        }
    }
}

/// Budgets for stall escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscalationPolicy {
    pub guide_attempts: u32,
    pub max_replacements: u32,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            guide_attempts: DEFAULT_GUIDE_ATTEMPTS,
            max_replacements: DEFAULT_MAX_REPLACEMENTS,
        }
    }
}

impl EscalationPolicy {
    /// Decide the next step.
    ///
    /// # Arguments
    ///
    /// * `consecutive_stalls` - Stalled checks in a row for this worker (1 on the first)
    /// * `replacements` - Replacement workers already used for the task
    pub fn decide(&self, consecutive_stalls: u32, replacements: u32) -> Escalation {
        if consecutive_stalls <= self.guide_attempts {
            Escalation::Guide
        } else if replacements < self.max_replacements {
            Escalation::Replace
        } else {
            Escalation::Cancel
        }
    }
}

/// Counts attempts per task, for both failure retries and stall
/// replacements.
#[derive(Debug, Clone, Default)]
pub struct RetryTracker {
    retries: HashMap<TaskId, u32>,
}

impl RetryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns 0 for a task never retried.
    pub fn get_retries(&self, task_id: &TaskId) -> u32 {
        self.retries.get(task_id).copied().unwrap_or(0)
    }

    /// Increment the count for a task and return the new value.
    pub fn increment(&mut self, task_id: &TaskId) -> u32 {
        let count = self.retries.entry(task_id.clone()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn reset(&mut self, task_id: &TaskId) {
        self.retries.remove(task_id);
    }

    pub fn len(&self) -> usize {
        self.retries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.retries.is_empty()
    }
}
