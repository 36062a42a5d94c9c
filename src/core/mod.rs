//! Core domain models for orchestration runs.
//!
//! This module contains the task data model, worker roles, and the Task
//! Board that tracks the dependency graph and layer floor.

pub mod board;
pub mod role;
pub mod task;

pub use board::{LayerProgress, RunnableTasks, TaskBoard};
pub use role::Role;
pub use task::{Task, TaskId, TaskStatus};
