//! Layer Barrier: turns board bookkeeping into a suspension point.

use crate::core::{TaskBoard, TaskId, TaskStatus};

/// How a wait on a layer ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BarrierOutcome {
    /// The layer floor moved past the awaited layer.
    Complete,
    /// Tasks at or below the layer failed.
    Failed(Vec<TaskId>),
}

/// Waits for the board's layer floor to pass a layer.
#[derive(Debug, Clone)]
pub struct LayerBarrier {
    board: TaskBoard,
}

impl LayerBarrier {
    pub fn new(board: TaskBoard) -> Self {
        Self { board }
    }

    /// Suspend until `current_layer > layer`.
    ///
    /// With `stop_on_failure` the wait ends as soon as any task at or
    /// below the layer has failed. Without it, a failure ends the wait
    /// only once every such task is terminal, since the floor will never
    /// move past a failed task.
    pub async fn await_layer_complete(&self, layer: u32, stop_on_failure: bool) -> BarrierOutcome {
        let mut changes = self.board.subscribe();
        loop {
            changes.borrow_and_update();
            if let Some(outcome) = self.check(layer, stop_on_failure) {
                return outcome;
            }
            if changes.changed().await.is_err() {
                // The board handle we hold keeps the sender alive.
                return self
                    .check(layer, stop_on_failure)
                    .unwrap_or(BarrierOutcome::Complete);
            }
        }
    }

    /// Non-blocking version of the barrier condition.
    pub fn check(&self, layer: u32, stop_on_failure: bool) -> Option<BarrierOutcome> {
        if self.board.current_layer() > layer {
            return Some(BarrierOutcome::Complete);
        }
        let tasks = self.board.all_tasks();
        let mut failed = Vec::new();
        let mut settled = true;
        for task in tasks.iter().filter(|t| t.layer <= layer) {
            match task.status {
                TaskStatus::Failed { .. } => failed.push(task.id.clone()),
                ref s if !s.is_terminal() => settled = false,
                _ => {}
            }
        }
        if !failed.is_empty() && (stop_on_failure || settled) {
            return Some(BarrierOutcome::Failed(failed));
        }
        None
    }
}
