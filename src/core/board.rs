//! Task Board: the dependency graph and the single source of truth for
//! what is runnable now.
//!
//! Tasks live in a petgraph `DiGraph` where an edge `a -> b` means `b`
//! depends on `a`. On top of the explicit edges the board keeps a layer
//! floor (`current_layer`): a task is eligible only when its layer is at
//! or below the floor and every dependency is `done`. The floor is the
//! lowest layer that still has unsettled work, so a failed task pins it.
//!
//! The board is a cheap `Clone` handle; every mutation bumps a version
//! counter on a `watch` channel so waiters (the layer barrier, the
//! coordinator) wake on change instead of polling.

use crate::core::task::{Task, TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::orchestration::WorkerId;
use parking_lot::RwLock;
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use petgraph::Direction;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Default)]
struct BoardState {
    graph: DiGraph<Task, ()>,
    index: HashMap<TaskId, NodeIndex>,
    /// Dependency ids named by some task but not created yet, mapped to
    /// the tasks waiting on them.
    unresolved: BTreeMap<TaskId, BTreeSet<TaskId>>,
    current_layer: u32,
}

impl BoardState {
    fn task(&self, id: &TaskId) -> Result<&Task> {
        self.index
            .get(id)
            .and_then(|&ix| self.graph.node_weight(ix))
            .ok_or_else(|| Error::UnknownTask(id.clone()))
    }

    fn task_mut(&mut self, id: &TaskId) -> Result<&mut Task> {
        match self.index.get(id) {
            Some(&ix) => self
                .graph
                .node_weight_mut(ix)
                .ok_or_else(|| Error::UnknownTask(id.clone())),
            None => Err(Error::UnknownTask(id.clone())),
        }
    }

    fn compute_floor(&self) -> u32 {
        let unsettled = self
            .graph
            .node_weights()
            .filter(|t| !t.status.is_settled())
            .map(|t| t.layer)
            .min();
        match unsettled {
            Some(layer) => layer,
            None => self
                .graph
                .node_weights()
                .map(|t| t.layer + 1)
                .max()
                .unwrap_or(0),
        }
    }

    fn is_eligible(&self, ix: NodeIndex) -> bool {
        let Some(task) = self.graph.node_weight(ix) else {
            return false;
        };
        if task.layer > self.current_layer {
            return false;
        }
        // A dependency that was never created blocks the task.
        let linked = self.graph.neighbors_directed(ix, Direction::Incoming).count();
        if linked < task.depends_on.len() {
            return false;
        }
        self.graph
            .neighbors_directed(ix, Direction::Incoming)
            .all(|dep| {
                self.graph
                    .node_weight(dep)
                    .map(|d| d.status == TaskStatus::Done)
                    .unwrap_or(false)
            })
    }

    /// Recompute the layer floor and promote or demote runnable tasks.
    ///
    /// Returns the previous floor when it moved.
    fn refresh(&mut self) -> Option<u32> {
        let previous = self.current_layer;
        self.current_layer = self.compute_floor();

        let indices: Vec<NodeIndex> = self.graph.node_indices().collect();
        for ix in indices {
            let eligible = self.is_eligible(ix);
            if let Some(task) = self.graph.node_weight_mut(ix) {
                match task.status {
                    TaskStatus::Pending if eligible => task.status = TaskStatus::Runnable,
                    TaskStatus::Runnable if !eligible => task.status = TaskStatus::Pending,
                    _ => {}
                }
            }
        }

        (previous != self.current_layer).then_some(previous)
    }

    /// Ids reachable from `start` along dependency edges, excluding `start`.
    fn dependents_of(&self, start: NodeIndex) -> Vec<NodeIndex> {
        let mut dfs = Dfs::new(&self.graph, start);
        let mut out = Vec::new();
        while let Some(ix) = dfs.next(&self.graph) {
            if ix != start {
                out.push(ix);
            }
        }
        out
    }
}

/// Per-layer status counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LayerProgress {
    pub layer: u32,
    pub total: usize,
    pub pending: usize,
    pub runnable: usize,
    pub in_progress: usize,
    pub done: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl LayerProgress {
    /// Every task in the layer reached a terminal state.
    pub fn is_settled(&self) -> bool {
        self.done + self.failed + self.cancelled == self.total
    }
}

/// Shared handle to the task graph of one orchestration run.
#[derive(Clone)]
pub struct TaskBoard {
    state: Arc<RwLock<BoardState>>,
    version: Arc<watch::Sender<u64>>,
}

impl TaskBoard {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            state: Arc::new(RwLock::new(BoardState::default())),
            version: Arc::new(version),
        }
    }

    /// Build a board from a batch of tasks, in order.
    ///
    /// Fails on the first rejected task, or if any dependency is still
    /// unresolved once every task has been added.
    pub fn from_tasks(tasks: impl IntoIterator<Item = Task>) -> Result<Self> {
        let board = Self::new();
        for task in tasks {
            board.create_task(task)?;
        }
        board.validate_complete()?;
        Ok(board)
    }

    /// Apply a mutation, then refresh eligibility and wake subscribers.
    fn mutate<T>(&self, f: impl FnOnce(&mut BoardState) -> Result<T>) -> Result<T> {
        let (out, moved, floor) = {
            let mut state = self.state.write();
            let out = f(&mut *state)?;
            let moved = state.refresh();
            (out, moved, state.current_layer)
        };
        if let Some(previous) = moved {
            info!(from = previous, to = floor, "Layer floor moved");
        }
        self.version.send_modify(|v| *v += 1);
        Ok(out)
    }

    /// Add a task to the board.
    ///
    /// The task's status and result are reset: it enters as `pending` and
    /// is promoted to `runnable` immediately if it is eligible.
    ///
    /// # Errors
    /// - `DuplicateId` if a task with the same id exists.
    /// - `Cycle` if the task depends on itself, on a task in a higher
    ///   layer, or if its edges close a cycle. The board is unchanged.
    /// - `LayerClosed` if the task sits below a layer where work started.
    pub fn create_task(&self, mut task: Task) -> Result<()> {
        let id = task.id.clone();
        let layer = task.layer;
        self.mutate(|state| {
            if state.index.contains_key(&id) {
                return Err(Error::DuplicateId(id.clone()));
            }
            if task.depends_on.contains(&id) {
                return Err(Error::Cycle {
                    task_id: id.clone(),
                    detail: "task depends on itself".to_string(),
                });
            }

            let mut incoming = Vec::new();
            for dep in &task.depends_on {
                if let Some(&dep_ix) = state.index.get(dep) {
                    let dep_layer = state.graph[dep_ix].layer;
                    if dep_layer > layer {
                        return Err(Error::Cycle {
                            task_id: id.clone(),
                            detail: format!(
                                "depends on {} at layer {}, which runs after layer {}",
                                dep, dep_layer, layer
                            ),
                        });
                    }
                    incoming.push(dep_ix);
                }
            }

            let mut outgoing = Vec::new();
            if let Some(waiting) = state.unresolved.get(&id) {
                for waiter in waiting {
                    if let Some(&w_ix) = state.index.get(waiter) {
                        let w_layer = state.graph[w_ix].layer;
                        if w_layer < layer {
                            return Err(Error::Cycle {
                                task_id: id.clone(),
                                detail: format!(
                                    "{} at layer {} depends on it from a lower layer",
                                    waiter, w_layer
                                ),
                            });
                        }
                        outgoing.push(w_ix);
                    }
                }
            }

            if layer < state.current_layer {
                let started = state
                    .graph
                    .node_weights()
                    .any(|t| t.layer >= layer && t.started_at.is_some());
                if started {
                    return Err(Error::LayerClosed {
                        task_id: id.clone(),
                        layer,
                        current: state.current_layer,
                    });
                }
            }

            task.status = TaskStatus::Pending;
            task.result = None;
            task.worker_id = None;
            task.started_at = None;
            task.completed_at = None;
            let missing: Vec<TaskId> = task
                .depends_on
                .iter()
                .filter(|d| !state.index.contains_key(*d))
                .cloned()
                .collect();

            let ix = state.graph.add_node(task);
            for dep_ix in incoming {
                state.graph.add_edge(dep_ix, ix, ());
            }
            for w_ix in outgoing {
                state.graph.add_edge(ix, w_ix, ());
            }
            if is_cyclic_directed(&state.graph) {
                // The new node is the last index, so removal keeps every
                // other index stable.
                state.graph.remove_node(ix);
                return Err(Error::Cycle {
                    task_id: id.clone(),
                    detail: "dependency edges close a cycle".to_string(),
                });
            }

            state.index.insert(id.clone(), ix);
            state.unresolved.remove(&id);
            for dep in missing {
                state.unresolved.entry(dep).or_default().insert(id.clone());
            }
            debug!(task_id = %id, layer, "Task created");
            Ok(())
        })
    }

    /// Look up a task by id.
    pub fn get_task(&self, id: &TaskId) -> Result<Task> {
        self.state.read().task(id).cloned()
    }

    /// Snapshot of every task, in creation order.
    pub fn all_tasks(&self) -> Vec<Task> {
        self.state.read().graph.node_weights().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The lowest layer that still has unsettled work.
    pub fn current_layer(&self) -> u32 {
        self.state.read().current_layer
    }

    /// Lazy sequence of tasks that are runnable now.
    ///
    /// The sequence is a snapshot of ids ordered by layer then creation;
    /// each task is re-checked as it is consumed, so one that was started
    /// in the meantime is skipped. Call again for a fresh sequence.
    pub fn runnable_tasks(&self) -> RunnableTasks {
        let state = self.state.read();
        let mut ids: Vec<(u32, usize, TaskId)> = state
            .graph
            .node_indices()
            .filter_map(|ix| {
                let t = &state.graph[ix];
                (t.status == TaskStatus::Runnable).then(|| (t.layer, ix.index(), t.id.clone()))
            })
            .collect();
        ids.sort();
        RunnableTasks {
            board: self.clone(),
            ids: ids.into_iter().map(|(_, _, id)| id).collect(),
        }
    }

    /// Move a runnable task to `in_progress` under the given worker.
    pub fn start_task(&self, id: &TaskId, worker: WorkerId) -> Result<()> {
        self.mutate(|state| {
            let task = state.task_mut(id)?;
            if task.status != TaskStatus::Runnable {
                return Err(Error::NotRunnable {
                    id: id.clone(),
                    status: task.status.name().to_string(),
                });
            }
            task.start(worker);
            debug!(task_id = %id, worker_id = %worker, "Task started");
            Ok(())
        })
    }

    /// Record a successful result for an in-progress task.
    pub fn mark_done(&self, id: &TaskId, result: Value) -> Result<()> {
        self.mutate(|state| {
            let task = state.task_mut(id)?;
            if task.status != TaskStatus::InProgress {
                return Err(Error::NotInProgress {
                    id: id.clone(),
                    status: task.status.name().to_string(),
                });
            }
            task.complete(result);
            debug!(task_id = %id, "Task done");
            Ok(())
        })
    }

    /// Record a failure for an in-progress task.
    pub fn mark_failed(&self, id: &TaskId, reason: &str) -> Result<()> {
        self.mutate(|state| {
            let task = state.task_mut(id)?;
            if task.status != TaskStatus::InProgress {
                return Err(Error::NotInProgress {
                    id: id.clone(),
                    status: task.status.name().to_string(),
                });
            }
            task.fail(reason);
            debug!(task_id = %id, reason, "Task failed");
            Ok(())
        })
    }

    /// Return an in-progress task to the runnable pool, e.g. to hand it to
    /// a replacement worker.
    pub fn requeue(&self, id: &TaskId) -> Result<()> {
        self.mutate(|state| {
            let task = state.task_mut(id)?;
            if task.status != TaskStatus::InProgress {
                return Err(Error::NotInProgress {
                    id: id.clone(),
                    status: task.status.name().to_string(),
                });
            }
            task.status = TaskStatus::Pending;
            task.worker_id = None;
            task.started_at = None;
            Ok(())
        })
    }

    /// Cancel a task and every transitive dependent.
    ///
    /// Terminal tasks are left alone. Returns the ids that were cancelled.
    pub fn cancel_task(&self, id: &TaskId, reason: &str) -> Result<Vec<TaskId>> {
        self.mutate(|state| {
            let ix = *state
                .index
                .get(id)
                .ok_or_else(|| Error::UnknownTask(id.clone()))?;
            let mut targets = vec![ix];
            targets.extend(state.dependents_of(ix));
            Ok(cancel_nodes(state, targets, reason))
        })
    }

    /// Cancel every transitive dependent of a task, leaving the task itself.
    pub fn cancel_dependents(&self, id: &TaskId, reason: &str) -> Result<Vec<TaskId>> {
        self.mutate(|state| {
            let ix = *state
                .index
                .get(id)
                .ok_or_else(|| Error::UnknownTask(id.clone()))?;
            let targets = state.dependents_of(ix);
            Ok(cancel_nodes(state, targets, reason))
        })
    }

    /// Cancel every task that has not reached a terminal state.
    pub fn cancel_remaining(&self, reason: &str) -> Vec<TaskId> {
        self.mutate(|state| {
            let targets: Vec<NodeIndex> = state.graph.node_indices().collect();
            Ok(cancel_nodes(state, targets, reason))
        })
        .unwrap_or_default()
    }

    /// Point an in-progress task at a different worker.
    pub fn reassign(&self, id: &TaskId, worker: WorkerId) -> Result<()> {
        self.mutate(|state| {
            let task = state.task_mut(id)?;
            if task.status != TaskStatus::InProgress {
                return Err(Error::NotInProgress {
                    id: id.clone(),
                    status: task.status.name().to_string(),
                });
            }
            task.worker_id = Some(worker);
            Ok(())
        })
    }

    /// Task ids grouped by layer.
    pub fn layers(&self) -> BTreeMap<u32, Vec<TaskId>> {
        let state = self.state.read();
        let mut out: BTreeMap<u32, Vec<TaskId>> = BTreeMap::new();
        for task in state.graph.node_weights() {
            out.entry(task.layer).or_default().push(task.id.clone());
        }
        out
    }

    /// The highest layer on the board, if any.
    pub fn max_layer(&self) -> Option<u32> {
        self.state.read().graph.node_weights().map(|t| t.layer).max()
    }

    /// Status counts for one layer.
    pub fn layer_progress(&self, layer: u32) -> LayerProgress {
        let state = self.state.read();
        let mut progress = LayerProgress {
            layer,
            ..Default::default()
        };
        for task in state.graph.node_weights().filter(|t| t.layer == layer) {
            progress.total += 1;
            match task.status {
                TaskStatus::Pending => progress.pending += 1,
                TaskStatus::Runnable => progress.runnable += 1,
                TaskStatus::InProgress => progress.in_progress += 1,
                TaskStatus::Done => progress.done += 1,
                TaskStatus::Failed { .. } => progress.failed += 1,
                TaskStatus::Cancelled { .. } => progress.cancelled += 1,
            }
        }
        progress
    }

    /// Ids of failed tasks at the given layer.
    pub fn failed_in_layer(&self, layer: u32) -> Vec<TaskId> {
        self.state
            .read()
            .graph
            .node_weights()
            .filter(|t| t.layer == layer && matches!(t.status, TaskStatus::Failed { .. }))
            .map(|t| t.id.clone())
            .collect()
    }

    /// Ids of every failed task on the board.
    pub fn failed_tasks(&self) -> Vec<TaskId> {
        self.state
            .read()
            .graph
            .node_weights()
            .filter(|t| matches!(t.status, TaskStatus::Failed { .. }))
            .map(|t| t.id.clone())
            .collect()
    }

    /// Every task reached a terminal state.
    pub fn is_drained(&self) -> bool {
        self.state
            .read()
            .graph
            .node_weights()
            .all(|t| t.status.is_terminal())
    }

    /// Tasks in an order that respects both dependency edges and layers.
    pub fn topological_order(&self) -> Result<Vec<Task>> {
        let state = self.state.read();
        let sorted = toposort(&state.graph, None).map_err(|cycle| Error::Cycle {
            task_id: state.graph[cycle.node_id()].id.clone(),
            detail: "cycle found while ordering tasks".to_string(),
        })?;
        let mut tasks: Vec<Task> = sorted
            .into_iter()
            .map(|ix| state.graph[ix].clone())
            .collect();
        // Edges never point to a lower layer, so a stable sort by layer
        // keeps the order topological.
        tasks.sort_by_key(|t| t.layer);
        Ok(tasks)
    }

    /// Fail if any task names a dependency that was never created.
    pub fn validate_complete(&self) -> Result<()> {
        let state = self.state.read();
        if let Some((missing, waiting)) = state.unresolved.iter().next() {
            let task_id = waiting
                .iter()
                .next()
                .cloned()
                .unwrap_or_else(|| missing.clone());
            return Err(Error::UnresolvedDependency {
                task_id,
                missing: missing.clone(),
            });
        }
        Ok(())
    }

    /// Receiver that changes on every board mutation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }
}

fn cancel_nodes(state: &mut BoardState, targets: Vec<NodeIndex>, reason: &str) -> Vec<TaskId> {
    let mut cancelled = Vec::new();
    for ix in targets {
        if let Some(task) = state.graph.node_weight_mut(ix) {
            if !task.status.is_terminal() {
                task.cancel(reason);
                debug!(task_id = %task.id, reason, "Task cancelled");
                cancelled.push(task.id.clone());
            }
        }
    }
    cancelled
}

impl Default for TaskBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskBoard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("TaskBoard")
            .field("tasks", &state.graph.node_count())
            .field("edges", &state.graph.edge_count())
            .field("current_layer", &state.current_layer)
            .finish()
    }
}

/// Lazy, re-checking iterator over runnable tasks.
pub struct RunnableTasks {
    board: TaskBoard,
    ids: VecDeque<TaskId>,
}

impl Iterator for RunnableTasks {
    type Item = Task;

    fn next(&mut self) -> Option<Task> {
        while let Some(id) = self.ids.pop_front() {
            if let Ok(task) = self.board.get_task(&id) {
                if task.status == TaskStatus::Runnable {
                    return Some(task);
                }
            }
        }
        None
    }
}
