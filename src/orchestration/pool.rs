//! Worker pool for concurrent orchestration runs.
//!
//! The `WorkerPool` spawns workers as tokio tasks, claims their ownership
//! up front, tracks liveness from the messages they send, and runs the
//! shutdown handshake when they are no longer needed. Lifecycle changes
//! are emitted as [`WorkerEvent`]s so the coordinator can record them
//! without polling.

use crate::core::{Role, TaskId};
use crate::error::{Error, Result};
use crate::orchestration::ownership::OwnershipRegistry;
use crate::orchestration::router::{Address, MessageKind, MessageRouter, Outbox};
use crate::orchestration::worker::{run_worker, Assignment, TaskExecutor, WorkerId, WorkerState};
use crate::util;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Events emitted by the pool for lifecycle changes.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Spawned {
        worker_id: WorkerId,
        role: Role,
    },
    /// A stalled worker sent a message again.
    Recovered {
        worker_id: WorkerId,
    },
    Stalled {
        worker_id: WorkerId,
        idle: Duration,
        consecutive_stalls: u32,
    },
    Terminated {
        worker_id: WorkerId,
        /// The worker did not acknowledge within the grace period.
        forced: bool,
    },
}

/// How a termination ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationOutcome {
    Graceful,
    Forced,
    AlreadyTerminated,
}

/// Returned by [`WorkerPool::spawn`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerHandle {
    pub id: WorkerId,
    pub role: Role,
    pub ownership_patterns: Vec<String>,
}

/// Point-in-time view of a worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub id: WorkerId,
    pub role: Role,
    pub state: WorkerState,
    pub ownership_patterns: Vec<String>,
    pub assigned_task_ids: Vec<TaskId>,
    pub consecutive_stalls: u32,
}

/// A worker found silent past the stall window.
#[derive(Debug, Clone, PartialEq)]
pub struct StallReport {
    pub worker_id: WorkerId,
    pub role: Role,
    pub task_ids: Vec<TaskId>,
    pub idle: Duration,
    pub consecutive_stalls: u32,
}

/// Timing knobs for the pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_workers: usize,
    /// Silence longer than this marks a busy worker stalled.
    pub stall_window: Duration,
    /// How long `terminate` waits for a shutdown ack.
    pub grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 8,
            stall_window: Duration::from_secs(30),
            grace: Duration::from_secs(5),
        }
    }
}

struct WorkerEntry {
    role: Role,
    state: WorkerState,
    patterns: Vec<String>,
    assigned: Vec<TaskId>,
    last_activity: Instant,
    consecutive_stalls: u32,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl WorkerEntry {
    fn snapshot(&self, id: WorkerId) -> WorkerSnapshot {
        WorkerSnapshot {
            id,
            role: self.role.clone(),
            state: self.state,
            ownership_patterns: self.patterns.clone(),
            assigned_task_ids: self.assigned.clone(),
            consecutive_stalls: self.consecutive_stalls,
        }
    }

    fn is_live(&self) -> bool {
        !matches!(self.state, WorkerState::ShuttingDown | WorkerState::Terminated)
    }
}

/// Manages the workers of one run.
///
/// Terminated workers stay in the table so a finished run can prove that
/// nothing leaked.
pub struct WorkerPool {
    workers: Mutex<HashMap<WorkerId, WorkerEntry>>,
    registry: OwnershipRegistry,
    router: MessageRouter,
    outbox: Outbox,
    executor: Arc<dyn TaskExecutor>,
    config: PoolConfig,
    event_tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl WorkerPool {
    /// Create a pool.
    ///
    /// # Arguments
    ///
    /// * `registry` - Ownership registry claims are made against
    /// * `router` - Router workers get mailboxes on
    /// * `outbox` - The coordinator's outbox, used for assignments and
    ///   shutdown requests
    /// * `executor` - Body every worker runs
    /// * `config` - Capacity and timing
    /// * `event_tx` - Channel for lifecycle events
    pub fn new(
        registry: OwnershipRegistry,
        router: MessageRouter,
        outbox: Outbox,
        executor: Arc<dyn TaskExecutor>,
        config: PoolConfig,
        event_tx: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self {
        Self {
            workers: Mutex::new(HashMap::new()),
            registry,
            router,
            outbox,
            executor,
            config,
            event_tx,
        }
    }

    /// Spawn a worker, claiming its ownership first.
    ///
    /// If the claim fails nothing is created. When `initial` is given it
    /// is delivered as the worker's first assignment.
    ///
    /// # Errors
    ///
    /// - `WorkerPoolFull` when at capacity.
    /// - `OwnershipConflict` when the patterns intersect an active claim.
    pub fn spawn(
        &self,
        role: Role,
        patterns: Vec<String>,
        initial: Option<Assignment>,
    ) -> Result<WorkerHandle> {
        if !self.has_capacity() {
            return Err(Error::WorkerPoolFull {
                max: self.config.max_workers,
            });
        }

        let id = WorkerId::new();
        self.registry.claim(id, &patterns)?;

        let address = Address::Worker(id);
        let mailbox = self.router.register(address);
        let worker_outbox = Outbox::new(address, self.router.clone());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_worker(
            id,
            self.executor.clone(),
            worker_outbox,
            mailbox,
            cancel.clone(),
        ));

        self.workers.lock().insert(
            id,
            WorkerEntry {
                role: role.clone(),
                state: WorkerState::Spawned,
                patterns: patterns.clone(),
                assigned: Vec::new(),
                last_activity: Instant::now(),
                consecutive_stalls: 0,
                cancel,
                handle: Some(handle),
            },
        );
        info!(worker_id = %id, role = %role, patterns = ?patterns, "Worker spawned");
        let _ = self.event_tx.send(WorkerEvent::Spawned {
            worker_id: id,
            role: role.clone(),
        });

        if let Some(assignment) = initial {
            self.assign(id, assignment)?;
        }

        Ok(WorkerHandle {
            id,
            role,
            ownership_patterns: patterns,
        })
    }

    /// Hand a task to a live worker.
    pub fn assign(&self, id: WorkerId, assignment: Assignment) -> Result<()> {
        {
            let mut workers = self.workers.lock();
            let entry = workers
                .get_mut(&id)
                .filter(|e| e.is_live())
                .ok_or(Error::WorkerNotFound { id })?;
            entry.assigned.push(assignment.task_id.clone());
            entry.last_activity = Instant::now();
        }
        debug!(worker_id = %id, task_id = %assignment.task_id, "Assigning task");
        self.outbox
            .send(Address::Worker(id), MessageKind::Assign, json!(assignment))?;
        Ok(())
    }

    /// Send a directive (e.g. guidance) to a worker.
    pub fn send(&self, id: WorkerId, kind: MessageKind, payload: Value) -> Result<u64> {
        self.outbox.send(Address::Worker(id), kind, payload)
    }

    /// Note that a message arrived from a worker.
    ///
    /// Any message counts as progress: spawned and stalled workers become
    /// active and the stall count resets.
    pub fn record_activity(&self, id: WorkerId) {
        let recovered = {
            let mut workers = self.workers.lock();
            let Some(entry) = workers.get_mut(&id) else {
                return;
            };
            entry.last_activity = Instant::now();
            entry.consecutive_stalls = 0;
            match entry.state {
                WorkerState::Spawned => {
                    entry.state = WorkerState::Active;
                    false
                }
                WorkerState::Stalled => {
                    entry.state = WorkerState::Active;
                    true
                }
                _ => false,
            }
        };
        if recovered {
            info!(worker_id = %id, "Worker recovered from stall");
            let _ = self.event_tx.send(WorkerEvent::Recovered { worker_id: id });
        }
    }

    /// Drop a finished task from a worker's assignment list.
    pub fn task_finished(&self, id: WorkerId, task_id: &TaskId) {
        if let Some(entry) = self.workers.lock().get_mut(&id) {
            entry.assigned.retain(|t| t != task_id);
        }
    }

    /// Flag busy workers that stayed silent for the stall window.
    ///
    /// Every check that finds a worker still silent counts as another
    /// consecutive stall.
    pub fn liveness_check(&self) -> Vec<StallReport> {
        let now = Instant::now();
        let mut reports = Vec::new();
        {
            let mut workers = self.workers.lock();
            for (id, entry) in workers.iter_mut() {
                if !entry.is_live() || entry.assigned.is_empty() {
                    continue;
                }
                let idle = now.duration_since(entry.last_activity);
                if idle < self.config.stall_window {
                    continue;
                }
                entry.state = WorkerState::Stalled;
                entry.consecutive_stalls += 1;
                reports.push(StallReport {
                    worker_id: *id,
                    role: entry.role.clone(),
                    task_ids: entry.assigned.clone(),
                    idle,
                    consecutive_stalls: entry.consecutive_stalls,
                });
            }
        }
        for report in &reports {
            warn!(
                worker_id = %report.worker_id,
                idle_ms = report.idle.as_millis() as u64,
                consecutive_stalls = report.consecutive_stalls,
                "Worker stalled"
            );
            let _ = self.event_tx.send(WorkerEvent::Stalled {
                worker_id: report.worker_id,
                idle: report.idle,
                consecutive_stalls: report.consecutive_stalls,
            });
        }
        reports
    }

    /// Shut a worker down.
    ///
    /// Sends `shutdown_request` and waits up to the grace period for the
    /// ack; a worker that does not answer is cancelled and aborted. Either
    /// way its ownership is released and its mailbox removed.
    ///
    /// The join handle stays in the table during the handshake, so a
    /// caller dropped mid-wait leaves a `shutting_down` worker that
    /// [`terminate_all`](Self::terminate_all) can still finish.
    pub async fn terminate(&self, id: WorkerId) -> Result<TerminationOutcome> {
        {
            let mut workers = self.workers.lock();
            let entry = workers.get_mut(&id).ok_or(Error::WorkerNotFound { id })?;
            if matches!(entry.state, WorkerState::Terminated | WorkerState::ShuttingDown) {
                return Ok(TerminationOutcome::AlreadyTerminated);
            }
            entry.state = WorkerState::ShuttingDown;
        }

        let ack = self.router.expect_ack(id);
        let acked = match self
            .outbox
            .send(Address::Worker(id), MessageKind::ShutdownRequest, Value::Null)
        {
            Ok(_) => matches!(util::within(self.config.grace, ack).await, Ok(Ok(_))),
            Err(e) => {
                debug!(worker_id = %id, error = %e, "Shutdown request not delivered");
                false
            }
        };

        Ok(self
            .finish(id, acked)
            .await
            .unwrap_or(TerminationOutcome::AlreadyTerminated))
    }

    /// Cancel, abort, release and unregister a worker, then join its task.
    ///
    /// All bookkeeping happens before the first await. Returns `None` when
    /// the worker was already terminated.
    async fn finish(&self, id: WorkerId, acked: bool) -> Option<TerminationOutcome> {
        let handle = {
            let mut workers = self.workers.lock();
            let entry = workers.get_mut(&id)?;
            if entry.state == WorkerState::Terminated {
                return None;
            }
            entry.cancel.cancel();
            entry.state = WorkerState::Terminated;
            entry.assigned.clear();
            entry.handle.take()
        };
        if let Some(handle) = &handle {
            handle.abort();
        }
        self.registry.release(id);
        self.router.unregister(Address::Worker(id));

        let outcome = if acked {
            info!(worker_id = %id, "Worker terminated");
            TerminationOutcome::Graceful
        } else {
            warn!(
                worker_id = %id,
                grace_ms = self.config.grace.as_millis() as u64,
                "Worker did not acknowledge shutdown, forced termination"
            );
            TerminationOutcome::Forced
        };
        let _ = self.event_tx.send(WorkerEvent::Terminated {
            worker_id: id,
            forced: outcome == TerminationOutcome::Forced,
        });

        if let Some(handle) = handle {
            let _ = handle.await;
        }
        Some(outcome)
    }

    /// Terminate every worker that is not already terminated, concurrently.
    ///
    /// Workers left `shutting_down` by an abandoned handshake are forced
    /// down without another request.
    pub async fn terminate_all(&self) -> Vec<(WorkerId, TerminationOutcome)> {
        let pending: Vec<(WorkerId, bool)> = self
            .workers
            .lock()
            .iter()
            .filter(|(_, e)| e.state != WorkerState::Terminated)
            .map(|(id, e)| (*id, e.state == WorkerState::ShuttingDown))
            .collect();
        let outcomes = join_all(pending.iter().map(|&(id, stranded)| async move {
            if stranded {
                debug!(worker_id = %id, "Finishing abandoned shutdown");
                Ok(self
                    .finish(id, false)
                    .await
                    .unwrap_or(TerminationOutcome::AlreadyTerminated))
            } else {
                self.terminate(id).await
            }
        }))
        .await;
        pending
            .into_iter()
            .zip(outcomes)
            .filter_map(|((id, _), outcome)| outcome.ok().map(|o| (id, o)))
            .collect()
    }

    /// Get a snapshot of a worker.
    pub fn get(&self, id: WorkerId) -> Option<WorkerSnapshot> {
        self.workers.lock().get(&id).map(|e| e.snapshot(id))
    }

    /// Snapshots of every worker this pool ever spawned.
    pub fn snapshots(&self) -> Vec<WorkerSnapshot> {
        self.workers
            .lock()
            .iter()
            .map(|(id, e)| e.snapshot(*id))
            .collect()
    }

    /// Workers that are neither shutting down nor terminated.
    pub fn active_count(&self) -> usize {
        self.workers.lock().values().filter(|e| e.is_live()).count()
    }

    pub fn has_capacity(&self) -> bool {
        self.active_count() < self.config.max_workers
    }

    pub fn max_workers(&self) -> usize {
        self.config.max_workers
    }

    /// The ownership registry claims are made against.
    pub fn registry(&self) -> &OwnershipRegistry {
        &self.registry
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Workers of an abandoned run must not outlive their pool.
        for entry in self.workers.get_mut().values() {
            entry.cancel.cancel();
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.lock().len())
            .field("max_workers", &self.config.max_workers)
            .finish()
    }
}
