//! Worker identity, the executor seam, and the worker message loop.
//!
//! A worker is a tokio task that owns one mailbox. It waits for `assign`
//! messages, runs the assigned task through a [`TaskExecutor`], and
//! reports `result` or `failure` back to the coordinator. A
//! `shutdown_request` is acknowledged and ends the loop, even in the
//! middle of a task.

use crate::core::{Role, TaskId};
use crate::error::{Error, Result};
use crate::orchestration::router::{Address, Mailbox, MessageKind, Outbox};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Unique identifier for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub Uuid);

impl WorkerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for WorkerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Worker lifecycle state.
///
/// `spawned -> active -> {stalled <-> active} -> shutting_down -> terminated`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Spawned,
    Active,
    Stalled,
    ShuttingDown,
    Terminated,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerState::Spawned => write!(f, "spawned"),
            WorkerState::Active => write!(f, "active"),
            WorkerState::Stalled => write!(f, "stalled"),
            WorkerState::ShuttingDown => write!(f, "shutting_down"),
            WorkerState::Terminated => write!(f, "terminated"),
        }
    }
}

/// Payload of an `assign` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub task_id: TaskId,
    pub role: Role,
    pub context: Value,
    /// Zero for the first attempt, incremented on each retry.
    #[serde(default)]
    pub attempt: u32,
}

/// Payload of a `result` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResultReport {
    pub task_id: TaskId,
    pub result: Value,
}

/// Payload of a `failure` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailureReport {
    pub task_id: TaskId,
    pub error: String,
}

/// The body of a worker: turns an assignment into a result payload.
///
/// Implementations should call [`WorkerContext::progress`] while working
/// on anything long-running; a worker that stays silent past the stall
/// window is treated as stuck.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, assignment: Assignment, ctx: &mut WorkerContext) -> Result<Value>;
}

/// Answers guidance requests and produces nudges for stalled workers.
pub trait GuidanceSource: Send + Sync {
    fn answer(&self, task_id: Option<&TaskId>, question: &Value) -> Value;

    fn nudge(&self, task_id: &TaskId, consecutive_stalls: u32) -> Value;
}

/// Guidance that always says the same thing.
#[derive(Debug, Clone)]
pub struct StaticGuidance {
    pub answer: String,
}

impl Default for StaticGuidance {
    fn default() -> Self {
        Self {
            answer: "Proceed with your best judgement within your ownership scope.".to_string(),
        }
    }
}

impl GuidanceSource for StaticGuidance {
    fn answer(&self, _task_id: Option<&TaskId>, _question: &Value) -> Value {
        json!({ "guidance": self.answer })
    }

    fn nudge(&self, task_id: &TaskId, consecutive_stalls: u32) -> Value {
        json!({
            "guidance": format!(
                "No progress seen on {} ({} checks). Report progress or ask for guidance.",
                task_id, consecutive_stalls
            ),
            "nudge": true,
        })
    }
}

/// Last sign of life from an inline executor.
#[derive(Debug, Clone)]
pub(crate) struct Heartbeat(Arc<Mutex<Instant>>);

impl Heartbeat {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(Instant::now())))
    }

    pub(crate) fn beat(&self) {
        *self.0.lock() = Instant::now();
    }

    pub(crate) fn idle(&self) -> Duration {
        self.0.lock().elapsed()
    }
}

enum Channel {
    Routed {
        outbox: Outbox,
        guidance: mpsc::UnboundedReceiver<Value>,
    },
    Direct {
        source: Arc<dyn GuidanceSource>,
        heartbeat: Heartbeat,
    },
}

/// Handle an executor uses to talk to its coordinator.
///
/// In concurrent mode messages go through the router; in sequential
/// mode the coordinator runs the executor inline and answers directly.
pub struct WorkerContext {
    worker_id: Option<WorkerId>,
    task_id: Option<TaskId>,
    channel: Channel,
}

impl WorkerContext {
    pub(crate) fn routed(
        worker_id: WorkerId,
        outbox: Outbox,
        guidance: mpsc::UnboundedReceiver<Value>,
    ) -> Self {
        Self {
            worker_id: Some(worker_id),
            task_id: None,
            channel: Channel::Routed { outbox, guidance },
        }
    }

    /// Context for inline execution without a router.
    pub fn direct(source: Arc<dyn GuidanceSource>) -> Self {
        Self {
            worker_id: None,
            task_id: None,
            channel: Channel::Direct {
                source,
                heartbeat: Heartbeat::new(),
            },
        }
    }

    /// Liveness handle of a direct context; `None` when routed, where the
    /// pool tracks liveness from messages instead.
    pub(crate) fn heartbeat(&self) -> Option<Heartbeat> {
        match &self.channel {
            Channel::Direct { heartbeat, .. } => Some(heartbeat.clone()),
            Channel::Routed { .. } => None,
        }
    }

    /// The worker running this context; `None` in sequential mode.
    pub fn worker_id(&self) -> Option<WorkerId> {
        self.worker_id
    }

    /// The task currently being executed.
    pub fn task_id(&self) -> Option<&TaskId> {
        self.task_id.as_ref()
    }

    pub(crate) fn set_task(&mut self, task_id: Option<TaskId>) {
        self.task_id = task_id;
    }

    /// Report progress; doubles as a liveness heartbeat.
    pub fn progress(&self, payload: Value) -> Result<()> {
        match &self.channel {
            Channel::Routed { outbox, .. } => {
                outbox.send(Address::Coordinator, MessageKind::Progress, payload)?;
            }
            Channel::Direct { heartbeat, .. } => {
                heartbeat.beat();
                trace!(task_id = ?self.task_id, payload = %payload, "Progress");
            }
        }
        Ok(())
    }

    /// Ask the coordinator for guidance and wait for the answer.
    pub async fn request_guidance(&mut self, question: Value) -> Result<Value> {
        match &mut self.channel {
            Channel::Routed { outbox, guidance } => {
                // Unsolicited nudges that arrived earlier are not answers.
                while guidance.try_recv().is_ok() {}
                let payload = json!({ "task_id": self.task_id, "question": question });
                outbox.send(Address::Coordinator, MessageKind::RequestGuidance, payload)?;
                guidance
                    .recv()
                    .await
                    .ok_or_else(|| Error::ChannelClosed("guidance".to_string()))
            }
            Channel::Direct { source, heartbeat } => {
                heartbeat.beat();
                Ok(source.answer(self.task_id.as_ref(), &question))
            }
        }
    }
}

/// Message loop of a routed worker.
///
/// Returns when a shutdown request is acknowledged, the token is
/// cancelled, or the mailbox closes.
pub(crate) async fn run_worker(
    id: WorkerId,
    executor: Arc<dyn TaskExecutor>,
    outbox: Outbox,
    mailbox: Mailbox,
    cancel: CancellationToken,
) {
    let (guidance_tx, guidance_rx) = mpsc::unbounded_channel();
    let mut ctx = WorkerContext::routed(id, outbox.clone(), guidance_rx);
    let mut queued: VecDeque<Assignment> = VecDeque::new();

    if outbox
        .send(Address::Coordinator, MessageKind::Progress, json!({ "state": "ready" }))
        .is_err()
    {
        return;
    }

    loop {
        let assignment = match queued.pop_front() {
            Some(a) => a,
            None => {
                let msg = tokio::select! {
                    _ = cancel.cancelled() => return,
                    msg = mailbox.recv() => msg,
                };
                let Some(msg) = msg else { return };
                match msg.kind {
                    MessageKind::Assign => match serde_json::from_value::<Assignment>(msg.payload) {
                        Ok(a) => a,
                        Err(e) => {
                            warn!(worker_id = %id, error = %e, "Malformed assignment");
                            continue;
                        }
                    },
                    MessageKind::ShutdownRequest => {
                        acknowledge_shutdown(id, &outbox);
                        return;
                    }
                    other => {
                        trace!(worker_id = %id, kind = ?other, "Ignoring message while idle");
                        continue;
                    }
                }
            }
        };

        let task_id = assignment.task_id.clone();
        debug!(worker_id = %id, task_id = %task_id, attempt = assignment.attempt, "Executing task");
        ctx.set_task(Some(task_id.clone()));

        let outcome = {
            let exec = executor.execute(assignment, &mut ctx);
            tokio::pin!(exec);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    res = &mut exec => break res,
                    msg = mailbox.recv() => {
                        let Some(msg) = msg else { return };
                        match msg.kind {
                            MessageKind::ShutdownRequest => {
                                acknowledge_shutdown(id, &outbox);
                                return;
                            }
                            MessageKind::Guidance => {
                                let _ = guidance_tx.send(msg.payload);
                            }
                            MessageKind::Assign => {
                                if let Ok(a) = serde_json::from_value::<Assignment>(msg.payload) {
                                    queued.push_back(a);
                                }
                            }
                            other => trace!(worker_id = %id, kind = ?other, "Ignoring message while busy"),
                        }
                    }
                }
            }
        };
        ctx.set_task(None);

        let sent = match outcome {
            Ok(result) => outbox.send(
                Address::Coordinator,
                MessageKind::Result,
                json!(TaskResultReport { task_id, result }),
            ),
            Err(e) => outbox.send(
                Address::Coordinator,
                MessageKind::Failure,
                json!(TaskFailureReport {
                    task_id,
                    error: e.to_string(),
                }),
            ),
        };
        if sent.is_err() {
            return;
        }
    }
}

fn acknowledge_shutdown(id: WorkerId, outbox: &Outbox) {
    debug!(worker_id = %id, "Acknowledging shutdown");
    let _ = outbox.send(Address::Coordinator, MessageKind::ShutdownAck, Value::Null);
}
