//! Coordinator: the top-level control loop of a run.
//!
//! A run materializes the task board, lets the mode selector pick a
//! strategy, then either walks the tasks itself (sequential) or supervises
//! a worker pool layer by layer (concurrent). Whatever happens, the run
//! ends the same way: remaining tasks are cancelled on abort, every worker
//! is terminated and every ownership claim is released before the
//! synthesized result is returned.

use crate::core::{Task, TaskBoard, TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::orchestration::barrier::{BarrierOutcome, LayerBarrier};
use crate::orchestration::chain::{FollowUp, FollowUpRecord, ResultRules};
use crate::orchestration::health::{Escalation, EscalationPolicy, RetryTracker};
use crate::orchestration::mode::{
    self, Capabilities, ModePreference, OrchestrationMode, TaskEstimate,
};
use crate::orchestration::ownership::{OwnershipClaim, OwnershipRegistry};
use crate::orchestration::pool::{PoolConfig, WorkerEvent, WorkerPool, WorkerSnapshot};
use crate::orchestration::router::{
    Address, Mailbox, Message, MessageKind, MessageRouter, Outbox, RouterEvent,
};
use crate::orchestration::synthesis::{
    AbortCause, Anomaly, CollectSynthesizer, SynthesizedResult, Synthesizer,
};
use crate::orchestration::worker::{
    Assignment, GuidanceSource, StaticGuidance, TaskExecutor, TaskFailureReport,
    TaskResultReport, WorkerContext, WorkerId, WorkerState,
};
use crate::util;
use crate::workflow::{Plan, RunId, RunStatus};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

/// What to do when a task fails for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Abort as soon as any task fails.
    #[default]
    StopOnFirstFailure,
    /// Let the failed task's layer finish, then abort.
    DrainLayer,
}

/// What to do when a worker cannot claim its task's ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnershipPolicy {
    /// Keep the task runnable and retry once a worker releases its claim.
    #[default]
    Defer,
    Abort,
}

/// What to do when the router reports a sequence gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapPolicy {
    /// Record the gap as an anomaly and keep going.
    #[default]
    Warn,
    Abort,
}

/// Runtime knobs for a run.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub max_workers: usize,
    pub mode: ModePreference,
    pub failure_policy: FailurePolicy,
    pub ownership_policy: OwnershipPolicy,
    pub gap_policy: GapPolicy,
    /// Extra attempts on a fresh worker after a task reports failure.
    pub max_task_retries: u32,
    /// Cap on tasks added from results during one run.
    pub max_follow_ups: usize,
    pub run_timeout: Option<Duration>,
    /// Silence longer than this counts as a stall. Applies to pool workers
    /// and to tasks the coordinator runs inline.
    pub stall_window: Duration,
    pub check_interval: Duration,
    pub escalation: EscalationPolicy,
    /// Abort the run when a stalled worker's tasks get cancelled.
    pub abort_on_stall_cancel: bool,
    /// How long a worker gets to acknowledge a shutdown request.
    pub grace: Duration,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            max_workers: 8,
            mode: ModePreference::Auto,
            failure_policy: FailurePolicy::default(),
            ownership_policy: OwnershipPolicy::default(),
            gap_policy: GapPolicy::default(),
            max_task_retries: 0,
            max_follow_ups: 32,
            run_timeout: None,
            stall_window: Duration::from_secs(30),
            check_interval: Duration::from_secs(5),
            escalation: EscalationPolicy::default(),
            abort_on_stall_cancel: false,
            grace: Duration::from_secs(5),
        }
    }
}

/// State of workers and claims after a run's shutdown sequence.
#[derive(Debug, Clone, Serialize)]
pub struct Teardown {
    pub workers: Vec<WorkerSnapshot>,
    pub claims: Vec<OwnershipClaim>,
}

impl Teardown {
    /// Every worker terminated and no claim left behind.
    pub fn is_complete(&self) -> bool {
        self.claims.is_empty()
            && self
                .workers
                .iter()
                .all(|w| w.state == WorkerState::Terminated)
    }
}

/// Drives runs from a task graph to a synthesized result.
pub struct Coordinator {
    settings: RunSettings,
    executor: Arc<dyn TaskExecutor>,
    guidance: Arc<dyn GuidanceSource>,
    synthesizer: Arc<dyn Synthesizer>,
    follow_up: Arc<dyn FollowUp>,
    capabilities: Capabilities,
    status: Mutex<RunStatus>,
    last_teardown: Mutex<Option<Teardown>>,
}

impl Coordinator {
    /// Create a coordinator with static guidance, the collecting
    /// synthesizer, the built-in follow-up rules, and full in-process
    /// capabilities.
    pub fn new(settings: RunSettings, executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            settings,
            executor,
            guidance: Arc::new(StaticGuidance::default()),
            synthesizer: Arc::new(CollectSynthesizer),
            follow_up: Arc::new(ResultRules),
            capabilities: Capabilities::full(),
            status: Mutex::new(RunStatus::Pending),
            last_teardown: Mutex::new(None),
        }
    }

    pub fn with_guidance(mut self, guidance: Arc<dyn GuidanceSource>) -> Self {
        self.guidance = guidance;
        self
    }

    pub fn with_synthesizer(mut self, synthesizer: Arc<dyn Synthesizer>) -> Self {
        self.synthesizer = synthesizer;
        self
    }

    pub fn with_follow_up(mut self, follow_up: Arc<dyn FollowUp>) -> Self {
        self.follow_up = follow_up;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    /// Status of the current or most recent run.
    pub fn status(&self) -> RunStatus {
        *self.status.lock()
    }

    /// Workers and claims as they stood after the most recent run.
    pub fn last_teardown(&self) -> Option<Teardown> {
        self.last_teardown.lock().clone()
    }

    /// Run a plan.
    pub async fn run_plan(&self, plan: Plan) -> Result<SynthesizedResult> {
        let goal = plan.goal.clone();
        self.run(&goal, plan.into_tasks()).await
    }

    /// Run `tasks` toward `goal`.
    ///
    /// # Errors
    ///
    /// `RunAborted` carrying the cause and the partial result when a task
    /// failed, an ownership conflict could not be resolved, a stall
    /// exhausted its budget under `abort_on_stall_cancel`, a gap arrived
    /// under the abort gap policy, the run timed out, or the task graph
    /// was malformed.
    pub async fn run(&self, goal: &str, tasks: Vec<Task>) -> Result<SynthesizedResult> {
        let run_id = RunId::new();
        let started_at = Utc::now();
        *self.status.lock() = RunStatus::Running;
        info!(run_id = %run_id.short(), goal, tasks = tasks.len(), "Run started");

        let estimate = TaskEstimate {
            tasks: tasks.len(),
            distinct_roles: tasks
                .iter()
                .map(|t| &t.owner_role)
                .collect::<BTreeSet<_>>()
                .len(),
        };
        let decision = mode::select(self.capabilities, estimate, self.settings.mode);

        let board = match TaskBoard::from_tasks(tasks.iter().cloned()) {
            Ok(board) => board,
            Err(e) => {
                // Nothing ran; report every task as cancelled.
                let cause = AbortCause::Structural {
                    message: e.to_string(),
                };
                let reason = format!("run aborted: {}", cause);
                let tasks = tasks
                    .into_iter()
                    .map(|mut t| {
                        t.cancel(&reason);
                        t
                    })
                    .collect();
                let partial = SynthesizedResult::build(
                    run_id,
                    goal,
                    decision.mode,
                    tasks,
                    Vec::new(),
                    self.synthesizer.as_ref(),
                    started_at,
                    Some(cause.clone()),
                );
                *self.last_teardown.lock() = Some(Teardown {
                    workers: Vec::new(),
                    claims: Vec::new(),
                });
                return Err(self.abort(cause, partial));
            }
        };

        let mut supervisor = Supervisor::new(
            &self.settings,
            board.clone(),
            self.executor.clone(),
            self.guidance.clone(),
            self.follow_up.clone(),
        );

        let driven = {
            let drive = supervisor.drive(decision.mode);
            match self.settings.run_timeout {
                Some(limit) => util::within(limit, drive).await.and_then(|inner| inner),
                None => drive.await,
            }
        };
        let cause = match driven {
            Ok(cause) => cause,
            Err(Error::Timeout(after)) => Some(AbortCause::Timeout { after }),
            Err(e) => Some(AbortCause::Structural {
                message: e.to_string(),
            }),
        };

        *self.status.lock() = RunStatus::ShuttingDown;
        let teardown = supervisor.shutdown(cause.as_ref()).await;
        *self.last_teardown.lock() = Some(teardown);

        let tasks = board
            .topological_order()
            .unwrap_or_else(|_| board.all_tasks());
        let result = SynthesizedResult::build(
            run_id,
            goal,
            decision.mode,
            tasks,
            supervisor.anomalies,
            self.synthesizer.as_ref(),
            started_at,
            cause.clone(),
        )
        .with_follow_ups(supervisor.follow_ups);

        match cause {
            Some(cause) => Err(self.abort(cause, result)),
            None => {
                *self.status.lock() = RunStatus::Completed;
                info!(
                    run_id = %run_id.short(),
                    mode = %result.mode,
                    completed = result.completed.len(),
                    cancelled = result.cancelled.len(),
                    follow_ups = result.follow_ups.len(),
                    anomalies = result.anomalies.len(),
                    duration_ms = result.duration().as_millis() as u64,
                    "Run completed"
                );
                Ok(result)
            }
        }
    }

    fn abort(&self, cause: AbortCause, partial: SynthesizedResult) -> Error {
        *self.status.lock() = RunStatus::Aborted;
        error!(
            run_id = %partial.run_id.short(),
            cause = %cause,
            completed = partial.completed.len(),
            failed = partial.failed.len(),
            cancelled = partial.cancelled.len(),
            "Run aborted"
        );
        Error::RunAborted {
            cause,
            partial: Box::new(partial),
        }
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("settings", &self.settings)
            .field("capabilities", &self.capabilities)
            .field("status", &self.status())
            .finish()
    }
}

/// How one inline attempt ended.
enum Inline {
    Finished(Result<Value>),
    Replaced,
    Cancelled { consecutive_stalls: u32 },
}

/// What woke the concurrent control loop.
enum Wake {
    Barrier(BarrierOutcome),
    Message(Option<Message>),
    Router(RouterEvent),
    Pool(WorkerEvent),
    Liveness,
}

/// Per-run state: the board, the pool and its channels, and the
/// bookkeeping for retries, replacements, deferred spawns and follow-ups.
struct Supervisor {
    settings: RunSettings,
    board: TaskBoard,
    barrier: LayerBarrier,
    pool: WorkerPool,
    executor: Arc<dyn TaskExecutor>,
    guidance: Arc<dyn GuidanceSource>,
    follow_up: Arc<dyn FollowUp>,
    inbox: Mailbox,
    router_events: mpsc::UnboundedReceiver<RouterEvent>,
    pool_events: mpsc::UnboundedReceiver<WorkerEvent>,
    anomalies: Vec<Anomaly>,
    retries: RetryTracker,
    replacements: RetryTracker,
    deferred: HashSet<TaskId>,
    follow_ups: Vec<FollowUpRecord>,
}

impl Supervisor {
    fn new(
        settings: &RunSettings,
        board: TaskBoard,
        executor: Arc<dyn TaskExecutor>,
        guidance: Arc<dyn GuidanceSource>,
        follow_up: Arc<dyn FollowUp>,
    ) -> Self {
        let (router, router_events) = MessageRouter::new();
        let inbox = router.register(Address::Coordinator);
        let outbox = Outbox::new(Address::Coordinator, router.clone());
        let (event_tx, pool_events) = mpsc::unbounded_channel();
        let pool = WorkerPool::new(
            OwnershipRegistry::new(),
            router,
            outbox,
            executor.clone(),
            PoolConfig {
                max_workers: settings.max_workers,
                stall_window: settings.stall_window,
                grace: settings.grace,
            },
            event_tx,
        );
        Self {
            settings: settings.clone(),
            barrier: LayerBarrier::new(board.clone()),
            board,
            pool,
            executor,
            guidance,
            follow_up,
            inbox,
            router_events,
            pool_events,
            anomalies: Vec::new(),
            retries: RetryTracker::new(),
            replacements: RetryTracker::new(),
            deferred: HashSet::new(),
            follow_ups: Vec::new(),
        }
    }

    async fn drive(&mut self, mode: OrchestrationMode) -> Result<Option<AbortCause>> {
        match mode {
            OrchestrationMode::Sequential => self.drive_sequential().await,
            OrchestrationMode::Concurrent => self.drive_concurrent().await,
        }
    }

    fn stop_on_failure(&self) -> bool {
        self.settings.failure_policy == FailurePolicy::StopOnFirstFailure
    }

    // ========== Sequential ==========

    /// Walk the tasks in topological order, executing each in-process.
    async fn drive_sequential(&mut self) -> Result<Option<AbortCause>> {
        // The coordinator itself is the only worker.
        let delegate = WorkerId::new();
        let mut ctx = WorkerContext::direct(self.guidance.clone());

        // Re-read the order each time; follow-ups can extend the board.
        while let Some(task) = self
            .board
            .topological_order()?
            .into_iter()
            .find(|t| t.status == TaskStatus::Runnable)
        {
            self.board.start_task(&task.id, delegate)?;
            ctx.set_task(Some(task.id.clone()));

            loop {
                match self.execute_inline(delegate, &task, &mut ctx).await {
                    Inline::Finished(Ok(result)) => {
                        self.board.mark_done(&task.id, result)?;
                        self.chain(&task.id)?;
                        break;
                    }
                    Inline::Finished(Err(e)) => {
                        if self.retry(&task.id, &e.to_string()) {
                            continue;
                        }
                        self.fail_task(&task.id, &e.to_string())?;
                        if self.stop_on_failure() {
                            return Ok(Some(AbortCause::TaskFailed {
                                task_ids: vec![task.id.clone()],
                            }));
                        }
                        break;
                    }
                    Inline::Replaced => continue,
                    Inline::Cancelled { consecutive_stalls } => {
                        let err = Error::StallTimeout {
                            worker_id: delegate,
                            consecutive_stalls,
                        };
                        let cancelled = self
                            .board
                            .cancel_task(&task.id, "worker stalled past its budget")?;
                        warn!(task_id = %task.id, cancelled = ?cancelled, error = %err, "Cancelled stalled work");
                        if self.settings.abort_on_stall_cancel {
                            return Ok(Some(AbortCause::Stalled {
                                worker_id: delegate,
                                task_ids: vec![task.id.clone()],
                            }));
                        }
                        break;
                    }
                }
            }
        }
        ctx.set_task(None);

        let failed = self.board.failed_tasks();
        if failed.is_empty() {
            Ok(None)
        } else {
            Ok(Some(AbortCause::TaskFailed { task_ids: failed }))
        }
    }

    /// Run one attempt of `task` inline under the same stall ladder the
    /// pool applies to workers. Replacing drops the attempt and counts a
    /// replacement; the caller starts the next one.
    async fn execute_inline(
        &mut self,
        delegate: WorkerId,
        task: &Task,
        ctx: &mut WorkerContext,
    ) -> Inline {
        let replacements = self.replacements.get_retries(&task.id);
        let assignment = Assignment {
            task_id: task.id.clone(),
            role: task.owner_role.clone(),
            context: task.context.clone(),
            attempt: self.retries.get_retries(&task.id) + replacements,
        };
        let heartbeat = ctx.heartbeat();
        if let Some(heartbeat) = &heartbeat {
            heartbeat.beat();
        }

        let mut liveness = interval(self.settings.check_interval);
        liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);
        liveness.tick().await;

        let executor = self.executor.clone();
        let work = executor.execute(assignment, ctx);
        tokio::pin!(work);
        let mut consecutive_stalls = 0;

        loop {
            tokio::select! {
                result = &mut work => return Inline::Finished(result),
                _ = liveness.tick() => {}
            }
            let Some(heartbeat) = &heartbeat else {
                continue;
            };
            let idle = heartbeat.idle();
            if idle < self.settings.stall_window {
                consecutive_stalls = 0;
                continue;
            }
            consecutive_stalls += 1;
            let step = self.settings.escalation.decide(consecutive_stalls, replacements);
            warn!(
                task_id = %task.id,
                idle_ms = idle.as_millis() as u64,
                step = %step,
                consecutive_stalls,
                "Escalating stalled inline task"
            );
            self.anomalies.push(Anomaly::StallEscalation {
                worker_id: delegate,
                task_ids: vec![task.id.clone()],
                step,
                consecutive_stalls,
            });
            match step {
                Escalation::Guide => {
                    // Inline execution has no mailbox; the nudge is only logged.
                    let nudge = self.guidance.nudge(&task.id, consecutive_stalls);
                    debug!(task_id = %task.id, nudge = %nudge, "Nudge for inline task");
                }
                Escalation::Replace => {
                    self.replacements.increment(&task.id);
                    info!(task_id = %task.id, "Restarting stalled inline task");
                    return Inline::Replaced;
                }
                Escalation::Cancel => return Inline::Cancelled { consecutive_stalls },
            }
        }
    }

    /// Add the follow-ups a completed task's result calls for.
    ///
    /// A follow-up the board rejects (closed layer, duplicate id, cycle) or
    /// one past the budget is recorded as an anomaly; the run goes on.
    fn chain(&mut self, task_id: &TaskId) -> Result<()> {
        let task = self.board.get_task(task_id)?;
        let Some(result) = task.result.as_ref() else {
            return Ok(());
        };

        for follow_up in self.follow_up.follow_ups(&task, result) {
            let record = FollowUpRecord {
                task_id: follow_up.id.clone(),
                triggered_by: task_id.clone(),
                role: follow_up.owner_role.clone(),
                layer: follow_up.layer,
            };
            let outcome = if self.follow_ups.len() >= self.settings.max_follow_ups {
                Err(format!(
                    "follow-up budget of {} spent",
                    self.settings.max_follow_ups
                ))
            } else {
                self.board.create_task(follow_up).map_err(|e| e.to_string())
            };
            match outcome {
                Ok(()) => {
                    info!(
                        task_id = %record.task_id,
                        triggered_by = %task_id,
                        role = %record.role,
                        layer = record.layer,
                        "Follow-up added"
                    );
                    self.follow_ups.push(record);
                }
                Err(reason) => {
                    warn!(task_id = %record.task_id, triggered_by = %task_id, reason = %reason, "Follow-up rejected");
                    self.anomalies.push(Anomaly::FollowUpRejected {
                        task_id: record.task_id,
                        triggered_by: record.triggered_by,
                        reason,
                    });
                }
            }
        }
        Ok(())
    }

    /// Spend one retry on a failed task if the budget allows.
    fn retry(&mut self, task_id: &TaskId, error: &str) -> bool {
        if self.retries.get_retries(task_id) >= self.settings.max_task_retries {
            return false;
        }
        let attempt = self.retries.increment(task_id);
        warn!(task_id = %task_id, attempt, error, "Task failed, retrying");
        self.anomalies.push(Anomaly::TaskRetried {
            task_id: task_id.clone(),
            attempt,
            error: error.to_string(),
        });
        true
    }

    /// Mark a task failed for good and cancel everything downstream of it,
    /// since none of it can run.
    fn fail_task(&self, task_id: &TaskId, error: &str) -> Result<()> {
        warn!(task_id = %task_id, error, "Task failed");
        self.board.mark_failed(task_id, error)?;
        let cancelled = self
            .board
            .cancel_dependents(task_id, &format!("dependency {} failed", task_id))?;
        if !cancelled.is_empty() {
            debug!(task_id = %task_id, cancelled = ?cancelled, "Cancelled dependents of failed task");
        }
        Ok(())
    }

    // ========== Concurrent ==========

    /// Supervise workers layer by layer until the board drains.
    async fn drive_concurrent(&mut self) -> Result<Option<AbortCause>> {
        let stop = self.stop_on_failure();
        let mut liveness = interval(self.settings.check_interval);
        liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);
        liveness.tick().await;

        while let Some(layer) = self.open_layer() {
            info!(layer, tasks = self.board.layer_progress(layer).total, "Entering layer");
            loop {
                if let Some(cause) = self.admit()? {
                    return Ok(Some(cause));
                }

                let barrier = self.barrier.clone();
                let inbox = self.inbox.clone();
                let wake = tokio::select! {
                    outcome = barrier.await_layer_complete(layer, stop) => Wake::Barrier(outcome),
                    msg = inbox.recv() => Wake::Message(msg),
                    Some(event) = self.router_events.recv() => Wake::Router(event),
                    Some(event) = self.pool_events.recv() => Wake::Pool(event),
                    _ = liveness.tick() => Wake::Liveness,
                };

                let cause = match wake {
                    Wake::Barrier(BarrierOutcome::Complete) => break,
                    Wake::Barrier(BarrierOutcome::Failed(task_ids)) => {
                        Some(AbortCause::TaskFailed { task_ids })
                    }
                    Wake::Message(Some(msg)) => self.handle_message(msg).await?,
                    Wake::Message(None) => {
                        return Err(Error::ChannelClosed("coordinator inbox".to_string()))
                    }
                    Wake::Router(event) => self.handle_router_event(event),
                    Wake::Pool(event) => {
                        self.handle_pool_event(event);
                        None
                    }
                    Wake::Liveness => self.check_liveness().await?,
                };
                if cause.is_some() {
                    return Ok(cause);
                }
            }
        }
        Ok(None)
    }

    /// The layer the board is working on, or `None` once every layer passed.
    fn open_layer(&self) -> Option<u32> {
        let layer = self.board.current_layer();
        match self.board.max_layer() {
            Some(max) if layer <= max => Some(layer),
            _ => None,
        }
    }

    /// Spawn a worker for every runnable task the pool and the ownership
    /// registry allow.
    fn admit(&mut self) -> Result<Option<AbortCause>> {
        let mut blocked: Vec<(TaskId, WorkerId, String)> = Vec::new();

        for task in self.board.runnable_tasks() {
            if !self.pool.has_capacity() {
                break;
            }
            let attempt =
                self.retries.get_retries(&task.id) + self.replacements.get_retries(&task.id);
            let assignment = Assignment {
                task_id: task.id.clone(),
                role: task.owner_role.clone(),
                context: task.context.clone(),
                attempt,
            };

            match self.pool.spawn(
                task.owner_role.clone(),
                task.effective_ownership(),
                Some(assignment),
            ) {
                Ok(handle) => {
                    self.board.start_task(&task.id, handle.id)?;
                    self.deferred.remove(&task.id);
                }
                Err(Error::OwnershipConflict {
                    conflicting_worker_id,
                    overlapping_pattern,
                    ..
                }) => {
                    if self.settings.ownership_policy == OwnershipPolicy::Abort {
                        return Ok(Some(AbortCause::OwnershipConflict {
                            task_id: task.id,
                            conflicting_worker_id,
                            pattern: overlapping_pattern,
                        }));
                    }
                    if self.deferred.insert(task.id.clone()) {
                        info!(
                            task_id = %task.id,
                            conflicting_worker_id = %conflicting_worker_id,
                            pattern = %overlapping_pattern,
                            "Spawn deferred until the conflicting claim is released"
                        );
                        self.anomalies.push(Anomaly::DeferredSpawn {
                            task_id: task.id.clone(),
                            conflicting_worker_id,
                            pattern: overlapping_pattern.clone(),
                        });
                    }
                    blocked.push((task.id, conflicting_worker_id, overlapping_pattern));
                }
                Err(Error::WorkerPoolFull { .. }) => break,
                Err(e) => return Err(e),
            }
        }

        // Nobody is running who could release the conflicting claim.
        if self.pool.active_count() == 0 {
            if let Some((task_id, conflicting_worker_id, pattern)) = blocked.into_iter().next() {
                return Ok(Some(AbortCause::OwnershipConflict {
                    task_id,
                    conflicting_worker_id,
                    pattern,
                }));
            }
        }
        Ok(None)
    }

    /// The board still has `task_id` in progress under `worker_id`.
    fn owns(&self, worker_id: WorkerId, task_id: &TaskId) -> bool {
        self.board
            .get_task(task_id)
            .map(|t| t.status == TaskStatus::InProgress && t.worker_id == Some(worker_id))
            .unwrap_or(false)
    }

    async fn retire(&self, worker_id: WorkerId) {
        if let Err(e) = self.pool.terminate(worker_id).await {
            debug!(worker_id = %worker_id, error = %e, "Could not terminate worker");
        }
    }

    async fn handle_message(&mut self, msg: Message) -> Result<Option<AbortCause>> {
        let Address::Worker(worker_id) = msg.from else {
            return Ok(None);
        };
        self.pool.record_activity(worker_id);

        match msg.kind {
            MessageKind::Progress => {
                trace!(worker_id = %worker_id, payload = %msg.payload, "Progress");
            }
            MessageKind::Result => {
                let report: TaskResultReport = serde_json::from_value(msg.payload)?;
                self.pool.task_finished(worker_id, &report.task_id);
                if self.owns(worker_id, &report.task_id) {
                    self.board.mark_done(&report.task_id, report.result)?;
                    info!(task_id = %report.task_id, worker_id = %worker_id, "Task completed");
                    self.chain(&report.task_id)?;
                } else {
                    debug!(task_id = %report.task_id, worker_id = %worker_id, "Ignoring stale result");
                }
                self.retire(worker_id).await;
            }
            MessageKind::Failure => {
                let report: TaskFailureReport = serde_json::from_value(msg.payload)?;
                self.pool.task_finished(worker_id, &report.task_id);
                let owned = self.owns(worker_id, &report.task_id);
                self.retire(worker_id).await;
                if !owned {
                    debug!(task_id = %report.task_id, worker_id = %worker_id, "Ignoring stale failure");
                } else if self.retry(&report.task_id, &report.error) {
                    self.board.requeue(&report.task_id)?;
                } else {
                    self.fail_task(&report.task_id, &report.error)?;
                }
            }
            MessageKind::RequestGuidance => {
                let task_id = msg
                    .payload
                    .get("task_id")
                    .and_then(|v| serde_json::from_value::<TaskId>(v.clone()).ok());
                let question = msg.payload.get("question").cloned().unwrap_or(Value::Null);
                let answer = self.guidance.answer(task_id.as_ref(), &question);
                if let Err(e) = self.pool.send(worker_id, MessageKind::Guidance, answer) {
                    debug!(worker_id = %worker_id, error = %e, "Guidance not delivered");
                }
            }
            other => {
                trace!(worker_id = %worker_id, kind = ?other, "Ignoring message");
            }
        }
        Ok(None)
    }

    fn handle_router_event(&mut self, event: RouterEvent) -> Option<AbortCause> {
        match event {
            RouterEvent::GapDetected {
                from,
                to,
                expected,
                received,
            } => {
                self.anomalies.push(Anomaly::GapDetected {
                    from,
                    to,
                    expected,
                    received,
                });
                if self.settings.gap_policy == GapPolicy::Abort {
                    let err = Error::GapDetected {
                        from,
                        to,
                        expected,
                        received,
                    };
                    error!(error = %err, "Aborting on message gap");
                    return Some(AbortCause::GapDetected {
                        from,
                        to,
                        expected,
                        received,
                    });
                }
            }
            RouterEvent::Dropped {
                from, to, received, ..
            } => {
                self.anomalies.push(Anomaly::MessageDropped { from, to, received });
            }
        }
        None
    }

    fn handle_pool_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Terminated {
                worker_id,
                forced: true,
            } => {
                self.anomalies.push(Anomaly::ForcedTermination { worker_id });
            }
            other => trace!(event = ?other, "Worker event"),
        }
    }

    /// Escalate every stalled worker one step: guide, replace, or cancel.
    async fn check_liveness(&mut self) -> Result<Option<AbortCause>> {
        for report in self.pool.liveness_check() {
            let worker_id = report.worker_id;
            let replacements = report
                .task_ids
                .iter()
                .map(|t| self.replacements.get_retries(t))
                .max()
                .unwrap_or(0);
            let step = self
                .settings
                .escalation
                .decide(report.consecutive_stalls, replacements);
            warn!(
                worker_id = %worker_id,
                step = %step,
                consecutive_stalls = report.consecutive_stalls,
                "Escalating stalled worker"
            );
            self.anomalies.push(Anomaly::StallEscalation {
                worker_id,
                task_ids: report.task_ids.clone(),
                step,
                consecutive_stalls: report.consecutive_stalls,
            });

            match step {
                Escalation::Guide => {
                    for task_id in &report.task_ids {
                        let nudge = self.guidance.nudge(task_id, report.consecutive_stalls);
                        if let Err(e) = self.pool.send(worker_id, MessageKind::Guidance, nudge) {
                            debug!(worker_id = %worker_id, error = %e, "Nudge not delivered");
                        }
                    }
                }
                Escalation::Replace => {
                    let owned: Vec<TaskId> = report
                        .task_ids
                        .iter()
                        .filter(|t| self.owns(worker_id, t))
                        .cloned()
                        .collect();
                    self.retire(worker_id).await;
                    for task_id in owned {
                        self.replacements.increment(&task_id);
                        self.board.requeue(&task_id)?;
                        info!(task_id = %task_id, "Task handed to a replacement worker");
                    }
                }
                Escalation::Cancel => {
                    let owned: Vec<TaskId> = report
                        .task_ids
                        .iter()
                        .filter(|t| self.owns(worker_id, t))
                        .cloned()
                        .collect();
                    self.retire(worker_id).await;
                    let err = Error::StallTimeout {
                        worker_id,
                        consecutive_stalls: report.consecutive_stalls,
                    };
                    for task_id in &owned {
                        let cancelled = self
                            .board
                            .cancel_task(task_id, "worker stalled past its budget")?;
                        warn!(task_id = %task_id, cancelled = ?cancelled, error = %err, "Cancelled stalled work");
                    }
                    if self.settings.abort_on_stall_cancel {
                        return Ok(Some(AbortCause::Stalled {
                            worker_id,
                            task_ids: owned,
                        }));
                    }
                }
            }
        }
        Ok(None)
    }

    // ========== Shutdown ==========

    /// Cancel what is left on abort, terminate every worker and release
    /// every claim.
    async fn shutdown(&mut self, cause: Option<&AbortCause>) -> Teardown {
        if let Some(cause) = cause {
            let cancelled = self.board.cancel_remaining(&format!("run aborted: {}", cause));
            if !cancelled.is_empty() {
                info!(count = cancelled.len(), "Cancelled remaining tasks");
            }
        }

        let terminated = self.pool.terminate_all().await;
        debug!(workers = terminated.len(), "Workers terminated");

        while let Ok(event) = self.pool_events.try_recv() {
            self.handle_pool_event(event);
        }
        while let Ok(event) = self.router_events.try_recv() {
            // Too late to abort; keep the record.
            let _ = self.handle_router_event(event);
        }

        let registry = self.pool.registry();
        let leftover = registry.claims();
        if !leftover.is_empty() {
            warn!(claims = leftover.len(), "Releasing leftover ownership claims");
            registry.release_all();
        }

        Teardown {
            workers: self.pool.snapshots(),
            claims: registry.claims(),
        }
    }
}
