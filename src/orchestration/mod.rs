//! Concurrent machinery of an orchestration run.
//!
//! The coordinator drives a run through the task board, spawning workers
//! from the pool under ownership claims, exchanging messages through the
//! router, and gating layers with the barrier. The mode selector decides
//! whether any of that is used or the coordinator runs tasks itself.

pub mod barrier;
pub mod chain;
pub mod coordinator;
pub mod executor;
pub mod health;
pub mod mode;
pub mod ownership;
pub mod pool;
pub mod router;
pub mod synthesis;
pub mod worker;

pub use barrier::{BarrierOutcome, LayerBarrier};
pub use chain::{FollowUp, FollowUpRecord, NoFollowUps, ResultRules};
pub use coordinator::{
    Coordinator, FailurePolicy, GapPolicy, OwnershipPolicy, RunSettings, Teardown,
};
pub use executor::CommandExecutor;
pub use health::{Escalation, EscalationPolicy, RetryTracker};
pub use mode::{Capabilities, ModeDecision, ModePreference, OrchestrationMode, TaskEstimate};
pub use ownership::{patterns_overlap, OwnershipClaim, OwnershipRegistry};
pub use pool::{
    PoolConfig, StallReport, TerminationOutcome, WorkerEvent, WorkerHandle, WorkerPool,
    WorkerSnapshot,
};
pub use router::{Address, Mailbox, Message, MessageKind, MessageRouter, Outbox, RouterEvent};
pub use synthesis::{
    AbortCause, Anomaly, CollectSynthesizer, SynthesizedResult, Synthesizer, TaskOutcome,
};
pub use worker::{
    Assignment, GuidanceSource, StaticGuidance, TaskExecutor, TaskFailureReport,
    TaskResultReport, WorkerContext, WorkerId, WorkerState,
};
