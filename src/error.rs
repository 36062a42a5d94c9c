use thiserror::Error;

use crate::core::TaskId;
use crate::orchestration::{Address, AbortCause, SynthesizedResult, WorkerId};

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Adding task {task_id} would create a cycle: {detail}")]
    Cycle { task_id: TaskId, detail: String },

    #[error("Task already exists: {0}")]
    DuplicateId(TaskId),

    #[error("Task not found: {0}")]
    UnknownTask(TaskId),

    #[error("Task {id} is not in progress (status: {status})")]
    NotInProgress { id: TaskId, status: String },

    #[error("Task {id} is not runnable (status: {status})")]
    NotRunnable { id: TaskId, status: String },

    #[error("Cannot add task {task_id} at layer {layer}: work has already started at layer {current}")]
    LayerClosed {
        task_id: TaskId,
        layer: u32,
        current: u32,
    },

    #[error("Task {task_id} depends on {missing}, which was never created")]
    UnresolvedDependency { task_id: TaskId, missing: TaskId },

    #[error(
        "Ownership conflict: {requested_pattern} overlaps {overlapping_pattern} held by worker {conflicting_worker_id}"
    )]
    OwnershipConflict {
        conflicting_worker_id: WorkerId,
        overlapping_pattern: String,
        requested_pattern: String,
    },

    #[error("Message gap from {from} to {to}: expected #{expected}, received #{received}")]
    GapDetected {
        from: Address,
        to: Address,
        expected: u64,
        received: u64,
    },

    #[error("Worker {worker_id} stalled for {consecutive_stalls} consecutive checks")]
    StallTimeout {
        worker_id: WorkerId,
        consecutive_stalls: u32,
    },

    #[error("Run aborted: {cause}")]
    RunAborted {
        cause: AbortCause,
        partial: Box<SynthesizedResult>,
    },

    #[error("Worker not found: {id}")]
    WorkerNotFound { id: WorkerId },

    #[error("Worker pool is full (max: {max})")]
    WorkerPoolFull { max: usize },

    #[error("No mailbox registered for {0}")]
    UnknownRecipient(Address),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Worker error: {0}")]
    Worker(String),
}

pub type Result<T> = std::result::Result<T, Error>;
