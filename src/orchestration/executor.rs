//! Default worker body: run the task's command as a child process.

use crate::error::{Error, Result};
use crate::orchestration::worker::{Assignment, TaskExecutor, WorkerContext};
use crate::util;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::debug;

/// Interval between progress heartbeats while a command runs.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(1);

/// Runs `context.command` and reports `{exit_code, stdout, stderr}`.
///
/// The command's program is resolved on `PATH` before it is started, and
/// the child is killed if the worker is terminated. A task without a
/// command acknowledges its prompt. Keep the heartbeat well below the
/// stall window so long builds are not mistaken for stalls.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    heartbeat: Duration,
    working_dir: Option<PathBuf>,
}

impl Default for CommandExecutor {
    fn default() -> Self {
        Self {
            heartbeat: DEFAULT_HEARTBEAT,
            working_dir: None,
        }
    }
}

impl CommandExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[async_trait]
impl TaskExecutor for CommandExecutor {
    async fn execute(&self, assignment: Assignment, ctx: &mut WorkerContext) -> Result<Value> {
        let Some(command) = command_of(&assignment.context)? else {
            let prompt = assignment.context.get("prompt").cloned().unwrap_or(Value::Null);
            return Ok(json!({ "acknowledged": prompt, "role": assignment.role }));
        };

        let program = command[0].clone();
        let resolved = util::blocking(move || {
            which::which(&program).map_err(|e| Error::Worker(format!("{}: {}", program, e)))
        })
        .await?;
        debug!(task_id = %assignment.task_id, program = %resolved.display(), "Running command");

        let mut cmd = Command::new(&resolved);
        cmd.args(&command[1..])
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        ctx.progress(json!({ "state": "running", "command": command }))?;
        let started = Instant::now();
        let mut heartbeat = interval(self.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;

        let output = cmd.output();
        tokio::pin!(output);
        let output = loop {
            tokio::select! {
                out = &mut output => break out?,
                _ = heartbeat.tick() => {
                    ctx.progress(json!({
                        "state": "running",
                        "elapsed_ms": started.elapsed().as_millis() as u64,
                    }))?;
                }
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            let status = output
                .status
                .code()
                .map(|c| format!("exit code {}", c))
                .unwrap_or_else(|| "a signal".to_string());
            return Err(Error::Worker(format!(
                "{} failed with {}: {}",
                command[0],
                status,
                stderr.trim()
            )));
        }
        Ok(json!({
            "exit_code": output.status.code(),
            "stdout": stdout,
            "stderr": stderr,
        }))
    }
}

/// Extract `context.command` as a non-empty list of strings.
fn command_of(context: &Value) -> Result<Option<Vec<String>>> {
    let Some(raw) = context.get("command") else {
        return Ok(None);
    };
    let command: Vec<String> = serde_json::from_value(raw.clone())
        .map_err(|_| Error::Validation("command must be a list of strings".to_string()))?;
    if command.is_empty() {
        return Err(Error::Validation("command is empty".to_string()));
    }
    Ok(Some(command))
}
