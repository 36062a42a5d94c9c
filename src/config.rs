use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::orchestration::{
    EscalationPolicy, FailurePolicy, GapPolicy, ModePreference, OwnershipPolicy, RunSettings,
};
use crate::{Error, Result};

/// `[run]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub max_workers: usize,
    pub mode: ModePreference,
    pub failure_policy: FailurePolicy,
    pub ownership_policy: OwnershipPolicy,
    pub gap_policy: GapPolicy,
    pub max_task_retries: u32,
    /// Cap on tasks added from results during one run.
    pub max_follow_ups: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_timeout_secs: Option<u64>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_workers: 8,
            mode: ModePreference::Auto,
            failure_policy: FailurePolicy::StopOnFirstFailure,
            ownership_policy: OwnershipPolicy::Defer,
            gap_policy: GapPolicy::Warn,
            max_task_retries: 0,
            max_follow_ups: 32,
            run_timeout_secs: None,
        }
    }
}

/// `[liveness]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    pub stall_window_ms: u64,
    pub check_interval_ms: u64,
    pub guide_attempts: u32,
    pub max_replacements: u32,
    pub abort_on_stall_cancel: bool,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            stall_window_ms: 30_000,
            check_interval_ms: 5_000,
            guide_attempts: 2,
            max_replacements: 1,
            abort_on_stall_cancel: false,
        }
    }
}

/// `[shutdown]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub grace_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self { grace_ms: 5_000 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub liveness: LivenessConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

impl Config {
    pub fn orchestra_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".orchestra"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::orchestra_dir()?.join("orchestra.toml"))
    }

    /// Load from the default location, falling back to defaults.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load from an explicit path; a missing file means defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Loading config");
        if !path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        debug!(
            max_workers = config.run.max_workers,
            mode = ?config.run.mode,
            stall_window_ms = config.liveness.stall_window_ms,
            "Config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        Self::ensure_dirs()?;
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        fs::write(path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "Config saved");
        Ok(())
    }

    pub fn ensure_dirs() -> Result<()> {
        let dir = Self::orchestra_dir()?;
        if !dir.exists() {
            debug!(dir = %dir.display(), "Creating orchestra directory");
            fs::create_dir_all(&dir)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.run.max_workers == 0 {
            return Err(Error::Validation("run.max_workers must be at least 1".to_string()));
        }
        if self.liveness.stall_window_ms == 0 || self.liveness.check_interval_ms == 0 {
            return Err(Error::Validation(
                "liveness.stall_window_ms and liveness.check_interval_ms must be positive"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Runtime settings for the coordinator.
    pub fn run_settings(&self) -> RunSettings {
        RunSettings {
            max_workers: self.run.max_workers,
            mode: self.run.mode,
            failure_policy: self.run.failure_policy,
            ownership_policy: self.run.ownership_policy,
            gap_policy: self.run.gap_policy,
            max_task_retries: self.run.max_task_retries,
            max_follow_ups: self.run.max_follow_ups,
            run_timeout: self.run.run_timeout_secs.map(Duration::from_secs),
            stall_window: Duration::from_millis(self.liveness.stall_window_ms),
            check_interval: Duration::from_millis(self.liveness.check_interval_ms),
            escalation: EscalationPolicy {
                guide_attempts: self.liveness.guide_attempts,
                max_replacements: self.liveness.max_replacements,
            },
            abort_on_stall_cancel: self.liveness.abort_on_stall_cancel,
            grace: Duration::from_millis(self.shutdown.grace_ms),
        }
    }
}
