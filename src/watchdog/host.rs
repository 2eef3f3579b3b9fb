use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("not supported on this host: {0}")]
    Unsupported(String),
    #[error("job registry error: {0}")]
    Registry(String),
    #[error("host I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// A named process the host can start and look up.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessTarget {
    pub name: String,
}

impl ProcessTarget {
    pub const AGENT: &'static str = "agent";
    pub const COMPANION: &'static str = "companion";

    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// The main enforcement process.
    pub fn agent() -> Self {
        Self::new(Self::AGENT)
    }

    pub fn companion() -> Self {
        Self::new(Self::COMPANION)
    }
}

impl fmt::Display for ProcessTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobSchedule {
    /// Exact wake-up that re-arms itself after firing.
    Alarm { interval_secs: u64 },
    /// Deferred job; the host may batch or delay it.
    Periodic { interval_secs: u64 },
}

impl JobSchedule {
    pub fn interval(&self) -> Duration {
        match self {
            JobSchedule::Alarm { interval_secs } | JobSchedule::Periodic { interval_secs } => {
                Duration::from_secs((*interval_secs).max(1))
            }
        }
    }
}

/// A host-scheduled job whose every firing ensures `target` is running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: String,
    pub schedule: JobSchedule,
    /// Survives process death and reboots.
    pub persisted: bool,
    pub target: ProcessTarget,
}

/// Host process-liveness primitives. Starting an already-running target is a
/// no-op that reports `Ok(false)`.
#[async_trait]
pub trait Host: Send + Sync {
    /// Returns true if the target had to be started.
    async fn ensure_running(&self, target: &ProcessTarget) -> Result<bool, HostError>;

    async fn is_running(&self, target: &ProcessTarget) -> Result<bool, HostError>;

    /// Registers (or replaces) a job with the same id.
    async fn schedule(&self, job: ScheduledJob) -> Result<(), HostError>;

    /// Unknown ids are not an error.
    async fn cancel(&self, job_id: &str) -> Result<(), HostError>;

    async fn spawn_companion(
        &self,
        target: &ProcessTarget,
        interval: Duration,
    ) -> Result<(), HostError>;

    async fn stop_companion(&self) -> Result<(), HostError>;

    /// One-shot restart of `target` after `delay`, independent of the caller
    /// staying alive.
    async fn schedule_restart(
        &self,
        target: &ProcessTarget,
        delay: Duration,
    ) -> Result<(), HostError>;

    /// Briefly raises the agent to foreground priority so the host re-binds
    /// its introspection channel.
    async fn bump_foreground_priority(&self) -> Result<(), HostError>;
}
