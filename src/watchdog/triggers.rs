use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};
use thiserror::Error;
use tokio::{sync::Notify, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use super::{Host, HostError, JobSchedule, ProcessTarget, ScheduledJob};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

/// Hosts refuse deferred jobs more frequent than this.
pub const MIN_PERIODIC_INTERVAL: Duration = Duration::from_secs(15 * 60);

pub const WAKE_TIMER_JOB_ID: &str = "curfew.wake_timer";
pub const PERIODIC_JOB_ID: &str = "curfew.periodic";
pub const PERSISTED_JOB_ID: &str = "curfew.persisted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    WakeTimer,
    PeriodicJob,
    PersistedJob,
    Companion,
    TaskRemoved,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::WakeTimer => "wake_timer",
            TriggerKind::PeriodicJob => "periodic_job",
            TriggerKind::PersistedJob => "persisted_job",
            TriggerKind::Companion => "companion",
            TriggerKind::TaskRemoved => "task_removed",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("{kind} trigger denied by host: {source}")]
    Denied {
        kind: TriggerKind,
        #[source]
        source: HostError,
    },
    #[error("{kind} trigger failed: {source}")]
    Failed {
        kind: TriggerKind,
        #[source]
        source: HostError,
    },
}

impl TriggerError {
    pub fn from_host(kind: TriggerKind, source: HostError) -> Self {
        match source {
            HostError::PermissionDenied(_) | HostError::Unsupported(_) => {
                TriggerError::Denied { kind, source }
            }
            _ => TriggerError::Failed { kind, source },
        }
    }

    pub fn kind(&self) -> TriggerKind {
        match self {
            TriggerError::Denied { kind, .. } | TriggerError::Failed { kind, .. } => *kind,
        }
    }

    /// Expected steady state on restrictive hosts rather than a fault.
    pub fn is_denied(&self) -> bool {
        matches!(self, TriggerError::Denied { .. })
    }
}

/// One independent way of getting the agent restarted. Implementations hold
/// no state shared with other triggers, and arming twice is harmless.
#[async_trait]
pub trait RecoveryTrigger: Send + Sync {
    fn kind(&self) -> TriggerKind;
    async fn arm(&self) -> Result<(), TriggerError>;
    async fn disarm(&self) -> Result<(), TriggerError>;
}

async fn schedule_job(
    host: &dyn Host,
    kind: TriggerKind,
    job: ScheduledJob,
) -> Result<(), TriggerError> {
    log_debug!("arming {kind} as job {} ({:?})", job.id, job.schedule);
    host.schedule(job)
        .await
        .map_err(|err| TriggerError::from_host(kind, err))
}

async fn cancel_job(host: &dyn Host, kind: TriggerKind, id: &str) -> Result<(), TriggerError> {
    host.cancel(id)
        .await
        .map_err(|err| TriggerError::from_host(kind, err))
}

/// Short self-re-arming wake-up. Firing while the agent is alive is a no-op.
/// The desktop host has no OS alarm for it, so once the agent is gone it
/// fires only through the companion.
pub struct WakeTimerTrigger {
    host: Arc<dyn Host>,
    target: ProcessTarget,
    interval: Duration,
}

impl WakeTimerTrigger {
    pub fn new(host: Arc<dyn Host>, target: ProcessTarget, interval: Duration) -> Self {
        Self {
            host,
            target,
            interval,
        }
    }
}

#[async_trait]
impl RecoveryTrigger for WakeTimerTrigger {
    fn kind(&self) -> TriggerKind {
        TriggerKind::WakeTimer
    }

    async fn arm(&self) -> Result<(), TriggerError> {
        let job = ScheduledJob {
            id: WAKE_TIMER_JOB_ID.to_string(),
            schedule: JobSchedule::Alarm {
                interval_secs: self.interval.as_secs().max(1),
            },
            persisted: false,
            target: self.target.clone(),
        };
        schedule_job(self.host.as_ref(), self.kind(), job).await
    }

    async fn disarm(&self) -> Result<(), TriggerError> {
        cancel_job(self.host.as_ref(), self.kind(), WAKE_TIMER_JOB_ID).await
    }
}

/// Deferred periodic job. Revoked through a different host path than alarms.
pub struct PeriodicJobTrigger {
    host: Arc<dyn Host>,
    target: ProcessTarget,
    interval: Duration,
}

impl PeriodicJobTrigger {
    pub fn new(host: Arc<dyn Host>, target: ProcessTarget, interval: Duration) -> Self {
        Self {
            host,
            target,
            interval: interval.max(MIN_PERIODIC_INTERVAL),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

#[async_trait]
impl RecoveryTrigger for PeriodicJobTrigger {
    fn kind(&self) -> TriggerKind {
        TriggerKind::PeriodicJob
    }

    async fn arm(&self) -> Result<(), TriggerError> {
        let job = ScheduledJob {
            id: PERIODIC_JOB_ID.to_string(),
            schedule: JobSchedule::Periodic {
                interval_secs: self.interval.as_secs(),
            },
            persisted: false,
            target: self.target.clone(),
        };
        schedule_job(self.host.as_ref(), self.kind(), job).await
    }

    async fn disarm(&self) -> Result<(), TriggerError> {
        cancel_job(self.host.as_ref(), self.kind(), PERIODIC_JOB_ID).await
    }
}

/// Job-registry entry that survives reboots and is not tied to the agent's
/// own scheduling.
pub struct PersistedJobTrigger {
    host: Arc<dyn Host>,
    target: ProcessTarget,
    interval: Duration,
}

impl PersistedJobTrigger {
    pub fn new(host: Arc<dyn Host>, target: ProcessTarget, interval: Duration) -> Self {
        Self {
            host,
            target,
            interval: interval.max(MIN_PERIODIC_INTERVAL),
        }
    }
}

#[async_trait]
impl RecoveryTrigger for PersistedJobTrigger {
    fn kind(&self) -> TriggerKind {
        TriggerKind::PersistedJob
    }

    async fn arm(&self) -> Result<(), TriggerError> {
        let job = ScheduledJob {
            id: PERSISTED_JOB_ID.to_string(),
            schedule: JobSchedule::Periodic {
                interval_secs: self.interval.as_secs(),
            },
            persisted: true,
            target: self.target.clone(),
        };
        schedule_job(self.host.as_ref(), self.kind(), job).await
    }

    async fn disarm(&self) -> Result<(), TriggerError> {
        cancel_job(self.host.as_ref(), self.kind(), PERSISTED_JOB_ID).await
    }
}

/// Separate low-footprint process that keeps asking for the agent.
pub struct CompanionTrigger {
    host: Arc<dyn Host>,
    target: ProcessTarget,
    interval: Duration,
}

impl CompanionTrigger {
    pub fn new(host: Arc<dyn Host>, target: ProcessTarget, interval: Duration) -> Self {
        Self {
            host,
            target,
            interval,
        }
    }
}

#[async_trait]
impl RecoveryTrigger for CompanionTrigger {
    fn kind(&self) -> TriggerKind {
        TriggerKind::Companion
    }

    async fn arm(&self) -> Result<(), TriggerError> {
        let companion = ProcessTarget::companion();
        match self.host.is_running(&companion).await {
            Ok(true) => {
                log_debug!("companion already running");
                return Ok(());
            }
            Ok(false) => {}
            Err(err) => log_warn!("companion liveness unknown, spawning anyway: {err}"),
        }

        self.host
            .spawn_companion(&self.target, self.interval)
            .await
            .map_err(|err| TriggerError::from_host(self.kind(), err))
    }

    async fn disarm(&self) -> Result<(), TriggerError> {
        self.host
            .stop_companion()
            .await
            .map_err(|err| TriggerError::from_host(self.kind(), err))
    }
}

/// Hard-restart path for when the user swipes the agent away: schedule a
/// near-future restart, then shut down cleanly instead of lingering half
/// alive.
pub struct TaskRemovedHook {
    host: Arc<dyn Host>,
    target: ProcessTarget,
    delay: Duration,
    removed: Arc<Notify>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TaskRemovedHook {
    /// `removed` is notified by the platform when the task is removed;
    /// `shutdown` is cancelled once the restart is scheduled.
    pub fn new(
        host: Arc<dyn Host>,
        target: ProcessTarget,
        delay: Duration,
        removed: Arc<Notify>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            host,
            target,
            delay,
            removed,
            shutdown,
            task: Mutex::new(None),
        }
    }

    fn replace_task(&self, next: Option<JoinHandle<()>>) {
        let mut slot = self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = slot.take() {
            previous.abort();
        }
        *slot = next;
    }
}

#[async_trait]
impl RecoveryTrigger for TaskRemovedHook {
    fn kind(&self) -> TriggerKind {
        TriggerKind::TaskRemoved
    }

    async fn arm(&self) -> Result<(), TriggerError> {
        let host = self.host.clone();
        let target = self.target.clone();
        let delay = self.delay;
        let removed = self.removed.clone();
        let shutdown = self.shutdown.clone();

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = removed.notified() => {
                    log_info!("task removed; scheduling restart of {target} in {delay:?}");
                    if let Err(err) = host.schedule_restart(&target, delay).await {
                        log_warn!("restart after task removal not scheduled: {err}");
                    }
                    shutdown.cancel();
                }
                _ = shutdown.cancelled() => {}
            }
        });

        self.replace_task(Some(handle));
        Ok(())
    }

    async fn disarm(&self) -> Result<(), TriggerError> {
        self.replace_task(None);
        Ok(())
    }
}
