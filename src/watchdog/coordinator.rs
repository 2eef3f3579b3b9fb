use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::{
    metrics::{Counter, MetricsCollector},
    settings::AgentSettings,
};

use super::{
    CompanionTrigger, Host, PeriodicJobTrigger, PersistedJobTrigger, ProcessTarget,
    RecoveryTrigger, TaskRemovedHook, TriggerError, TriggerKind, WakeTimerTrigger,
};

const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Coverage {
    Full,
    Partial,
    None,
}

#[derive(Debug)]
pub struct TriggerOutcome {
    pub kind: TriggerKind,
    pub error: Option<TriggerError>,
}

impl TriggerOutcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Per-trigger results of an `arm` or `disarm` pass.
#[derive(Debug, Default)]
pub struct ArmReport {
    pub outcomes: Vec<TriggerOutcome>,
}

impl ArmReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|outcome| outcome.is_ok()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &TriggerOutcome> {
        self.outcomes.iter().filter(|outcome| !outcome.is_ok())
    }

    pub fn coverage(&self) -> Coverage {
        match self.succeeded() {
            0 => Coverage::None,
            n if n == self.outcomes.len() => Coverage::Full,
            _ => Coverage::Partial,
        }
    }
}

/// Arms every recovery trigger independently. A trigger that fails is logged
/// and skipped; it never stops the remaining ones from being armed.
pub struct WatchdogCoordinator {
    triggers: Vec<Box<dyn RecoveryTrigger>>,
    metrics: Option<MetricsCollector>,
}

impl WatchdogCoordinator {
    pub fn new(triggers: Vec<Box<dyn RecoveryTrigger>>) -> Self {
        Self {
            triggers,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The five standard triggers, all targeting the agent process.
    pub fn standard(
        host: Arc<dyn Host>,
        settings: &AgentSettings,
        task_removed: Arc<Notify>,
        shutdown: CancellationToken,
    ) -> Self {
        let target = ProcessTarget::agent();
        Self::new(vec![
            Box::new(WakeTimerTrigger::new(
                host.clone(),
                target.clone(),
                settings.wake_timer_interval(),
            )),
            Box::new(PeriodicJobTrigger::new(
                host.clone(),
                target.clone(),
                settings.periodic_job_interval(),
            )),
            Box::new(PersistedJobTrigger::new(
                host.clone(),
                target.clone(),
                settings.periodic_job_interval(),
            )),
            Box::new(CompanionTrigger::new(
                host.clone(),
                target.clone(),
                settings.companion_interval(),
            )),
            Box::new(TaskRemovedHook::new(
                host,
                target,
                settings.restart_delay(),
                task_removed,
                shutdown,
            )),
        ])
    }

    pub fn kinds(&self) -> Vec<TriggerKind> {
        self.triggers.iter().map(|trigger| trigger.kind()).collect()
    }

    pub async fn arm(&self) -> ArmReport {
        let mut report = ArmReport::default();

        for trigger in &self.triggers {
            let kind = trigger.kind();
            let error = match trigger.arm().await {
                Ok(()) => None,
                Err(err) => {
                    if err.is_denied() {
                        log_warn!("skipping {kind} trigger: {err}");
                    } else {
                        log_error!("failed to arm {kind} trigger: {err}");
                    }
                    if let Some(metrics) = &self.metrics {
                        metrics.increment(Counter::TriggerFailures);
                    }
                    Some(err)
                }
            };
            report.outcomes.push(TriggerOutcome { kind, error });
        }

        match report.coverage() {
            Coverage::Full => log_info!("all {} recovery triggers armed", report.succeeded()),
            Coverage::Partial => log_warn!(
                "partial recovery coverage: {}/{} triggers armed",
                report.succeeded(),
                report.outcomes.len()
            ),
            Coverage::None => log_error!("no recovery trigger could be armed"),
        }

        report
    }

    /// Uninstall flow only.
    pub async fn disarm(&self) -> ArmReport {
        let mut report = ArmReport::default();

        for trigger in &self.triggers {
            let kind = trigger.kind();
            let error = trigger.disarm().await.err();
            if let Some(err) = &error {
                log_warn!("failed to disarm {kind} trigger: {err}");
            }
            report.outcomes.push(TriggerOutcome { kind, error });
        }

        log_info!(
            "disarmed {}/{} recovery triggers",
            report.succeeded(),
            report.outcomes.len()
        );
        report
    }
}
