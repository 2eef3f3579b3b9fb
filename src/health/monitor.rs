use chrono::Utc;
use serde::Serialize;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::{metrics::MetricsCollector, watchdog::Host};

use super::{EscalationBackoff, Heartbeat, IntrospectionProbe, TransportProbe};

const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub introspection_bound: bool,
    pub transport_connected: bool,
    pub tracker_alive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthAction {
    None,
    Escalated,
    /// Introspection still unbound, but the backoff window has not elapsed.
    Deferred { retry_in: Duration },
    EscalationFailed(String),
}

/// Finer-grained checks inside a live agent. Only a lost introspection
/// binding escalates; transport loss is tolerated as transient.
pub struct HealthMonitor {
    introspection: Arc<dyn IntrospectionProbe>,
    transport: Arc<dyn TransportProbe>,
    heartbeat: Heartbeat,
    host: Arc<dyn Host>,
    backoff: EscalationBackoff,
    metrics: MetricsCollector,
    // False when no introspection source exists at all; nothing to repair then.
    introspection_configured: bool,
}

impl HealthMonitor {
    pub fn new(
        introspection: Arc<dyn IntrospectionProbe>,
        transport: Arc<dyn TransportProbe>,
        heartbeat: Heartbeat,
        host: Arc<dyn Host>,
        backoff: EscalationBackoff,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            introspection,
            transport,
            heartbeat,
            host,
            backoff,
            metrics,
            introspection_configured: true,
        }
    }

    pub fn with_introspection_configured(mut self, configured: bool) -> Self {
        self.introspection_configured = configured;
        self
    }

    pub fn check_health(&self) -> HealthReport {
        HealthReport {
            introspection_bound: self.introspection.is_bound(),
            transport_connected: self.transport.is_connected(),
            tracker_alive: self.heartbeat.is_fresh(),
        }
    }

    pub async fn run_check(&mut self, now: Instant) -> (HealthReport, HealthAction) {
        let report = self.check_health();

        if !report.transport_connected {
            log_info!("realtime transport disconnected; waiting for next refresh");
        }
        if !report.tracker_alive {
            log_warn!("tracking loop heartbeat is stale");
        }

        if report.introspection_bound {
            if self.backoff.attempts() > 0 {
                log_info!(
                    "introspection channel rebound after {} escalation(s)",
                    self.backoff.attempts()
                );
            }
            self.backoff.reset();
            return (report, HealthAction::None);
        }

        if !self.introspection_configured {
            return (report, HealthAction::None);
        }

        if !self.backoff.is_ready(now) {
            let retry_in = self.backoff.remaining(now);
            log_warn!("introspection channel unbound; next self-repair in {retry_in:?}");
            return (report, HealthAction::Deferred { retry_in });
        }

        let next = self.backoff.record_attempt(now);
        self.metrics.record_escalation(Utc::now()).await;
        match self.host.bump_foreground_priority().await {
            Ok(()) => {
                log_warn!(
                    "introspection channel unbound; triggered self-repair (attempt {}, next in {next:?})",
                    self.backoff.attempts()
                );
                (report, HealthAction::Escalated)
            }
            Err(err) => {
                log_error!(
                    "self-repair failed (attempt {}, next in {next:?}): {err}",
                    self.backoff.attempts()
                );
                (report, HealthAction::EscalationFailed(err.to_string()))
            }
        }
    }

    pub async fn run(mut self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let (report, _action) = self.run_check(Instant::now()).await;
                    let snapshot = self.metrics.get_snapshot().await;
                    log_info!(
                        "health: {:?} cpu={:.1}% rss={:.1}MB evaluations={} blocks={} overlays={} escalations={}",
                        report,
                        snapshot.system.cpu_percent,
                        snapshot.system.memory_mb,
                        snapshot.evaluations,
                        snapshot.blocking_verdicts,
                        snapshot.overlay_constructions,
                        snapshot.escalations
                    );
                }
                _ = cancel.cancelled() => {
                    log_info!("health monitor shutting down");
                    break;
                }
            }
        }
    }
}
