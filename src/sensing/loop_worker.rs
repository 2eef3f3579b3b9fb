use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Notify};
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    health::Heartbeat,
    metrics::{Counter, MetricsCollector},
    models::EnforcementVerdict,
    overlay::OverlayController,
    policy::PolicySnapshot,
};

use super::tracker::{TickOutcome, UsageTracker};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

// Import the logging macros (exported at crate root)
use crate::{log_debug, log_info, log_warn};

const TICK_TIMEOUT_SECS: u64 = 10;

/// Everything the tracking loop publishes to or listens on.
#[derive(Clone)]
pub struct TrackingContext {
    pub overlay: OverlayController,
    pub verdicts: broadcast::Sender<EnforcementVerdict>,
    pub heartbeat: Heartbeat,
    /// Notified for "apply latest policy now" requests.
    pub reevaluate: Arc<Notify>,
    pub policy_rx: watch::Receiver<Arc<PolicySnapshot>>,
    pub metrics: MetricsCollector,
}

/// Upper bound between heartbeats of a healthy loop.
pub fn heartbeat_budget(tick_interval: Duration) -> Duration {
    tick_interval * 2 + Duration::from_secs(TICK_TIMEOUT_SECS)
}

pub async fn tracking_loop(
    mut tracker: UsageTracker,
    mut ctx: TrackingContext,
    interval: Duration,
    cancel_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut policy_open = true;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                run_tick(&mut tracker, &ctx).await;
            }
            _ = ctx.reevaluate.notified() => {
                log_debug!("re-evaluating on request");
                run_reevaluation(&tracker, &ctx).await;
            }
            changed = ctx.policy_rx.changed(), if policy_open => {
                match changed {
                    Ok(()) => {
                        let revision = ctx.policy_rx.borrow_and_update().revision;
                        log_debug!("policy revision {revision} published; re-evaluating");
                        run_reevaluation(&tracker, &ctx).await;
                    }
                    Err(_) => policy_open = false,
                }
            }
            _ = cancel_token.cancelled() => {
                log_info!("tracking loop shutting down");
                break;
            }
        }
    }
}

async fn run_tick(tracker: &mut UsageTracker, ctx: &TrackingContext) {
    let timeout = Duration::from_secs(TICK_TIMEOUT_SECS);
    let outcome = match tokio::time::timeout(timeout, tracker.tick(Utc::now())).await {
        Ok(outcome) => outcome,
        Err(_) => {
            ctx.metrics.increment(Counter::TickTimeouts);
            log_warn!("tracking tick timeout (> {}s)", TICK_TIMEOUT_SECS);
            TickOutcome::default()
        }
    };
    ctx.heartbeat.beat();

    if let Some(verdict) = outcome.verdict {
        publish(verdict, ctx);
    }
}

async fn run_reevaluation(tracker: &UsageTracker, ctx: &TrackingContext) {
    let timeout = Duration::from_secs(TICK_TIMEOUT_SECS);
    match tokio::time::timeout(timeout, tracker.reevaluate(Utc::now())).await {
        Ok(Some(verdict)) => {
            ctx.heartbeat.beat();
            publish(verdict, ctx);
        }
        Ok(None) => ctx.heartbeat.beat(),
        Err(_) => {
            ctx.metrics.increment(Counter::TickTimeouts);
            log_warn!("re-evaluation timeout (> {}s)", TICK_TIMEOUT_SECS);
        }
    }
}

fn publish(verdict: EnforcementVerdict, ctx: &TrackingContext) {
    ctx.metrics.increment(Counter::Evaluations);
    if verdict.blocking_reason().is_some() {
        ctx.metrics.increment(Counter::BlockingVerdicts);
    }

    // No subscribers is fine.
    let _ = ctx.verdicts.send(verdict.clone());
    ctx.overlay.submit(verdict);
}
