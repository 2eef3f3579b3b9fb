use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;

use crate::{
    health::LivenessProbe,
    metrics::{Counter, MetricsCollector},
    models::EnforcementVerdict,
};

use super::{HideCause, OverlayMachine, OverlayState, OverlaySurface, Transition};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

enum OverlayRequest {
    Verdict(EnforcementVerdict),
    Hide(HideCause),
    Flush(oneshot::Sender<()>),
}

/// Handle to the overlay actor. Every caller (tracker, command handler,
/// liveness check) goes through the same queue; only the actor touches the
/// surface.
#[derive(Clone)]
pub struct OverlayController {
    tx: mpsc::UnboundedSender<OverlayRequest>,
    state_rx: watch::Receiver<OverlayState>,
}

impl OverlayController {
    /// Spawns the actor and its liveness check. Both stop when `cancel` fires;
    /// the actor hides the overlay on its way out. While `liveness` reports
    /// dead, blocking verdicts never bring the overlay up.
    pub fn spawn<S>(
        surface: S,
        liveness: Arc<dyn LivenessProbe>,
        liveness_interval: Duration,
        metrics: MetricsCollector,
        cancel: CancellationToken,
    ) -> (Self, Vec<JoinHandle<()>>)
    where
        S: OverlaySurface + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(OverlayState::hidden());

        let controller = Self { tx, state_rx };

        let actor = tokio::spawn(overlay_actor(
            OverlayMachine::new(surface),
            liveness.clone(),
            rx,
            state_tx,
            metrics,
            cancel.clone(),
        ));
        let liveness_task = tokio::spawn(liveness_loop(
            controller.clone(),
            liveness,
            liveness_interval,
            cancel,
        ));

        (controller, vec![actor, liveness_task])
    }

    pub fn submit(&self, verdict: EnforcementVerdict) {
        self.send(OverlayRequest::Verdict(verdict));
    }

    /// Explicit "clear now" override. The cleared block stays suppressed until
    /// the verdict changes.
    pub fn clear(&self) {
        self.send(OverlayRequest::Hide(HideCause::Command));
    }

    pub fn state(&self) -> OverlayState {
        self.state_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<OverlayState> {
        self.state_rx.clone()
    }

    /// Resolves once every request queued before this call has been applied.
    /// Returns false if the actor is gone.
    pub async fn flush(&self) -> bool {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(OverlayRequest::Flush(done_tx)).is_err() {
            return false;
        }
        done_rx.await.is_ok()
    }

    fn send(&self, request: OverlayRequest) {
        if self.tx.send(request).is_err() {
            log_warn!("overlay actor stopped; dropping request");
        }
    }
}

async fn overlay_actor<S: OverlaySurface>(
    mut machine: OverlayMachine<S>,
    liveness: Arc<dyn LivenessProbe>,
    mut rx: mpsc::UnboundedReceiver<OverlayRequest>,
    state_tx: watch::Sender<OverlayState>,
    metrics: MetricsCollector,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                machine.hide(HideCause::Shutdown);
                state_tx.send_replace(machine.state());
                log_info!("overlay actor shutting down");
                break;
            }
            request = rx.recv() => {
                let Some(request) = request else {
                    machine.hide(HideCause::Shutdown);
                    state_tx.send_replace(machine.state());
                    break;
                };

                let mut next = Some(request);
                while let Some(request) = next.take() {
                    let (request, following) = coalesce(request, &mut rx);
                    next = following;
                    apply(&mut machine, request, liveness.as_ref(), &metrics);
                    state_tx.send_if_modified(|state| {
                        let current = machine.state();
                        if *state == current {
                            return false;
                        }
                        *state = current;
                        true
                    });
                }
            }
        }
    }
}

/// Collapses a run of queued verdicts into the newest one. Superseded
/// verdicts are dropped, never reordered; any other request ends the run.
fn coalesce(
    mut request: OverlayRequest,
    rx: &mut mpsc::UnboundedReceiver<OverlayRequest>,
) -> (OverlayRequest, Option<OverlayRequest>) {
    if !matches!(request, OverlayRequest::Verdict(_)) {
        return (request, None);
    }

    let mut dropped = 0usize;
    loop {
        match rx.try_recv() {
            Ok(OverlayRequest::Verdict(newer)) => {
                request = OverlayRequest::Verdict(newer);
                dropped += 1;
            }
            Ok(other) => {
                if dropped > 0 {
                    log_debug!("coalesced {dropped} stale overlay verdicts");
                }
                return (request, Some(other));
            }
            Err(_) => {
                if dropped > 0 {
                    log_debug!("coalesced {dropped} stale overlay verdicts");
                }
                return (request, None);
            }
        }
    }
}

fn apply<S: OverlaySurface>(
    machine: &mut OverlayMachine<S>,
    request: OverlayRequest,
    liveness: &dyn LivenessProbe,
    metrics: &MetricsCollector,
) {
    let transition = match request {
        OverlayRequest::Verdict(verdict)
            if verdict.blocking_reason().is_some() && !liveness.is_alive() =>
        {
            log_debug!(
                "enforcement not live; not showing overlay for {}",
                verdict.app_identifier
            );
            machine.hide(HideCause::Liveness)
        }
        OverlayRequest::Verdict(verdict) => machine.apply_verdict(&verdict),
        OverlayRequest::Hide(cause) => machine.hide(cause),
        OverlayRequest::Flush(done) => {
            let _ = done.send(());
            return;
        }
    };

    match transition {
        Transition::Shown | Transition::Replaced => metrics.increment(Counter::OverlayConstructions),
        Transition::Failed => metrics.increment(Counter::OverlayFailures),
        _ => {}
    }
}

async fn liveness_loop(
    controller: OverlayController,
    liveness: Arc<dyn LivenessProbe>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !controller.state_rx.borrow().visible {
                    continue;
                }
                if !liveness.is_alive() {
                    log_warn!("enforcement liveness lost while overlay shown; hiding");
                    controller.send(OverlayRequest::Hide(HideCause::Liveness));
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BlockReason;
    use crate::overlay::surface::testing::RecordingSurface;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Switch(AtomicBool);

    impl LivenessProbe for Switch {
        fn is_alive(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn spawn_controller(
        surface: RecordingSurface,
        alive: Arc<Switch>,
        interval: Duration,
    ) -> (OverlayController, CancellationToken, MetricsCollector) {
        let cancel = CancellationToken::new();
        let metrics = MetricsCollector::new();
        let (controller, _handles) =
            OverlayController::spawn(surface, alive, interval, metrics.clone(), cancel.clone());
        (controller, cancel, metrics)
    }

    async fn wait_for(
        rx: &mut watch::Receiver<OverlayState>,
        predicate: impl Fn(&OverlayState) -> bool,
    ) {
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|state| predicate(state)))
            .await
            .expect("overlay state did not settle")
            .expect("overlay actor stopped");
    }

    #[tokio::test]
    async fn repeated_identical_verdicts_construct_once() {
        let surface = RecordingSurface::default();
        let alive = Arc::new(Switch(AtomicBool::new(true)));
        let (controller, cancel, metrics) =
            spawn_controller(surface.clone(), alive, Duration::from_secs(60));

        for _ in 0..5 {
            controller.submit(EnforcementVerdict::block("video", BlockReason::AppLimit, None));
        }
        assert!(controller.flush().await);

        assert_eq!(surface.presented(), 1);
        assert_eq!(metrics.get(Counter::OverlayConstructions), 1);
        assert_eq!(
            controller.state(),
            OverlayState::shown("video", BlockReason::AppLimit)
        );
        cancel.cancel();
    }

    #[tokio::test]
    async fn verdicts_apply_in_order_and_last_one_wins() {
        let surface = RecordingSurface::default();
        let alive = Arc::new(Switch(AtomicBool::new(true)));
        let (controller, cancel, _metrics) =
            spawn_controller(surface, alive, Duration::from_secs(60));

        controller.submit(EnforcementVerdict::block("game", BlockReason::AppBlock, None));
        controller.submit(EnforcementVerdict::allow("game"));
        controller.submit(EnforcementVerdict::block("video", BlockReason::Schedule, None));
        assert!(controller.flush().await);

        assert_eq!(
            controller.state(),
            OverlayState::shown("video", BlockReason::Schedule)
        );
        cancel.cancel();
    }

    #[tokio::test]
    async fn clear_overrides_current_block() {
        let surface = RecordingSurface::default();
        let alive = Arc::new(Switch(AtomicBool::new(true)));
        let (controller, cancel, _metrics) =
            spawn_controller(surface.clone(), alive, Duration::from_secs(60));

        controller.submit(EnforcementVerdict::block("game", BlockReason::AppBlock, None));
        controller.clear();
        controller.submit(EnforcementVerdict::block("game", BlockReason::AppBlock, None));
        assert!(controller.flush().await);

        assert!(!controller.state().visible);
        assert_eq!(surface.presented(), 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn liveness_loss_hides_without_explicit_request() {
        let surface = RecordingSurface::default();
        let alive = Arc::new(Switch(AtomicBool::new(true)));
        let (controller, cancel, _metrics) =
            spawn_controller(surface, alive.clone(), Duration::from_millis(20));
        let mut rx = controller.subscribe();

        controller.submit(EnforcementVerdict::block("game", BlockReason::DeviceLock, None));
        wait_for(&mut rx, |state| state.visible).await;

        alive.0.store(false, Ordering::SeqCst);
        wait_for(&mut rx, |state| !state.visible).await;
        cancel.cancel();
    }

    #[tokio::test]
    async fn dead_enforcement_keeps_overlay_down_until_recovered() {
        let surface = RecordingSurface::default();
        let alive = Arc::new(Switch(AtomicBool::new(false)));
        let (controller, cancel, metrics) =
            spawn_controller(surface.clone(), alive.clone(), Duration::from_millis(20));

        for _ in 0..6 {
            controller.submit(EnforcementVerdict::block("video", BlockReason::AppLimit, None));
            assert!(controller.flush().await);
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        assert_eq!(surface.presented(), 0);
        assert_eq!(metrics.get(Counter::OverlayConstructions), 0);
        assert!(!controller.state().visible);

        alive.0.store(true, Ordering::SeqCst);
        controller.submit(EnforcementVerdict::block("video", BlockReason::AppLimit, None));
        assert!(controller.flush().await);
        assert_eq!(surface.presented(), 1);
        assert!(controller.state().visible);
        cancel.cancel();
    }

    #[tokio::test]
    async fn cancellation_tears_down_surface() {
        let surface = RecordingSurface::default();
        let alive = Arc::new(Switch(AtomicBool::new(true)));
        let cancel = CancellationToken::new();
        let (controller, handles) = OverlayController::spawn(
            surface.clone(),
            alive,
            Duration::from_secs(60),
            MetricsCollector::new(),
            cancel.clone(),
        );

        controller.submit(EnforcementVerdict::block("game", BlockReason::AppBlock, None));
        assert!(controller.flush().await);

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(!controller.state().visible);
        assert!(!controller.flush().await);
    }
}
