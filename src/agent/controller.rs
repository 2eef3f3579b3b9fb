use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use tokio::{
    sync::{broadcast, mpsc, watch, Notify},
    task::JoinHandle,
    time::{Duration, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    health::{
        EnforcementLiveness, EscalationBackoff, HealthMonitor, Heartbeat, LivenessProbe,
        TransportStatus,
    },
    metrics::MetricsCollector,
    models::EnforcementVerdict,
    overlay::{OverlayController, OverlayState, OverlaySurface},
    policy::{PolicyCache, PolicyFetcher, PolicyRefresher, PolicyStore, RuleEngine},
    sensing::{
        loop_worker::heartbeat_budget, CommandForegroundProbe, ForegroundFeed, TrackerController,
        TrackingContext, UsageStatsSource, UsageStore, UsageTracker,
    },
    settings::AgentSettings,
    watchdog::Host,
};

use super::{CommandInbox, ObservedFetcher, RemoteCommand};

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

const VERDICT_CHANNEL_CAPACITY: usize = 64;
const COMMAND_CHANNEL_CAPACITY: usize = 32;
const PRUNE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Collaborators the agent is assembled from.
pub struct AgentParts {
    pub settings: AgentSettings,
    pub cache: PolicyCache,
    pub fetcher: Arc<dyn PolicyFetcher>,
    pub policy_store: Option<Arc<dyn PolicyStore>>,
    pub usage_store: Arc<dyn UsageStore>,
    pub usage_stats: Arc<dyn UsageStatsSource>,
    pub feed: ForegroundFeed,
    /// Publishes into `feed`; when absent something else must bind it.
    pub foreground_probe: Option<CommandForegroundProbe>,
    pub host: Arc<dyn Host>,
    pub surface: Box<dyn OverlaySurface>,
    pub inbox: Option<CommandInbox>,
    /// Overlay liveness also requires a bound introspection channel.
    pub introspection_required: bool,
}

#[derive(Clone)]
struct CommandRouter {
    cache: PolicyCache,
    overlay: OverlayController,
    refresh: Arc<Notify>,
    reevaluate: Arc<Notify>,
    policy_store: Option<Arc<dyn PolicyStore>>,
}

impl CommandRouter {
    async fn apply(&self, command: RemoteCommand) {
        log_info!("applying remote command {command}");
        match command {
            RemoteCommand::Lock => {
                if self.cache.set_remote_lock(true) {
                    self.persist_lock().await;
                }
            }
            RemoteCommand::Unlock => {
                if self.cache.set_remote_lock(false) {
                    self.persist_lock().await;
                }
                self.overlay.clear();
                self.request_refresh();
            }
            RemoteCommand::RefreshPolicy => self.request_refresh(),
            RemoteCommand::ClearOverlay => self.overlay.clear(),
        }
    }

    fn request_refresh(&self) {
        self.refresh.notify_one();
        self.reevaluate.notify_one();
    }

    async fn persist_lock(&self) {
        let Some(store) = &self.policy_store else {
            return;
        };
        let snapshot = self.cache.snapshot();
        if let Err(err) = store.save_policy(&snapshot).await {
            log_warn!("remote lock state not persisted: {err:?}");
        }
    }
}

/// Owns every enforcement loop under one cancellation token: tracker,
/// overlay actor and liveness check, health monitor, policy refresher,
/// command pump, and the optional foreground probe and inbox.
pub struct AgentController {
    shutdown: CancellationToken,
    tracker: TrackerController,
    handles: Vec<JoinHandle<()>>,
    router: CommandRouter,
    commands: mpsc::Sender<RemoteCommand>,
    verdicts: broadcast::Sender<EnforcementVerdict>,
    transport: TransportStatus,
    metrics: MetricsCollector,
}

impl AgentController {
    pub async fn start(parts: AgentParts, shutdown: CancellationToken) -> Result<Self> {
        let AgentParts {
            settings,
            cache,
            fetcher,
            policy_store,
            usage_store,
            usage_stats,
            feed,
            foreground_probe,
            host,
            surface,
            inbox,
            introspection_required,
        } = parts;

        let metrics = MetricsCollector::new();
        let transport = TransportStatus::new();
        let heartbeat = Heartbeat::new(heartbeat_budget(settings.tick_interval()));
        let refresh = Arc::new(Notify::new());
        let reevaluate = Arc::new(Notify::new());
        let mut handles = Vec::new();

        let refresher = PolicyRefresher::new(
            cache.clone(),
            Arc::new(ObservedFetcher::new(fetcher, transport.clone())),
            policy_store.clone(),
        );
        if !refresher.restore().await {
            log_info!("no persisted policy; failing open until the first refresh");
        }
        handles.push(tokio::spawn(refresher.run(
            settings.policy_refresh_interval(),
            refresh.clone(),
            shutdown.child_token(),
        )));

        let liveness: Arc<dyn LivenessProbe> = if introspection_required {
            Arc::new(EnforcementLiveness::new(
                Arc::new(feed.clone()),
                heartbeat.clone(),
            ))
        } else {
            Arc::new(EnforcementLiveness::heartbeat_only(heartbeat.clone()))
        };
        let (overlay, overlay_handles) = OverlayController::spawn(
            surface,
            liveness,
            settings.overlay_liveness_interval(),
            metrics.clone(),
            shutdown.child_token(),
        );
        handles.extend(overlay_handles);

        if let Some(probe) = foreground_probe {
            handles.push(tokio::spawn(probe.run(feed.clone(), shutdown.child_token())));
        }

        let (verdicts, _) = broadcast::channel(VERDICT_CHANNEL_CAPACITY);
        let tracker = UsageTracker::new(
            feed.clone(),
            usage_stats,
            usage_store.clone(),
            RuleEngine::new(cache.clone()),
        );
        let ctx = TrackingContext {
            overlay: overlay.clone(),
            verdicts: verdicts.clone(),
            heartbeat: heartbeat.clone(),
            reevaluate: reevaluate.clone(),
            policy_rx: cache.subscribe(),
            metrics: metrics.clone(),
        };
        let mut tracker_controller = TrackerController::new();
        tracker_controller
            .start(tracker, ctx, settings.tick_interval(), &shutdown)
            .context("failed to start tracking loop")?;

        let monitor = HealthMonitor::new(
            Arc::new(feed),
            Arc::new(transport.clone()),
            heartbeat,
            host,
            EscalationBackoff::new(settings.escalation_initial(), settings.escalation_max()),
            metrics.clone(),
        )
        .with_introspection_configured(introspection_required);
        handles.push(tokio::spawn(
            monitor.run(settings.health_interval(), shutdown.child_token()),
        ));

        handles.push(tokio::spawn(prune_loop(
            usage_store,
            settings.usage_retention_hours(),
            shutdown.child_token(),
        )));

        let router = CommandRouter {
            cache,
            overlay,
            refresh,
            reevaluate,
            policy_store,
        };
        let (commands, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        handles.push(tokio::spawn(command_pump(
            router.clone(),
            command_rx,
            shutdown.child_token(),
        )));

        if let Some(inbox) = inbox {
            handles.push(tokio::spawn(inbox.run(commands.clone(), shutdown.child_token())));
        }

        log_info!("agent started for device {}", settings.device_id);

        Ok(Self {
            shutdown,
            tracker: tracker_controller,
            handles,
            router,
            commands,
            verdicts,
            transport,
            metrics,
        })
    }

    /// "Apply latest policy now": refetch and re-evaluate the foreground app.
    pub fn request_refresh(&self) {
        self.router.request_refresh();
    }

    pub async fn apply_command(&self, command: RemoteCommand) {
        self.router.apply(command).await;
    }

    pub fn command_sender(&self) -> mpsc::Sender<RemoteCommand> {
        self.commands.clone()
    }

    pub fn subscribe_verdicts(&self) -> broadcast::Receiver<EnforcementVerdict> {
        self.verdicts.subscribe()
    }

    pub fn subscribe_overlay(&self) -> watch::Receiver<OverlayState> {
        self.router.overlay.subscribe()
    }

    pub fn overlay_state(&self) -> OverlayState {
        self.router.overlay.state()
    }

    pub fn overlay(&self) -> &OverlayController {
        &self.router.overlay
    }

    pub fn cache(&self) -> &PolicyCache {
        &self.router.cache
    }

    pub fn transport(&self) -> &TransportStatus {
        &self.transport
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancels every loop and waits for all of them to finish.
    pub async fn shutdown(mut self) -> Result<()> {
        self.shutdown.cancel();
        self.tracker.stop().await?;
        for handle in self.handles.drain(..) {
            if let Err(err) = handle.await {
                log_warn!("agent task ended abnormally: {err}");
            }
        }
        log_info!("agent stopped");
        Ok(())
    }
}

async fn command_pump(
    router: CommandRouter,
    mut rx: mpsc::Receiver<RemoteCommand>,
    cancel_token: CancellationToken,
) {
    loop {
        tokio::select! {
            command = rx.recv() => {
                let Some(command) = command else { break };
                router.apply(command).await;
            }
            _ = cancel_token.cancelled() => break,
        }
    }
}

async fn prune_loop(
    store: Arc<dyn UsageStore>,
    retention_hours: u64,
    cancel_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = Utc::now();
                let cutoff = crate::sensing::store::retention_cutoff(now, retention_hours);
                match store.prune_older_than(cutoff).await {
                    Ok(0) => {}
                    Ok(removed) => log_info!("pruned {removed} usage records older than {cutoff}"),
                    Err(err) => log_warn!("usage pruning failed: {err:?}"),
                }
            }
            _ = cancel_token.cancelled() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BlockReason, Rule, RuleType};
    use crate::overlay::surface::testing::RecordingSurface;
    use crate::policy::PolicyError;
    use crate::sensing::{ForegroundApp, ForegroundPublisher, MemoryUsageStore, NoUsageStats};
    use crate::watchdog::host::testing::FakeHost;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct StaticFetcher(Mutex<Vec<Rule>>);

    #[async_trait]
    impl PolicyFetcher for StaticFetcher {
        async fn fetch_rules(&self) -> Result<Vec<Rule>, PolicyError> {
            Ok(self.0.lock().unwrap().clone())
        }
    }

    struct Harness {
        agent: AgentController,
        surface: RecordingSurface,
        _publisher: ForegroundPublisher,
    }

    async fn start_agent(rules: Vec<Rule>) -> Harness {
        let feed = ForegroundFeed::new();
        let publisher = feed.bind();
        publisher.publish(ForegroundApp::new("com.example.game", "Game"));
        let surface = RecordingSurface::default();

        let parts = AgentParts {
            settings: AgentSettings::default(),
            cache: PolicyCache::new(),
            fetcher: Arc::new(StaticFetcher(Mutex::new(rules))),
            policy_store: None,
            usage_store: Arc::new(MemoryUsageStore::new()),
            usage_stats: Arc::new(NoUsageStats),
            feed,
            foreground_probe: None,
            host: Arc::new(FakeHost::default()),
            surface: Box::new(surface.clone()),
            inbox: None,
            introspection_required: true,
        };
        let agent = AgentController::start(parts, CancellationToken::new())
            .await
            .unwrap();

        Harness {
            agent,
            surface,
            _publisher: publisher,
        }
    }

    async fn wait_for_overlay(agent: &AgentController, predicate: impl Fn(&OverlayState) -> bool) {
        let mut rx = agent.subscribe_overlay();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|state| predicate(state)))
            .await
            .expect("overlay did not reach expected state")
            .unwrap();
    }

    #[tokio::test]
    async fn remote_lock_and_unlock_drive_the_overlay() {
        let harness = start_agent(Vec::new()).await;
        let agent = &harness.agent;

        agent.command_sender().send(RemoteCommand::Lock).await.unwrap();
        wait_for_overlay(agent, |state| {
            state.visible && state.block_reason == Some(BlockReason::DeviceLock)
        })
        .await;
        assert!(agent.cache().snapshot().remote_lock);

        agent.command_sender().send(RemoteCommand::Unlock).await.unwrap();
        wait_for_overlay(agent, |state| !state.visible).await;
        assert!(!agent.cache().snapshot().remote_lock);

        harness.agent.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn clear_overlay_holds_until_verdict_changes() {
        let harness = start_agent(vec![
            Rule::new("b", RuleType::AppBlock).with_target("com.example.game")
        ])
        .await;
        let agent = &harness.agent;

        wait_for_overlay(agent, |state| state.visible).await;
        agent.apply_command(RemoteCommand::ClearOverlay).await;
        wait_for_overlay(agent, |state| !state.visible).await;

        agent.request_refresh();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(agent.overlay().flush().await);
        assert!(!agent.overlay_state().visible);
        assert_eq!(harness.surface.presented(), 1);

        harness.agent.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_hides_overlay_and_joins_loops() {
        let harness = start_agent(vec![Rule::new("lock", RuleType::DeviceLock)]).await;
        wait_for_overlay(&harness.agent, |state| state.visible).await;
        let overlay = harness.agent.overlay().clone();

        harness.agent.shutdown().await.unwrap();
        assert!(!overlay.state().visible);
    }
}
