use anyhow::{bail, Context, Result};
use log::info;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use super::loop_worker::{tracking_loop, TrackingContext};
use super::tracker::UsageTracker;

/// Owns the tracking loop task. The loop is cancelled through a child of the
/// agent's token, so agent shutdown stops it too.
pub struct TrackerController {
    handle: Option<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
}

impl Default for TrackerController {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackerController {
    pub fn new() -> Self {
        Self {
            handle: None,
            cancel_token: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    pub fn start(
        &mut self,
        tracker: UsageTracker,
        ctx: TrackingContext,
        interval: Duration,
        parent: &CancellationToken,
    ) -> Result<()> {
        if self.is_running() {
            bail!("tracking already active");
        }

        let cancel_token = parent.child_token();
        let handle = tokio::spawn(tracking_loop(tracker, ctx, interval, cancel_token.clone()));

        info!("tracking loop started (every {interval:?})");
        self.handle = Some(handle);
        self.cancel_token = Some(cancel_token);
        Ok(())
    }

    pub async fn stop(&mut self) -> Result<()> {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }

        if let Some(handle) = self.handle.take() {
            handle
                .await
                .context("tracking loop task failed to join")
                .map(|_| ())
        } else {
            Ok(())
        }
    }
}
