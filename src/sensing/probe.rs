use anyhow::{anyhow, bail, Context, Result};
use std::process::Stdio;
use tokio::process::Command;
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::{ForegroundApp, ForegroundFeed, ForegroundPublisher};

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

const PROBE_TIMEOUT_SECS: u64 = 3;
/// Consecutive failures before the channel is reported unbound.
const MAX_FAILURES: u32 = 3;

/// Desktop introspection adapter: polls a command that prints the foreground
/// app as `identifier<TAB>display name` (display name optional) and publishes
/// it to the feed.
pub struct CommandForegroundProbe {
    command: Vec<String>,
    interval: Duration,
}

impl CommandForegroundProbe {
    pub fn new(command: Vec<String>, interval: Duration) -> Self {
        Self { command, interval }
    }

    pub async fn sample(&self) -> Result<Option<ForegroundApp>> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("empty foreground command"))?;

        let output = tokio::time::timeout(
            Duration::from_secs(PROBE_TIMEOUT_SECS),
            Command::new(program)
                .args(args)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| anyhow!("{program} timed out after {PROBE_TIMEOUT_SECS}s"))?
        .with_context(|| format!("failed to run {program}"))?;

        if !output.status.success() {
            bail!("{program} exited with {}", output.status);
        }
        Ok(parse_probe_output(&String::from_utf8_lossy(&output.stdout)))
    }

    pub async fn run(self, feed: ForegroundFeed, cancel_token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut publisher: Option<ForegroundPublisher> = Some(feed.bind());
        let mut failures = 0u32;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sample().await {
                        Ok(app) => {
                            if failures >= MAX_FAILURES {
                                log_info!("foreground probe recovered after {failures} failures");
                            }
                            failures = 0;
                            let bound = publisher.get_or_insert_with(|| feed.bind());
                            match app {
                                Some(app) => bound.publish(app),
                                None => bound.clear(),
                            }
                        }
                        Err(err) => {
                            failures += 1;
                            log_warn!("foreground probe failed ({failures}): {err:?}");
                            if let Some(bound) = &publisher {
                                bound.clear();
                            }
                            if failures == MAX_FAILURES {
                                log_warn!("foreground probe unbound after {MAX_FAILURES} failures");
                                publisher = None;
                            }
                        }
                    }
                }
                _ = cancel_token.cancelled() => {
                    log_info!("foreground probe shutting down");
                    break;
                }
            }
        }
    }
}

/// First non-empty line wins. Empty output means nothing is in the foreground.
pub fn parse_probe_output(stdout: &str) -> Option<ForegroundApp> {
    let line = stdout.lines().map(str::trim).find(|line| !line.is_empty())?;
    let (identifier, display_name) = match line.split_once('\t') {
        Some((identifier, name)) => (identifier.trim(), name.trim()),
        None => (line, line),
    };
    if identifier.is_empty() {
        return None;
    }
    let display_name = if display_name.is_empty() {
        identifier
    } else {
        display_name
    };
    Some(ForegroundApp::new(identifier, display_name))
}
