use anyhow::{Context, Result};
use std::path::PathBuf;
use tokio::time::{Duration, Instant, MissedTickBehavior};

use crate::watchdog::{Host, ProcessTarget, SystemHost};

const RELAUNCH_WAIT: Duration = Duration::from_secs(10);
const RELAUNCH_POLL: Duration = Duration::from_millis(200);

/// The companion process: periodically asks for the agent and services the
/// job registry. Holds no enforcement state of its own.
pub async fn run_companion(data_dir: PathBuf, interval: Duration) -> Result<()> {
    let host = SystemHost::for_current_exe(data_dir, None)
        .context("failed to locate the current executable")?;
    let me = ProcessTarget::companion();
    if !host.claim(&me).context("failed to claim companion pid file")? {
        log::info!("another companion is already running");
        return Ok(());
    }

    let agent = ProcessTarget::agent();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    log::info!("companion polling every {interval:?}");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match host.ensure_running(&agent).await {
                    Ok(true) => log::info!("companion restarted the agent"),
                    Ok(false) => {}
                    Err(err) => log::warn!("companion could not ensure agent: {err}"),
                }
                if let Err(err) = host.run_due_jobs(Instant::now().into_std()).await {
                    log::warn!("companion could not service job registry: {err}");
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    host.release(&me);
    Ok(())
}

/// Starts the agent if it is down. This is what OS-registered jobs run, at
/// boot and on every timer firing.
pub async fn ensure_agent(data_dir: PathBuf) -> Result<()> {
    let host = SystemHost::for_current_exe(data_dir, None)
        .context("failed to locate the current executable")?;
    if host.ensure_running(&ProcessTarget::agent()).await? {
        log::info!("agent started");
    }
    Ok(())
}

/// Delayed one-shot restart used by the task-removed hook. Waits for the old
/// agent to exit so the restart is not mistaken for a no-op.
pub async fn relaunch(data_dir: PathBuf, delay: Duration) -> Result<()> {
    let host = SystemHost::for_current_exe(data_dir, None)
        .context("failed to locate the current executable")?;
    let agent = ProcessTarget::agent();

    tokio::time::sleep(delay).await;

    let deadline = Instant::now() + RELAUNCH_WAIT;
    while host.is_running(&agent).await? {
        if Instant::now() >= deadline {
            log::info!("agent still running after {RELAUNCH_WAIT:?}; nothing to relaunch");
            return Ok(());
        }
        tokio::time::sleep(RELAUNCH_POLL).await;
    }

    if host.ensure_running(&agent).await? {
        log::info!("agent relaunched");
    }
    Ok(())
}
