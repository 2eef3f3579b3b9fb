pub mod agent;
pub mod companion;
pub mod db;
pub mod health;
pub mod metrics;
pub mod models;
pub mod overlay;
pub mod policy;
pub mod sensing;
pub mod settings;
pub mod utils;
pub mod watchdog;

use anyhow::{Context, Result};
use std::{fs, path::PathBuf, sync::Arc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use agent::{AgentController, AgentParts, CommandInbox};
use db::Database;
use overlay::{HeadlessSurface, OverlaySurface, ProcessSurface};
use policy::{FilePolicyFetcher, PolicyCache, PolicyStore};
use sensing::{CommandForegroundProbe, ForegroundFeed, NoUsageStats};
use settings::{AgentSettings, SettingsStore};
use watchdog::{Coverage, Host, ProcessTarget, SystemHost, WatchdogCoordinator};

pub use companion::{ensure_agent, relaunch, run_companion};

pub fn init_logging() {
    // Initialize logging (reads RUST_LOG env var)
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();
}

pub fn debug_mode() -> bool {
    std::env::var("CURFEW_DEBUG")
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// `<data_local_dir>/curfew`, falling back to the working directory.
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("curfew")
}

pub fn load_settings(data_dir: &std::path::Path) -> Result<AgentSettings> {
    fs::create_dir_all(data_dir)
        .with_context(|| format!("Failed to create {}", data_dir.display()))?;
    let store = SettingsStore::new(data_dir.join("settings.json"))?;
    let settings = store.get();
    if debug_mode() {
        log::info!("CURFEW_DEBUG set; using shortened intervals");
        Ok(settings.with_debug_overrides())
    } else {
        Ok(settings)
    }
}

/// Runs the enforcement agent until shutdown or task removal.
pub async fn run_agent(data_dir: PathBuf) -> Result<()> {
    let settings = load_settings(&data_dir)?;

    let host = SystemHost::for_current_exe(data_dir.clone(), settings.repair_command.clone())
        .context("failed to locate the current executable")?;
    let me = ProcessTarget::agent();
    if !host.claim(&me).context("failed to claim agent pid file")? {
        log::info!("agent already running; nothing to do");
        return Ok(());
    }

    match host.restore_persisted().await {
        Ok(restored) => log::info!("restored {restored} persisted recovery job(s)"),
        Err(err) => log::warn!("persisted job registry unreadable: {err}"),
    }

    let database = Arc::new(Database::new(data_dir.join("curfew.sqlite3"))?);

    let policy_path = settings
        .policy_file
        .clone()
        .unwrap_or_else(|| data_dir.join("policy.json"));

    let foreground_probe = settings
        .foreground_command
        .clone()
        .map(|command| CommandForegroundProbe::new(command, settings.tick_interval()));
    if foreground_probe.is_none() {
        log::warn!("no foreground command configured; realtime introspection unavailable");
    }

    let surface: Box<dyn OverlaySurface> = match settings.overlay_command.clone() {
        Some(command) => Box::new(ProcessSurface::new(command)),
        None => {
            log::warn!("no overlay command configured; blocks are only logged");
            Box::new(HeadlessSurface::new())
        }
    };

    let shutdown = CancellationToken::new();
    let host_handle: Arc<dyn Host> = Arc::new(host.clone());

    let parts = AgentParts {
        settings: settings.clone(),
        cache: PolicyCache::new(),
        fetcher: Arc::new(FilePolicyFetcher::new(policy_path)),
        policy_store: Some(database.clone() as Arc<dyn PolicyStore>),
        usage_store: database,
        usage_stats: Arc::new(NoUsageStats),
        feed: ForegroundFeed::new(),
        introspection_required: foreground_probe.is_some(),
        foreground_probe,
        host: host_handle.clone(),
        surface,
        inbox: Some(CommandInbox::new(
            data_dir.join("inbox"),
            settings.tick_interval(),
        )),
    };
    let agent = AgentController::start(parts, shutdown.clone()).await?;

    let task_removed = Arc::new(Notify::new());
    let watchdog = WatchdogCoordinator::standard(
        host_handle,
        &settings,
        task_removed.clone(),
        shutdown.clone(),
    )
    .with_metrics(agent.metrics().clone());
    let report = watchdog.arm().await;
    if report.coverage() == Coverage::None {
        log::error!("running without any recovery trigger");
    }

    tokio::spawn(listen_for_signals(shutdown.clone(), task_removed));

    shutdown.cancelled().await;
    agent.shutdown().await?;
    host.shutdown_timers().await;
    host.release(&me);
    Ok(())
}

/// Ctrl-C stops the agent. SIGTERM is how a session manager removes the
/// task, so it takes the hard-restart path.
async fn listen_for_signals(shutdown: CancellationToken, task_removed: Arc<Notify>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => shutdown.cancel(),
                    _ = terminate.recv() => task_removed.notify_one(),
                    _ = shutdown.cancelled() => {}
                }
                return;
            }
            Err(err) => log::warn!("SIGTERM handler unavailable: {err}"),
        }
    }

    drop(task_removed);
    tokio::select! {
        _ = tokio::signal::ctrl_c() => shutdown.cancel(),
        _ = shutdown.cancelled() => {}
    }
}

/// Uninstall flow: removes every recovery trigger and stops the agent.
pub async fn disarm(data_dir: PathBuf) -> Result<()> {
    let settings = load_settings(&data_dir)?;
    let host = SystemHost::for_current_exe(data_dir, None)
        .context("failed to locate the current executable")?;

    let watchdog = WatchdogCoordinator::standard(
        Arc::new(host.clone()),
        &settings,
        Arc::new(Notify::new()),
        CancellationToken::new(),
    );
    let report = watchdog.disarm().await;
    for failure in report.failures() {
        if let Some(err) = &failure.error {
            log::warn!("{} not disarmed: {err}", failure.kind);
        }
    }

    if host.terminate(&ProcessTarget::agent())? {
        log::info!("agent stopped");
    }
    Ok(())
}
