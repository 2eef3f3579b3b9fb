use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

/// Minimum retention for local usage records before the reporter may prune them.
pub const MIN_RETENTION_HOURS: u64 = 24;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentSettings {
    pub device_id: String,
    pub tick_interval_secs: u64,
    pub health_interval_secs: u64,
    pub overlay_liveness_secs: u64,
    pub wake_timer_secs: u64,
    pub periodic_job_mins: u64,
    pub companion_interval_secs: u64,
    pub restart_delay_ms: u64,
    pub policy_refresh_secs: u64,
    pub escalation_initial_secs: u64,
    pub escalation_max_secs: u64,
    pub usage_retention_hours: u64,
    /// JSON rule list written by the backend sync collaborator.
    pub policy_file: Option<PathBuf>,
    /// Program + args that draws the blocking surface; app and reason are appended.
    pub overlay_command: Option<Vec<String>>,
    /// Program + args printing the current foreground app identifier.
    pub foreground_command: Option<Vec<String>>,
    /// Program + args that forces the host to re-prioritise and rebind the agent.
    pub repair_command: Option<Vec<String>>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            device_id: format!("dev_{}", uuid::Uuid::new_v4()),
            tick_interval_secs: 5,
            health_interval_secs: 60,
            overlay_liveness_secs: 5,
            wake_timer_secs: 120,
            periodic_job_mins: 15,
            companion_interval_secs: 30,
            restart_delay_ms: 1_000,
            policy_refresh_secs: 300,
            escalation_initial_secs: 60,
            escalation_max_secs: 1_800,
            usage_retention_hours: 48,
            policy_file: None,
            overlay_command: None,
            foreground_command: None,
            repair_command: None,
        }
    }
}

impl AgentSettings {
    /// Shortened cadences for local debugging (`CURFEW_DEBUG=1`).
    pub fn with_debug_overrides(mut self) -> Self {
        self.tick_interval_secs = 1;
        self.health_interval_secs = 5;
        self.overlay_liveness_secs = 1;
        self.wake_timer_secs = 10;
        self.companion_interval_secs = 5;
        self.policy_refresh_secs = 15;
        self.escalation_initial_secs = 5;
        self.escalation_max_secs = 60;
        self
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs.max(1))
    }

    pub fn overlay_liveness_interval(&self) -> Duration {
        Duration::from_secs(self.overlay_liveness_secs.max(1))
    }

    pub fn wake_timer_interval(&self) -> Duration {
        Duration::from_secs(self.wake_timer_secs.max(1))
    }

    pub fn periodic_job_interval(&self) -> Duration {
        Duration::from_secs(self.periodic_job_mins.max(1) * 60)
    }

    pub fn companion_interval(&self) -> Duration {
        Duration::from_secs(self.companion_interval_secs.max(1))
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn policy_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.policy_refresh_secs.max(1))
    }

    pub fn escalation_initial(&self) -> Duration {
        Duration::from_secs(self.escalation_initial_secs.max(1))
    }

    pub fn escalation_max(&self) -> Duration {
        Duration::from_secs(self.escalation_max_secs.max(self.escalation_initial_secs).max(1))
    }

    pub fn usage_retention_hours(&self) -> u64 {
        self.usage_retention_hours.max(MIN_RETENTION_HOURS)
    }
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<AgentSettings>,
}

impl SettingsStore {
    /// Loads settings from `path`, falling back to defaults when the file is
    /// missing or unreadable. Defaults are written back so the generated
    /// device id stays stable across restarts.
    pub fn new(path: PathBuf) -> Result<Self> {
        let existing = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            match serde_json::from_str(&contents) {
                Ok(settings) => Some(settings),
                Err(err) => {
                    log::warn!(
                        "Ignoring unparsable settings at {}: {err}",
                        path.display()
                    );
                    None
                }
            }
        } else {
            None
        };

        let store = Self {
            path,
            data: RwLock::new(existing.clone().unwrap_or_default()),
        };

        if existing.is_none() {
            store.persist(&store.read())?;
        }

        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self) -> AgentSettings {
        self.read().clone()
    }

    pub fn update(&self, settings: AgentSettings) -> Result<()> {
        let mut guard = self.write();
        *guard = settings;
        self.persist(&guard)
    }

    pub fn reload(&self) -> Result<()> {
        let contents = fs::read_to_string(&self.path)?;
        let data: AgentSettings = serde_json::from_str(&contents)?;
        *self.write() = data;
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, AgentSettings> {
        self.data.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, AgentSettings> {
        self.data.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, data: &AgentSettings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }
}
