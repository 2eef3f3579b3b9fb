use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Counter {
    Evaluations,
    BlockingVerdicts,
    OverlayConstructions,
    OverlayFailures,
    Escalations,
    TriggerFailures,
    TickTimeouts,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub cpu_percent: f32,
    pub memory_mb: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub system: SystemMetrics,
    pub evaluations: u64,
    pub blocking_verdicts: u64,
    pub overlay_constructions: u64,
    pub overlay_failures: u64,
    pub escalations: u64,
    pub trigger_failures: u64,
    pub tick_timeouts: u64,
    pub last_escalation: Option<DateTime<Utc>>,
}
