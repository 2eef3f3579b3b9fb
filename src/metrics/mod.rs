mod types;

pub use types::{Counter, MetricsSnapshot, SystemMetrics};

use chrono::{DateTime, Utc};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::Mutex;

/// Own-process CPU/RSS plus enforcement counters.
///
/// Counters are lock-free so the tracker and overlay hot paths can bump them
/// synchronously; only the sysinfo sample takes the async lock.
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<SystemState>>,
    counters: Arc<Counters>,
}

struct SystemState {
    system: System,
    pid: Pid,
    last_escalation: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Counters {
    evaluations: AtomicU64,
    blocking_verdicts: AtomicU64,
    overlay_constructions: AtomicU64,
    overlay_failures: AtomicU64,
    escalations: AtomicU64,
    trigger_failures: AtomicU64,
    tick_timeouts: AtomicU64,
}

impl Counters {
    fn slot(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::Evaluations => &self.evaluations,
            Counter::BlockingVerdicts => &self.blocking_verdicts,
            Counter::OverlayConstructions => &self.overlay_constructions,
            Counter::OverlayFailures => &self.overlay_failures,
            Counter::Escalations => &self.escalations,
            Counter::TriggerFailures => &self.trigger_failures,
            Counter::TickTimeouts => &self.tick_timeouts,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        let mut system = System::new();
        let pid = Pid::from_u32(std::process::id());

        // Initial refresh to establish baseline for CPU calculation
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]));

        Self {
            inner: Arc::new(Mutex::new(SystemState {
                system,
                pid,
                last_escalation: None,
            })),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn increment(&self, counter: Counter) {
        self.counters.slot(counter).fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, counter: Counter, amount: u64) {
        self.counters.slot(counter).fetch_add(amount, Ordering::Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counters.slot(counter).load(Ordering::Relaxed)
    }

    pub async fn record_escalation(&self, at: DateTime<Utc>) {
        self.increment(Counter::Escalations);
        self.inner.lock().await.last_escalation = Some(at);
    }

    pub async fn get_snapshot(&self) -> MetricsSnapshot {
        let mut state = self.inner.lock().await;
        let pid = state.pid;

        // Refresh to get current CPU/RAM
        state.system.refresh_processes(ProcessesToUpdate::Some(&[pid]));

        let system = state
            .system
            .process(pid)
            .map(|process| SystemMetrics {
                cpu_percent: process.cpu_usage(),
                memory_mb: process.memory() as f64 / 1024.0 / 1024.0,
            })
            .unwrap_or_default();

        MetricsSnapshot {
            system,
            evaluations: self.get(Counter::Evaluations),
            blocking_verdicts: self.get(Counter::BlockingVerdicts),
            overlay_constructions: self.get(Counter::OverlayConstructions),
            overlay_failures: self.get(Counter::OverlayFailures),
            escalations: self.get(Counter::Escalations),
            trigger_failures: self.get(Counter::TriggerFailures),
            tick_timeouts: self.get(Counter::TickTimeouts),
            last_escalation: state.last_escalation,
        }
    }
}
