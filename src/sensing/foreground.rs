use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForegroundApp {
    pub identifier: String,
    pub display_name: String,
}

impl ForegroundApp {
    pub fn new(identifier: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            display_name: display_name.into(),
        }
    }
}

/// Realtime foreground-app signal.
///
/// Platform introspection (accessibility service, window tracker) holds a
/// `ForegroundPublisher`; everything else reads through the feed. The feed
/// counts as bound while at least one publisher is alive, which is what the
/// health monitor and overlay liveness check treat as "introspection channel
/// bound".
#[derive(Clone)]
pub struct ForegroundFeed {
    tx: Arc<watch::Sender<Option<ForegroundApp>>>,
    publishers: Arc<AtomicUsize>,
}

impl Default for ForegroundFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl ForegroundFeed {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            tx: Arc::new(tx),
            publishers: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn bind(&self) -> ForegroundPublisher {
        self.publishers.fetch_add(1, Ordering::SeqCst);
        ForegroundPublisher {
            tx: self.tx.clone(),
            publishers: self.publishers.clone(),
        }
    }

    pub fn is_bound(&self) -> bool {
        self.publishers.load(Ordering::SeqCst) > 0
    }

    pub fn current(&self) -> Option<ForegroundApp> {
        if !self.is_bound() {
            return None;
        }
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<ForegroundApp>> {
        self.tx.subscribe()
    }
}

pub struct ForegroundPublisher {
    tx: Arc<watch::Sender<Option<ForegroundApp>>>,
    publishers: Arc<AtomicUsize>,
}

impl ForegroundPublisher {
    pub fn publish(&self, app: ForegroundApp) {
        self.tx.send_if_modified(|current| {
            if current.as_ref() == Some(&app) {
                return false;
            }
            *current = Some(app);
            true
        });
    }

    pub fn clear(&self) {
        self.tx.send_if_modified(|current| current.take().is_some());
    }
}

impl Drop for ForegroundPublisher {
    fn drop(&mut self) {
        // Last publisher gone: the channel is unbound and its value is stale.
        if self.publishers.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.tx.send_replace(None);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppLastUsed {
    pub identifier: String,
    pub display_name: String,
    pub last_used: DateTime<Utc>,
}

/// Coarse batch usage statistics used when no realtime signal is available.
#[async_trait]
pub trait UsageStatsSource: Send + Sync {
    async fn last_used_since(&self, since: DateTime<Utc>) -> Result<Vec<AppLastUsed>>;
}

/// Host without a batch statistics source.
pub struct NoUsageStats;

#[async_trait]
impl UsageStatsSource for NoUsageStats {
    async fn last_used_since(&self, _since: DateTime<Utc>) -> Result<Vec<AppLastUsed>> {
        Ok(Vec::new())
    }
}
