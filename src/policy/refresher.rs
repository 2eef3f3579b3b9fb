use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::{log_debug, log_info, log_warn};

use super::{PolicyCache, PolicyError, PolicyFetcher, PolicyStore};

const ENABLE_LOGS: bool = true;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Updated { revision: u64 },
    Unchanged,
}

/// Pulls rule sets from the fetcher off the enforcement hot path and
/// publishes them into the cache. A failed refresh keeps the last-known-good
/// snapshot and is retried on the next cycle.
pub struct PolicyRefresher {
    cache: PolicyCache,
    fetcher: Arc<dyn PolicyFetcher>,
    store: Option<Arc<dyn PolicyStore>>,
}

impl PolicyRefresher {
    pub fn new(
        cache: PolicyCache,
        fetcher: Arc<dyn PolicyFetcher>,
        store: Option<Arc<dyn PolicyStore>>,
    ) -> Self {
        Self {
            cache,
            fetcher,
            store,
        }
    }

    /// Restores the persisted snapshot, if any, so enforcement resumes with the
    /// last good policy before the first fetch completes.
    pub async fn restore(&self) -> bool {
        let Some(store) = &self.store else {
            return false;
        };
        match store.load_policy().await {
            Ok(Some(snapshot)) => {
                log_info!(
                    "restored policy revision {} ({} rules, remote_lock={})",
                    snapshot.revision,
                    snapshot.rules.len(),
                    snapshot.remote_lock
                );
                self.cache.restore(snapshot);
                true
            }
            Ok(None) => false,
            Err(err) => {
                log_warn!("failed to restore persisted policy: {err:?}");
                false
            }
        }
    }

    pub async fn refresh_once(&self) -> Result<RefreshOutcome, PolicyError> {
        let rules = self.fetcher.fetch_rules().await?;

        let current = self.cache.snapshot();
        if current.fetched_at.is_some() && *current.rules == rules {
            return Ok(RefreshOutcome::Unchanged);
        }

        let published = self.cache.replace_rules(rules, Utc::now());
        if let Some(store) = &self.store {
            if let Err(err) = store.save_policy(&published).await {
                log_warn!("policy revision {} not persisted: {err:?}", published.revision);
            }
        }

        Ok(RefreshOutcome::Updated {
            revision: published.revision,
        })
    }

    /// Refreshes at startup, on every `refresh` notification and on a fixed
    /// cadence until cancelled.
    pub async fn run(self, interval: Duration, refresh: Arc<Notify>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = refresh.notified() => {
                    log_debug!("explicit policy refresh requested");
                }
                _ = cancel.cancelled() => {
                    log_info!("policy refresher shutting down");
                    break;
                }
            }

            match self.refresh_once().await {
                Ok(RefreshOutcome::Updated { revision }) => {
                    log_info!("policy updated to revision {revision}");
                }
                Ok(RefreshOutcome::Unchanged) => log_debug!("policy unchanged"),
                Err(err) => log_warn!("policy refresh failed, keeping last-known-good: {err}"),
            }
        }
    }
}
