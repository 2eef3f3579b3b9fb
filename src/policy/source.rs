use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{path::PathBuf, sync::Arc};
use thiserror::Error;
use tokio::sync::watch;

use crate::models::Rule;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("policy source unavailable: {0}")]
    Unavailable(String),
    #[error("policy payload rejected: {0}")]
    Invalid(String),
    #[error("policy I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Immutable view of the active rule set plus the remote lock flag.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PolicySnapshot {
    pub rules: Arc<Vec<Rule>>,
    /// Set by an explicit remote lock command, evaluated as a device lock.
    pub remote_lock: bool,
    pub revision: u64,
    pub fetched_at: Option<DateTime<Utc>>,
}

impl PolicySnapshot {
    /// True until the first successful refresh or restore.
    pub fn is_unrefreshed(&self) -> bool {
        self.fetched_at.is_none() && self.rules.is_empty()
    }
}

/// Transport seam towards the backend.
#[async_trait]
pub trait PolicyFetcher: Send + Sync {
    async fn fetch_rules(&self) -> Result<Vec<Rule>, PolicyError>;
}

/// Persistence for the last-known-good snapshot.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn save_policy(&self, snapshot: &PolicySnapshot) -> Result<()>;
    async fn load_policy(&self) -> Result<Option<PolicySnapshot>>;
}

/// Reads a JSON rule list dropped on disk by the sync collaborator.
pub struct FilePolicyFetcher {
    path: PathBuf,
}

impl FilePolicyFetcher {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl PolicyFetcher for FilePolicyFetcher {
    async fn fetch_rules(&self) -> Result<Vec<Rule>, PolicyError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(PolicyError::Unavailable(format!(
                    "{} does not exist yet",
                    self.path.display()
                )));
            }
            Err(err) => return Err(err.into()),
        };

        serde_json::from_str(&contents).map_err(|err| PolicyError::Invalid(err.to_string()))
    }
}

/// Holder of the current policy snapshot.
///
/// Snapshots are replaced wholesale through a watch channel: readers grab an
/// `Arc` and never observe a half-applied rule set, and `snapshot()` never
/// waits on a refresh in flight.
#[derive(Clone)]
pub struct PolicyCache {
    tx: Arc<watch::Sender<Arc<PolicySnapshot>>>,
}

impl Default for PolicyCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyCache {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Arc::new(PolicySnapshot::default()));
        Self { tx: Arc::new(tx) }
    }

    pub fn with_snapshot(snapshot: PolicySnapshot) -> Self {
        let cache = Self::new();
        cache.restore(snapshot);
        cache
    }

    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<PolicySnapshot>> {
        self.tx.subscribe()
    }

    /// Installs a previously persisted snapshot as-is.
    pub fn restore(&self, snapshot: PolicySnapshot) {
        self.tx.send_replace(Arc::new(snapshot));
    }

    /// Publishes a freshly fetched rule set, keeping the remote lock flag.
    pub fn replace_rules(&self, rules: Vec<Rule>, fetched_at: DateTime<Utc>) -> Arc<PolicySnapshot> {
        let mut published = None;
        self.tx.send_modify(|current| {
            let next = Arc::new(PolicySnapshot {
                rules: Arc::new(rules),
                remote_lock: current.remote_lock,
                revision: current.revision + 1,
                fetched_at: Some(fetched_at),
            });
            published = Some(next.clone());
            *current = next;
        });
        published.unwrap_or_else(|| self.snapshot())
    }

    /// Returns whether the flag changed.
    pub fn set_remote_lock(&self, locked: bool) -> bool {
        self.tx.send_if_modified(|current| {
            if current.remote_lock == locked {
                return false;
            }
            *current = Arc::new(PolicySnapshot {
                rules: current.rules.clone(),
                remote_lock: locked,
                revision: current.revision + 1,
                fetched_at: current.fetched_at,
            });
            true
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RuleType;

    #[test]
    fn replace_rules_swaps_whole_set_and_keeps_lock() {
        let cache = PolicyCache::new();
        assert!(cache.snapshot().is_unrefreshed());

        cache.set_remote_lock(true);
        let before = cache.snapshot();

        cache.replace_rules(
            vec![Rule::new("r1", RuleType::AppBlock).with_target("a")],
            Utc::now(),
        );
        let after = cache.snapshot();

        assert!(before.rules.is_empty(), "old snapshot must stay untouched");
        assert_eq!(after.rules.len(), 1);
        assert!(after.remote_lock);
        assert!(after.revision > before.revision);
    }

    #[test]
    fn set_remote_lock_reports_changes_only() {
        let cache = PolicyCache::new();
        assert!(cache.set_remote_lock(true));
        assert!(!cache.set_remote_lock(true));
        assert!(cache.set_remote_lock(false));
    }

    #[tokio::test]
    async fn subscribers_observe_replacements() {
        let cache = PolicyCache::new();
        let mut rx = cache.subscribe();

        cache.replace_rules(vec![Rule::new("r1", RuleType::DeviceLock)], Utc::now());

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().rules.len(), 1);
    }

    #[tokio::test]
    async fn file_fetcher_distinguishes_missing_from_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.json");
        let fetcher = FilePolicyFetcher::new(path.clone());

        assert!(matches!(
            fetcher.fetch_rules().await,
            Err(PolicyError::Unavailable(_))
        ));

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(fetcher.fetch_rules().await, Err(PolicyError::Invalid(_))));

        std::fs::write(&path, r#"[{"id": "r1", "type": "device_lock"}]"#).unwrap();
        let rules = fetcher.fetch_rules().await.unwrap();
        assert_eq!(rules[0].rule_type, RuleType::DeviceLock);
    }
}
