use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Local, NaiveDate, Utc};
use std::sync::Mutex;

use crate::{models::UsageRecord, settings::MIN_RETENTION_HOURS};

/// Append-only usage log. The tracker is the only writer; the rule engine only
/// sees aggregates.
#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn append(&self, record: &UsageRecord) -> Result<()>;

    async fn total_for_day(&self, day: NaiveDate) -> Result<i64>;

    async fn total_for_app_on_day(&self, app_identifier: &str, day: NaiveDate) -> Result<i64>;

    /// Records for the external reporter, oldest first.
    async fn records_since(&self, since: DateTime<Utc>) -> Result<Vec<UsageRecord>>;

    /// Deletes records older than `cutoff`, never touching the last 24 hours.
    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    async fn today_total(&self) -> Result<i64> {
        self.total_for_day(Local::now().date_naive()).await
    }

    async fn today_total_for_app(&self, app_identifier: &str) -> Result<i64> {
        self.total_for_app_on_day(app_identifier, Local::now().date_naive())
            .await
    }
}

pub fn retention_cutoff(now: DateTime<Utc>, retention_hours: u64) -> DateTime<Utc> {
    let hours = retention_hours.max(MIN_RETENTION_HOURS).min(i64::MAX as u64) as i64;
    now - Duration::hours(hours)
}

pub fn clamp_to_retention_floor(cutoff: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    cutoff.min(retention_cutoff(now, MIN_RETENTION_HOURS))
}

#[derive(Default)]
pub struct MemoryUsageStore {
    records: Mutex<Vec<UsageRecord>>,
}

impl MemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<UsageRecord> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<UsageRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl UsageStore for MemoryUsageStore {
    async fn append(&self, record: &UsageRecord) -> Result<()> {
        let mut record = record.clone();
        record.duration_seconds = record.duration_seconds.max(0);
        self.lock().push(record);
        Ok(())
    }

    async fn total_for_day(&self, day: NaiveDate) -> Result<i64> {
        Ok(self
            .lock()
            .iter()
            .filter(|record| record.local_day() == day)
            .map(|record| record.duration_seconds)
            .sum())
    }

    async fn total_for_app_on_day(&self, app_identifier: &str, day: NaiveDate) -> Result<i64> {
        Ok(self
            .lock()
            .iter()
            .filter(|record| {
                record.local_day() == day
                    && record
                        .app_identifier
                        .eq_ignore_ascii_case(app_identifier.trim())
            })
            .map(|record| record.duration_seconds)
            .sum())
    }

    async fn records_since(&self, since: DateTime<Utc>) -> Result<Vec<UsageRecord>> {
        let mut records: Vec<_> = self
            .lock()
            .iter()
            .filter(|record| record.timestamp >= since)
            .cloned()
            .collect();
        records.sort_by_key(|record| record.timestamp);
        Ok(records)
    }

    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let cutoff = clamp_to_retention_floor(cutoff, Utc::now());
        let mut records = self.lock();
        let before = records.len();
        records.retain(|record| record.timestamp >= cutoff);
        Ok(before - records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retention_cutoff_applies_floor() {
        let now = Utc::now();
        assert_eq!(retention_cutoff(now, 1), now - Duration::hours(24));
        assert_eq!(retention_cutoff(now, 72), now - Duration::hours(72));
    }

    #[tokio::test]
    async fn memory_store_prune_keeps_recent_day() {
        let store = MemoryUsageStore::new();
        let now = Utc::now();
        for hours_ago in [1, 23, 25, 100] {
            store
                .append(&UsageRecord {
                    app_identifier: "a".into(),
                    display_name: "A".into(),
                    duration_seconds: 5,
                    timestamp: now - Duration::hours(hours_ago),
                })
                .await
                .unwrap();
        }

        assert_eq!(store.prune_older_than(now).await.unwrap(), 2);
        assert_eq!(store.records().len(), 2);
    }
}
