use chrono::{DateTime, Local, Utc};
use std::{collections::HashMap, sync::Arc};

use crate::{
    models::{EnforcementVerdict, UsageRecord},
    policy::RuleEngine,
};

use super::{ForegroundApp, ForegroundFeed, UsageStatsSource, UsageStore};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_warn};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickOutcome {
    pub attributed: Option<UsageRecord>,
    pub verdict: Option<EnforcementVerdict>,
}

/// Converts the time between samples into attributed usage and evaluates the
/// foreground app against the current policy.
///
/// `last_check` advances on every tick, attributed or not, so a long outage of
/// both foreground sources never turns into one huge backlog. Sub-second
/// remainders are carried into the next attributed tick of the same app so
/// whole-second totals do not drift low.
pub struct UsageTracker {
    feed: ForegroundFeed,
    stats: Arc<dyn UsageStatsSource>,
    store: Arc<dyn UsageStore>,
    engine: RuleEngine,
    last_check: Option<DateTime<Utc>>,
    carry_ms: i64,
    // App the carried remainder belongs to.
    carry_app: Option<String>,
}

impl UsageTracker {
    pub fn new(
        feed: ForegroundFeed,
        stats: Arc<dyn UsageStatsSource>,
        store: Arc<dyn UsageStore>,
        engine: RuleEngine,
    ) -> Self {
        Self {
            feed,
            stats,
            store,
            engine,
            last_check: None,
            carry_ms: 0,
            carry_app: None,
        }
    }

    pub fn last_check(&self) -> Option<DateTime<Utc>> {
        self.last_check
    }

    pub async fn tick(&mut self, now: DateTime<Utc>) -> TickOutcome {
        let previous = self.last_check.replace(now);

        let elapsed_ms = match previous {
            Some(last) => (now - last).num_milliseconds(),
            // First sample: nothing to attribute yet, but still enforce.
            None => 0,
        };

        if previous.is_some() && elapsed_ms <= 0 {
            log_debug!("skipping tick with non-positive elapsed time ({elapsed_ms}ms)");
            return TickOutcome::default();
        }

        let since = previous.unwrap_or(now);
        let Some(app) = self.resolve_foreground(since).await else {
            self.carry_ms = 0;
            self.carry_app = None;
            return TickOutcome::default();
        };

        let attributed = self.attribute(&app, elapsed_ms, now).await;
        let verdict = self.evaluate(&app, now).await;

        TickOutcome {
            attributed,
            verdict: Some(verdict),
        }
    }

    /// Evaluates the current foreground app against the latest policy without
    /// attributing time. Used when the policy changes between ticks; the
    /// elapsed time is picked up by the next regular tick.
    pub async fn reevaluate(&self, now: DateTime<Utc>) -> Option<EnforcementVerdict> {
        let since = self.last_check.unwrap_or(now);
        let app = self.resolve_foreground(since).await?;
        Some(self.evaluate(&app, now).await)
    }

    async fn resolve_foreground(&self, since: DateTime<Utc>) -> Option<ForegroundApp> {
        if let Some(app) = self.feed.current() {
            return Some(app);
        }

        match self.stats.last_used_since(since).await {
            Ok(stats) => stats
                .into_iter()
                .filter(|entry| entry.last_used >= since)
                .max_by_key(|entry| entry.last_used)
                .map(|entry| ForegroundApp::new(entry.identifier, entry.display_name)),
            Err(err) => {
                log_warn!("batch usage statistics unavailable: {err:?}");
                None
            }
        }
    }

    async fn attribute(
        &mut self,
        app: &ForegroundApp,
        elapsed_ms: i64,
        now: DateTime<Utc>,
    ) -> Option<UsageRecord> {
        let same_app = self
            .carry_app
            .as_deref()
            .is_some_and(|carried| carried.eq_ignore_ascii_case(&app.identifier));
        if !same_app {
            self.carry_ms = 0;
            self.carry_app = Some(app.identifier.clone());
        }

        let total_ms = elapsed_ms.max(0) + self.carry_ms;
        let seconds = total_ms / 1000;
        self.carry_ms = total_ms % 1000;

        if seconds == 0 {
            return None;
        }

        let record = UsageRecord {
            app_identifier: app.identifier.clone(),
            display_name: app.display_name.clone(),
            duration_seconds: seconds,
            timestamp: now,
        };

        match self.store.append(&record).await {
            Ok(()) => Some(record),
            Err(err) => {
                log_warn!(
                    "failed to persist {}s of usage for {}: {err:?}",
                    seconds,
                    app.identifier
                );
                None
            }
        }
    }

    async fn evaluate(&self, app: &ForegroundApp, now: DateTime<Utc>) -> EnforcementVerdict {
        let local_now = now.with_timezone(&Local);
        let day = local_now.date_naive();

        let usage_today = match self.store.total_for_day(day).await {
            Ok(total) => total,
            Err(err) => {
                log_warn!("daily usage total unavailable, evaluating with 0: {err:?}");
                0
            }
        };
        let usage_app = match self.store.total_for_app_on_day(&app.identifier, day).await {
            Ok(total) => total,
            Err(err) => {
                log_warn!(
                    "usage total for {} unavailable, evaluating with 0: {err:?}",
                    app.identifier
                );
                0
            }
        };

        let usage_per_app = HashMap::from([(app.identifier.clone(), usage_app)]);
        self.engine.evaluate_at(
            &app.identifier,
            usage_today,
            &usage_per_app,
            local_now.naive_local(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BlockReason, Rule, RuleType};
    use crate::policy::PolicyCache;
    use crate::sensing::{AppLastUsed, MemoryUsageStore, NoUsageStats};
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::Duration;

    struct FixedStats(Vec<AppLastUsed>);

    #[async_trait]
    impl UsageStatsSource for FixedStats {
        async fn last_used_since(&self, _since: DateTime<Utc>) -> Result<Vec<AppLastUsed>> {
            Ok(self.0.clone())
        }
    }

    fn tracker_with(
        feed: ForegroundFeed,
        stats: Arc<dyn UsageStatsSource>,
        cache: PolicyCache,
    ) -> (UsageTracker, Arc<MemoryUsageStore>) {
        let store = Arc::new(MemoryUsageStore::new());
        let tracker = UsageTracker::new(feed, stats, store.clone(), RuleEngine::new(cache));
        (tracker, store)
    }

    #[tokio::test]
    async fn realtime_signal_gets_full_elapsed_time() {
        let feed = ForegroundFeed::new();
        let publisher = feed.bind();
        publisher.publish(ForegroundApp::new("video", "Video"));
        let (mut tracker, store) = tracker_with(feed, Arc::new(NoUsageStats), PolicyCache::new());

        let start = Utc::now();
        let first = tracker.tick(start).await;
        assert!(first.attributed.is_none());
        assert!(first.verdict.is_some());

        let second = tracker.tick(start + Duration::seconds(5)).await;
        let record = second.attributed.unwrap();
        assert_eq!(record.app_identifier, "video");
        assert_eq!(record.duration_seconds, 5);
        assert_eq!(store.records().len(), 1);
    }

    #[tokio::test]
    async fn falls_back_to_most_recently_used_app() {
        let start = Utc::now();
        let stats = Arc::new(FixedStats(vec![
            AppLastUsed {
                identifier: "older".into(),
                display_name: "Older".into(),
                last_used: start + Duration::seconds(1),
            },
            AppLastUsed {
                identifier: "newer".into(),
                display_name: "Newer".into(),
                last_used: start + Duration::seconds(4),
            },
            AppLastUsed {
                identifier: "stale".into(),
                display_name: "Stale".into(),
                last_used: start - Duration::hours(1),
            },
        ]));
        let (mut tracker, _store) = tracker_with(ForegroundFeed::new(), stats, PolicyCache::new());

        tracker.tick(start).await;
        let outcome = tracker.tick(start + Duration::seconds(5)).await;
        assert_eq!(outcome.attributed.unwrap().app_identifier, "newer");
    }

    #[tokio::test]
    async fn unattributed_tick_still_advances_last_check() {
        let (mut tracker, store) =
            tracker_with(ForegroundFeed::new(), Arc::new(NoUsageStats), PolicyCache::new());

        let start = Utc::now();
        tracker.tick(start).await;
        let outcome = tracker.tick(start + Duration::seconds(5)).await;

        assert_eq!(outcome, TickOutcome::default());
        assert_eq!(tracker.last_check(), Some(start + Duration::seconds(5)));
        assert!(store.records().is_empty());
    }

    #[tokio::test]
    async fn non_positive_elapsed_is_a_no_op() {
        let feed = ForegroundFeed::new();
        let publisher = feed.bind();
        publisher.publish(ForegroundApp::new("video", "Video"));
        let (mut tracker, store) = tracker_with(feed, Arc::new(NoUsageStats), PolicyCache::new());

        let start = Utc::now();
        tracker.tick(start).await;
        assert_eq!(tracker.tick(start).await, TickOutcome::default());
        assert_eq!(
            tracker.tick(start - Duration::seconds(3)).await,
            TickOutcome::default()
        );
        assert!(store.records().is_empty());
    }

    #[tokio::test]
    async fn reevaluate_does_not_attribute_or_advance() {
        let cache = PolicyCache::new();
        let feed = ForegroundFeed::new();
        let publisher = feed.bind();
        publisher.publish(ForegroundApp::new("game", "Game"));
        let (mut tracker, store) = tracker_with(feed, Arc::new(NoUsageStats), cache.clone());

        let start = Utc::now();
        tracker.tick(start).await;
        cache.replace_rules(
            vec![Rule::new("b", RuleType::AppBlock).with_target("game")],
            Utc::now(),
        );

        let verdict = tracker.reevaluate(start).await.unwrap();
        assert_eq!(verdict.reason, Some(BlockReason::AppBlock));
        assert_eq!(tracker.last_check(), Some(start));
        assert!(store.records().is_empty());
    }

    #[tokio::test]
    async fn sub_second_remainders_carry_forward() {
        let feed = ForegroundFeed::new();
        let publisher = feed.bind();
        publisher.publish(ForegroundApp::new("video", "Video"));
        let (mut tracker, store) = tracker_with(feed, Arc::new(NoUsageStats), PolicyCache::new());

        let start = Utc::now();
        tracker.tick(start).await;
        tracker.tick(start + Duration::milliseconds(1500)).await;
        tracker.tick(start + Duration::milliseconds(3000)).await;

        let total: i64 = store.records().iter().map(|r| r.duration_seconds).sum();
        assert_eq!(total, 3);
    }

    #[tokio::test]
    async fn remainder_is_not_credited_to_next_app() {
        let feed = ForegroundFeed::new();
        let publisher = feed.bind();
        publisher.publish(ForegroundApp::new("video", "Video"));
        let (mut tracker, store) = tracker_with(feed, Arc::new(NoUsageStats), PolicyCache::new());

        let start = Utc::now();
        tracker.tick(start).await;
        tracker.tick(start + Duration::milliseconds(1900)).await;

        publisher.publish(ForegroundApp::new("chat", "Chat"));
        let outcome = tracker.tick(start + Duration::milliseconds(2500)).await;
        assert!(outcome.attributed.is_none());

        let chat: i64 = store
            .records()
            .iter()
            .filter(|r| r.app_identifier == "chat")
            .map(|r| r.duration_seconds)
            .sum();
        assert_eq!(chat, 0);

        tracker.tick(start + Duration::milliseconds(3100)).await;
        let chat: i64 = store
            .records()
            .iter()
            .filter(|r| r.app_identifier == "chat")
            .map(|r| r.duration_seconds)
            .sum();
        assert_eq!(chat, 1);
    }

    #[tokio::test]
    async fn quota_verdict_reflects_newly_attributed_time() {
        let cache = PolicyCache::new();
        cache.replace_rules(
            vec![Rule::new("q", RuleType::AppLimit)
                .with_target("video")
                .with_limit_minutes(1)],
            Utc::now(),
        );

        let feed = ForegroundFeed::new();
        let publisher = feed.bind();
        publisher.publish(ForegroundApp::new("video", "Video"));
        let (mut tracker, _store) = tracker_with(feed, Arc::new(NoUsageStats), cache);

        let start = Utc::now();
        tracker.tick(start).await;
        let under = tracker.tick(start + Duration::seconds(59)).await;
        assert!(!under.verdict.unwrap().blocked);

        let over = tracker.tick(start + Duration::seconds(60)).await;
        let verdict = over.verdict.unwrap();
        assert!(verdict.blocked);
        assert_eq!(verdict.reason, Some(BlockReason::AppLimit));
    }
}
