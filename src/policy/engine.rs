use chrono::{Local, NaiveDateTime};
use std::collections::HashMap;

use crate::models::{BlockReason, EnforcementVerdict, Rule, RuleType};

use super::{schedule::ScheduleWindow, PolicyCache, PolicySnapshot};

/// Synchronous "should this app be blocked right now" over the latest cached
/// policy snapshot. Cheap to clone; all clones read the same cache.
#[derive(Clone)]
pub struct RuleEngine {
    cache: PolicyCache,
}

impl RuleEngine {
    pub fn new(cache: PolicyCache) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &PolicyCache {
        &self.cache
    }

    pub fn evaluate(
        &self,
        app_identifier: &str,
        usage_today: i64,
        usage_per_app: &HashMap<String, i64>,
    ) -> EnforcementVerdict {
        self.evaluate_at(
            app_identifier,
            usage_today,
            usage_per_app,
            Local::now().naive_local(),
        )
    }

    pub fn evaluate_at(
        &self,
        app_identifier: &str,
        usage_today: i64,
        usage_per_app: &HashMap<String, i64>,
        now: NaiveDateTime,
    ) -> EnforcementVerdict {
        let snapshot = self.cache.snapshot();
        if snapshot.is_unrefreshed() {
            log::debug!("policy not yet refreshed; allowing {app_identifier}");
        }
        evaluate_snapshot(&snapshot, app_identifier, usage_today, usage_per_app, now)
    }
}

/// Pure evaluation. First fired policy wins, in severity order:
/// explicit block, device lock, schedule, daily quota, per-app quota.
///
/// Negative usage values are clamped to zero. An empty rule set allows
/// everything.
pub fn evaluate_snapshot(
    snapshot: &PolicySnapshot,
    app_identifier: &str,
    usage_today: i64,
    usage_per_app: &HashMap<String, i64>,
    now: NaiveDateTime,
) -> EnforcementVerdict {
    let usage_today = clamp_usage(usage_today, "usage_today");
    let app_usage = clamp_usage(app_usage(usage_per_app, app_identifier), "usage_per_app");

    let enabled = || snapshot.rules.iter().filter(|rule| rule.enabled);
    let of_type = |rule_type: RuleType| enabled().filter(move |rule| rule.rule_type == rule_type);
    let block = |rule: &Rule| {
        EnforcementVerdict::block(
            app_identifier,
            BlockReason::from(rule.rule_type),
            Some(rule.id.clone()),
        )
    };

    if let Some(rule) = of_type(RuleType::AppBlock).find(|rule| rule.targets(app_identifier)) {
        return block(rule);
    }

    if snapshot.remote_lock {
        return EnforcementVerdict::block(app_identifier, BlockReason::DeviceLock, None);
    }
    if let Some(rule) = of_type(RuleType::DeviceLock).next() {
        return block(rule);
    }

    if let Some(rule) = of_type(RuleType::Schedule).find(|rule| {
        applies_to(rule, app_identifier)
            && ScheduleWindow::from_rule(rule)
                .map(|window| window.contains(now))
                .unwrap_or(false)
    }) {
        return block(rule);
    }

    if let Some(rule) = of_type(RuleType::DailyLimit).find(|rule| {
        applies_to(rule, app_identifier) && quota_exceeded(rule, usage_today)
    }) {
        return block(rule);
    }

    if let Some(rule) = of_type(RuleType::AppLimit)
        .find(|rule| rule.targets(app_identifier) && quota_exceeded(rule, app_usage))
    {
        return block(rule);
    }

    EnforcementVerdict::allow(app_identifier)
}

fn applies_to(rule: &Rule, app_identifier: &str) -> bool {
    rule.is_device_wide() || rule.targets(app_identifier)
}

/// A quota of N minutes is exceeded at exactly N * 60 seconds.
fn quota_exceeded(rule: &Rule, used_seconds: i64) -> bool {
    rule.limit_seconds()
        .map(|limit| used_seconds >= limit)
        .unwrap_or(false)
}

fn app_usage(usage_per_app: &HashMap<String, i64>, app_identifier: &str) -> i64 {
    if let Some(seconds) = usage_per_app.get(app_identifier) {
        return *seconds;
    }
    usage_per_app
        .iter()
        .find(|(app, _)| app.trim().eq_ignore_ascii_case(app_identifier.trim()))
        .map(|(_, seconds)| *seconds)
        .unwrap_or(0)
}

fn clamp_usage(value: i64, field: &str) -> i64 {
    if value < 0 {
        log::warn!("negative {field} ({value}) passed to rule engine; clamping to 0");
        0
    } else {
        value
    }
}
