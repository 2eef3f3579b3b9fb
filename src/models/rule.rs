//! Policy rule data models.
//!
//! Rules arrive from the backend as an immutable list. The active set is always
//! replaced wholesale (see `policy::PolicyCache`), never patched in place.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    AppBlock,
    DeviceLock,
    Schedule,
    DailyLimit,
    AppLimit,
}

impl RuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleType::AppBlock => "app_block",
            RuleType::DeviceLock => "device_lock",
            RuleType::Schedule => "schedule",
            RuleType::DailyLimit => "daily_limit",
            RuleType::AppLimit => "app_limit",
        }
    }
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rule {
    pub id: String,
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// App identifier this rule applies to. `None` (or empty) means device-wide.
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub limit_minutes: Option<u32>,
    /// Local wall-clock start, `HH:MM` or `HH:MM:SS`.
    #[serde(default)]
    pub schedule_start: Option<String>,
    #[serde(default)]
    pub schedule_end: Option<String>,
    /// Weekday indices, 0 = Sunday through 6 = Saturday. Empty means every day.
    #[serde(default)]
    pub schedule_days: BTreeSet<u8>,
}

impl Rule {
    pub fn new(id: impl Into<String>, rule_type: RuleType) -> Self {
        Self {
            id: id.into(),
            rule_type,
            enabled: true,
            target: None,
            limit_minutes: None,
            schedule_start: None,
            schedule_end: None,
            schedule_days: BTreeSet::new(),
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_limit_minutes(mut self, minutes: u32) -> Self {
        self.limit_minutes = Some(minutes);
        self
    }

    pub fn with_schedule(
        mut self,
        start: impl Into<String>,
        end: impl Into<String>,
        days: impl IntoIterator<Item = u8>,
    ) -> Self {
        self.schedule_start = Some(start.into());
        self.schedule_end = Some(end.into());
        self.schedule_days = days.into_iter().collect();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn is_device_wide(&self) -> bool {
        self.target
            .as_deref()
            .map(|target| target.trim().is_empty())
            .unwrap_or(true)
    }

    /// Exact, case-insensitive identifier match. Device-wide rules never "target" an app.
    pub fn targets(&self, app_identifier: &str) -> bool {
        match self.target.as_deref() {
            Some(target) if !target.trim().is_empty() => {
                target.trim().eq_ignore_ascii_case(app_identifier.trim())
            }
            _ => false,
        }
    }

    pub fn limit_seconds(&self) -> Option<i64> {
        self.limit_minutes.map(|minutes| i64::from(minutes) * 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_backend_rule_json() {
        let json = r#"[
            {"id": "r1", "type": "app_block", "target": "com.example.game"},
            {"id": "r2", "type": "schedule", "enabled": false,
             "schedule_start": "21:00", "schedule_end": "07:00", "schedule_days": [0, 6]},
            {"id": "r3", "type": "daily_limit", "limit_minutes": 120}
        ]"#;

        let rules: Vec<Rule> = serde_json::from_str(json).unwrap();
        assert_eq!(rules.len(), 3);
        assert_eq!(rules[0].rule_type, RuleType::AppBlock);
        assert!(rules[0].enabled);
        assert!(!rules[1].enabled);
        assert_eq!(rules[1].schedule_days, BTreeSet::from([0, 6]));
        assert_eq!(rules[2].limit_seconds(), Some(7200));
        assert!(rules[2].is_device_wide());
    }

    #[test]
    fn target_match_is_exact_and_case_insensitive() {
        let rule = Rule::new("r1", RuleType::AppBlock).with_target("com.Example.Game");
        assert!(rule.targets("com.example.game"));
        assert!(!rule.targets("com.example.game.lite"));
        assert!(!rule.targets("game"));
    }

    #[test]
    fn blank_target_is_device_wide() {
        let rule = Rule::new("r1", RuleType::Schedule).with_target("  ");
        assert!(rule.is_device_wide());
        assert!(!rule.targets(""));
    }
}
