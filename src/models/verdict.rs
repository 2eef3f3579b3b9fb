use serde::{Deserialize, Serialize};
use std::fmt;

use super::RuleType;

/// Why an app is blocked. Declaration order is severity order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    AppBlock,
    DeviceLock,
    Schedule,
    DailyLimit,
    AppLimit,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::AppBlock => "app_block",
            BlockReason::DeviceLock => "device_lock",
            BlockReason::Schedule => "schedule",
            BlockReason::DailyLimit => "daily_limit",
            BlockReason::AppLimit => "app_limit",
        }
    }

    /// Text shown on the blocking surface.
    pub fn message(&self) -> &'static str {
        match self {
            BlockReason::AppBlock => "This app has been blocked by your parent.",
            BlockReason::DeviceLock => "This device is locked.",
            BlockReason::Schedule => "This is outside your allowed hours.",
            BlockReason::DailyLimit => "You have used up today's screen time.",
            BlockReason::AppLimit => "You have reached today's limit for this app.",
        }
    }
}

impl From<RuleType> for BlockReason {
    fn from(rule_type: RuleType) -> Self {
        match rule_type {
            RuleType::AppBlock => BlockReason::AppBlock,
            RuleType::DeviceLock => BlockReason::DeviceLock,
            RuleType::Schedule => BlockReason::Schedule,
            RuleType::DailyLimit => BlockReason::DailyLimit,
            RuleType::AppLimit => BlockReason::AppLimit,
        }
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Block/allow decision for one evaluation. Ephemeral, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EnforcementVerdict {
    pub blocked: bool,
    pub reason: Option<BlockReason>,
    pub app_identifier: String,
    /// Rule that fired, if any. `None` for the remote lock and for allows.
    pub rule_id: Option<String>,
}

impl EnforcementVerdict {
    pub fn allow(app_identifier: impl Into<String>) -> Self {
        Self {
            blocked: false,
            reason: None,
            app_identifier: app_identifier.into(),
            rule_id: None,
        }
    }

    pub fn block(
        app_identifier: impl Into<String>,
        reason: BlockReason,
        rule_id: Option<String>,
    ) -> Self {
        Self {
            blocked: true,
            reason: Some(reason),
            app_identifier: app_identifier.into(),
            rule_id,
        }
    }

    /// A verdict only blocks when it also names a reason; a reasonless block is
    /// treated as an allow rather than surfacing an unexplained overlay.
    pub fn blocking_reason(&self) -> Option<BlockReason> {
        if self.blocked {
            self.reason
        } else {
            None
        }
    }
}
