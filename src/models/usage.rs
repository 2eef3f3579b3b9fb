use chrono::{DateTime, Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// One attributed slice of foreground time. Appended, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub app_identifier: String,
    pub display_name: String,
    pub duration_seconds: i64,
    pub timestamp: DateTime<Utc>,
}

impl UsageRecord {
    /// Local calendar day the record counts towards for daily quotas.
    pub fn local_day(&self) -> NaiveDate {
        self.timestamp.with_timezone(&Local).date_naive()
    }
}
