use chrono::{Datelike, Duration, NaiveDateTime, NaiveTime};
use std::collections::BTreeSet;

use crate::models::Rule;

/// Local wall-clock window on a set of weekdays (0 = Sunday .. 6 = Saturday).
///
/// A window whose end is earlier than its start runs past midnight; the part
/// after midnight belongs to the day the window started on. A zero-length
/// window (start == end) never matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub days: BTreeSet<u8>,
}

impl ScheduleWindow {
    pub fn from_rule(rule: &Rule) -> Option<Self> {
        let start = parse_clock(rule.schedule_start.as_deref()?)?;
        let end = parse_clock(rule.schedule_end.as_deref()?)?;
        Some(Self {
            start,
            end,
            days: rule.schedule_days.clone(),
        })
    }

    pub fn contains(&self, now: NaiveDateTime) -> bool {
        let time = now.time();
        let today = weekday_index(now);

        if self.start < self.end {
            return self.applies_on(today) && time >= self.start && time < self.end;
        }

        if self.start > self.end {
            let yesterday = weekday_index(now - Duration::days(1));
            return (self.applies_on(today) && time >= self.start)
                || (self.applies_on(yesterday) && time < self.end);
        }

        false
    }

    fn applies_on(&self, weekday: u8) -> bool {
        self.days.is_empty() || self.days.contains(&weekday)
    }
}

fn weekday_index(at: NaiveDateTime) -> u8 {
    at.weekday().num_days_from_sunday() as u8
}

fn parse_clock(raw: &str) -> Option<NaiveTime> {
    let raw = raw.trim();
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .ok()
}
