use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::{params, Row};

use crate::{
    db::{helpers::parse_datetime, Database},
    models::UsageRecord,
    sensing::store::{clamp_to_retention_floor, UsageStore},
};

const DAY_FORMAT: &str = "%Y-%m-%d";

/// Fixed-width timestamps keep lexical ordering equal to chronological ordering.
fn to_stored_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn row_to_usage_record(row: &Row) -> Result<UsageRecord, rusqlite::Error> {
    let recorded_at: String = row.get("recorded_at")?;

    Ok(UsageRecord {
        app_identifier: row.get("app_identifier")?,
        display_name: row.get("display_name")?,
        duration_seconds: row.get("duration_seconds")?,
        timestamp: parse_datetime(&recorded_at, "recorded_at").map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    e.to_string(),
                )),
            )
        })?,
    })
}

#[async_trait]
impl UsageStore for Database {
    async fn append(&self, record: &UsageRecord) -> Result<()> {
        let record = record.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO usage_records (app_identifier, display_name, duration_seconds, recorded_at, day)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.app_identifier,
                    record.display_name,
                    record.duration_seconds.max(0),
                    to_stored_timestamp(&record.timestamp),
                    record.local_day().format(DAY_FORMAT).to_string(),
                ],
            )
            .context("failed to insert usage record")?;
            Ok(())
        })
        .await
    }

    async fn total_for_day(&self, day: NaiveDate) -> Result<i64> {
        let day = day.format(DAY_FORMAT).to_string();
        self.execute(move |conn| {
            let total: i64 = conn.query_row(
                "SELECT COALESCE(SUM(duration_seconds), 0) FROM usage_records WHERE day = ?1",
                params![day],
                |row| row.get(0),
            )?;
            Ok(total)
        })
        .await
    }

    async fn total_for_app_on_day(&self, app_identifier: &str, day: NaiveDate) -> Result<i64> {
        let app_identifier = app_identifier.trim().to_string();
        let day = day.format(DAY_FORMAT).to_string();
        self.execute(move |conn| {
            let total: i64 = conn.query_row(
                "SELECT COALESCE(SUM(duration_seconds), 0) FROM usage_records
                 WHERE day = ?1 AND app_identifier = ?2 COLLATE NOCASE",
                params![day, app_identifier],
                |row| row.get(0),
            )?;
            Ok(total)
        })
        .await
    }

    async fn records_since(&self, since: DateTime<Utc>) -> Result<Vec<UsageRecord>> {
        let since = to_stored_timestamp(&since);
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT app_identifier, display_name, duration_seconds, recorded_at
                 FROM usage_records
                 WHERE recorded_at >= ?1
                 ORDER BY recorded_at ASC, id ASC",
            )?;

            let records = stmt
                .query_map(params![since], row_to_usage_record)?
                .collect::<Result<Vec<_>, _>>()?;

            Ok(records)
        })
        .await
    }

    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let cutoff = to_stored_timestamp(&clamp_to_retention_floor(cutoff, Utc::now()));
        self.execute(move |conn| {
            let removed = conn
                .execute(
                    "DELETE FROM usage_records WHERE recorded_at < ?1",
                    params![cutoff],
                )
                .context("failed to prune usage records")?;
            Ok(removed)
        })
        .await
    }
}
