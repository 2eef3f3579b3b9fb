use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;

use crate::{
    db::{
        helpers::{parse_optional_datetime, to_i64, to_u64},
        Database,
    },
    models::Rule,
    policy::{PolicySnapshot, PolicyStore},
};

#[async_trait]
impl PolicyStore for Database {
    /// Upserts the single snapshot row. A save carrying an older revision than
    /// the stored one is ignored, so concurrent writers cannot roll it back.
    async fn save_policy(&self, snapshot: &PolicySnapshot) -> Result<()> {
        let rules_json =
            serde_json::to_string(snapshot.rules.as_ref()).context("failed to serialize rule set")?;
        let revision = to_i64(snapshot.revision)?;
        let remote_lock = snapshot.remote_lock;
        let fetched_at = snapshot
            .fetched_at
            .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true));

        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO policy_snapshots (id, revision, rules_json, remote_lock, fetched_at, saved_at)
                 VALUES (1, ?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                     revision = excluded.revision,
                     rules_json = excluded.rules_json,
                     remote_lock = excluded.remote_lock,
                     fetched_at = excluded.fetched_at,
                     saved_at = excluded.saved_at
                 WHERE excluded.revision >= policy_snapshots.revision",
                params![
                    revision,
                    rules_json,
                    remote_lock,
                    fetched_at,
                    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                ],
            )
            .context("failed to save policy snapshot")?;
            Ok(())
        })
        .await
    }

    async fn load_policy(&self) -> Result<Option<PolicySnapshot>> {
        let row = self
            .execute(|conn| {
                let row = conn
                    .query_row(
                        "SELECT revision, rules_json, remote_lock, fetched_at
                         FROM policy_snapshots WHERE id = 1",
                        [],
                        |row| {
                            Ok((
                                row.get::<_, i64>(0)?,
                                row.get::<_, String>(1)?,
                                row.get::<_, bool>(2)?,
                                row.get::<_, Option<String>>(3)?,
                            ))
                        },
                    )
                    .optional()?;
                Ok(row)
            })
            .await?;

        let Some((revision, rules_json, remote_lock, fetched_at)) = row else {
            return Ok(None);
        };

        let rules: Vec<Rule> =
            serde_json::from_str(&rules_json).context("stored rule set is not valid JSON")?;

        Ok(Some(PolicySnapshot {
            rules: Arc::new(rules),
            remote_lock,
            revision: to_u64(revision, "revision")?,
            fetched_at: parse_optional_datetime(fetched_at, "fetched_at")?,
        }))
    }
}
