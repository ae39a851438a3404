// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.
//!
//! SQLite has no `FOR UPDATE SKIP LOCKED`, so the deferred-event batch
//! reserve runs an `UPDATE … WHERE id IN (SELECT …) RETURNING` inside one
//! transaction; under SQLite's single-writer model this is equivalent to
//! the PostgreSQL reservation. The database opens in WAL mode with a busy
//! timeout so several engine instances can share one file.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

use xjog_machine::ChartReference;

use crate::error::ChartError;
use crate::journal::JournalQuery;

use super::{
    ChartRow, DeferredEventRow, DigestRow, ExternalIdRow, FullStateRow, InstanceRow,
    JournalEntryRow, JournalStore, NewChart, NewDeferredEvent, NewJournalEntry, PersistenceStore,
};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

const CHART_COLUMNS: &str = r#""timestamp", "ownerId" AS "owner_id", "machineId" AS "machine_id",
       "chartId" AS "chart_id", "parentMachineId" AS "parent_machine_id",
       "parentChartId" AS "parent_chart_id", "state", "paused""#;

const DEFERRED_COLUMNS: &str = r#""id", "machineId" AS "machine_id", "chartId" AS "chart_id",
       "eventId" AS "event_id", "eventTo" AS "event_to", "event", "timestamp",
       "delay", "due", "lock""#;

const ENTRY_COLUMNS: &str = r#""id", "timestamp", "machineId" AS "machine_id",
       "chartId" AS "chart_id", "event", "state", "context",
       "stateDelta" AS "state_delta", "contextDelta" AS "context_delta""#;

const FULL_STATE_COLUMNS: &str = r#""id", "created", "timestamp", "ownerId" AS "owner_id",
       "machineId" AS "machine_id", "chartId" AS "chart_id",
       "parentMachineId" AS "parent_machine_id", "parentChartId" AS "parent_chart_id",
       "event", "state", "context""#;

/// SQLite-backed store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a store from an existing pool. The caller is responsible for
    /// running [`crate::migrations::run_sqlite`].
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a store from a file path.
    ///
    /// Creates parent directories and the database file if needed, opens
    /// the database in WAL mode with a busy timeout, and runs all
    /// migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, ChartError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    ChartError::storage(
                        "create_dir",
                        format!("failed to create directory {:?}: {}", parent, e),
                    )
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| {
                ChartError::storage(
                    "connect",
                    format!("failed to connect to SQLite at {:?}: {}", path, e),
                )
            })?;

        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| ChartError::storage("migrate", e))?;

        Ok(Self { pool })
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl PersistenceStore for SqliteStore {
    async fn overthrow_other_instances(&self, self_id: &str) -> Result<(), ChartError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        sqlx::query(r#"UPDATE "instances" SET "dying" = 1"#)
            .execute(&mut *tx)
            .await?;

        sqlx::query(r#"UPDATE "charts" SET "paused" = 1"#)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO "instances" ("timestamp", "instanceId", "dying")
            VALUES (?1, ?2, 0)
            "#,
        )
        .bind(now)
        .bind(self_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn remove_instance(&self, instance_id: &str) -> Result<(), ChartError> {
        sqlx::query(r#"DELETE FROM "instances" WHERE "instanceId" = ?1"#)
            .bind(instance_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn is_instance_dying(&self, instance_id: &str) -> Result<bool, ChartError> {
        let dying: Option<(bool,)> =
            sqlx::query_as(r#"SELECT "dying" FROM "instances" WHERE "instanceId" = ?1"#)
                .bind(instance_id)
                .fetch_optional(&self.pool)
                .await?;
        // A missing row means someone removed us; drain as if flagged.
        Ok(dying.map(|row| row.0).unwrap_or(true))
    }

    async fn count_alive_instances(&self) -> Result<i64, ChartError> {
        let count: (i64,) =
            sqlx::query_as(r#"SELECT COUNT(*) FROM "instances" WHERE "dying" = 0"#)
                .fetch_one(&self.pool)
                .await?;
        Ok(count.0)
    }

    async fn list_instances(&self) -> Result<Vec<InstanceRow>, ChartError> {
        let rows = sqlx::query_as::<_, InstanceRow>(
            r#"
            SELECT "timestamp", "instanceId" AS "instance_id", "dying"
            FROM "instances"
            ORDER BY "timestamp" ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn insert_chart(&self, chart: &NewChart<'_>) -> Result<(), ChartError> {
        sqlx::query(
            r#"
            INSERT INTO "charts"
                ("timestamp", "ownerId", "machineId", "chartId",
                 "parentMachineId", "parentChartId", "state", "paused")
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)
            "#,
        )
        .bind(Utc::now())
        .bind(chart.owner_id)
        .bind(&chart.reference.machine_id)
        .bind(&chart.reference.chart_id)
        .bind(chart.parent.map(|p| p.machine_id.as_str()))
        .bind(chart.parent.map(|p| p.chart_id.as_str()))
        .bind(chart.state)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => ChartError::Conflict {
                what: format!("chart '{}'", chart.reference),
            },
            _ => ChartError::from(e),
        })?;
        Ok(())
    }

    async fn read_chart(
        &self,
        reference: &ChartReference,
    ) -> Result<Option<ChartRow>, ChartError> {
        let row = sqlx::query_as::<_, ChartRow>(&format!(
            r#"SELECT {CHART_COLUMNS} FROM "charts" WHERE "machineId" = ?1 AND "chartId" = ?2"#
        ))
        .bind(&reference.machine_id)
        .bind(&reference.chart_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn update_chart_state(
        &self,
        reference: &ChartReference,
        state: &[u8],
    ) -> Result<(), ChartError> {
        let result = sqlx::query(
            r#"
            UPDATE "charts"
            SET "state" = ?1, "timestamp" = ?2
            WHERE "machineId" = ?3 AND "chartId" = ?4
            "#,
        )
        .bind(state)
        .bind(Utc::now())
        .bind(&reference.machine_id)
        .bind(&reference.chart_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ChartError::ChartNotFound {
                reference: reference.clone(),
            });
        }
        Ok(())
    }

    async fn destroy_chart(&self, reference: &ChartReference) -> Result<(), ChartError> {
        let mut tx = self.pool.begin().await?;

        let removed = sqlx::query(
            r#"DELETE FROM "charts" WHERE "machineId" = ?1 AND "chartId" = ?2"#,
        )
        .bind(&reference.machine_id)
        .bind(&reference.chart_id)
        .execute(&mut *tx)
        .await?;

        if removed.rows_affected() == 0 {
            return Err(ChartError::ChartNotFound {
                reference: reference.clone(),
            });
        }

        for table in [
            r#"DELETE FROM "deferredEvents" WHERE "machineId" = ?1 AND "chartId" = ?2"#,
            r#"DELETE FROM "externalId" WHERE "machineId" = ?1 AND "chartId" = ?2"#,
            r#"DELETE FROM "ongoingActivities" WHERE "machineId" = ?1 AND "chartId" = ?2"#,
            r#"DELETE FROM "digests" WHERE "machineId" = ?1 AND "chartId" = ?2"#,
        ] {
            sqlx::query(table)
                .bind(&reference.machine_id)
                .bind(&reference.chart_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn gently_adopt_charts(
        &self,
        self_id: &str,
    ) -> Result<Vec<ChartReference>, ChartError> {
        let adopted: Vec<(String, String)> = sqlx::query_as(
            r#"
            UPDATE "charts"
            SET "ownerId" = ?1, "paused" = 0
            WHERE "paused" = 1
              AND NOT EXISTS (
                  SELECT 1 FROM "ongoingActivities" a
                  WHERE a."machineId" = "charts"."machineId"
                    AND a."chartId" = "charts"."chartId"
              )
            RETURNING "machineId", "chartId"
            "#,
        )
        .bind(self_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(adopted
            .into_iter()
            .map(|(machine_id, chart_id)| ChartReference::new(machine_id, chart_id))
            .collect())
    }

    async fn forcibly_adopt_charts(
        &self,
        self_id: &str,
    ) -> Result<Vec<ChartReference>, ChartError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM "ongoingActivities"
            WHERE ("machineId", "chartId") IN (
                SELECT "machineId", "chartId" FROM "charts" WHERE "paused" = 1
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        let adopted: Vec<(String, String)> = sqlx::query_as(
            r#"
            UPDATE "charts"
            SET "ownerId" = ?1, "paused" = 0
            WHERE "paused" = 1
            RETURNING "machineId", "chartId"
            "#,
        )
        .bind(self_id)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(adopted
            .into_iter()
            .map(|(machine_id, chart_id)| ChartReference::new(machine_id, chart_id))
            .collect())
    }

    async fn count_paused_charts(&self) -> Result<i64, ChartError> {
        let count: (i64,) = sqlx::query_as(r#"SELECT COUNT(*) FROM "charts" WHERE "paused" = 1"#)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0)
    }

    async fn count_own_charts(&self, owner_id: &str) -> Result<i64, ChartError> {
        let count: (i64,) =
            sqlx::query_as(r#"SELECT COUNT(*) FROM "charts" WHERE "ownerId" = ?1"#)
                .bind(owner_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count.0)
    }

    async fn list_charts(&self) -> Result<Vec<ChartRow>, ChartError> {
        let rows = sqlx::query_as::<_, ChartRow>(&format!(
            r#"SELECT {CHART_COLUMNS} FROM "charts" ORDER BY "machineId", "chartId""#
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn insert_deferred_event(
        &self,
        event: &NewDeferredEvent,
    ) -> Result<DeferredEventRow, ChartError> {
        let now = Utc::now();
        let due = now + chrono::Duration::milliseconds(event.delay_ms);
        let event_id = serde_json::to_string(&event.event_id)?;
        let event_json = serde_json::to_string(&event.event)?;
        let event_to = match &event.event_to {
            Some(target) => Some(serde_json::to_string(target)?),
            None => None,
        };

        let row = sqlx::query_as::<_, DeferredEventRow>(&format!(
            r#"
            INSERT INTO "deferredEvents"
                ("machineId", "chartId", "eventId", "eventTo", "event",
                 "timestamp", "delay", "due", "lock")
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL)
            RETURNING {DEFERRED_COLUMNS}
            "#
        ))
        .bind(&event.reference.machine_id)
        .bind(&event.reference.chart_id)
        .bind(&event_id)
        .bind(&event_to)
        .bind(&event_json)
        .bind(now)
        .bind(event.delay_ms)
        .bind(due)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    async fn read_deferred_event_batch(
        &self,
        self_id: &str,
        batch_size: i64,
        look_ahead: Duration,
    ) -> Result<Vec<DeferredEventRow>, ChartError> {
        let horizon = Utc::now()
            + chrono::Duration::from_std(look_ahead)
                .map_err(|e| ChartError::storage("read_deferred_event_batch", e))?;

        let mut tx = self.pool.begin().await?;
        let mut rows = sqlx::query_as::<_, DeferredEventRow>(&format!(
            r#"
            UPDATE "deferredEvents"
            SET "lock" = ?1
            WHERE "lock" IS NULL
              AND "id" IN (
                  SELECT "id" FROM "deferredEvents"
                  WHERE "lock" IS NULL AND "due" < ?2
                  ORDER BY "due" ASC, "id" ASC
                  LIMIT ?3
              )
            RETURNING {DEFERRED_COLUMNS}
            "#
        ))
        .bind(self_id)
        .bind(horizon)
        .bind(batch_size)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        // RETURNING order is unspecified; restore the delivery order.
        rows.sort_by(|a, b| (a.due, a.id).cmp(&(b.due, b.id)));
        Ok(rows)
    }

    async fn release_deferred_event(&self, id: i64) -> Result<(), ChartError> {
        sqlx::query(r#"UPDATE "deferredEvents" SET "lock" = NULL WHERE "id" = ?1"#)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn release_all_deferred_events(&self, self_id: &str) -> Result<(), ChartError> {
        sqlx::query(r#"UPDATE "deferredEvents" SET "lock" = NULL WHERE "lock" = ?1"#)
            .bind(self_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_deferred_event(&self, id: i64) -> Result<(), ChartError> {
        sqlx::query(r#"DELETE FROM "deferredEvents" WHERE "id" = ?1"#)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_deferred_events_by_event_id(
        &self,
        reference: &ChartReference,
        event_id: &str,
    ) -> Result<u64, ChartError> {
        let result = sqlx::query(
            r#"
            DELETE FROM "deferredEvents"
            WHERE "machineId" = ?1 AND "chartId" = ?2 AND "eventId" = ?3
            "#,
        )
        .bind(&reference.machine_id)
        .bind(&reference.chart_id)
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_all_deferred_events(
        &self,
        reference: &ChartReference,
    ) -> Result<(), ChartError> {
        sqlx::query(r#"DELETE FROM "deferredEvents" WHERE "machineId" = ?1 AND "chartId" = ?2"#)
            .bind(&reference.machine_id)
            .bind(&reference.chart_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn register_activity(
        &self,
        reference: &ChartReference,
        activity_id: &str,
    ) -> Result<(), ChartError> {
        sqlx::query(
            r#"
            INSERT INTO "ongoingActivities" ("machineId", "chartId", "activityId")
            VALUES (?1, ?2, ?3)
            ON CONFLICT ("machineId", "chartId", "activityId") DO NOTHING
            "#,
        )
        .bind(&reference.machine_id)
        .bind(&reference.chart_id)
        .bind(activity_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn unregister_activity(
        &self,
        reference: &ChartReference,
        activity_id: &str,
    ) -> Result<(), ChartError> {
        sqlx::query(
            r#"
            DELETE FROM "ongoingActivities"
            WHERE "machineId" = ?1 AND "chartId" = ?2 AND "activityId" = ?3
            "#,
        )
        .bind(&reference.machine_id)
        .bind(&reference.chart_id)
        .bind(activity_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn unregister_all_activities(
        &self,
        reference: &ChartReference,
    ) -> Result<(), ChartError> {
        sqlx::query(
            r#"DELETE FROM "ongoingActivities" WHERE "machineId" = ?1 AND "chartId" = ?2"#,
        )
        .bind(&reference.machine_id)
        .bind(&reference.chart_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn is_activity_registered(
        &self,
        reference: &ChartReference,
        activity_id: &str,
    ) -> Result<bool, ChartError> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT 1 FROM "ongoingActivities"
            WHERE "machineId" = ?1 AND "chartId" = ?2 AND "activityId" = ?3
            "#,
        )
        .bind(&reference.machine_id)
        .bind(&reference.chart_id)
        .bind(activity_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn count_activities(&self, reference: &ChartReference) -> Result<i64, ChartError> {
        let count: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM "ongoingActivities"
            WHERE "machineId" = ?1 AND "chartId" = ?2
            "#,
        )
        .bind(&reference.machine_id)
        .bind(&reference.chart_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.0)
    }

    async fn register_external_id(
        &self,
        key: &str,
        value: &str,
        reference: &ChartReference,
    ) -> Result<(), ChartError> {
        sqlx::query(
            r#"
            INSERT INTO "externalId" ("key", "value", "machineId", "chartId")
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(&reference.machine_id)
        .bind(&reference.chart_id)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => ChartError::Conflict {
                what: format!("external id ({key}, {value})"),
            },
            _ => ChartError::from(e),
        })?;
        Ok(())
    }

    async fn drop_external_id(&self, key: &str, value: &str) -> Result<(), ChartError> {
        sqlx::query(r#"DELETE FROM "externalId" WHERE "key" = ?1 AND "value" = ?2"#)
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn chart_by_external_id(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Option<ChartReference>, ChartError> {
        let row: Option<(String, String)> = sqlx::query_as(
            r#"
            SELECT "machineId", "chartId" FROM "externalId"
            WHERE "key" = ?1 AND "value" = ?2
            "#,
        )
        .bind(key)
        .bind(value)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(machine_id, chart_id)| ChartReference::new(machine_id, chart_id)))
    }

    async fn list_external_ids(&self) -> Result<Vec<ExternalIdRow>, ChartError> {
        let rows = sqlx::query_as::<_, ExternalIdRow>(
            r#"
            SELECT "key", "value", "machineId" AS "machine_id", "chartId" AS "chart_id"
            FROM "externalId"
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn upsert_digest(
        &self,
        reference: &ChartReference,
        key: &str,
        value: &str,
    ) -> Result<(), ChartError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO "digests" ("created", "timestamp", "machineId", "chartId", "key", "value")
            VALUES (?1, ?1, ?2, ?3, ?4, ?5)
            ON CONFLICT ("machineId", "chartId", "key") DO UPDATE SET
                "value" = excluded."value",
                "timestamp" = excluded."timestamp"
            "#,
        )
        .bind(now)
        .bind(&reference.machine_id)
        .bind(&reference.chart_id)
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_digests(&self, reference: &ChartReference) -> Result<(), ChartError> {
        sqlx::query(r#"DELETE FROM "digests" WHERE "machineId" = ?1 AND "chartId" = ?2"#)
            .bind(&reference.machine_id)
            .bind(&reference.chart_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_digests(
        &self,
        machine_id: Option<&str>,
    ) -> Result<Vec<DigestRow>, ChartError> {
        let rows = sqlx::query_as::<_, DigestRow>(
            r#"
            SELECT "created", "timestamp", "machineId" AS "machine_id",
                   "chartId" AS "chart_id", "key", "value"
            FROM "digests"
            WHERE (?1 IS NULL OR "machineId" = ?1)
            ORDER BY "machineId", "chartId", "key"
            "#,
        )
        .bind(machine_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[async_trait]
impl JournalStore for SqliteStore {
    async fn append_journal(
        &self,
        entry: &NewJournalEntry<'_>,
    ) -> Result<JournalEntryRow, ChartError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let full_state = entry.store_full.then_some(entry.state);
        let full_context = entry.store_full.then_some(entry.context);

        let row = sqlx::query_as::<_, JournalEntryRow>(&format!(
            r#"
            INSERT INTO "journalEntries"
                ("timestamp", "machineId", "chartId", "event", "state", "context",
                 "stateDelta", "contextDelta")
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            RETURNING {ENTRY_COLUMNS}
            "#
        ))
        .bind(now)
        .bind(&entry.reference.machine_id)
        .bind(&entry.reference.chart_id)
        .bind(entry.event)
        .bind(full_state)
        .bind(full_context)
        .bind(entry.state_delta)
        .bind(entry.context_delta)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO "fullJournalStates"
                ("id", "created", "timestamp", "ownerId", "machineId", "chartId",
                 "parentMachineId", "parentChartId", "event", "state", "context")
            VALUES (?1, ?2, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT ("machineId", "chartId") DO UPDATE SET
                "id" = excluded."id",
                "timestamp" = excluded."timestamp",
                "ownerId" = excluded."ownerId",
                "parentMachineId" = excluded."parentMachineId",
                "parentChartId" = excluded."parentChartId",
                "event" = excluded."event",
                "state" = excluded."state",
                "context" = excluded."context"
            WHERE excluded."id" > "fullJournalStates"."id"
            "#,
        )
        .bind(row.id)
        .bind(now)
        .bind(entry.owner_id)
        .bind(&entry.reference.machine_id)
        .bind(&entry.reference.chart_id)
        .bind(entry.parent.map(|p| p.machine_id.as_str()))
        .bind(entry.parent.map(|p| p.chart_id.as_str()))
        .bind(entry.event)
        .bind(entry.state)
        .bind(entry.context)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(row)
    }

    async fn read_journal_entry(
        &self,
        id: i64,
    ) -> Result<Option<JournalEntryRow>, ChartError> {
        let row = sqlx::query_as::<_, JournalEntryRow>(&format!(
            r#"SELECT {ENTRY_COLUMNS} FROM "journalEntries" WHERE "id" = ?1"#
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn query_journal_entries(
        &self,
        query: &JournalQuery,
    ) -> Result<Vec<JournalEntryRow>, ChartError> {
        let order = if query.descending { "DESC" } else { "ASC" };
        let rows = sqlx::query_as::<_, JournalEntryRow>(&format!(
            r#"
            SELECT {ENTRY_COLUMNS} FROM "journalEntries"
            WHERE (?1 IS NULL OR ("machineId" = ?1 AND "chartId" = ?2))
              AND (?3 IS NULL OR "machineId" = ?3)
              AND (?4 IS NULL OR "id" > ?4)
              AND (?5 IS NULL OR "id" >= ?5)
              AND (?6 IS NULL OR "id" < ?6)
              AND (?7 IS NULL OR "id" <= ?7)
              AND (?8 IS NULL OR "timestamp" >= ?8)
              AND (?9 IS NULL OR "timestamp" < ?9)
            ORDER BY "id" {order}
            LIMIT ?10 OFFSET ?11
            "#
        ))
        .bind(query.reference.as_ref().map(|r| r.machine_id.as_str()))
        .bind(query.reference.as_ref().map(|r| r.chart_id.as_str()))
        .bind(query.machine_id.as_deref())
        .bind(query.after)
        .bind(query.after_including)
        .bind(query.before)
        .bind(query.before_including)
        .bind(query.since)
        .bind(query.until)
        .bind(query.limit.unwrap_or(i64::MAX))
        .bind(query.offset.unwrap_or(0))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn read_full_state(
        &self,
        reference: &ChartReference,
    ) -> Result<Option<FullStateRow>, ChartError> {
        let row = sqlx::query_as::<_, FullStateRow>(&format!(
            r#"
            SELECT {FULL_STATE_COLUMNS} FROM "fullJournalStates"
            WHERE "machineId" = ?1 AND "chartId" = ?2
            "#
        ))
        .bind(&reference.machine_id)
        .bind(&reference.chart_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn query_full_states(
        &self,
        query: &JournalQuery,
    ) -> Result<Vec<FullStateRow>, ChartError> {
        let order = if query.descending { "DESC" } else { "ASC" };
        let rows = sqlx::query_as::<_, FullStateRow>(&format!(
            r#"
            SELECT {FULL_STATE_COLUMNS} FROM "fullJournalStates"
            WHERE (?1 IS NULL OR ("machineId" = ?1 AND "chartId" = ?2))
              AND (?3 IS NULL OR "machineId" = ?3)
              AND (?4 IS NULL OR ("parentMachineId" = ?4 AND "parentChartId" = ?5))
              AND (?6 IS NULL OR "id" > ?6)
              AND (?7 IS NULL OR "id" >= ?7)
              AND (?8 IS NULL OR "id" < ?8)
              AND (?9 IS NULL OR "id" <= ?9)
              AND (?10 IS NULL OR "timestamp" >= ?10)
              AND (?11 IS NULL OR "timestamp" < ?11)
            ORDER BY "id" {order}
            LIMIT ?12 OFFSET ?13
            "#
        ))
        .bind(query.reference.as_ref().map(|r| r.machine_id.as_str()))
        .bind(query.reference.as_ref().map(|r| r.chart_id.as_str()))
        .bind(query.machine_id.as_deref())
        .bind(query.parent.as_ref().map(|r| r.machine_id.as_str()))
        .bind(query.parent.as_ref().map(|r| r.chart_id.as_str()))
        .bind(query.after)
        .bind(query.after_including)
        .bind(query.before)
        .bind(query.before_including)
        .bind(query.since)
        .bind(query.until)
        .bind(query.limit.unwrap_or(i64::MAX))
        .bind(query.offset.unwrap_or(0))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn latest_journal_id(&self) -> Result<i64, ChartError> {
        let max: (Option<i64>,) = sqlx::query_as(r#"SELECT MAX("id") FROM "journalEntries""#)
            .fetch_one(&self.pool)
            .await?;
        Ok(max.0.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xjog_machine::Event;

    async fn memory_store() -> SqliteStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite");
        MIGRATOR.run(&pool).await.expect("migrations");
        SqliteStore::new(pool)
    }

    fn chart_state() -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "value": "closed",
            "context": {},
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn chart_crud_and_conflict() {
        let store = memory_store().await;
        let reference = ChartReference::new("door", "main");

        store
            .insert_chart(&NewChart {
                reference: &reference,
                parent: None,
                owner_id: "engine-1",
                state: &chart_state(),
            })
            .await
            .unwrap();

        let dup = store
            .insert_chart(&NewChart {
                reference: &reference,
                parent: None,
                owner_id: "engine-1",
                state: &chart_state(),
            })
            .await
            .unwrap_err();
        assert!(matches!(dup, ChartError::Conflict { .. }));

        let row = store.read_chart(&reference).await.unwrap().unwrap();
        assert_eq!(row.owner_id, "engine-1");
        assert!(!row.paused);

        store.update_chart_state(&reference, b"{}").await.unwrap();
        let row = store.read_chart(&reference).await.unwrap().unwrap();
        assert_eq!(row.state, b"{}");

        store.destroy_chart(&reference).await.unwrap();
        assert!(store.read_chart(&reference).await.unwrap().is_none());
        assert!(matches!(
            store.destroy_chart(&reference).await.unwrap_err(),
            ChartError::ChartNotFound { .. }
        ));
    }

    #[tokio::test]
    async fn overthrow_pauses_charts_and_flags_instances() {
        let store = memory_store().await;
        let reference = ChartReference::new("door", "main");

        store.overthrow_other_instances("engine-a").await.unwrap();
        store
            .insert_chart(&NewChart {
                reference: &reference,
                parent: None,
                owner_id: "engine-a",
                state: &chart_state(),
            })
            .await
            .unwrap();

        store.overthrow_other_instances("engine-b").await.unwrap();

        assert!(store.is_instance_dying("engine-a").await.unwrap());
        assert!(!store.is_instance_dying("engine-b").await.unwrap());
        assert_eq!(store.count_alive_instances().await.unwrap(), 1);
        assert_eq!(store.count_paused_charts().await.unwrap(), 1);

        // Gentle adoption picks the idle chart up.
        let adopted = store.gently_adopt_charts("engine-b").await.unwrap();
        assert_eq!(adopted, vec![reference.clone()]);
        assert_eq!(store.count_paused_charts().await.unwrap(), 0);
        assert_eq!(store.count_own_charts("engine-b").await.unwrap(), 1);

        // Missing rows count as dying.
        assert!(store.is_instance_dying("engine-x").await.unwrap());
    }

    #[tokio::test]
    async fn gentle_adoption_skips_charts_with_activities() {
        let store = memory_store().await;
        let busy = ChartReference::new("order", "busy");
        let idle = ChartReference::new("order", "idle");

        store.overthrow_other_instances("engine-a").await.unwrap();
        for reference in [&busy, &idle] {
            store
                .insert_chart(&NewChart {
                    reference,
                    parent: None,
                    owner_id: "engine-a",
                    state: &chart_state(),
                })
                .await
                .unwrap();
        }
        store.register_activity(&busy, "poller").await.unwrap();

        store.overthrow_other_instances("engine-b").await.unwrap();

        let adopted = store.gently_adopt_charts("engine-b").await.unwrap();
        assert_eq!(adopted, vec![idle.clone()]);
        assert_eq!(store.count_paused_charts().await.unwrap(), 1);

        let forced = store.forcibly_adopt_charts("engine-b").await.unwrap();
        assert_eq!(forced, vec![busy.clone()]);
        assert_eq!(store.count_paused_charts().await.unwrap(), 0);
        assert_eq!(store.count_activities(&busy).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn deferred_event_reserve_orders_and_leases() {
        let store = memory_store().await;
        let reference = ChartReference::new("clock", "1");

        let late = store
            .insert_deferred_event(&NewDeferredEvent {
                reference: reference.clone(),
                event: Event::new("late"),
                event_id: serde_json::json!("late"),
                event_to: None,
                delay_ms: 5_000,
            })
            .await
            .unwrap();
        let soon = store
            .insert_deferred_event(&NewDeferredEvent {
                reference: reference.clone(),
                event: Event::new("soon"),
                event_id: serde_json::json!(7),
                event_to: None,
                delay_ms: 0,
            })
            .await
            .unwrap();
        assert!(late.lock.is_none());

        let batch = store
            .read_deferred_event_batch("engine-a", 10, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(
            batch.iter().map(|r| r.id).collect::<Vec<_>>(),
            vec![soon.id, late.id]
        );
        assert!(batch.iter().all(|r| r.lock.as_deref() == Some("engine-a")));

        // Reserved rows stay reserved.
        let empty = store
            .read_deferred_event_batch("engine-b", 10, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(empty.is_empty());

        // Releasing the lease makes rows claimable again; both release
        // paths are idempotent.
        store.release_all_deferred_events("engine-a").await.unwrap();
        store.release_deferred_event(soon.id).await.unwrap();
        let batch = store
            .read_deferred_event_batch("engine-b", 1, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, soon.id);

        // Deleting twice is a no-op.
        store.delete_deferred_event(soon.id).await.unwrap();
        store.delete_deferred_event(soon.id).await.unwrap();

        let removed = store
            .delete_deferred_events_by_event_id(
                &reference,
                &serde_json::to_string(&serde_json::json!("late")).unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn event_id_round_trips_json_values() {
        let store = memory_store().await;
        let reference = ChartReference::new("clock", "1");

        let row = store
            .insert_deferred_event(&NewDeferredEvent {
                reference: reference.clone(),
                event: Event::new("tick"),
                event_id: serde_json::json!(42),
                event_to: None,
                delay_ms: 0,
            })
            .await
            .unwrap();
        let decoded: serde_json::Value = serde_json::from_str(&row.event_id).unwrap();
        assert_eq!(decoded, serde_json::json!(42));
        assert_eq!(row.decode_event().unwrap(), Event::new("tick"));
    }

    #[tokio::test]
    async fn external_id_unique_per_pair() {
        let store = memory_store().await;
        let chart_x = ChartReference::new("orderMachine", "chartX");

        store
            .register_external_id("orderNo", "42", &chart_x)
            .await
            .unwrap();
        let conflict = store
            .register_external_id("orderNo", "42", &ChartReference::new("orderMachine", "other"))
            .await
            .unwrap_err();
        assert!(matches!(conflict, ChartError::Conflict { .. }));

        assert_eq!(
            store.chart_by_external_id("orderNo", "42").await.unwrap(),
            Some(chart_x.clone())
        );

        store.drop_external_id("orderNo", "42").await.unwrap();
        assert_eq!(store.chart_by_external_id("orderNo", "42").await.unwrap(), None);
        // Dropping again is a no-op.
        store.drop_external_id("orderNo", "42").await.unwrap();
    }

    #[tokio::test]
    async fn journal_snapshot_never_moves_backwards() {
        let store = memory_store().await;
        let reference = ChartReference::new("walk", "w1");

        let first = store
            .append_journal(&NewJournalEntry {
                owner_id: "engine-a",
                reference: &reference,
                parent: None,
                event: None,
                state: br#""at home""#,
                context: b"{}",
                state_delta: b"[]",
                context_delta: b"[]",
                store_full: true,
            })
            .await
            .unwrap();
        let second = store
            .append_journal(&NewJournalEntry {
                owner_id: "engine-a",
                reference: &reference,
                parent: None,
                event: Some(br#"{"type":"go to park"}"#),
                state: br#""at the park""#,
                context: b"{}",
                state_delta: b"[]",
                context_delta: b"[]",
                store_full: false,
            })
            .await
            .unwrap();
        assert!(second.id > first.id);

        let full = store.read_full_state(&reference).await.unwrap().unwrap();
        assert_eq!(full.id, second.id);
        assert_eq!(full.state.as_deref(), Some(br#""at the park""#.as_slice()));

        // The first entry stored its full state, the second only deltas.
        let first_row = store.read_journal_entry(first.id).await.unwrap().unwrap();
        assert!(first_row.state.is_some());
        let second_row = store.read_journal_entry(second.id).await.unwrap().unwrap();
        assert!(second_row.state.is_none());
        assert_eq!(store.latest_journal_id().await.unwrap(), second.id);
    }

    #[tokio::test]
    async fn journal_query_bounds_and_order() {
        let store = memory_store().await;
        let reference = ChartReference::new("walk", "w1");

        for step in 0..4 {
            let state = format!("{step}");
            store
                .append_journal(&NewJournalEntry {
                    owner_id: "engine-a",
                    reference: &reference,
                    parent: None,
                    event: None,
                    state: state.as_bytes(),
                    context: b"{}",
                    state_delta: b"[]",
                    context_delta: b"[]",
                    store_full: step == 0,
                })
                .await
                .unwrap();
        }

        let all = store
            .query_journal_entries(&JournalQuery::for_chart(reference.clone()))
            .await
            .unwrap();
        assert_eq!(all.len(), 4);
        assert!(all.windows(2).all(|pair| pair[0].id < pair[1].id));

        let after = store
            .query_journal_entries(&JournalQuery {
                reference: Some(reference.clone()),
                after: Some(all[1].id),
                ..JournalQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(after.len(), 2);

        let descending = store
            .query_journal_entries(&JournalQuery {
                reference: Some(reference.clone()),
                descending: true,
                limit: Some(2),
                ..JournalQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(descending.len(), 2);
        assert!(descending[0].id > descending[1].id);
    }

    #[tokio::test]
    async fn digest_upsert_and_listing() {
        let store = memory_store().await;
        let reference = ChartReference::new("order", "1");

        store.upsert_digest(&reference, "status", "open").await.unwrap();
        store.upsert_digest(&reference, "status", "shipped").await.unwrap();
        store.upsert_digest(&reference, "total", "12").await.unwrap();

        let rows = store.list_digests(Some("order")).await.unwrap();
        assert_eq!(rows.len(), 2);
        let status = rows.iter().find(|r| r.key == "status").unwrap();
        assert_eq!(status.value, "shipped");

        store.delete_digests(&reference).await.unwrap();
        assert!(store.list_digests(None).await.unwrap().is_empty());
    }
}
