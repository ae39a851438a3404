// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed persistence implementation.
//!
//! The deferred-event batch reserve uses `FOR UPDATE SKIP LOCKED` so
//! several engine instances can poll the queue without blocking each
//! other; the winning instance marks its rows with its lease in the same
//! statement.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use xjog_machine::ChartReference;

use crate::error::ChartError;
use crate::journal::JournalQuery;

use super::{
    ChartRow, DeferredEventRow, DigestRow, ExternalIdRow, FullStateRow, InstanceRow,
    JournalEntryRow, JournalStore, NewChart, NewDeferredEvent, NewJournalEntry, PersistenceStore,
};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/postgresql");

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

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a store from an existing pool. The caller is responsible for
    /// running [`crate::migrations::run_postgres`].
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to a database URL and run all migrations.
    pub async fn connect(url: &str) -> Result<Self, ChartError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(|e| ChartError::storage("connect", e))?;

        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| ChartError::storage("migrate", e))?;

        Ok(Self { pool })
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl PersistenceStore for PostgresStore {
    async fn overthrow_other_instances(&self, self_id: &str) -> Result<(), ChartError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        sqlx::query(r#"UPDATE "instances" SET "dying" = TRUE"#)
            .execute(&mut *tx)
            .await?;

        sqlx::query(r#"UPDATE "charts" SET "paused" = TRUE"#)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO "instances" ("timestamp", "instanceId", "dying")
            VALUES ($1, $2, FALSE)
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
        sqlx::query(r#"DELETE FROM "instances" WHERE "instanceId" = $1"#)
            .bind(instance_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn is_instance_dying(&self, instance_id: &str) -> Result<bool, ChartError> {
        let dying: Option<(bool,)> =
            sqlx::query_as(r#"SELECT "dying" FROM "instances" WHERE "instanceId" = $1"#)
                .bind(instance_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(dying.map(|row| row.0).unwrap_or(true))
    }

    async fn count_alive_instances(&self) -> Result<i64, ChartError> {
        let count: (i64,) =
            sqlx::query_as(r#"SELECT COUNT(*) FROM "instances" WHERE "dying" = FALSE"#)
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, FALSE)
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
            r#"SELECT {CHART_COLUMNS} FROM "charts" WHERE "machineId" = $1 AND "chartId" = $2"#
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
            SET "state" = $1, "timestamp" = $2
            WHERE "machineId" = $3 AND "chartId" = $4
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
            r#"DELETE FROM "charts" WHERE "machineId" = $1 AND "chartId" = $2"#,
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
            r#"DELETE FROM "deferredEvents" WHERE "machineId" = $1 AND "chartId" = $2"#,
            r#"DELETE FROM "externalId" WHERE "machineId" = $1 AND "chartId" = $2"#,
            r#"DELETE FROM "ongoingActivities" WHERE "machineId" = $1 AND "chartId" = $2"#,
            r#"DELETE FROM "digests" WHERE "machineId" = $1 AND "chartId" = $2"#,
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
            SET "ownerId" = $1, "paused" = FALSE
            WHERE "paused" = TRUE
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
                SELECT "machineId", "chartId" FROM "charts" WHERE "paused" = TRUE
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        let adopted: Vec<(String, String)> = sqlx::query_as(
            r#"
            UPDATE "charts"
            SET "ownerId" = $1, "paused" = FALSE
            WHERE "paused" = TRUE
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
        let count: (i64,) =
            sqlx::query_as(r#"SELECT COUNT(*) FROM "charts" WHERE "paused" = TRUE"#)
                .fetch_one(&self.pool)
                .await?;
        Ok(count.0)
    }

    async fn count_own_charts(&self, owner_id: &str) -> Result<i64, ChartError> {
        let count: (i64,) =
            sqlx::query_as(r#"SELECT COUNT(*) FROM "charts" WHERE "ownerId" = $1"#)
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NULL)
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

        let mut rows = sqlx::query_as::<_, DeferredEventRow>(&format!(
            r#"
            WITH claimable AS (
                SELECT "id"
                FROM "deferredEvents"
                WHERE "lock" IS NULL AND "due" < $2
                ORDER BY "due" ASC, "id" ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE "deferredEvents"
            SET "lock" = $1
            WHERE "id" IN (SELECT "id" FROM claimable)
            RETURNING {DEFERRED_COLUMNS}
            "#
        ))
        .bind(self_id)
        .bind(horizon)
        .bind(batch_size)
        .fetch_all(&self.pool)
        .await?;

        // RETURNING order is unspecified; restore the delivery order.
        rows.sort_by(|a, b| (a.due, a.id).cmp(&(b.due, b.id)));
        Ok(rows)
    }

    async fn release_deferred_event(&self, id: i64) -> Result<(), ChartError> {
        sqlx::query(r#"UPDATE "deferredEvents" SET "lock" = NULL WHERE "id" = $1"#)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn release_all_deferred_events(&self, self_id: &str) -> Result<(), ChartError> {
        sqlx::query(r#"UPDATE "deferredEvents" SET "lock" = NULL WHERE "lock" = $1"#)
            .bind(self_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_deferred_event(&self, id: i64) -> Result<(), ChartError> {
        sqlx::query(r#"DELETE FROM "deferredEvents" WHERE "id" = $1"#)
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
            WHERE "machineId" = $1 AND "chartId" = $2 AND "eventId" = $3
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
        sqlx::query(r#"DELETE FROM "deferredEvents" WHERE "machineId" = $1 AND "chartId" = $2"#)
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
            VALUES ($1, $2, $3)
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
            WHERE "machineId" = $1 AND "chartId" = $2 AND "activityId" = $3
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
            r#"DELETE FROM "ongoingActivities" WHERE "machineId" = $1 AND "chartId" = $2"#,
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
        let row: Option<(i32,)> = sqlx::query_as(
            r#"
            SELECT 1 FROM "ongoingActivities"
            WHERE "machineId" = $1 AND "chartId" = $2 AND "activityId" = $3
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
            WHERE "machineId" = $1 AND "chartId" = $2
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
            VALUES ($1, $2, $3, $4)
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
        sqlx::query(r#"DELETE FROM "externalId" WHERE "key" = $1 AND "value" = $2"#)
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
            WHERE "key" = $1 AND "value" = $2
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
            VALUES ($1, $1, $2, $3, $4, $5)
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
        sqlx::query(r#"DELETE FROM "digests" WHERE "machineId" = $1 AND "chartId" = $2"#)
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
            WHERE ($1::text IS NULL OR "machineId" = $1)
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
impl JournalStore for PostgresStore {
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
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
            VALUES ($1, $2, $2, $3, $4, $5, $6, $7, $8, $9, $10)
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
            r#"SELECT {ENTRY_COLUMNS} FROM "journalEntries" WHERE "id" = $1"#
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
            WHERE ($1::text IS NULL OR ("machineId" = $1 AND "chartId" = $2))
              AND ($3::text IS NULL OR "machineId" = $3)
              AND ($4::bigint IS NULL OR "id" > $4)
              AND ($5::bigint IS NULL OR "id" >= $5)
              AND ($6::bigint IS NULL OR "id" < $6)
              AND ($7::bigint IS NULL OR "id" <= $7)
              AND ($8::timestamptz IS NULL OR "timestamp" >= $8)
              AND ($9::timestamptz IS NULL OR "timestamp" < $9)
            ORDER BY "id" {order}
            LIMIT $10 OFFSET $11
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
            WHERE "machineId" = $1 AND "chartId" = $2
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
            WHERE ($1::text IS NULL OR ("machineId" = $1 AND "chartId" = $2))
              AND ($3::text IS NULL OR "machineId" = $3)
              AND ($4::text IS NULL OR ("parentMachineId" = $4 AND "parentChartId" = $5))
              AND ($6::bigint IS NULL OR "id" > $6)
              AND ($7::bigint IS NULL OR "id" >= $7)
              AND ($8::bigint IS NULL OR "id" < $8)
              AND ($9::bigint IS NULL OR "id" <= $9)
              AND ($10::timestamptz IS NULL OR "timestamp" >= $10)
              AND ($11::timestamptz IS NULL OR "timestamp" < $11)
            ORDER BY "id" {order}
            LIMIT $12 OFFSET $13
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
