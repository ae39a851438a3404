// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends.
//!
//! Two traits split the storage surface: [`PersistenceStore`] covers
//! instances, charts, deferred events, activity markers, external ids and
//! digests; [`JournalStore`] covers the append-only delta log and its
//! snapshot table. Both are implemented by the SQLite and PostgreSQL
//! backends; [`EngineStore`] is the combination the engine is built over.
//!
//! Composite operations (overthrow, forcible adoption, chart destruction,
//! journal appends) each run in a single driver transaction owned by the
//! backend, so callers never nest transactions.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresStore;
pub use self::sqlite::SqliteStore;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use xjog_machine::{ChartReference, Event, SendTarget};

use crate::error::ChartError;
use crate::journal::JournalQuery;

/// Instance record from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct InstanceRow {
    /// When the instance registered.
    pub timestamp: DateTime<Utc>,
    /// Unique identifier for the engine process.
    pub instance_id: String,
    /// Whether the instance has been overthrown or is shutting down.
    pub dying: bool,
}

/// Chart record from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ChartRow {
    /// Last write time.
    pub timestamp: DateTime<Utc>,
    /// The instance currently running this chart.
    pub owner_id: String,
    /// Machine definition id.
    pub machine_id: String,
    /// Chart instance id.
    pub chart_id: String,
    /// Parent chart machine id, when invoked as a child.
    pub parent_machine_id: Option<String>,
    /// Parent chart id, when invoked as a child.
    pub parent_chart_id: Option<String>,
    /// The evaluator's full composed snapshot, as JSON bytes.
    pub state: Vec<u8>,
    /// True while the chart awaits adoption; paused charts reject sends.
    pub paused: bool,
}

impl ChartRow {
    /// The chart's reference.
    pub fn reference(&self) -> ChartReference {
        ChartReference::new(self.machine_id.clone(), self.chart_id.clone())
    }

    /// The parent's reference, if any.
    pub fn parent_reference(&self) -> Option<ChartReference> {
        match (&self.parent_machine_id, &self.parent_chart_id) {
            (Some(m), Some(c)) => Some(ChartReference::new(m.clone(), c.clone())),
            _ => None,
        }
    }
}

/// Input for chart creation.
#[derive(Debug, Clone)]
pub struct NewChart<'a> {
    /// The chart to create.
    pub reference: &'a ChartReference,
    /// Parent chart, when invoked as a child.
    pub parent: Option<&'a ChartReference>,
    /// Owning instance.
    pub owner_id: &'a str,
    /// Initial snapshot bytes.
    pub state: &'a [u8],
}

/// Deferred event record from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeferredEventRow {
    /// Monotonic row id; the delivery tiebreaker.
    pub id: i64,
    /// Target chart machine id.
    pub machine_id: String,
    /// Target chart id.
    pub chart_id: String,
    /// Idempotency/cancellation key, as its JSON serialization.
    pub event_id: String,
    /// Routing target, as tagged JSON; the chart itself when absent.
    pub event_to: Option<String>,
    /// The event payload, as JSON.
    pub event: String,
    /// When the row was inserted.
    pub timestamp: DateTime<Utc>,
    /// Requested delay in milliseconds.
    pub delay: i64,
    /// Delivery time; set once at insert and never changed.
    pub due: DateTime<Utc>,
    /// Instance currently holding the delivery lease, if any.
    pub lock: Option<String>,
}

impl DeferredEventRow {
    /// The chart the row belongs to.
    pub fn reference(&self) -> ChartReference {
        ChartReference::new(self.machine_id.clone(), self.chart_id.clone())
    }

    /// Decode the event payload.
    pub fn decode_event(&self) -> Result<Event, ChartError> {
        Ok(serde_json::from_str(&self.event)?)
    }

    /// Decode the routing target.
    pub fn decode_target(&self) -> Result<Option<SendTarget>, ChartError> {
        match &self.event_to {
            None => Ok(None),
            Some(text) => Ok(Some(serde_json::from_str(text)?)),
        }
    }
}

/// Input for deferring an event.
#[derive(Debug, Clone)]
pub struct NewDeferredEvent {
    /// The chart the event belongs to (and its default delivery target).
    pub reference: ChartReference,
    /// The event payload.
    pub event: Event,
    /// Idempotency/cancellation key; an opaque JSON value.
    pub event_id: serde_json::Value,
    /// Optional routing target.
    pub event_to: Option<SendTarget>,
    /// Delivery delay in milliseconds.
    pub delay_ms: i64,
}

/// External id record from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ExternalIdRow {
    /// Lookup key namespace.
    pub key: String,
    /// Lookup value.
    pub value: String,
    /// Referenced chart machine id.
    pub machine_id: String,
    /// Referenced chart id.
    pub chart_id: String,
}

impl ExternalIdRow {
    /// The referenced chart.
    pub fn reference(&self) -> ChartReference {
        ChartReference::new(self.machine_id.clone(), self.chart_id.clone())
    }
}

/// Digest record from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DigestRow {
    /// When the digest key was first written for the chart.
    pub created: DateTime<Utc>,
    /// When the digest key was last updated.
    pub timestamp: DateTime<Utc>,
    /// Chart machine id.
    pub machine_id: String,
    /// Chart id.
    pub chart_id: String,
    /// Digest key.
    pub key: String,
    /// Digest value.
    pub value: String,
}

/// Journal entry record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JournalEntryRow {
    /// Monotonic entry id across the whole journal.
    pub id: i64,
    /// When the entry was recorded.
    pub timestamp: DateTime<Utc>,
    /// Chart machine id.
    pub machine_id: String,
    /// Chart id.
    pub chart_id: String,
    /// Triggering event JSON, if any.
    pub event: Option<Vec<u8>>,
    /// Full state value JSON; present on the chart's first entry only.
    pub state: Option<Vec<u8>>,
    /// Full context JSON; present on the chart's first entry only.
    pub context: Option<Vec<u8>>,
    /// JSON-patch from the new state value back to the previous one.
    pub state_delta: Vec<u8>,
    /// JSON-patch from the new context back to the previous one.
    pub context_delta: Vec<u8>,
}

impl JournalEntryRow {
    /// The chart the entry belongs to.
    pub fn reference(&self) -> ChartReference {
        ChartReference::new(self.machine_id.clone(), self.chart_id.clone())
    }
}

/// Latest full snapshot of one chart in the journal.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FullStateRow {
    /// Id of the journal entry this snapshot reflects.
    pub id: i64,
    /// When the snapshot row was first created.
    pub created: DateTime<Utc>,
    /// When the snapshot was last advanced.
    pub timestamp: DateTime<Utc>,
    /// Instance that recorded the latest entry.
    pub owner_id: String,
    /// Chart machine id.
    pub machine_id: String,
    /// Chart id.
    pub chart_id: String,
    /// Parent machine id, if any.
    pub parent_machine_id: Option<String>,
    /// Parent chart id, if any.
    pub parent_chart_id: Option<String>,
    /// Latest triggering event JSON.
    pub event: Option<Vec<u8>>,
    /// Latest full state value JSON.
    pub state: Option<Vec<u8>>,
    /// Latest full context JSON.
    pub context: Option<Vec<u8>>,
}

impl FullStateRow {
    /// The chart the snapshot belongs to.
    pub fn reference(&self) -> ChartReference {
        ChartReference::new(self.machine_id.clone(), self.chart_id.clone())
    }
}

/// Input for one journal append.
#[derive(Debug, Clone)]
pub struct NewJournalEntry<'a> {
    /// Instance recording the entry.
    pub owner_id: &'a str,
    /// The chart that changed.
    pub reference: &'a ChartReference,
    /// The chart's parent, if any.
    pub parent: Option<&'a ChartReference>,
    /// Triggering event JSON.
    pub event: Option<&'a [u8]>,
    /// New full state value JSON (always written to the snapshot table).
    pub state: &'a [u8],
    /// New full context JSON (always written to the snapshot table).
    pub context: &'a [u8],
    /// Backwards state patch (new → old).
    pub state_delta: &'a [u8],
    /// Backwards context patch (new → old).
    pub context_delta: &'a [u8],
    /// Also store the full state/context on the entry row itself; set for
    /// the chart's first entry.
    pub store_full: bool,
}

/// Storage for instances, charts, deferred events, activity markers,
/// external ids and digests.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    // --- instances -------------------------------------------------------

    /// In one transaction: flag every existing instance dying, pause every
    /// chart, and register `self_id` as the one live instance.
    async fn overthrow_other_instances(&self, self_id: &str) -> Result<(), ChartError>;

    /// Remove an instance row.
    async fn remove_instance(&self, instance_id: &str) -> Result<(), ChartError>;

    /// Whether the instance has been flagged dying. A missing row counts as
    /// dying: someone removed us, so we must drain.
    async fn is_instance_dying(&self, instance_id: &str) -> Result<bool, ChartError>;

    /// Number of instances with `dying = false`.
    async fn count_alive_instances(&self) -> Result<i64, ChartError>;

    /// All instance rows.
    async fn list_instances(&self) -> Result<Vec<InstanceRow>, ChartError>;

    // --- charts ----------------------------------------------------------

    /// Insert a chart row. Fails with [`ChartError::Conflict`] when the
    /// reference is already in use.
    async fn insert_chart(&self, chart: &NewChart<'_>) -> Result<(), ChartError>;

    /// Read one chart row.
    async fn read_chart(&self, reference: &ChartReference)
        -> Result<Option<ChartRow>, ChartError>;

    /// Replace a chart's snapshot bytes.
    async fn update_chart_state(
        &self,
        reference: &ChartReference,
        state: &[u8],
    ) -> Result<(), ChartError>;

    /// In one transaction: delete the chart row and every related deferred
    /// event, external id, activity marker and digest.
    async fn destroy_chart(&self, reference: &ChartReference) -> Result<(), ChartError>;

    /// Adopt every paused chart that has no activity marker. Returns the
    /// adopted references. Idempotent; safe to call repeatedly.
    async fn gently_adopt_charts(
        &self,
        self_id: &str,
    ) -> Result<Vec<ChartReference>, ChartError>;

    /// In one transaction: wipe activity markers of paused charts and adopt
    /// all remaining paused charts. Returns the adopted references.
    async fn forcibly_adopt_charts(
        &self,
        self_id: &str,
    ) -> Result<Vec<ChartReference>, ChartError>;

    /// Number of paused charts.
    async fn count_paused_charts(&self) -> Result<i64, ChartError>;

    /// Number of charts owned by `owner_id`.
    async fn count_own_charts(&self, owner_id: &str) -> Result<i64, ChartError>;

    /// All chart rows.
    async fn list_charts(&self) -> Result<Vec<ChartRow>, ChartError>;

    // --- deferred events -------------------------------------------------

    /// Insert a deferred event; `due` is computed as now plus the delay and
    /// never changes afterwards.
    async fn insert_deferred_event(
        &self,
        event: &NewDeferredEvent,
    ) -> Result<DeferredEventRow, ChartError>;

    /// Atomically reserve up to `batch_size` unlocked rows due within
    /// `look_ahead`, marking them locked by `self_id`. Rows come back in
    /// `(due ASC, id ASC)` order.
    async fn read_deferred_event_batch(
        &self,
        self_id: &str,
        batch_size: i64,
        look_ahead: Duration,
    ) -> Result<Vec<DeferredEventRow>, ChartError>;

    /// Release one row's lease. Idempotent.
    async fn release_deferred_event(&self, id: i64) -> Result<(), ChartError>;

    /// Release every lease held by `self_id`. Idempotent.
    async fn release_all_deferred_events(&self, self_id: &str) -> Result<(), ChartError>;

    /// Delete one row. Idempotent.
    async fn delete_deferred_event(&self, id: i64) -> Result<(), ChartError>;

    /// Delete every row of `reference` whose `eventId` equals the given
    /// JSON serialization. Returns the number of rows removed.
    async fn delete_deferred_events_by_event_id(
        &self,
        reference: &ChartReference,
        event_id: &str,
    ) -> Result<u64, ChartError>;

    /// Delete every row of `reference`.
    async fn delete_all_deferred_events(
        &self,
        reference: &ChartReference,
    ) -> Result<(), ChartError>;

    // --- activities ------------------------------------------------------

    /// Insert an activity marker. Idempotent.
    async fn register_activity(
        &self,
        reference: &ChartReference,
        activity_id: &str,
    ) -> Result<(), ChartError>;

    /// Remove an activity marker. Idempotent.
    async fn unregister_activity(
        &self,
        reference: &ChartReference,
        activity_id: &str,
    ) -> Result<(), ChartError>;

    /// Remove every activity marker of a chart.
    async fn unregister_all_activities(
        &self,
        reference: &ChartReference,
    ) -> Result<(), ChartError>;

    /// Whether an activity marker exists.
    async fn is_activity_registered(
        &self,
        reference: &ChartReference,
        activity_id: &str,
    ) -> Result<bool, ChartError>;

    /// Number of activity markers for a chart.
    async fn count_activities(&self, reference: &ChartReference) -> Result<i64, ChartError>;

    // --- external ids ----------------------------------------------------

    /// Register a `(key, value) → chart` lookup. Fails with
    /// [`ChartError::Conflict`] when the pair is taken.
    async fn register_external_id(
        &self,
        key: &str,
        value: &str,
        reference: &ChartReference,
    ) -> Result<(), ChartError>;

    /// Drop a lookup pair. Idempotent.
    async fn drop_external_id(&self, key: &str, value: &str) -> Result<(), ChartError>;

    /// Resolve a lookup pair to a chart.
    async fn chart_by_external_id(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Option<ChartReference>, ChartError>;

    /// All external id rows.
    async fn list_external_ids(&self) -> Result<Vec<ExternalIdRow>, ChartError>;

    // --- digests ---------------------------------------------------------

    /// Insert or update one digest key for a chart.
    async fn upsert_digest(
        &self,
        reference: &ChartReference,
        key: &str,
        value: &str,
    ) -> Result<(), ChartError>;

    /// Remove every digest row of a chart.
    async fn delete_digests(&self, reference: &ChartReference) -> Result<(), ChartError>;

    /// All digest rows, optionally restricted to one machine.
    async fn list_digests(&self, machine_id: Option<&str>)
        -> Result<Vec<DigestRow>, ChartError>;
}

/// Storage for the append-only journal and its snapshot table.
#[async_trait]
pub trait JournalStore: Send + Sync {
    /// In one transaction: insert the entry and advance the chart's full
    /// snapshot, guarded so an out-of-order insert never moves the snapshot
    /// backwards. Returns the inserted entry.
    async fn append_journal(
        &self,
        entry: &NewJournalEntry<'_>,
    ) -> Result<JournalEntryRow, ChartError>;

    /// Read one entry by id.
    async fn read_journal_entry(&self, id: i64)
        -> Result<Option<JournalEntryRow>, ChartError>;

    /// Query entries by chart, parent, machine, id bounds and time bounds.
    async fn query_journal_entries(
        &self,
        query: &JournalQuery,
    ) -> Result<Vec<JournalEntryRow>, ChartError>;

    /// Read the latest full snapshot of a chart.
    async fn read_full_state(
        &self,
        reference: &ChartReference,
    ) -> Result<Option<FullStateRow>, ChartError>;

    /// Query full snapshots with the same filter vocabulary as entries.
    async fn query_full_states(
        &self,
        query: &JournalQuery,
    ) -> Result<Vec<FullStateRow>, ChartError>;

    /// The highest journal entry id, or 0 when the journal is empty.
    async fn latest_journal_id(&self) -> Result<i64, ChartError>;
}

/// The combined storage surface the engine is built over.
pub trait EngineStore: PersistenceStore + JournalStore {}

impl<T: PersistenceStore + JournalStore> EngineStore for T {}
