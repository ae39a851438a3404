// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The journal: append-only delta log with full-state snapshots.
//!
//! Every committed transition is recorded as one [`JournalEntryRow`]
//! holding two JSON patches that run **backwards**: applied to the new
//! value they reproduce the previous one. The latest full snapshot per
//! chart lives in `fullJournalStates`, advanced atomically with each
//! append and guarded so it never moves backwards. Walking snapshots back
//! through the patches is what makes time travel cheap without duplicating
//! full state on every entry.
//!
//! Change notifications fan out on an in-process broadcast channel (the
//! `new-journal-entry` channel); subscription streams re-query from a
//! per-subscription high-water mark on every notification, so subscribers
//! never observe duplicate or out-of-order ids. Cross-process observers
//! poll the query surface instead.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use xjog_machine::{ChartReference, Event};

use crate::change::{ChangeKind, StateChange};
use crate::error::{ChartError, Result};
use crate::persistence::{EngineStore, FullStateRow, JournalEntryRow, JournalStore, NewJournalEntry};

/// Capacity of the notification broadcast channel.
const NOTIFY_CAPACITY: usize = 256;

/// Capacity of each subscription stream.
const SUBSCRIPTION_CAPACITY: usize = 64;

/// Payload of the `new-journal-entry` notification channel.
#[derive(Debug, Clone)]
pub struct JournalNotification {
    /// Id of the appended entry.
    pub id: i64,
    /// The chart the entry belongs to.
    pub reference: ChartReference,
}

/// Filter for journal queries and subscriptions.
///
/// Id bounds compose: `after` / `before` are exclusive,
/// `after_including` / `before_including` inclusive. `descending` flips
/// the id order; `limit`/`offset` page the result.
#[derive(Debug, Clone, Default)]
pub struct JournalQuery {
    /// Restrict to one chart.
    pub reference: Option<ChartReference>,
    /// Restrict to children of one chart (full-state queries only).
    pub parent: Option<ChartReference>,
    /// Restrict to one machine.
    pub machine_id: Option<String>,
    /// Entries with id strictly greater.
    pub after: Option<i64>,
    /// Entries with id greater or equal.
    pub after_including: Option<i64>,
    /// Entries with id strictly smaller.
    pub before: Option<i64>,
    /// Entries with id smaller or equal.
    pub before_including: Option<i64>,
    /// Entries recorded at or after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Entries recorded before this instant.
    pub until: Option<DateTime<Utc>>,
    /// Maximum rows returned.
    pub limit: Option<i64>,
    /// Rows skipped before returning.
    pub offset: Option<i64>,
    /// Return rows in descending id order.
    pub descending: bool,
}

impl JournalQuery {
    /// Query all entries of one chart.
    pub fn for_chart(reference: ChartReference) -> Self {
        Self {
            reference: Some(reference),
            ..Self::default()
        }
    }
}

/// A full chart state reconstructed as of one journal entry.
#[derive(Debug, Clone)]
pub struct MergedJournalEntry {
    /// The entry the state was reconstructed at.
    pub id: i64,
    /// The chart.
    pub reference: ChartReference,
    /// When the entry was recorded.
    pub timestamp: DateTime<Utc>,
    /// The event that produced the entry, if any.
    pub event: Option<Event>,
    /// The state value as it was right after the entry.
    pub state: Value,
    /// The context as it was right after the entry.
    pub context: Value,
}

/// Compute the backwards delta: a patch that, applied to `new`, yields
/// `old`.
pub(crate) fn backwards_delta(new: &Value, old: &Value) -> Result<Vec<u8>> {
    let patch = json_patch::diff(new, old);
    Ok(serde_json::to_vec(&patch)?)
}

/// Apply a stored backwards delta to a value.
pub(crate) fn apply_delta(value: &mut Value, delta: &[u8]) -> Result<()> {
    let patch: json_patch::Patch = serde_json::from_slice(delta)?;
    json_patch::patch(value, &patch).map_err(|e| ChartError::Serialization {
        details: format!("delta application failed: {e}"),
    })
}

/// The journal front: delta computation, notification fan-out,
/// subscriptions and time travel over a [`crate::persistence::JournalStore`] backend.
#[derive(Clone)]
pub struct Journal {
    store: Arc<dyn EngineStore>,
    notify_tx: broadcast::Sender<JournalNotification>,
}

impl Journal {
    /// Create a journal over a store backend.
    pub fn new(store: Arc<dyn EngineStore>) -> Self {
        let (notify_tx, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self { store, notify_tx }
    }

    /// Record one state change. Creation records store the full state on
    /// the entry row; deletions are not journaled. Returns the appended
    /// entry, or `None` when the change kind is not journaled.
    pub async fn record(
        &self,
        owner_id: &str,
        change: &StateChange,
    ) -> Result<Option<JournalEntryRow>> {
        let (old_value, old_context) = match &change.old {
            Some(snapshot) => (snapshot.value.clone(), snapshot.context.clone()),
            None => (Value::Null, Value::Null),
        };
        let (new_value, new_context) = match &change.new {
            Some(snapshot) => (snapshot.value.clone(), snapshot.context.clone()),
            None => {
                // Deletion: the snapshot table keeps the last recorded state.
                return Ok(None);
            }
        };

        let state_delta = backwards_delta(&new_value, &old_value)?;
        let context_delta = backwards_delta(&new_context, &old_context)?;
        let event_bytes = match &change.event {
            Some(event) => Some(serde_json::to_vec(event)?),
            None => None,
        };
        let state_bytes = serde_json::to_vec(&new_value)?;
        let context_bytes = serde_json::to_vec(&new_context)?;

        let entry = self
            .store
            .append_journal(&NewJournalEntry {
                owner_id,
                reference: &change.reference,
                parent: change.parent.as_ref(),
                event: event_bytes.as_deref(),
                state: &state_bytes,
                context: &context_bytes,
                state_delta: &state_delta,
                context_delta: &context_delta,
                store_full: change.kind == ChangeKind::Create,
            })
            .await?;

        debug!(
            entry = entry.id,
            chart = %change.reference,
            kind = %change.kind,
            "journal entry recorded"
        );

        let _ = self.notify_tx.send(JournalNotification {
            id: entry.id,
            reference: change.reference.clone(),
        });

        Ok(Some(entry))
    }

    /// Subscribe to raw append notifications.
    pub fn notifications(&self) -> broadcast::Receiver<JournalNotification> {
        self.notify_tx.subscribe()
    }

    /// Read one entry by id.
    pub async fn read_entry(&self, id: i64) -> Result<Option<JournalEntryRow>> {
        self.store.read_journal_entry(id).await
    }

    /// Query entries.
    pub async fn query_entries(&self, query: &JournalQuery) -> Result<Vec<JournalEntryRow>> {
        self.store.query_journal_entries(query).await
    }

    /// Read the latest full snapshot of a chart.
    pub async fn read_full_state(
        &self,
        reference: &ChartReference,
    ) -> Result<Option<FullStateRow>> {
        self.store.read_full_state(reference).await
    }

    /// Query full snapshots.
    pub async fn query_full_states(&self, query: &JournalQuery) -> Result<Vec<FullStateRow>> {
        self.store.query_full_states(query).await
    }

    /// Stream entries appended after subscription, filtered by `filter`'s
    /// chart/machine/time fields. Ids arrive strictly increasing without
    /// duplicates. The stream ends with an error item if the notification
    /// channel closes underneath it.
    pub async fn new_journal_entries(
        &self,
        filter: JournalQuery,
    ) -> Result<mpsc::Receiver<Result<JournalEntryRow>>> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let mut mark = self.store.latest_journal_id().await?;
        let mut notifications = self.notify_tx.subscribe();
        let store = self.store.clone();

        tokio::spawn(async move {
            loop {
                match notifications.recv().await {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        // Re-query from the high-water mark; a lagged
                        // receiver catches up the same way.
                        let mut query = filter.clone();
                        query.after = Some(mark);
                        query.descending = false;
                        let rows = match store.query_journal_entries(&query).await {
                            Ok(rows) => rows,
                            Err(error) => {
                                warn!(%error, "journal subscription query failed");
                                let _ = tx.send(Err(error)).await;
                                return;
                            }
                        };
                        for row in rows {
                            mark = mark.max(row.id);
                            if tx.send(Ok(row)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        let _ = tx
                            .send(Err(ChartError::storage(
                                "journal-subscription",
                                "notification channel closed",
                            )))
                            .await;
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }

    /// Stream full-state snapshots advanced after subscription. Snapshot
    /// ids are journal entry ids, so the same high-water-mark discipline
    /// applies.
    pub async fn new_full_states(
        &self,
        filter: JournalQuery,
    ) -> Result<mpsc::Receiver<Result<FullStateRow>>> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let mut mark = self.store.latest_journal_id().await?;
        let mut notifications = self.notify_tx.subscribe();
        let store = self.store.clone();

        tokio::spawn(async move {
            loop {
                match notifications.recv().await {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        let mut query = filter.clone();
                        query.after = Some(mark);
                        query.descending = false;
                        let rows = match store.query_full_states(&query).await {
                            Ok(rows) => rows,
                            Err(error) => {
                                warn!(%error, "full-state subscription query failed");
                                let _ = tx.send(Err(error)).await;
                                return;
                            }
                        };
                        for row in rows {
                            mark = mark.max(row.id);
                            if tx.send(Ok(row)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        let _ = tx
                            .send(Err(ChartError::storage(
                                "full-state-subscription",
                                "notification channel closed",
                            )))
                            .await;
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }

    /// Reconstruct the full state of a chart *as it was right after entry
    /// `id`*: start from the current snapshot and apply every newer
    /// entry's backwards patch, newest first.
    pub async fn read_merged_entry(&self, id: i64) -> Result<Option<MergedJournalEntry>> {
        let Some(entry) = self.store.read_journal_entry(id).await? else {
            return Ok(None);
        };
        let reference = entry.reference();

        let Some(full) = self.store.read_full_state(&reference).await? else {
            return Ok(None);
        };

        let mut state: Value = match &full.state {
            Some(bytes) => serde_json::from_slice(bytes)?,
            None => Value::Null,
        };
        let mut context: Value = match &full.context {
            Some(bytes) => serde_json::from_slice(bytes)?,
            None => Value::Null,
        };

        let newer = self
            .store
            .query_journal_entries(&JournalQuery {
                reference: Some(reference.clone()),
                after: Some(id),
                before_including: Some(full.id),
                descending: true,
                ..JournalQuery::default()
            })
            .await?;

        for newer_entry in &newer {
            apply_delta(&mut state, &newer_entry.state_delta)?;
            apply_delta(&mut context, &newer_entry.context_delta)?;
        }

        let event = match &entry.event {
            Some(bytes) => Some(serde_json::from_slice(bytes)?),
            None => None,
        };

        Ok(Some(MergedJournalEntry {
            id: entry.id,
            reference,
            timestamp: entry.timestamp,
            event,
            state,
            context,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backwards_delta_reproduces_the_old_value() {
        let old = serde_json::json!({ "place": "at home", "steps": 0 });
        let new = serde_json::json!({ "place": "at the park", "steps": 4 });

        let delta = backwards_delta(&new, &old).unwrap();
        let mut document = new.clone();
        apply_delta(&mut document, &delta).unwrap();
        assert_eq!(document, old);
    }

    #[test]
    fn backwards_delta_of_root_strings() {
        let old = serde_json::json!("at home");
        let new = serde_json::json!("at the park");

        let delta = backwards_delta(&new, &old).unwrap();
        let mut document = new.clone();
        apply_delta(&mut document, &delta).unwrap();
        assert_eq!(document, old);
    }

    #[test]
    fn delta_between_equal_values_is_empty() {
        let value = serde_json::json!({ "a": 1 });
        let delta = backwards_delta(&value, &value).unwrap();
        let patch: json_patch::Patch = serde_json::from_slice(&delta).unwrap();
        assert!(patch.0.is_empty());
    }

    #[test]
    fn create_delta_walks_back_to_null() {
        let new = serde_json::json!({ "goodWeather": true });
        let delta = backwards_delta(&new, &Value::Null).unwrap();
        let mut document = new.clone();
        apply_delta(&mut document, &delta).unwrap();
        assert_eq!(document, Value::Null);
    }
}
