// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Chart digests.
//!
//! Digests are per-chart key/value summaries maintained by an update hook:
//! applications register mapper functions per machine, and every committed
//! change runs the mappers and upserts the produced pairs. Digest rows are
//! what the filter-tree query surface evaluates against, so applications
//! can find charts by domain attributes without deserializing snapshots.
//! Observers get a `new-digest-entry` notification per updated chart.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::debug;

use xjog_machine::filter::ChartDigest;
use xjog_machine::{ChartReference, DigestFilter};

use crate::change::{ChangeKind, StateChange};
use crate::error::Result;
use crate::persistence::{EngineStore, PersistenceStore};

/// Capacity of the digest notification channel.
const NOTIFY_CAPACITY: usize = 256;

/// Maps a committed change to digest key/value pairs.
pub type DigestMapper = Arc<dyn Fn(&StateChange) -> Vec<(String, String)> + Send + Sync>;

/// Maintains the `digests` table through the update-hook pipeline.
pub struct DigestWriter {
    store: Arc<dyn EngineStore>,
    mappers: RwLock<HashMap<String, Vec<DigestMapper>>>,
    notify_tx: broadcast::Sender<ChartReference>,
}

impl DigestWriter {
    pub(crate) fn new(store: Arc<dyn EngineStore>) -> Self {
        let (notify_tx, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self {
            store,
            mappers: RwLock::new(HashMap::new()),
            notify_tx,
        }
    }

    /// Register a digest mapper for one machine.
    pub fn register_mapper(&self, machine_id: impl Into<String>, mapper: DigestMapper) {
        self.mappers
            .write()
            .expect("digest mappers poisoned")
            .entry(machine_id.into())
            .or_default()
            .push(mapper);
    }

    /// Subscribe to the `new-digest-entry` channel.
    pub fn notifications(&self) -> broadcast::Receiver<ChartReference> {
        self.notify_tx.subscribe()
    }

    /// The digest leg of the update-hook pipeline.
    pub(crate) async fn handle(&self, change: &StateChange) -> Result<()> {
        if change.kind == ChangeKind::Delete {
            self.store.delete_digests(&change.reference).await?;
            return Ok(());
        }

        let mappers: Vec<DigestMapper> = self
            .mappers
            .read()
            .expect("digest mappers poisoned")
            .get(&change.reference.machine_id)
            .cloned()
            .unwrap_or_default();
        if mappers.is_empty() {
            return Ok(());
        }

        let mut wrote = false;
        for mapper in mappers {
            for (key, value) in mapper(change) {
                self.store
                    .upsert_digest(&change.reference, &key, &value)
                    .await?;
                wrote = true;
            }
        }

        if wrote {
            debug!(chart = %change.reference, "digests updated");
            let _ = self.notify_tx.send(change.reference.clone());
        }
        Ok(())
    }

    /// Query charts by digest filter, optionally restricted to one
    /// machine. Rows are grouped per chart and the filter tree evaluated
    /// in memory.
    pub async fn query(
        &self,
        machine_id: Option<&str>,
        filter: Option<&DigestFilter>,
    ) -> Result<Vec<ChartDigest>> {
        let rows = self.store.list_digests(machine_id).await?;

        let mut grouped: HashMap<ChartReference, (HashMap<String, String>, DateTime<Utc>, DateTime<Utc>)> =
            HashMap::new();
        for row in rows {
            let reference = ChartReference::new(row.machine_id.clone(), row.chart_id.clone());
            let entry = grouped
                .entry(reference)
                .or_insert_with(|| (HashMap::new(), row.created, row.timestamp));
            entry.0.insert(row.key, row.value);
            entry.1 = entry.1.min(row.created);
            entry.2 = entry.2.max(row.timestamp);
        }

        let mut digests: Vec<ChartDigest> = grouped
            .into_iter()
            .map(|(reference, (entries, created, updated))| ChartDigest {
                reference,
                entries,
                created,
                updated,
            })
            .filter(|digest| filter.map(|f| f.eval(digest)).unwrap_or(true))
            .collect();
        digests.sort_by(|a, b| a.reference.uri().cmp(&b.reference.uri()));
        Ok(digests)
    }
}
