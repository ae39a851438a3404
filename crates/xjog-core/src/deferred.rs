// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deferred-event scheduling.
//!
//! The manager keeps an in-memory view of the rows this instance has
//! reserved (leased with `lock = instanceId`) and one armed timer per row.
//! A scheduler loop performs batched lookahead reads: it atomically
//! reserves every unlocked row due within the lookahead window, arms
//! timers, and re-arms itself at the last reserved row's due time (full
//! batch, since more rows are likely waiting) or after the regular interval.
//! Deferring an event due earlier than the next scheduled read pulls the
//! read forward.
//!
//! On fire, the event is delivered exactly once by this instance and the
//! row deleted; a retry after delivery finds nothing to redo. Delivery to
//! a vanished chart still deletes the row (with a warning) so the queue
//! never loops on a dead event. Storage failures instead release the lease
//! so another instance can claim the row.

use std::collections::HashMap;
use std::sync::Weak;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use xjog_machine::ChartReference;

use crate::engine::EngineInner;
use crate::error::{ChartError, Result};
use crate::persistence::{DeferredEventRow, NewDeferredEvent, PersistenceStore};
use crate::util::correlation_id;

struct SchedulerState {
    /// Reserved rows by id; every entry has a matching armed timer.
    events: HashMap<i64, DeferredEventRow>,
    /// Armed timer per reserved row.
    timers: HashMap<i64, JoinHandle<()>>,
    /// Wall-clock time of the next batch read.
    next_read_at: DateTime<Utc>,
}

/// Persistent timer queue with batched lookahead and per-event timers.
pub struct DeferredEventManager {
    engine: Weak<EngineInner>,
    state: Mutex<SchedulerState>,
    reschedule: Notify,
    shutdown: Notify,
    started: AtomicBool,
    stopping: AtomicBool,
}

impl DeferredEventManager {
    pub(crate) fn new(engine: Weak<EngineInner>) -> Self {
        Self {
            engine,
            state: Mutex::new(SchedulerState {
                events: HashMap::new(),
                timers: HashMap::new(),
                next_read_at: Utc::now(),
            }),
            reschedule: Notify::new(),
            shutdown: Notify::new(),
            started: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
        }
    }

    /// Start the scheduler loop. Idempotent.
    pub(crate) fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = self.engine.clone();
        tokio::spawn(async move {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            Self::run(inner).await;
        });
    }

    async fn run(inner: std::sync::Arc<EngineInner>) {
        let manager = &inner.deferred;
        info!(
            batch_size = inner.options.deferred_events.batch_size,
            interval_ms = inner.options.deferred_events.interval.as_millis() as u64,
            look_ahead_ms = inner.options.deferred_events.look_ahead.as_millis() as u64,
            "deferred event scheduler started"
        );

        loop {
            if manager.stopping.load(Ordering::SeqCst) {
                break;
            }
            let next_read_at = manager.state.lock().await.next_read_at;
            let wait = (next_read_at - Utc::now())
                .to_std()
                .unwrap_or(std::time::Duration::ZERO);

            tokio::select! {
                biased;

                _ = manager.shutdown.notified() => break,

                _ = manager.reschedule.notified() => continue,

                _ = tokio::time::sleep(wait) => {
                    if let Err(error) = manager.schedule_upcoming(&inner).await {
                        error!(%error, "deferred batch read failed");
                        let mut state = manager.state.lock().await;
                        state.next_read_at =
                            Utc::now() + chrono::Duration::from_std(
                                inner.options.deferred_events.interval,
                            ).unwrap_or_else(|_| chrono::Duration::seconds(30));
                    }
                }
            }
        }

        info!("deferred event scheduler stopped");
    }

    /// The batch cycle: reserve due rows, arm timers, pick the next read
    /// time.
    async fn schedule_upcoming(&self, inner: &std::sync::Arc<EngineInner>) -> Result<()> {
        let options = &inner.options.deferred_events;
        let rows = inner
            .store
            .read_deferred_event_batch(
                &inner.instance_id,
                options.batch_size,
                options.look_ahead,
            )
            .await?;

        let full_batch = rows.len() as i64 == options.batch_size;
        let last_due = rows.last().map(|row| row.due);

        let mut state = self.state.lock().await;
        for row in rows {
            if state.timers.contains_key(&row.id) {
                continue;
            }
            self.arm(&mut state, row);
        }
        state.next_read_at = match (full_batch, last_due) {
            // A full batch means more rows are likely waiting right behind
            // the last one.
            (true, Some(due)) => due,
            _ => {
                Utc::now()
                    + chrono::Duration::from_std(options.interval)
                        .unwrap_or_else(|_| chrono::Duration::seconds(30))
            }
        };

        Ok(())
    }

    fn arm(&self, state: &mut SchedulerState, row: DeferredEventRow) {
        let id = row.id;
        let delay = (row.due - Utc::now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        let weak = self.engine.clone();

        debug!(event = id, chart = %row.reference(), delay_ms = delay.as_millis() as u64, "timer armed");

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            inner.deferred.fire(&inner, id).await;
        });
        state.events.insert(id, row);
        state.timers.insert(id, handle);
    }

    /// Deliver one armed event and delete its row.
    async fn fire(&self, inner: &std::sync::Arc<EngineInner>, id: i64) {
        let row = {
            let state = self.state.lock().await;
            state.events.get(&id).cloned()
        };
        let Some(row) = row else {
            // Cancelled between arming and firing.
            return;
        };
        let cid = correlation_id();

        let delete_row = match inner.deliver_deferred(&row).await {
            Ok(_) => true,
            Err(ChartError::ChartNotFound { reference }) => {
                warn!(
                    cid,
                    event = id,
                    chart = %reference,
                    "deferred delivery found no chart, dropping event"
                );
                true
            }
            Err(error) => {
                error!(cid, event = id, %error, "deferred delivery failed, releasing lease");
                false
            }
        };

        {
            let mut state = self.state.lock().await;
            state.events.remove(&id);
            state.timers.remove(&id);
        }

        let result = if delete_row {
            inner.store.delete_deferred_event(id).await
        } else {
            inner.store.release_deferred_event(id).await
        };
        if let Err(error) = result {
            error!(cid, event = id, %error, "deferred row cleanup failed");
        }
    }

    /// Persist a deferred event. If it is due before the next scheduled
    /// batch read, the read is pulled forward to the event's due time.
    pub(crate) async fn defer(&self, event: NewDeferredEvent) -> Result<DeferredEventRow> {
        let inner = self
            .engine
            .upgrade()
            .ok_or_else(|| ChartError::storage("defer", "engine dropped"))?;
        let row = inner.store.insert_deferred_event(&event).await?;

        let mut state = self.state.lock().await;
        if row.due < state.next_read_at {
            state.next_read_at = row.due;
            self.reschedule.notify_one();
        }
        debug!(
            event = row.id,
            chart = %row.reference(),
            delay_ms = row.delay,
            "event deferred"
        );
        Ok(row)
    }

    /// Cancel every scheduled event of `reference` with the given
    /// cancellation key. Idempotent.
    pub(crate) async fn cancel(
        &self,
        reference: &ChartReference,
        event_id: &serde_json::Value,
    ) -> Result<u64> {
        let key = serde_json::to_string(event_id)?;

        {
            let mut state = self.state.lock().await;
            let ids: Vec<i64> = state
                .events
                .values()
                .filter(|row| {
                    row.event_id == key
                        && row.machine_id == reference.machine_id
                        && row.chart_id == reference.chart_id
                })
                .map(|row| row.id)
                .collect();
            for id in ids {
                if let Some(handle) = state.timers.remove(&id) {
                    handle.abort();
                }
                state.events.remove(&id);
            }
        }

        let inner = self
            .engine
            .upgrade()
            .ok_or_else(|| ChartError::storage("cancel", "engine dropped"))?;
        inner
            .store
            .delete_deferred_events_by_event_id(reference, &key)
            .await
    }

    /// Cancel every scheduled event of one chart.
    pub(crate) async fn cancel_all_for_chart(&self, reference: &ChartReference) -> Result<()> {
        self.forget_chart(reference).await;
        let inner = self
            .engine
            .upgrade()
            .ok_or_else(|| ChartError::storage("cancel_all_for_chart", "engine dropped"))?;
        inner.store.delete_all_deferred_events(reference).await
    }

    /// Drop in-memory timers of one chart without touching rows (used when
    /// the rows are already removed by a cascade).
    pub(crate) async fn forget_chart(&self, reference: &ChartReference) {
        let mut state = self.state.lock().await;
        let ids: Vec<i64> = state
            .events
            .values()
            .filter(|row| {
                row.machine_id == reference.machine_id && row.chart_id == reference.chart_id
            })
            .map(|row| row.id)
            .collect();
        for id in ids {
            if let Some(handle) = state.timers.remove(&id) {
                handle.abort();
            }
            state.events.remove(&id);
        }
    }

    /// Shutdown: stop the loop, drop all timers and release this
    /// instance's leases so another instance can claim them.
    pub(crate) async fn stop_and_release(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.shutdown.notify_one();

        {
            let mut state = self.state.lock().await;
            for (_, handle) in state.timers.drain() {
                handle.abort();
            }
            state.events.clear();
        }

        if let Some(inner) = self.engine.upgrade() {
            if let Err(error) = inner
                .store
                .release_all_deferred_events(&inner.instance_id)
                .await
            {
                error!(%error, "failed to release deferred event leases");
            }
        }
    }
}
