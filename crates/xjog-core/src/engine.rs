// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The engine composition root.
//!
//! [`Engine`] owns the store, the journal, the digest writer, the machine
//! registry, the deferred-event scheduler, the activity manager and the
//! startup manager, and exposes the public operation surface: machine
//! registration, chart creation and destruction, event delivery, external
//! id lookup, chart/digest queries, update hooks and the engine-wide
//! change broadcast.
//!
//! Construction is builder-based like an embeddable runtime: provide a
//! store, tune the options, `build()`, then `start().await`, which
//! overthrows every other instance sharing the database, adopts their
//! charts and resolves once the engine is ready.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use xjog_machine::{
    ChartFacts, ChartFilter, ChartReference, DigestFilter, Event, Machine, SendTarget, State,
};
use xjog_machine::filter::ChartDigest;

use crate::activity::ActivityManager;
use crate::change::{StateChange, UpdateHook};
use crate::config::EngineOptions;
use crate::deferred::DeferredEventManager;
use crate::digest::{DigestMapper, DigestWriter};
use crate::error::{ChartError, Result};
use crate::executor::{ChartExecutor, ContextPatch};
use crate::journal::Journal;
use crate::persistence::{DeferredEventRow, EngineStore, NewDeferredEvent, PersistenceStore};
use crate::registry::{ChartLookup, MachineRegistry};
use crate::startup::{EnginePhase, StartupManager};
use crate::util::correlation_id;

/// Capacity of the engine-wide change broadcast.
const CHANGES_CAPACITY: usize = 1024;

/// Shared engine state behind the public [`Engine`] handle.
pub(crate) struct EngineInner {
    pub(crate) instance_id: String,
    pub(crate) options: EngineOptions,
    pub(crate) store: Arc<dyn EngineStore>,
    pub(crate) journal: Journal,
    pub(crate) digests: DigestWriter,
    pub(crate) registry: MachineRegistry,
    pub(crate) deferred: DeferredEventManager,
    pub(crate) activities: ActivityManager,
    pub(crate) startup: StartupManager,
    changes_tx: broadcast::Sender<StateChange>,
    hooks: Mutex<Vec<(u64, UpdateHook)>>,
    next_hook_id: AtomicU64,
    self_weak: Weak<EngineInner>,
}

impl EngineInner {
    pub(crate) fn self_weak(&self) -> Weak<EngineInner> {
        self.self_weak.clone()
    }

    pub(crate) fn is_dying(&self) -> bool {
        self.startup.is_dying()
    }

    /// Begin shutdown without waiting for it (mutex-timeout path).
    pub(crate) fn initiate_shutdown(&self) {
        let weak = self.self_weak();
        tokio::spawn(async move {
            if let Some(inner) = weak.upgrade() {
                let _ = StartupManager::run_shutdown(inner).await;
            }
        });
    }

    pub(crate) fn changes(&self) -> broadcast::Receiver<StateChange> {
        self.changes_tx.subscribe()
    }

    pub(crate) fn publish_change(&self, change: &Arc<StateChange>) {
        let _ = self.changes_tx.send((**change).clone());
    }

    /// Run the update-hook pipeline: journal writer, digest writer, then
    /// user hooks, sequentially. Any failure aborts the send.
    pub(crate) async fn run_hooks(&self, change: &Arc<StateChange>) -> Result<()> {
        self.journal
            .record(&self.instance_id, change)
            .await
            .map_err(|e| ChartError::HookFailed {
                reason: format!("journal: {e}"),
            })?;

        self.digests
            .handle(change)
            .await
            .map_err(|e| ChartError::HookFailed {
                reason: format!("digest: {e}"),
            })?;

        let hooks: Vec<UpdateHook> = {
            let installed = self.hooks.lock().expect("hooks poisoned");
            installed.iter().map(|(_, hook)| hook.clone()).collect()
        };
        for hook in hooks {
            hook(change.clone())
                .await
                .map_err(|reason| ChartError::HookFailed { reason })?;
        }
        Ok(())
    }

    /// Park an event on the deferred queue with zero routing.
    pub(crate) async fn defer_event(
        &self,
        reference: ChartReference,
        event: Event,
        delay_ms: i64,
    ) -> Result<()> {
        self.deferred
            .defer(NewDeferredEvent {
                reference,
                event,
                event_id: serde_json::Value::String(correlation_id()),
                event_to: None,
                delay_ms,
            })
            .await?;
        Ok(())
    }

    /// Deliver a fired deferred event along its routing target.
    pub(crate) async fn deliver_deferred(
        &self,
        row: &DeferredEventRow,
    ) -> Result<Option<State>> {
        let event = row.decode_event()?;
        let cid = correlation_id();
        debug!(cid, event = row.id, chart = %row.reference(), kind = %event.kind, "delivering deferred event");

        match row.decode_target()? {
            None => {
                self.send_event_internal(&row.reference(), event, None, &cid)
                    .await
            }
            Some(SendTarget::Chart(target)) => {
                self.send_event_internal(&target, event, None, &cid).await
            }
            Some(SendTarget::Parent) => {
                let reference = row.reference();
                let parent = self
                    .store
                    .read_chart(&reference)
                    .await?
                    .and_then(|chart| chart.parent_reference());
                match parent {
                    Some(parent) => {
                        self.send_event_internal(&parent, event, None, &cid).await
                    }
                    None => {
                        warn!(cid, chart = %reference, "deferred event routed to absent parent");
                        Ok(None)
                    }
                }
            }
            Some(SendTarget::Activity { activity_id }) => {
                let delivered = self
                    .activities
                    .send_to(&row.reference(), &activity_id, event)
                    .await?;
                if !delivered {
                    warn!(
                        cid,
                        chart = %row.reference(),
                        activity = %activity_id,
                        "deferred event routed to absent activity"
                    );
                }
                Ok(None)
            }
        }
    }

    /// Deliver one event to a chart. Paused charts park the event on the
    /// deferred queue instead.
    pub(crate) async fn send_event_internal(
        &self,
        reference: &ChartReference,
        event: Event,
        patch: Option<ContextPatch>,
        cid: &str,
    ) -> Result<Option<State>> {
        match self.registry.get_chart(reference).await? {
            ChartLookup::Hit(executor) => executor.send(event, patch, cid).await,
            ChartLookup::Paused => {
                debug!(cid, chart = %reference, "chart paused, deferring event");
                self.defer_event(reference.clone(), event, 0).await?;
                Ok(None)
            }
            ChartLookup::Missing => Err(ChartError::ChartNotFound {
                reference: reference.clone(),
            }),
        }
    }

    /// Create a chart and cache its executor.
    pub(crate) async fn create_chart_internal(
        &self,
        machine_id: &str,
        chart_id: Option<String>,
        parent: Option<ChartReference>,
        cid: &str,
    ) -> Result<ChartReference> {
        let machine = self.registry.machine(machine_id)?;
        let chart_id =
            chart_id.unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        let reference = ChartReference::new(machine_id.to_string(), chart_id);

        let executor = ChartExecutor::create(
            self,
            machine,
            reference.clone(),
            parent,
            cid,
        )
        .await?;
        self.registry.insert(&reference, executor).await?;
        Ok(reference)
    }

    /// Destroy a chart and drop its executor.
    pub(crate) async fn destroy_chart_internal(
        &self,
        reference: &ChartReference,
        cid: &str,
    ) -> Result<()> {
        match self.registry.get_chart(reference).await? {
            ChartLookup::Hit(executor) => {
                executor.destroy(cid).await?;
                self.registry.remove(reference).await?;
                Ok(())
            }
            ChartLookup::Paused => Err(ChartError::storage(
                "destroy",
                format!("chart '{reference}' is paused awaiting adoption"),
            )),
            ChartLookup::Missing => Err(ChartError::ChartNotFound {
                reference: reference.clone(),
            }),
        }
    }
}

/// Builder for an [`Engine`].
pub struct EngineBuilder {
    store: Option<Arc<dyn EngineStore>>,
    options: EngineOptions,
}

impl std::fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("store", &self.store.as_ref().map(|_| "..."))
            .field("options", &self.options)
            .finish()
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            store: None,
            options: EngineOptions::default(),
        }
    }
}

impl EngineBuilder {
    /// Create a builder with default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the storage backend (required).
    pub fn store(mut self, store: Arc<dyn EngineStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the engine options.
    pub fn options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    /// Build the engine. Fails when no store is configured.
    pub fn build(self) -> Result<Engine> {
        let store = self
            .store
            .ok_or_else(|| ChartError::storage("build", "store is required"))?;
        let options = self.options.clamped();
        let instance_id = uuid::Uuid::new_v4().simple().to_string();
        let (changes_tx, _) = broadcast::channel(CHANGES_CAPACITY);

        let inner = Arc::new_cyclic(|weak: &Weak<EngineInner>| EngineInner {
            instance_id: instance_id.clone(),
            options,
            store: store.clone(),
            journal: Journal::new(store.clone()),
            digests: DigestWriter::new(store.clone()),
            registry: MachineRegistry::new(weak.clone()),
            deferred: DeferredEventManager::new(weak.clone()),
            activities: ActivityManager::new(weak.clone()),
            startup: StartupManager::new(weak.clone()),
            changes_tx,
            hooks: Mutex::new(Vec::new()),
            next_hook_id: AtomicU64::new(1),
            self_weak: weak.clone(),
        });

        info!(instance = %instance_id, "engine built");
        Ok(Engine { inner })
    }
}

/// Options for [`Engine::create_chart`].
#[derive(Debug, Clone, Default)]
pub struct CreateChartOptions {
    /// Fixed chart id; generated when absent.
    pub chart_id: Option<String>,
    /// Parent chart for invoked children.
    pub parent: Option<ChartReference>,
}

/// An uninstaller for an update hook.
pub struct HookHandle {
    id: u64,
    engine: Weak<EngineInner>,
}

impl HookHandle {
    /// Remove the hook; subsequent changes no longer reach it.
    pub fn uninstall(self) {
        if let Some(inner) = self.engine.upgrade() {
            inner
                .hooks
                .lock()
                .expect("hooks poisoned")
                .retain(|(id, _)| *id != self.id);
        }
    }
}

/// A durable statechart execution engine instance.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

impl Engine {
    /// Create a builder.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// This instance's unique id.
    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> EnginePhase {
        self.inner.startup.phase()
    }

    /// Watch lifecycle phase transitions.
    pub fn phase_changes(&self) -> watch::Receiver<EnginePhase> {
        self.inner.startup.subscribe()
    }

    /// The storage backend.
    pub fn store(&self) -> Arc<dyn EngineStore> {
        self.inner.store.clone()
    }

    /// The journal (queries, subscriptions, time travel).
    pub fn journal(&self) -> &Journal {
        &self.inner.journal
    }

    /// Register a machine definition. Legal only before [`start`](Self::start).
    pub fn register_machine(&self, machine: Arc<dyn Machine>) -> Result<()> {
        self.inner.registry.register_machine(machine)
    }

    /// Register a digest mapper for one machine.
    pub fn register_digest_mapper(&self, machine_id: impl Into<String>, mapper: DigestMapper) {
        self.inner.digests.register_mapper(machine_id, mapper);
    }

    /// Subscribe to the `new-digest-entry` channel.
    pub fn digest_notifications(&self) -> broadcast::Receiver<ChartReference> {
        self.inner.digests.notifications()
    }

    /// Start the engine: overthrow other instances, adopt their charts,
    /// start the deferred-event scheduler and the death-note watch.
    /// Resolves once the engine is ready.
    pub async fn start(&self) -> Result<()> {
        self.inner.registry.close_registration();
        self.inner.startup.begin(&self.inner).await?;
        self.inner.deferred.start();
        self.inner.startup.spawn_background(self.inner.clone());
        self.inner.startup.wait_ready().await
    }

    /// Gracefully shut the engine down; resolves once halted.
    pub async fn shutdown(&self) -> Result<()> {
        StartupManager::run_shutdown(self.inner.clone()).await
    }

    /// Wait until the engine halts (e.g. after being overthrown).
    pub async fn wait_halted(&self) {
        let mut phases = self.inner.startup.subscribe();
        while *phases.borrow_and_update() != EnginePhase::Halted {
            if phases.changed().await.is_err() {
                return;
            }
        }
    }

    /// Observable stream of every state change in this engine.
    pub fn changes(&self) -> broadcast::Receiver<StateChange> {
        self.inner.changes()
    }

    /// Install an update hook; returns its uninstaller.
    pub fn install_update_hook(&self, hook: UpdateHook) -> HookHandle {
        let id = self.inner.next_hook_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .hooks
            .lock()
            .expect("hooks poisoned")
            .push((id, hook));
        HookHandle {
            id,
            engine: self.inner.self_weak(),
        }
    }

    /// Create a chart of a registered machine.
    pub async fn create_chart(
        &self,
        machine_id: &str,
        options: CreateChartOptions,
    ) -> Result<ChartReference> {
        let cid = correlation_id();
        self.inner
            .create_chart_internal(machine_id, options.chart_id, options.parent, &cid)
            .await
    }

    /// Destroy a chart: hooks, cascading row removal, activity and timer
    /// teardown.
    pub async fn destroy_chart(&self, reference: &ChartReference) -> Result<()> {
        let cid = correlation_id();
        self.inner.destroy_chart_internal(reference, &cid).await
    }

    /// Deliver an event to a chart. Returns the new state, or `None` when
    /// the event was parked or the transition declined.
    pub async fn send_event(
        &self,
        reference: &ChartReference,
        event: impl Into<Event>,
    ) -> Result<Option<State>> {
        let cid = correlation_id();
        self.inner
            .send_event_internal(reference, event.into(), None, &cid)
            .await
    }

    /// Deliver an event with a context patch applied before the evaluator
    /// runs.
    pub async fn send_event_with(
        &self,
        reference: &ChartReference,
        event: impl Into<Event>,
        patch: ContextPatch,
    ) -> Result<Option<State>> {
        let cid = correlation_id();
        self.inner
            .send_event_internal(reference, event.into(), Some(patch), &cid)
            .await
    }

    /// Route an event to a running activity of a chart.
    pub async fn send_to(
        &self,
        reference: &ChartReference,
        activity_id: &str,
        event: impl Into<Event>,
    ) -> Result<bool> {
        self.inner
            .activities
            .send_to(reference, activity_id, event.into())
            .await
    }

    /// Read a chart's current state; `None` when no such chart exists.
    pub async fn get_chart(&self, reference: &ChartReference) -> Result<Option<State>> {
        match self.inner.registry.get_chart(reference).await? {
            ChartLookup::Hit(executor) => Ok(Some(executor.current_state().await?)),
            ChartLookup::Paused => {
                let row = self.inner.store.read_chart(reference).await?;
                match row {
                    Some(row) => Ok(Some(State::from_bytes(&row.state)?)),
                    None => Ok(None),
                }
            }
            ChartLookup::Missing => Ok(None),
        }
    }

    /// Number of running activities for one chart on this instance.
    pub async fn ongoing_activity_count(&self, reference: &ChartReference) -> usize {
        self.inner.activities.count_for(reference).await
    }

    /// Register a secondary `(key, value) → chart` lookup.
    pub async fn register_external_id(
        &self,
        key: &str,
        value: &str,
        reference: &ChartReference,
    ) -> Result<()> {
        self.inner.store.register_external_id(key, value, reference).await
    }

    /// Drop a secondary lookup pair.
    pub async fn drop_external_id(&self, key: &str, value: &str) -> Result<()> {
        self.inner.store.drop_external_id(key, value).await
    }

    /// Resolve a secondary lookup pair to a chart.
    pub async fn get_chart_by_external_id(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Option<ChartReference>> {
        self.inner.store.chart_by_external_id(key, value).await
    }

    /// Find charts by filter tree, evaluated over chart identity, state
    /// value and external identifiers.
    pub async fn query_charts(&self, filter: &ChartFilter) -> Result<Vec<ChartReference>> {
        let charts = self.inner.store.list_charts().await?;
        let external = self.inner.store.list_external_ids().await?;

        let mut ids_by_chart: std::collections::HashMap<ChartReference, Vec<(String, String)>> =
            std::collections::HashMap::new();
        for row in external {
            ids_by_chart
                .entry(row.reference())
                .or_default()
                .push((row.key, row.value));
        }

        let mut matches = Vec::new();
        for chart in charts {
            let reference = chart.reference();
            let state_value = State::from_bytes(&chart.state)
                .map(|state| state.value)
                .unwrap_or(serde_json::Value::Null);
            let facts = ChartFacts {
                reference: reference.clone(),
                state_value,
                external_ids: ids_by_chart.remove(&reference).unwrap_or_default(),
            };
            if filter.eval(&facts) {
                matches.push(reference);
            }
        }
        Ok(matches)
    }

    /// Find chart digests by filter tree.
    pub async fn query_digests(
        &self,
        machine_id: Option<&str>,
        filter: Option<&DigestFilter>,
    ) -> Result<Vec<ChartDigest>> {
        self.inner.digests.query(machine_id, filter).await
    }
}
