// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The activity manager.
//!
//! An activity is an externally-provided side effect bound to one chart:
//! a future, a callback, an event stream or a nested chart. Activities
//! outlive chart executors (a chart can fall out of the cache while its
//! activity keeps running) but never outlive the owning engine instance:
//! after a handover the adopting instance re-runs the chart's entry
//! actions, which re-register the activities from the machine definition.
//!
//! Every activity emission reaches the owner through the deferred queue
//! with zero delay, never by re-entering the owner's chart mutex directly.
//! The persistent `ongoingActivities` marker row exists purely for the
//! adoption logic: a marked chart is skipped by gentle adoption until the
//! grace period expires.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Weak;

use futures::StreamExt;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use xjog_machine::{ActivityJob, ActivitySpawn, ChartReference, Event};

use crate::change::ChangeKind;
use crate::engine::EngineInner;
use crate::error::{ChartError, Result};
use crate::persistence::PersistenceStore;
use crate::util::correlation_id;

struct ActivityHandle {
    task: JoinHandle<()>,
    /// Inbound event channel for callback activities.
    inbox: Option<mpsc::UnboundedSender<Event>>,
    /// Child chart for nested-chart activities.
    child: Option<ChartReference>,
    auto_forward: bool,
}

#[derive(Default)]
struct Registry {
    /// machine id → chart id → activity id → handle.
    charts: HashMap<String, HashMap<String, HashMap<String, ActivityHandle>>>,
}

impl Registry {
    fn get(&self, reference: &ChartReference, activity_id: &str) -> Option<&ActivityHandle> {
        self.charts
            .get(&reference.machine_id)?
            .get(&reference.chart_id)?
            .get(activity_id)
    }

    fn contains(&self, reference: &ChartReference, activity_id: &str) -> bool {
        self.get(reference, activity_id).is_some()
    }

    fn insert(&mut self, reference: &ChartReference, activity_id: String, handle: ActivityHandle) {
        self.charts
            .entry(reference.machine_id.clone())
            .or_default()
            .entry(reference.chart_id.clone())
            .or_default()
            .insert(activity_id, handle);
    }

    fn remove(
        &mut self,
        reference: &ChartReference,
        activity_id: &str,
    ) -> Option<ActivityHandle> {
        let machines = self.charts.get_mut(&reference.machine_id)?;
        let charts = machines.get_mut(&reference.chart_id)?;
        let handle = charts.remove(activity_id);
        if charts.is_empty() {
            machines.remove(&reference.chart_id);
        }
        if machines.is_empty() {
            self.charts.remove(&reference.machine_id);
        }
        handle
    }

    fn remove_chart(&mut self, reference: &ChartReference) -> Vec<(String, ActivityHandle)> {
        let Some(machines) = self.charts.get_mut(&reference.machine_id) else {
            return Vec::new();
        };
        let removed = machines
            .remove(&reference.chart_id)
            .map(|activities| activities.into_iter().collect())
            .unwrap_or_default();
        if machines.is_empty() {
            self.charts.remove(&reference.machine_id);
        }
        removed
    }

    fn drain(&mut self) -> Vec<(ChartReference, String, ActivityHandle)> {
        let mut all = Vec::new();
        for (machine_id, charts) in self.charts.drain() {
            for (chart_id, activities) in charts {
                for (activity_id, handle) in activities {
                    all.push((
                        ChartReference::new(machine_id.clone(), chart_id.clone()),
                        activity_id,
                        handle,
                    ));
                }
            }
        }
        all
    }

    fn count_for(&self, reference: &ChartReference) -> usize {
        self.charts
            .get(&reference.machine_id)
            .and_then(|m| m.get(&reference.chart_id))
            .map(|a| a.len())
            .unwrap_or(0)
    }
}

/// In-memory registry of running activities, keyed per chart.
pub struct ActivityManager {
    engine: Weak<EngineInner>,
    registry: Mutex<Registry>,
}

impl ActivityManager {
    pub(crate) fn new(engine: Weak<EngineInner>) -> Self {
        Self {
            engine,
            registry: Mutex::new(Registry::default()),
        }
    }

    fn inner(&self) -> Result<Arc<EngineInner>> {
        self.engine
            .upgrade()
            .ok_or_else(|| ChartError::storage("activity", "engine dropped"))
    }

    /// Register and start an activity. Idempotent: a second registration
    /// of the same `(chart, activity)` pair is a no-op, which is what
    /// makes re-running entry actions after adoption safe.
    pub(crate) async fn register(
        &self,
        owner: &ChartReference,
        activity_id: &str,
        spawn: ActivitySpawn,
        auto_forward: bool,
        cid: &str,
    ) -> Result<()> {
        let inner = self.inner()?;

        // Nested charts are created outside the registry mutex: the
        // child's own entry actions may register activities of their own.
        let premade_child = match &spawn {
            ActivitySpawn::Chart {
                machine_id,
                chart_id,
                ..
            } => {
                if self.registry.lock().await.contains(owner, activity_id) {
                    debug!(cid, chart = %owner, activity = activity_id, "activity already running");
                    return Ok(());
                }
                Some(
                    inner
                        .create_chart_internal(
                            machine_id,
                            chart_id.clone(),
                            Some(owner.clone()),
                            cid,
                        )
                        .await?,
                )
            }
            _ => None,
        };

        // The marker row and the registry entry land before any driver
        // runs, so a side effect that completes instantly still finds its
        // own registration to clean up.
        let mut registry = self.registry.lock().await;
        if registry.contains(owner, activity_id) {
            debug!(cid, chart = %owner, activity = activity_id, "activity already running");
            if let Some(child) = premade_child {
                drop(registry);
                let _ = inner.destroy_chart_internal(&child, cid).await;
            }
            return Ok(());
        }
        inner.store.register_activity(owner, activity_id).await?;

        let handle = match spawn {
            ActivitySpawn::Future(future) => {
                let task = tokio::spawn(Self::drive_future(
                    self.engine.clone(),
                    owner.clone(),
                    activity_id.to_string(),
                    future,
                ));
                ActivityHandle {
                    task,
                    inbox: None,
                    child: None,
                    auto_forward,
                }
            }
            ActivitySpawn::Callback(callback) => {
                let (emit_tx, emit_rx) = mpsc::unbounded_channel();
                let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
                let job = ActivityJob {
                    owner: owner.clone(),
                    activity_id: activity_id.to_string(),
                    emit: emit_tx,
                    inbox: inbox_rx,
                };
                let future = callback(job);
                let task = tokio::spawn(Self::drive_callback(
                    self.engine.clone(),
                    owner.clone(),
                    activity_id.to_string(),
                    future,
                    emit_rx,
                ));
                ActivityHandle {
                    task,
                    inbox: Some(inbox_tx),
                    child: None,
                    auto_forward,
                }
            }
            ActivitySpawn::Stream(stream) => {
                let task = tokio::spawn(Self::drive_stream(
                    self.engine.clone(),
                    owner.clone(),
                    activity_id.to_string(),
                    stream,
                ));
                ActivityHandle {
                    task,
                    inbox: None,
                    child: None,
                    auto_forward,
                }
            }
            ActivitySpawn::Chart { sync, .. } => {
                let child = premade_child.clone().ok_or_else(|| {
                    ChartError::storage("activity", "nested chart missing after creation")
                })?;
                let task = if sync {
                    tokio::spawn(Self::drive_child_sync(
                        self.engine.clone(),
                        owner.clone(),
                        child.clone(),
                    ))
                } else {
                    tokio::spawn(async {})
                };
                ActivityHandle {
                    task,
                    inbox: None,
                    child: Some(child),
                    auto_forward,
                }
            }
        };
        registry.insert(owner, activity_id.to_string(), handle);
        drop(registry);

        info!(cid, chart = %owner, activity = activity_id, "activity registered");
        Ok(())
    }

    async fn drive_future(
        engine: Weak<EngineInner>,
        owner: ChartReference,
        activity_id: String,
        future: futures::future::BoxFuture<'static, std::result::Result<serde_json::Value, String>>,
    ) {
        let result = future.await;
        let Some(inner) = engine.upgrade() else {
            return;
        };
        let event = match result {
            Ok(value) => Event::done_invoke(&activity_id, value),
            Err(message) => Event::error_platform(&activity_id, message),
        };
        if let Err(error) = inner.defer_event(owner.clone(), event, 0).await {
            warn!(chart = %owner, activity = activity_id, %error, "activity result lost");
        }
        inner.activities.finish(&owner, &activity_id).await;
    }

    async fn drive_callback(
        engine: Weak<EngineInner>,
        owner: ChartReference,
        activity_id: String,
        future: futures::future::BoxFuture<'static, std::result::Result<(), String>>,
        mut emissions: mpsc::UnboundedReceiver<Event>,
    ) {
        let forward_owner = owner.clone();
        let forward_engine = engine.clone();
        let forward = async move {
            while let Some(event) = emissions.recv().await {
                let Some(inner) = forward_engine.upgrade() else {
                    return;
                };
                if let Err(error) = inner.defer_event(forward_owner.clone(), event, 0).await {
                    warn!(chart = %forward_owner, %error, "activity emission lost");
                }
            }
        };

        let (result, _) = tokio::join!(future, forward);

        let Some(inner) = engine.upgrade() else {
            return;
        };
        let event = match result {
            Ok(()) => Event::done_invoke(&activity_id, serde_json::Value::Null),
            Err(message) => Event::error_platform(&activity_id, message),
        };
        if let Err(error) = inner.defer_event(owner.clone(), event, 0).await {
            warn!(chart = %owner, activity = activity_id, %error, "activity result lost");
        }
        inner.activities.finish(&owner, &activity_id).await;
    }

    async fn drive_stream(
        engine: Weak<EngineInner>,
        owner: ChartReference,
        activity_id: String,
        mut stream: futures::stream::BoxStream<'static, Event>,
    ) {
        while let Some(event) = stream.next().await {
            let Some(inner) = engine.upgrade() else {
                return;
            };
            if let Err(error) = inner.defer_event(owner.clone(), event, 0).await {
                warn!(chart = %owner, activity = activity_id, %error, "activity emission lost");
            }
        }
        let Some(inner) = engine.upgrade() else {
            return;
        };
        let done = Event::done_invoke(&activity_id, serde_json::Value::Null);
        if let Err(error) = inner.defer_event(owner.clone(), done, 0).await {
            warn!(chart = %owner, activity = activity_id, %error, "activity result lost");
        }
        inner.activities.finish(&owner, &activity_id).await;
    }

    /// Forward a synchronized child chart's updates to the owner.
    async fn drive_child_sync(
        engine: Weak<EngineInner>,
        owner: ChartReference,
        child: ChartReference,
    ) {
        let Some(inner) = engine.upgrade() else {
            return;
        };
        let mut changes = inner.changes();
        drop(inner);

        loop {
            match changes.recv().await {
                Ok(change) if change.reference == child => match change.kind {
                    ChangeKind::Update => {
                        let Some(new) = change.new else { continue };
                        let Some(inner) = engine.upgrade() else { return };
                        let event = Event::child_update(new.value, new.context);
                        if let Err(error) = inner.defer_event(owner.clone(), event, 0).await {
                            warn!(chart = %owner, %error, "child sync update lost");
                        }
                    }
                    ChangeKind::Delete => return,
                    ChangeKind::Create => {}
                },
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(child = %child, skipped, "child sync lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    /// Remove a completed activity's registration without aborting its
    /// task (called from inside the task itself).
    async fn finish(&self, owner: &ChartReference, activity_id: &str) {
        let removed = self.registry.lock().await.remove(owner, activity_id);
        if removed.is_none() {
            return;
        }
        if let Ok(inner) = self.inner() {
            Self::drop_marker(&inner, owner, activity_id).await;
        }
        debug!(chart = %owner, activity = activity_id, "activity finished");
    }

    /// Drop the persistent marker row, but only while the chart is still
    /// ours: after a handover the adopting instance has re-created the
    /// marker for its own restart of the activity.
    async fn drop_marker(inner: &Arc<EngineInner>, owner: &ChartReference, activity_id: &str) {
        match inner.store.read_chart(owner).await {
            Ok(Some(row)) if row.owner_id != inner.instance_id => {
                debug!(
                    chart = %owner,
                    activity = activity_id,
                    "chart adopted elsewhere, leaving marker in place"
                );
                return;
            }
            Ok(Some(_)) => {}
            // Chart already gone; the cascade removed the marker.
            Ok(None) => return,
            Err(error) => {
                warn!(chart = %owner, %error, "marker ownership check failed");
            }
        }
        if let Err(error) = inner.store.unregister_activity(owner, activity_id).await {
            warn!(chart = %owner, activity = activity_id, %error, "marker cleanup failed");
        }
    }

    /// Stop one activity: abort its task, destroy a nested chart if any,
    /// and drop the marker row. Deterministic no-op when absent.
    pub(crate) async fn stop(&self, owner: &ChartReference, activity_id: &str) -> Result<()> {
        let handle = self.registry.lock().await.remove(owner, activity_id);
        let Some(handle) = handle else {
            return Ok(());
        };
        let inner = self.inner()?;
        self.teardown(&inner, owner, activity_id, handle).await;
        Ok(())
    }

    async fn teardown(
        &self,
        inner: &Arc<EngineInner>,
        owner: &ChartReference,
        activity_id: &str,
        handle: ActivityHandle,
    ) {
        handle.task.abort();
        if let Some(child) = handle.child {
            let cid = correlation_id();
            if let Err(error) = Box::pin(inner.destroy_chart_internal(&child, &cid)).await {
                warn!(chart = %owner, child = %child, %error, "nested chart teardown failed");
            }
        }
        Self::drop_marker(inner, owner, activity_id).await;
        info!(chart = %owner, activity = activity_id, "activity stopped");
    }

    /// Stop every activity of one chart.
    pub(crate) async fn stop_all_for_chart(&self, owner: &ChartReference) -> Result<()> {
        let removed = self.registry.lock().await.remove_chart(owner);
        if removed.is_empty() {
            return Ok(());
        }
        let inner = self.inner()?;
        for (activity_id, handle) in removed {
            self.teardown(&inner, owner, &activity_id, handle).await;
        }
        Ok(())
    }

    /// Stop every activity of every chart (shutdown path).
    pub(crate) async fn stop_all(&self) {
        let removed = self.registry.lock().await.drain();
        let Ok(inner) = self.inner() else {
            return;
        };
        for (owner, activity_id, handle) in removed {
            self.teardown(&inner, &owner, &activity_id, handle).await;
        }
    }

    /// Route an event to one activity. Returns false when no such activity
    /// is running or it does not accept inbound events.
    pub(crate) async fn send_to(
        &self,
        owner: &ChartReference,
        activity_id: &str,
        event: Event,
    ) -> Result<bool> {
        enum Route {
            Inbox(mpsc::UnboundedSender<Event>),
            Child(ChartReference),
        }

        let route = {
            let registry = self.registry.lock().await;
            match registry.get(owner, activity_id) {
                Some(handle) => match (&handle.inbox, &handle.child) {
                    (Some(inbox), _) => Some(Route::Inbox(inbox.clone())),
                    (None, Some(child)) => Some(Route::Child(child.clone())),
                    (None, None) => None,
                },
                None => None,
            }
        };

        match route {
            Some(Route::Inbox(inbox)) => Ok(inbox.send(event).is_ok()),
            Some(Route::Child(child)) => {
                let inner = self.inner()?;
                let cid = correlation_id();
                inner.send_event_internal(&child, event, None, &cid).await?;
                Ok(true)
            }
            None => {
                debug!(chart = %owner, activity = activity_id, "no inbound route for activity");
                Ok(false)
            }
        }
    }

    /// Relay an event the owner received to every auto-forwarding activity
    /// of that chart. Runs after the owner's transition completes.
    pub(crate) async fn send_auto_forward(&self, owner: &ChartReference, event: &Event) {
        enum Route {
            Inbox(mpsc::UnboundedSender<Event>),
            Child(ChartReference),
        }

        let routes: Vec<(String, Route)> = {
            let registry = self.registry.lock().await;
            let Some(activities) = registry
                .charts
                .get(&owner.machine_id)
                .and_then(|m| m.get(&owner.chart_id))
            else {
                return;
            };
            activities
                .iter()
                .filter(|(_, handle)| handle.auto_forward)
                .filter_map(|(id, handle)| match (&handle.inbox, &handle.child) {
                    (Some(inbox), _) => Some((id.clone(), Route::Inbox(inbox.clone()))),
                    (None, Some(child)) => Some((id.clone(), Route::Child(child.clone()))),
                    (None, None) => None,
                })
                .collect()
        };

        for (activity_id, route) in routes {
            match route {
                Route::Inbox(inbox) => {
                    let _ = inbox.send(event.clone());
                }
                Route::Child(child) => {
                    let Ok(inner) = self.inner() else { return };
                    let cid = correlation_id();
                    if let Err(error) = Box::pin(inner.send_event_internal(
                        &child,
                        event.clone(),
                        None,
                        &cid,
                    ))
                    .await
                    {
                        warn!(
                            chart = %owner,
                            activity = activity_id,
                            %error,
                            "auto-forward to nested chart failed"
                        );
                    }
                }
            }
        }
    }

    /// Number of running activities for one chart.
    pub(crate) async fn count_for(&self, owner: &ChartReference) -> usize {
        self.registry.lock().await.count_for(owner)
    }
}
