// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The chart executor.
//!
//! One executor per live chart. A timed mutex serializes every mutating
//! operation on the chart; acquisition timeout is treated as a stuck chart
//! (typically an infinite event loop) and shuts the engine down.
//!
//! The send pipeline: short-circuit to the deferred queue when stopping or
//! dying, acquire the mutex, apply the context patch, run the evaluator,
//! refresh the cache position, run update hooks, persist the snapshot,
//! publish the change, dispatch the new state's actions, notify the parent
//! on final states, release the mutex, then auto-forward. The in-memory
//! state is only replaced after hooks and persistence succeed, so a hook
//! failure leaves both memory and database on the old state.
//!
//! Auto-forwarded events run after the mutex is released: a child's
//! reaction can reach observers before the parent's own broadcast does.

use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tracing::{debug, error, info, warn};

use xjog_machine::{Action, ChartReference, Event, Machine, State};

use crate::change::{ChangeKind, StateChange};
use crate::engine::EngineInner;
use crate::error::{ChartError, Result};
use crate::persistence::{NewChart, NewDeferredEvent, PersistenceStore};
use crate::util::TimedMutex;

/// A context patch applied before the evaluator runs.
#[derive(Clone)]
pub enum ContextPatch {
    /// Shallow-merge the object's keys into the context.
    Merge(Value),
    /// Replace the context with the function of its deep copy.
    Apply(Arc<dyn Fn(Value) -> Value + Send + Sync>),
}

impl ContextPatch {
    fn apply(&self, context: Value) -> Value {
        match self {
            ContextPatch::Merge(patch) => match (context, patch) {
                (Value::Object(mut base), Value::Object(overlay)) => {
                    for (key, value) in overlay {
                        base.insert(key.clone(), value.clone());
                    }
                    Value::Object(base)
                }
                (_, patch) => patch.clone(),
            },
            ContextPatch::Apply(f) => f(context),
        }
    }
}

impl std::fmt::Debug for ContextPatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContextPatch::Merge(patch) => f.debug_tuple("Merge").field(patch).finish(),
            ContextPatch::Apply(_) => f.write_str("Apply(..)"),
        }
    }
}

/// Executes and persists transitions for one chart.
pub struct ChartExecutor {
    engine: Weak<EngineInner>,
    reference: ChartReference,
    parent: Option<ChartReference>,
    machine: Arc<dyn Machine>,
    mutex: TimedMutex<State>,
    stopping: AtomicBool,
}

impl ChartExecutor {
    /// Create a brand-new chart: initial state, create-change through the
    /// hooks, chart row, initial actions.
    pub(crate) async fn create(
        inner: &EngineInner,
        machine: Arc<dyn Machine>,
        reference: ChartReference,
        parent: Option<ChartReference>,
        cid: &str,
    ) -> Result<Arc<Self>> {
        let initial = machine
            .initial_state()
            .map_err(|e| ChartError::TransitionFailed {
                reference: reference.clone(),
                reason: e.to_string(),
            })?;

        let executor = Arc::new(Self {
            engine: inner.self_weak(),
            reference: reference.clone(),
            parent: parent.clone(),
            machine,
            mutex: TimedMutex::new(initial.clone(), inner.options.chart_mutex_timeout),
            stopping: AtomicBool::new(false),
        });

        let change = Arc::new(StateChange {
            kind: ChangeKind::Create,
            reference: reference.clone(),
            parent: parent.clone(),
            event: None,
            old: None,
            new: Some(initial.snapshot()),
        });
        inner.run_hooks(&change).await?;

        let state_bytes = initial.to_bytes()?;
        inner
            .store
            .insert_chart(&NewChart {
                reference: &reference,
                parent: parent.as_ref(),
                owner_id: &inner.instance_id,
                state: &state_bytes,
            })
            .await?;

        inner.publish_change(&change);
        info!(cid, chart = %reference, "chart created");

        executor.dispatch_actions(inner, &initial, None, false, cid).await;
        Ok(executor)
    }

    /// Rebuild an executor around a persisted snapshot.
    pub(crate) fn rehydrate(
        inner: &EngineInner,
        machine: Arc<dyn Machine>,
        reference: ChartReference,
        parent: Option<ChartReference>,
        state_bytes: &[u8],
    ) -> Result<Arc<Self>> {
        let state = State::from_bytes(state_bytes)?;
        Ok(Arc::new(Self {
            engine: inner.self_weak(),
            reference,
            parent,
            machine,
            mutex: TimedMutex::new(state, inner.options.chart_mutex_timeout),
            stopping: AtomicBool::new(false),
        }))
    }

    /// The chart this executor runs.
    pub fn reference(&self) -> &ChartReference {
        &self.reference
    }

    /// The chart's parent, if invoked as a child.
    pub fn parent(&self) -> Option<&ChartReference> {
        self.parent.as_ref()
    }

    /// A copy of the current state.
    pub async fn current_state(&self) -> Result<State> {
        let guard = self.mutex.lock(&self.reference.uri()).await?;
        Ok(guard.clone())
    }

    /// Wait until no transition is in flight. Used by cache eviction.
    pub(crate) async fn wait_idle(&self) {
        let _ = self.mutex.lock_unbounded().await;
    }

    /// Deliver one event to this chart.
    ///
    /// Returns the new state, or `None` when the event was parked on the
    /// deferred queue (engine dying, chart stopping) or the evaluator
    /// declined the transition.
    pub(crate) async fn send(
        &self,
        event: Event,
        context_patch: Option<ContextPatch>,
        cid: &str,
    ) -> Result<Option<State>> {
        let inner = self
            .engine
            .upgrade()
            .ok_or_else(|| ChartError::storage("send", "engine dropped"))?;

        if self.stopping.load(Ordering::SeqCst) || inner.is_dying() {
            debug!(cid, chart = %self.reference, event = %event.kind, "parked on deferred queue");
            inner.defer_event(self.reference.clone(), event, 0).await?;
            return Ok(None);
        }

        let mut guard = match self.mutex.lock(&self.reference.uri()).await {
            Ok(guard) => guard,
            Err(err) => {
                error!(
                    cid,
                    chart = %self.reference,
                    "chart mutex stuck, shutting the engine down"
                );
                inner.initiate_shutdown();
                return Err(err);
            }
        };

        let old_state = guard.clone();
        let mut working = guard.clone();
        if let Some(patch) = &context_patch {
            working.context = patch.apply(working.context);
        }

        let next = match self.machine.transition(&working, &event) {
            Ok(next) => next,
            Err(e) => {
                warn!(
                    cid,
                    chart = %self.reference,
                    event = %event.kind,
                    error = %e,
                    "transition failed"
                );
                return Ok(None);
            }
        };

        inner.registry.touch(&self.reference).await;

        let change = Arc::new(StateChange {
            kind: ChangeKind::Update,
            reference: self.reference.clone(),
            parent: self.parent.clone(),
            event: Some(event.clone()),
            old: Some(old_state.snapshot()),
            new: Some(next.snapshot()),
        });

        // Hooks and persistence run before the in-memory state advances,
        // so a failure leaves no trace of the transition.
        inner.run_hooks(&change).await?;

        let state_bytes = next.to_bytes()?;
        inner
            .store
            .update_chart_state(&self.reference, &state_bytes)
            .await?;
        *guard = next.clone();

        inner.publish_change(&change);
        debug!(cid, chart = %self.reference, event = %event.kind, "transition committed");

        self.dispatch_actions(&inner, &next, Some(&event), false, cid).await;

        if let (Some(done), Some(parent)) = (&next.done, &self.parent) {
            let done_event = Event::done_invoke(&self.reference.chart_id, done.clone());
            let key = Value::String(done_event.kind.clone());
            if let Err(error) = inner
                .deferred
                .defer(NewDeferredEvent {
                    reference: parent.clone(),
                    event: done_event,
                    event_id: key,
                    event_to: None,
                    delay_ms: 0,
                })
                .await
            {
                warn!(cid, chart = %self.reference, %error, "done event to parent lost");
            }
        }

        drop(guard);

        inner.activities.send_auto_forward(&self.reference, &event).await;

        Ok(Some(next))
    }

    /// Re-run the current state's actions after adoption; restarts
    /// activities, skips one-shot init side effects.
    pub(crate) async fn run_step(&self, cid: &str) -> Result<()> {
        let inner = self
            .engine
            .upgrade()
            .ok_or_else(|| ChartError::storage("run_step", "engine dropped"))?;
        let state = {
            let guard = self.mutex.lock(&self.reference.uri()).await?;
            guard.clone()
        };
        debug!(cid, chart = %self.reference, "running step after adoption");
        self.dispatch_actions(&inner, &state, None, true, cid).await;
        Ok(())
    }

    /// Destroy the chart: delete-change through the hooks, cascade the
    /// rows away, stop activities and drop timers.
    pub(crate) async fn destroy(&self, cid: &str) -> Result<()> {
        let inner = self
            .engine
            .upgrade()
            .ok_or_else(|| ChartError::storage("destroy", "engine dropped"))?;

        self.stopping.store(true, Ordering::SeqCst);
        let guard = match self.mutex.lock(&self.reference.uri()).await {
            Ok(guard) => guard,
            Err(err) => {
                error!(cid, chart = %self.reference, "chart mutex stuck during destroy");
                inner.initiate_shutdown();
                return Err(err);
            }
        };

        let change = Arc::new(StateChange {
            kind: ChangeKind::Delete,
            reference: self.reference.clone(),
            parent: self.parent.clone(),
            event: None,
            old: Some(guard.snapshot()),
            new: None,
        });
        inner.run_hooks(&change).await?;

        inner.store.destroy_chart(&self.reference).await?;
        inner.publish_change(&change);
        drop(guard);

        inner.activities.stop_all_for_chart(&self.reference).await?;
        inner.deferred.cancel_all_for_chart(&self.reference).await?;

        info!(cid, chart = %self.reference, "chart destroyed");
        Ok(())
    }

    /// Execute the actions attached to a state. `replay` marks a re-run
    /// after adoption: init markers are skipped so initial side effects do
    /// not fire twice.
    async fn dispatch_actions(
        &self,
        inner: &EngineInner,
        state: &State,
        event: Option<&Event>,
        replay: bool,
        cid: &str,
    ) {
        let trigger = event.cloned().unwrap_or_else(|| Event::new("xjog.init"));

        for action in &state.actions {
            match action {
                Action::Send {
                    event: outgoing,
                    to,
                    delay_ms,
                    id,
                } => {
                    if let Err(error) = inner
                        .deferred
                        .defer(NewDeferredEvent {
                            reference: self.reference.clone(),
                            event: outgoing.clone(),
                            event_id: id.clone(),
                            event_to: to.clone(),
                            delay_ms: *delay_ms,
                        })
                        .await
                    {
                        warn!(cid, chart = %self.reference, %error, "send action failed");
                    }
                }
                Action::Cancel { id } => {
                    if let Err(error) = inner.deferred.cancel(&self.reference, id).await {
                        warn!(cid, chart = %self.reference, %error, "cancel action failed");
                    }
                }
                Action::Start {
                    activity_id,
                    auto_forward,
                } => match self.machine.create_activity(activity_id, state) {
                    Some(spawn) => {
                        if let Err(error) = Box::pin(inner.activities.register(
                            &self.reference,
                            activity_id,
                            spawn,
                            *auto_forward,
                            cid,
                        ))
                        .await
                        {
                            warn!(
                                cid,
                                chart = %self.reference,
                                activity = %activity_id,
                                %error,
                                "start action failed"
                            );
                        }
                    }
                    None => {
                        warn!(
                            cid,
                            chart = %self.reference,
                            activity = %activity_id,
                            "machine produced no activity for start action"
                        );
                    }
                },
                Action::Stop { activity_id } => {
                    if let Err(error) = inner.activities.stop(&self.reference, activity_id).await {
                        warn!(
                            cid,
                            chart = %self.reference,
                            activity = %activity_id,
                            %error,
                            "stop action failed"
                        );
                    }
                }
                Action::Log { message } => {
                    info!(cid, chart = %self.reference, log = %message, "log action");
                }
                Action::Init => {
                    if replay {
                        debug!(cid, chart = %self.reference, "init action skipped on replay");
                    }
                }
                Action::Custom { name } => {
                    if let Err(error) = self.machine.exec_action(name, &state.context, &trigger) {
                        warn!(
                            cid,
                            chart = %self.reference,
                            action = %name,
                            %error,
                            "custom action failed"
                        );
                    }
                }
            }
        }
    }
}
