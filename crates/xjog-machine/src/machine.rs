// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The evaluator interface.
//!
//! The engine treats the statechart evaluator as a pure library: given the
//! previous [`State`] and an [`Event`], a [`Machine`] produces the next
//! state. Everything effectful lives in the actions attached to the
//! produced state and in the [`ActivitySpawn`] descriptors the machine
//! hands back when an activity starts.

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::event::Event;
use crate::ident::ChartReference;
use crate::state::State;

/// Error raised by a machine definition.
///
/// Transition failures are not fatal to the engine: a failed transition is
/// logged and the triggering send resolves to no state change.
#[derive(Debug, Clone, thiserror::Error)]
#[error("machine error: {0}")]
pub struct MachineError(pub String);

impl MachineError {
    /// Convenience constructor.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// A statechart definition as consumed by the engine.
///
/// Implementations must be pure in `initial_state` and `transition`: all
/// side effects go through the returned actions and activity spawns.
pub trait Machine: Send + Sync + 'static {
    /// Identifier of this machine definition.
    fn id(&self) -> &str;

    /// The initial composed state, including its entry actions.
    fn initial_state(&self) -> Result<State, MachineError>;

    /// Compute the next state from the previous state and an event.
    ///
    /// Machines that do not react to `event` should return the previous
    /// state unchanged (with no actions) rather than an error.
    fn transition(&self, state: &State, event: &Event) -> Result<State, MachineError>;

    /// Construct the side effect behind a `Start` action.
    ///
    /// Returns `None` when the activity id is unknown or no longer present
    /// in the given state; the engine logs a warning and moves on.
    fn create_activity(&self, activity_id: &str, state: &State) -> Option<ActivitySpawn> {
        let _ = (activity_id, state);
        None
    }

    /// Execute a named `Custom` action.
    ///
    /// Failures are swallowed as warnings by the engine; they never abort
    /// the transition that carried the action.
    fn exec_action(&self, name: &str, context: &Value, event: &Event) -> Result<(), MachineError> {
        let _ = (name, context, event);
        Err(MachineError::new(format!("unknown action '{name}'")))
    }
}

/// Handles given to a callback activity.
///
/// The callback emits events to its owning chart through `emit` and
/// receives events sent to it (via `send`-to-activity routing) on `inbox`.
pub struct ActivityJob {
    /// The chart that owns this activity.
    pub owner: ChartReference,
    /// Activity id within the owning chart.
    pub activity_id: String,
    /// Emit an event to the owning chart.
    pub emit: mpsc::UnboundedSender<Event>,
    /// Inbound events routed to this activity.
    pub inbox: mpsc::UnboundedReceiver<Event>,
}

/// Descriptor of a side effect to run for an invoked activity.
pub enum ActivitySpawn {
    /// Promise-like: resolves once with done-data, or rejects with an error
    /// message.
    Future(BoxFuture<'static, Result<Value, String>>),
    /// Callback: a function driven with send/receive handles; its returned
    /// future is the activity's lifetime.
    Callback(Box<dyn FnOnce(ActivityJob) -> BoxFuture<'static, Result<(), String>> + Send>),
    /// Observable: every yielded event is forwarded to the owning chart;
    /// stream end means completion.
    Stream(BoxStream<'static, Event>),
    /// Nested chart running in-process, parented to the owning chart.
    Chart {
        /// Machine definition of the child.
        machine_id: String,
        /// Fixed chart id for the child; generated when absent.
        chart_id: Option<String>,
        /// Forward child state updates to the owner as `xjog.update` events.
        sync: bool,
    },
}

impl std::fmt::Debug for ActivitySpawn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActivitySpawn::Future(_) => f.write_str("ActivitySpawn::Future"),
            ActivitySpawn::Callback(_) => f.write_str("ActivitySpawn::Callback"),
            ActivitySpawn::Stream(_) => f.write_str("ActivitySpawn::Stream"),
            ActivitySpawn::Chart {
                machine_id,
                chart_id,
                sync,
            } => f
                .debug_struct("ActivitySpawn::Chart")
                .field("machine_id", machine_id)
                .field("chart_id", chart_id)
                .field("sync", sync)
                .finish(),
        }
    }
}
