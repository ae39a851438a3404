// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Actions and send routing.
//!
//! Actions are pure data: the evaluator attaches them to a state and the
//! engine executes them after the transition commits. Keeping them data-only
//! is what lets a persisted snapshot be rehydrated on another instance and
//! its entry actions re-run (restarting activities) without the evaluator
//! being present at decode time. Behaviourful actions (`Custom`) are
//! resolved by name against the machine definition at dispatch time.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::Event;
use crate::ident::ChartReference;

/// Routing target of a sent event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "target", rename_all = "camelCase")]
pub enum SendTarget {
    /// Another chart, by reference.
    Chart(ChartReference),
    /// A running activity of the sending chart.
    Activity {
        /// Activity id within the sending chart.
        #[serde(rename = "activityId")]
        activity_id: String,
    },
    /// The sending chart's parent.
    Parent,
}

/// One action attached to a state by the evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Action {
    /// Enqueue `event` for delivery after `delay_ms` milliseconds, to `to`
    /// (or back to the sending chart when absent). `id` is the cancellation
    /// key; it is an opaque JSON value preserving round-trip equality.
    Send {
        /// The event to deliver.
        event: Event,
        /// Routing target; the sending chart itself when `None`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<SendTarget>,
        /// Delivery delay in milliseconds.
        #[serde(rename = "delayMs", default)]
        delay_ms: i64,
        /// Cancellation key.
        id: Value,
    },
    /// Cancel a previously scheduled send with the matching key.
    Cancel {
        /// Cancellation key of the send to revoke.
        id: Value,
    },
    /// Start (invoke) an activity.
    Start {
        /// Activity id, resolved through the machine's activity creator.
        #[serde(rename = "activityId")]
        activity_id: String,
        /// Relay every event the owning chart receives to this activity.
        #[serde(rename = "autoForward", default)]
        auto_forward: bool,
    },
    /// Stop a running activity.
    Stop {
        /// Activity id to stop.
        #[serde(rename = "activityId")]
        activity_id: String,
    },
    /// Emit a log record.
    Log {
        /// Message payload.
        message: Value,
    },
    /// Marker action on the initial state; skipped when rehydrating so
    /// initial side effects do not re-run after adoption.
    Init,
    /// Named action resolved against the machine definition.
    Custom {
        /// Action name.
        name: String,
    },
}

impl Action {
    /// Short label for broadcast views and log records.
    pub fn label(&self) -> &str {
        match self {
            Action::Send { .. } => "send",
            Action::Cancel { .. } => "cancel",
            Action::Start { .. } => "start",
            Action::Stop { .. } => "stop",
            Action::Log { .. } => "log",
            Action::Init => "init",
            Action::Custom { name } => name,
        }
    }
}
