// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! State-change broadcast values and update hooks.
//!
//! Every committed transition produces one [`StateChange`] that is run
//! through the installed update hooks (journal writer, digest writer, user
//! hooks) in order and then published on the engine-wide broadcast channel.
//! Hooks run while the chart mutex is held: a hook failure aborts the send
//! and nothing is persisted.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use xjog_machine::{ChartReference, ChartSnapshot, Event};

/// Kind of a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ChangeKind {
    /// A chart was created.
    Create,
    /// A chart transitioned.
    Update,
    /// A chart was destroyed.
    Delete,
}

/// One transition as seen by hooks and broadcast subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChange {
    /// What happened.
    pub kind: ChangeKind,
    /// The chart that changed.
    pub reference: ChartReference,
    /// The chart's parent, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ChartReference>,
    /// The event that triggered the change; absent for creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<Event>,
    /// The state before the change; absent for creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<ChartSnapshot>,
    /// The state after the change; absent for deletion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new: Option<ChartSnapshot>,
}

/// An installed update hook.
///
/// Hooks receive each change after the transition is computed and before it
/// is persisted; returning an error fails the send and rolls the in-memory
/// state back.
pub type UpdateHook =
    Arc<dyn Fn(Arc<StateChange>) -> BoxFuture<'static, std::result::Result<(), String>> + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_kind_displays_lowercase() {
        assert_eq!(ChangeKind::Create.to_string(), "create");
        assert_eq!(ChangeKind::Update.to_string(), "update");
        assert_eq!(ChangeKind::Delete.to_string(), "delete");
    }

    #[test]
    fn change_serializes_reference_and_kind() {
        let change = StateChange {
            kind: ChangeKind::Update,
            reference: ChartReference::new("door", "main"),
            parent: None,
            event: Some(Event::new("open")),
            old: None,
            new: None,
        };
        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(json["kind"], "update");
        assert_eq!(json["reference"]["machineId"], "door");
        assert_eq!(json["event"]["type"], "open");
    }
}
