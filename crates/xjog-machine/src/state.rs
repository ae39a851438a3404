// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! State snapshots.
//!
//! A [`State`] is the full composed snapshot the evaluator produces for a
//! chart: the state value (a string or a nested object for hierarchical
//! machines), the extended context, the actions to execute on entry, and
//! the done-data once a final state is reached. The whole snapshot
//! round-trips through JSON so a chart can be persisted and rehydrated on
//! another engine instance; re-running the recorded actions is what brings
//! activities back to life after adoption.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::action::Action;

/// The full composed snapshot of one chart as produced by the evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    /// The state value: a plain string for flat machines, a nested object
    /// for hierarchical ones.
    pub value: Value,
    /// The extended context.
    pub context: Value,
    /// Actions attached to this state, executed by the engine after the
    /// transition that produced it (and re-executed on rehydration).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<Action>,
    /// Done-data when this is a final state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done: Option<Value>,
}

impl State {
    /// Create a snapshot with no actions and no done-data.
    pub fn new(value: Value, context: Value) -> Self {
        Self {
            value,
            context,
            actions: Vec::new(),
            done: None,
        }
    }

    /// Attach actions to this snapshot.
    pub fn with_actions(mut self, actions: Vec<Action>) -> Self {
        self.actions = actions;
        self
    }

    /// Mark this snapshot as final, carrying `done_data` to the parent.
    pub fn with_done(mut self, done_data: Value) -> Self {
        self.done = Some(done_data);
        self
    }

    /// Whether this snapshot is a final state.
    pub fn is_final(&self) -> bool {
        self.done.is_some()
    }

    /// Match the state value against a dotted path pattern.
    ///
    /// `"a.b"` matches both the string value `"a.b"` and the nested object
    /// value `{"a": "b"}` (or `{"a": {"b": ...}}`).
    pub fn matches(&self, pattern: &str) -> bool {
        if self.value.as_str() == Some(pattern) {
            return true;
        }
        let mut cursor = &self.value;
        let mut segments = pattern.split('.').peekable();
        while let Some(segment) = segments.next() {
            match cursor {
                Value::String(s) => {
                    // A leaf string must match the remaining single segment.
                    return s == segment && segments.peek().is_none();
                }
                Value::Object(map) => match map.get(segment) {
                    Some(inner) => {
                        if segments.peek().is_none() {
                            return true;
                        }
                        cursor = inner;
                    }
                    None => return false,
                },
                _ => return false,
            }
        }
        false
    }

    /// Serialize the snapshot for the persistent `state` column.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize a snapshot from the persistent `state` column.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// A broadcast-friendly view of this snapshot.
    pub fn snapshot(&self) -> ChartSnapshot {
        ChartSnapshot {
            value: self.value.clone(),
            context: self.context.clone(),
            actions: self.actions.iter().map(|a| a.label().to_string()).collect(),
        }
    }
}

/// The value/context/action view of one side of a state change, as carried
/// on the engine's broadcast stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartSnapshot {
    /// State value at this point.
    pub value: Value,
    /// Context at this point.
    pub context: Value,
    /// Labels of the actions attached to the state.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;

    #[test]
    fn snapshot_round_trips_through_bytes() {
        let state = State::new(
            serde_json::json!({ "working": "hard" }),
            serde_json::json!({ "count": 3 }),
        )
        .with_actions(vec![Action::Send {
            event: Event::new("tick"),
            to: None,
            delay_ms: 500,
            id: serde_json::json!("tick-timer"),
        }]);

        let bytes = state.to_bytes().unwrap();
        let back = State::from_bytes(&bytes).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn matches_flat_string_value() {
        let state = State::new(serde_json::json!("open"), Value::Null);
        assert!(state.matches("open"));
        assert!(!state.matches("closed"));
    }

    #[test]
    fn matches_nested_value() {
        let state = State::new(serde_json::json!({ "door": { "open": "wide" } }), Value::Null);
        assert!(state.matches("door"));
        assert!(state.matches("door.open"));
        assert!(state.matches("door.open.wide"));
        assert!(!state.matches("door.closed"));
        assert!(!state.matches("door.open.wide.very"));
    }

    #[test]
    fn final_state_carries_done_data() {
        let state =
            State::new(serde_json::json!("finished"), Value::Null).with_done(serde_json::json!(7));
        assert!(state.is_final());
        assert_eq!(state.done, Some(serde_json::json!(7)));
    }
}
