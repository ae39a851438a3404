// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Event values.
//!
//! Events are opaque to the engine apart from their `type` string: the
//! evaluator decides what they mean. A handful of well-known type prefixes
//! carry engine semantics (`done.invoke.*` for completed activities,
//! `error.platform.*` for failed ones, `xjog.update` for synchronized child
//! charts) and have constructors here so every producer spells them the
//! same way.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event type prefix for successful activity / child-chart completion.
pub const DONE_INVOKE_PREFIX: &str = "done.invoke.";

/// Event type prefix for activity failures.
pub const ERROR_PLATFORM_PREFIX: &str = "error.platform.";

/// Event type for synchronized child-chart state updates.
pub const CHILD_UPDATE_TYPE: &str = "xjog.update";

/// A named, JSON-serialisable value consumed by the evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// The event type tag.
    #[serde(rename = "type")]
    pub kind: String,
    /// Opaque payload; `null` when the event carries no data.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl Event {
    /// Create an event with no payload.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            data: Value::Null,
        }
    }

    /// Create an event carrying a payload.
    pub fn with_data(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }

    /// Completion event for an invoked activity or child chart.
    pub fn done_invoke(id: &str, done_data: Value) -> Self {
        Self {
            kind: format!("{DONE_INVOKE_PREFIX}{id}"),
            data: done_data,
        }
    }

    /// Failure event for an invoked activity.
    pub fn error_platform(id: &str, message: impl Into<String>) -> Self {
        Self {
            kind: format!("{ERROR_PLATFORM_PREFIX}{id}"),
            data: serde_json::json!({ "message": message.into() }),
        }
    }

    /// Synchronized state update from a child chart.
    pub fn child_update(value: Value, context: Value) -> Self {
        Self {
            kind: CHILD_UPDATE_TYPE.to_string(),
            data: serde_json::json!({ "value": value, "context": context }),
        }
    }

    /// Whether this is a `done.invoke.*` completion event.
    pub fn is_done_invoke(&self) -> bool {
        self.kind.starts_with(DONE_INVOKE_PREFIX)
    }
}

impl From<&str> for Event {
    fn from(kind: &str) -> Self {
        Self::new(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_type_tag() {
        let event = Event::with_data("open", serde_json::json!({ "who": "rx" }));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "open");
        assert_eq!(json["who"], Value::Null);
        assert_eq!(json["data"]["who"], "rx");
    }

    #[test]
    fn null_data_is_omitted_and_restored() {
        let event = Event::new("close");
        let text = serde_json::to_string(&event).unwrap();
        assert_eq!(text, r#"{"type":"close"}"#);
        let back: Event = serde_json::from_str(&text).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn done_invoke_constructor() {
        let event = Event::done_invoke("fetch", serde_json::json!(3));
        assert_eq!(event.kind, "done.invoke.fetch");
        assert!(event.is_done_invoke());
    }
}
