// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared machine definitions for the xjog examples.

use serde_json::{Value, json};

use xjog_core::{Action, ActivitySpawn, Event, Machine, MachineError, State};

/// A small order-fulfilment machine:
///
/// ```text
///    received ──place──▶ picking ──picked──▶ shipped(final)
///                  │
///                  └─ entry: start "reserve-stock" activity,
///                     schedule a "reminder" after one second
/// ```
///
/// The reserve-stock activity resolves with a warehouse slot; its
/// `done.invoke.reserve-stock` event is consumed in `picking` to record the
/// slot in context. The reminder demonstrates a deferred transition that is
/// cancelled when picking completes in time.
pub struct OrderMachine;

/// Cancellation key of the picking reminder.
pub const REMINDER_ID: &str = "picking-reminder";

impl Machine for OrderMachine {
    fn id(&self) -> &str {
        "order"
    }

    fn initial_state(&self) -> Result<State, MachineError> {
        Ok(State::new(
            json!("received"),
            json!({ "slot": null, "reminded": false }),
        ))
    }

    fn transition(&self, state: &State, event: &Event) -> Result<State, MachineError> {
        match (state.value.as_str(), event.kind.as_str()) {
            (Some("received"), "place") => Ok(State::new(json!("picking"), state.context.clone())
                .with_actions(vec![
                    Action::Start {
                        activity_id: "reserve-stock".into(),
                        auto_forward: false,
                    },
                    Action::Send {
                        event: Event::new("reminder"),
                        to: None,
                        delay_ms: 1_000,
                        id: json!(REMINDER_ID),
                    },
                ])),
            (Some("picking"), "done.invoke.reserve-stock") => {
                let mut context = state.context.clone();
                context["slot"] = event.data.clone();
                Ok(State::new(json!("picking"), context))
            }
            (Some("picking"), "reminder") => {
                let mut context = state.context.clone();
                context["reminded"] = json!(true);
                Ok(State::new(json!("picking"), context).with_actions(vec![Action::Log {
                    message: json!("order is still waiting to be picked"),
                }]))
            }
            (Some("picking"), "picked") => Ok(State::new(json!("shipped"), state.context.clone())
                .with_actions(vec![Action::Cancel {
                    id: json!(REMINDER_ID),
                }])
                .with_done(json!({ "shipped": true }))),
            _ => Ok(State::new(state.value.clone(), state.context.clone())),
        }
    }

    fn create_activity(&self, activity_id: &str, _state: &State) -> Option<ActivitySpawn> {
        if activity_id != "reserve-stock" {
            return None;
        }
        Some(ActivitySpawn::Future(Box::pin(async {
            // Stand-in for a warehouse call.
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            Ok::<Value, String>(json!({ "aisle": 7, "bin": "C3" }))
        })))
    }
}
