// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for xjog-core integration tests.
//!
//! Provides a file-backed SQLite harness (so several engine instances can
//! share one database) and a handful of hand-written test machines.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use xjog_core::persistence::SqliteStore;
use xjog_core::{
    Action, ActivitySpawn, Engine, EngineOptions, Event, Machine, MachineError, State,
};

/// Shared database harness; every store opened from it sees one database.
pub struct TestHarness {
    _dir: tempfile::TempDir,
    pub db_path: PathBuf,
}

impl TestHarness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("xjog-test.db");
        Self {
            _dir: dir,
            db_path,
        }
    }

    /// Open a store (own pool) on the shared database file.
    pub async fn store(&self) -> Arc<SqliteStore> {
        Arc::new(
            SqliteStore::from_path(&self.db_path)
                .await
                .expect("sqlite store"),
        )
    }

    /// Build an engine over a fresh store with fast test options.
    pub async fn engine(&self, machines: &[Arc<dyn Machine>]) -> (Engine, Arc<SqliteStore>) {
        let store = self.store().await;
        let engine = Engine::builder()
            .store(store.clone())
            .options(fast_options())
            .build()
            .expect("engine build");
        for machine in machines {
            engine.register_machine(machine.clone()).expect("register");
        }
        (engine, store)
    }
}

/// Options scaled down for tests: short adoption passes, a grace period of
/// a few passes, tight scheduler interval.
pub fn fast_options() -> EngineOptions {
    let mut options = EngineOptions::default();
    options.startup.adoption_frequency = Duration::from_millis(50);
    options.startup.grace_period = Duration::from_millis(200);
    options.deferred_events.interval = Duration::from_millis(200);
    options.deferred_events.look_ahead = Duration::from_millis(500);
    options.shutdown.own_chart_polling_frequency = Duration::from_millis(50);
    options
}

/// Count rows in a table of the shared database.
pub async fn count_rows(store: &SqliteStore, table: &str) -> i64 {
    let count: (i64,) = sqlx::query_as(&format!(r#"SELECT COUNT(*) FROM "{table}""#))
        .fetch_one(store.pool())
        .await
        .expect("count query");
    count.0
}

/// A door that opens and closes.
pub struct DoorMachine;

impl Machine for DoorMachine {
    fn id(&self) -> &str {
        "door"
    }

    fn initial_state(&self) -> Result<State, MachineError> {
        Ok(State::new(json!("closed"), json!({})))
    }

    fn transition(&self, state: &State, event: &Event) -> Result<State, MachineError> {
        let next = match (state.value.as_str(), event.kind.as_str()) {
            (Some("closed"), "open") => json!("open"),
            (Some("open"), "close") => json!("closed"),
            _ => state.value.clone(),
        };
        Ok(State::new(next, state.context.clone()))
    }
}

/// Wanders between home, the park and the diner.
pub struct WalkingMachine;

impl Machine for WalkingMachine {
    fn id(&self) -> &str {
        "walkingAround"
    }

    fn initial_state(&self) -> Result<State, MachineError> {
        Ok(State::new(json!("at home"), json!({})))
    }

    fn transition(&self, state: &State, event: &Event) -> Result<State, MachineError> {
        let next = match event.kind.as_str() {
            "go to park" => json!("at the park"),
            "go to diner" => json!("at the diner"),
            "go home" => json!("at home"),
            _ => state.value.clone(),
        };
        Ok(State::new(next, state.context.clone()))
    }
}

/// Gets restless, works for 85 ms, then heads home disillusioned about the
/// weather.
pub struct RestlessMachine;

impl Machine for RestlessMachine {
    fn id(&self) -> &str {
        "restless"
    }

    fn initial_state(&self) -> Result<State, MachineError> {
        Ok(State::new(json!("idle"), json!({ "goodWeather": true })))
    }

    fn transition(&self, state: &State, event: &Event) -> Result<State, MachineError> {
        match (state.value.as_str(), event.kind.as_str()) {
            (Some("idle"), "getRestless") => Ok(State::new(
                json!("working"),
                state.context.clone(),
            )
            .with_actions(vec![Action::Send {
                event: Event::new("timeout"),
                to: None,
                delay_ms: 85,
                id: json!("after-85"),
            }])),
            (Some("working"), "timeout") => Ok(State::new(
                json!("home"),
                json!({ "goodWeather": false }),
            )),
            _ => Ok(State::new(state.value.clone(), state.context.clone())),
        }
    }
}

/// Invokes an activity that never resolves; used to exercise forcible
/// adoption.
pub struct StubbornMachine;

impl Machine for StubbornMachine {
    fn id(&self) -> &str {
        "stubborn"
    }

    fn initial_state(&self) -> Result<State, MachineError> {
        Ok(State::new(json!("idle"), json!({})))
    }

    fn transition(&self, state: &State, event: &Event) -> Result<State, MachineError> {
        match (state.value.as_str(), event.kind.as_str()) {
            (Some("idle"), "begin") => Ok(State::new(json!("working"), state.context.clone())
                .with_actions(vec![Action::Start {
                    activity_id: "eternal".into(),
                    auto_forward: false,
                }])),
            _ => Ok(State::new(state.value.clone(), state.context.clone())),
        }
    }

    fn create_activity(&self, activity_id: &str, _state: &State) -> Option<ActivitySpawn> {
        if activity_id != "eternal" {
            return None;
        }
        Some(ActivitySpawn::Future(Box::pin(futures::future::pending::<
            Result<Value, String>,
        >())))
    }
}

/// Invokes a future activity that resolves immediately with a payload.
pub struct FetcherMachine;

impl Machine for FetcherMachine {
    fn id(&self) -> &str {
        "fetcher"
    }

    fn initial_state(&self) -> Result<State, MachineError> {
        Ok(State::new(json!("idle"), json!({ "result": null })))
    }

    fn transition(&self, state: &State, event: &Event) -> Result<State, MachineError> {
        match (state.value.as_str(), event.kind.as_str()) {
            (Some("idle"), "fetch") => Ok(State::new(json!("loading"), state.context.clone())
                .with_actions(vec![Action::Start {
                    activity_id: "lookup".into(),
                    auto_forward: false,
                }])),
            (Some("loading"), "done.invoke.lookup") => Ok(State::new(
                json!("loaded"),
                json!({ "result": event.data }),
            )),
            _ => Ok(State::new(state.value.clone(), state.context.clone())),
        }
    }

    fn create_activity(&self, activity_id: &str, _state: &State) -> Option<ActivitySpawn> {
        if activity_id != "lookup" {
            return None;
        }
        Some(ActivitySpawn::Future(Box::pin(async {
            Ok(json!({ "answer": 42 }))
        })))
    }
}

/// Wait until `predicate` returns true, or panic after `timeout`.
pub async fn wait_for<F, Fut>(timeout: Duration, what: &str, mut predicate: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
