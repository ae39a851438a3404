// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deferred transitions: a delayed send action fires on schedule, exactly
//! one queue row exists during the wait and none after delivery.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{RestlessMachine, TestHarness, count_rows, wait_for};
use serde_json::json;
use xjog_core::{CreateChartOptions, PersistenceStore};

#[tokio::test(flavor = "multi_thread")]
async fn delayed_transition_fires_once() {
    let harness = TestHarness::new();
    let (engine, store) = harness.engine(&[Arc::new(RestlessMachine) as _]).await;
    engine.start().await.expect("start");

    let reference = engine
        .create_chart("restless", CreateChartOptions::default())
        .await
        .expect("create chart");

    let working = engine
        .send_event(&reference, "getRestless")
        .await
        .expect("send")
        .expect("state");
    assert!(working.matches("working"));
    assert_eq!(working.context, json!({ "goodWeather": true }));

    // Exactly one deferred row while the timer is pending.
    assert_eq!(count_rows(&store, "deferredEvents").await, 1);

    tokio::time::sleep(Duration::from_millis(150)).await;

    let state = engine
        .get_chart(&reference)
        .await
        .expect("get chart")
        .expect("state");
    assert!(state.matches("home"));
    assert_eq!(state.context, json!({ "goodWeather": false }));

    // The row is deleted after delivery.
    assert_eq!(count_rows(&store, "deferredEvents").await, 0);

    engine.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_releases_deferred_leases() {
    let harness = TestHarness::new();
    let store = harness.store().await;
    // A wide lookahead reserves far-future rows without arming imminent
    // timers, keeping the lease observable for the whole test.
    let mut options = common::fast_options();
    options.deferred_events.look_ahead = Duration::from_secs(30);
    let engine = xjog_core::Engine::builder()
        .store(store.clone())
        .options(options)
        .build()
        .expect("engine build");
    engine
        .register_machine(Arc::new(RestlessMachine))
        .expect("register");
    engine.start().await.expect("start");

    let reference = engine
        .create_chart("restless", CreateChartOptions::default())
        .await
        .expect("create chart");

    // Queue a far-future event directly through the store; the scheduler
    // reserves it on its next pass but the timer will not fire in-test.
    let row = store
        .insert_deferred_event(&xjog_core::persistence::NewDeferredEvent {
            reference: reference.clone(),
            event: xjog_core::Event::new("much-later"),
            event_id: json!("much-later"),
            event_to: None,
            delay_ms: 20_000,
        })
        .await
        .unwrap();

    // Wait for the scheduler to reserve it under this instance's lease.
    wait_for(Duration::from_secs(5), "row reserved", || {
        let store = store.clone();
        async move {
            let locked: (i64,) = sqlx::query_as(
                r#"SELECT COUNT(*) FROM "deferredEvents" WHERE "lock" IS NOT NULL"#,
            )
            .fetch_one(store.pool())
            .await
            .unwrap();
            locked.0 == 1
        }
    })
    .await;

    engine.shutdown().await.expect("shutdown");

    // The lease is released so another instance can claim the row.
    let unlocked: (i64,) = sqlx::query_as(
        r#"SELECT COUNT(*) FROM "deferredEvents" WHERE "id" = ?1 AND "lock" IS NULL"#,
    )
    .bind(row.id)
    .fetch_one(store.pool())
    .await
    .unwrap();
    assert_eq!(unlocked.0, 1);
}
