// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Activity completion: a future activity resolves, its done event flows
//! back through the deferred queue, and the registry cleans itself up.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{FetcherMachine, TestHarness, count_rows, wait_for};
use serde_json::json;
use xjog_core::{CreateChartOptions, DigestFilter, PersistenceStore, StateChange};

#[tokio::test(flavor = "multi_thread")]
async fn future_activity_resolves_into_a_done_event() {
    let harness = TestHarness::new();
    let (engine, store) = harness.engine(&[Arc::new(FetcherMachine) as _]).await;
    engine.start().await.expect("start");

    let reference = engine
        .create_chart("fetcher", CreateChartOptions::default())
        .await
        .expect("create chart");

    let loading = engine
        .send_event(&reference, "fetch")
        .await
        .expect("send fetch")
        .expect("state");
    assert!(loading.matches("loading"));

    // The future resolves immediately; its done.invoke event arrives
    // through the deferred queue and completes the transition.
    wait_for(Duration::from_secs(5), "activity result", || {
        let engine = engine.clone();
        let reference = reference.clone();
        async move {
            engine
                .get_chart(&reference)
                .await
                .unwrap()
                .map(|state| state.matches("loaded"))
                .unwrap_or(false)
        }
    })
    .await;

    let state = engine.get_chart(&reference).await.unwrap().unwrap();
    assert_eq!(state.context, json!({ "result": { "answer": 42 } }));

    // The finished activity unregistered itself, in memory and in the
    // database.
    assert_eq!(engine.ongoing_activity_count(&reference).await, 0);
    assert_eq!(store.count_activities(&reference).await.unwrap(), 0);
    assert_eq!(count_rows(&store, "ongoingActivities").await, 0);

    engine.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread")]
async fn digest_mappers_track_chart_state() {
    let harness = TestHarness::new();
    let (engine, _store) = harness.engine(&[Arc::new(common::DoorMachine) as _]).await;

    engine.register_digest_mapper(
        "door",
        Arc::new(|change: &StateChange| {
            let Some(new) = &change.new else {
                return Vec::new();
            };
            vec![(
                "position".to_string(),
                new.value.as_str().unwrap_or("unknown").to_string(),
            )]
        }),
    );

    engine.start().await.expect("start");

    let reference = engine
        .create_chart("door", CreateChartOptions::default())
        .await
        .unwrap();
    engine.send_event(&reference, "open").await.unwrap();

    let open_doors = engine
        .query_digests(
            Some("door"),
            Some(&DigestFilter::Eq {
                key: "position".into(),
                value: "open".into(),
            }),
        )
        .await
        .unwrap();
    assert_eq!(open_doors.len(), 1);
    assert_eq!(open_doors[0].reference, reference);

    engine.send_event(&reference, "close").await.unwrap();
    let open_doors = engine
        .query_digests(
            Some("door"),
            Some(&DigestFilter::Eq {
                key: "position".into(),
                value: "open".into(),
            }),
        )
        .await
        .unwrap();
    assert!(open_doors.is_empty());

    engine.shutdown().await.expect("shutdown");
}
