// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The delta journal: entry counts, monotonic ids, snapshot content,
//! backwards-delta reconstruction, time travel, subscription ordering and
//! broadcast/journal agreement.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{TestHarness, WalkingMachine};
use serde_json::json;
use xjog_core::{ChangeKind, CreateChartOptions, JournalQuery};

const WALK: [&str; 4] = ["go to park", "go to diner", "go to park", "go home"];

#[tokio::test(flavor = "multi_thread")]
async fn walking_around_leaves_a_reversible_trail() {
    let harness = TestHarness::new();
    let (engine, _store) = harness.engine(&[Arc::new(WalkingMachine) as _]).await;
    engine.start().await.expect("start");

    let reference = engine
        .create_chart(
            "walkingAround",
            CreateChartOptions {
                chart_id: Some("w1".into()),
                ..CreateChartOptions::default()
            },
        )
        .await
        .expect("create chart");

    for event in WALK {
        engine
            .send_event(&reference, event)
            .await
            .expect("send")
            .expect("state");
    }

    let journal = engine.journal();
    let entries = journal
        .query_entries(&JournalQuery::for_chart(reference.clone()))
        .await
        .expect("query entries");

    // One init record plus one per event, ids strictly increasing.
    assert_eq!(entries.len(), 5);
    assert!(entries.windows(2).all(|pair| pair[0].id < pair[1].id));

    // The first entry stores the full state, later ones deltas only.
    assert!(entries[0].state.is_some());
    assert!(entries[1..].iter().all(|entry| entry.state.is_none()));

    // One snapshot row, reflecting the final position.
    let full = journal
        .read_full_state(&reference)
        .await
        .expect("read full state")
        .expect("snapshot row");
    assert_eq!(full.id, entries.last().unwrap().id);
    let snapshot_state: serde_json::Value =
        serde_json::from_slice(full.state.as_deref().unwrap()).unwrap();
    assert_eq!(snapshot_state, json!("at home"));

    // Applying the stored deltas from the final snapshot walks the chart
    // back to its initial state, one stop at a time.
    let mut value = snapshot_state;
    let mut seen = Vec::new();
    for entry in entries.iter().skip(1).rev() {
        let patch: json_patch::Patch =
            serde_json::from_slice(&entry.state_delta).unwrap();
        json_patch::patch(&mut value, &patch).unwrap();
        seen.push(value.clone());
    }
    assert_eq!(
        seen,
        vec![
            json!("at the park"),
            json!("at the diner"),
            json!("at the park"),
            json!("at home"),
        ]
    );

    engine.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread")]
async fn merged_entry_reconstructs_past_states() {
    let harness = TestHarness::new();
    let (engine, _store) = harness.engine(&[Arc::new(WalkingMachine) as _]).await;
    engine.start().await.expect("start");

    let reference = engine
        .create_chart("walkingAround", CreateChartOptions::default())
        .await
        .expect("create chart");
    for event in WALK {
        engine.send_event(&reference, event).await.unwrap();
    }

    let journal = engine.journal();
    let entries = journal
        .query_entries(&JournalQuery::for_chart(reference.clone()))
        .await
        .unwrap();

    // Entry index 1 is the first walk: "go to park".
    let merged = journal
        .read_merged_entry(entries[1].id)
        .await
        .expect("merge")
        .expect("entry exists");
    assert_eq!(merged.state, json!("at the park"));
    assert_eq!(merged.event.as_ref().unwrap().kind, "go to park");

    // The init entry reconstructs the starting position.
    let merged = journal
        .read_merged_entry(entries[0].id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(merged.state, json!("at home"));

    engine.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread")]
async fn subscription_sees_new_entries_in_order() {
    let harness = TestHarness::new();
    let (engine, _store) = harness.engine(&[Arc::new(WalkingMachine) as _]).await;
    engine.start().await.expect("start");

    let reference = engine
        .create_chart("walkingAround", CreateChartOptions::default())
        .await
        .expect("create chart");

    let mut stream = engine
        .journal()
        .new_journal_entries(JournalQuery::for_chart(reference.clone()))
        .await
        .expect("subscribe");

    for event in WALK {
        engine.send_event(&reference, event).await.unwrap();
    }

    let mut ids = Vec::new();
    for _ in 0..WALK.len() {
        let entry = tokio::time::timeout(Duration::from_secs(5), stream.recv())
            .await
            .expect("stream item")
            .expect("stream open")
            .expect("entry ok");
        ids.push(entry.id);
    }
    assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));

    engine.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread")]
async fn broadcast_order_matches_journal_order() {
    let harness = TestHarness::new();
    let (engine, _store) = harness.engine(&[Arc::new(WalkingMachine) as _]).await;
    engine.start().await.expect("start");

    let mut changes = engine.changes();

    let reference = engine
        .create_chart("walkingAround", CreateChartOptions::default())
        .await
        .expect("create chart");
    for event in WALK {
        engine.send_event(&reference, event).await.unwrap();
    }

    let mut broadcast_events = Vec::new();
    for _ in 0..(WALK.len() + 1) {
        let change = tokio::time::timeout(Duration::from_secs(5), changes.recv())
            .await
            .expect("change item")
            .expect("channel open");
        broadcast_events.push(change);
    }

    assert_eq!(broadcast_events[0].kind, ChangeKind::Create);
    let broadcast_kinds: Vec<String> = broadcast_events[1..]
        .iter()
        .map(|change| change.event.as_ref().unwrap().kind.clone())
        .collect();

    let entries = engine
        .journal()
        .query_entries(&JournalQuery::for_chart(reference.clone()))
        .await
        .unwrap();
    let journal_kinds: Vec<String> = entries[1..]
        .iter()
        .map(|entry| {
            let event: xjog_core::Event =
                serde_json::from_slice(entry.event.as_deref().unwrap()).unwrap();
            event.kind
        })
        .collect();

    assert_eq!(broadcast_kinds, journal_kinds);

    engine.shutdown().await.expect("shutdown");
}
