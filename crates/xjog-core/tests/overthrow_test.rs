// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Two engines sharing one database: the newer instance overthrows the
//! older one and adopts its charts; the older instance notices its death
//! note and drains without losing anything.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{DoorMachine, TestHarness};
use xjog_core::{CreateChartOptions, EnginePhase, PersistenceStore};

#[tokio::test(flavor = "multi_thread")]
async fn newer_instance_overthrows_and_adopts() {
    let harness = TestHarness::new();

    let (engine_a, store_a) = harness.engine(&[Arc::new(DoorMachine) as _]).await;
    engine_a.start().await.expect("start A");

    let chart = engine_a
        .create_chart("door", CreateChartOptions::default())
        .await
        .expect("create chart");
    engine_a
        .send_event(&chart, "open")
        .await
        .expect("send open");

    // Second engine, same database file, its own pool.
    let (engine_b, store_b) = harness.engine(&[Arc::new(DoorMachine) as _]).await;
    engine_b.start().await.expect("start B");
    assert_eq!(engine_b.phase(), EnginePhase::Ready);

    // While both instances are alive: two rows, A flagged dying, B not.
    let instances = store_b.list_instances().await.unwrap();
    assert_eq!(instances.len(), 2);
    let row_a = instances
        .iter()
        .find(|row| row.instance_id == engine_a.instance_id())
        .expect("row for A");
    let row_b = instances
        .iter()
        .find(|row| row.instance_id == engine_b.instance_id())
        .expect("row for B");
    assert!(row_a.dying);
    assert!(!row_b.dying);

    // A notices the death note and halts on its own.
    tokio::time::timeout(Duration::from_secs(10), engine_a.wait_halted())
        .await
        .expect("A halts after being overthrown");

    let instances = store_a.list_instances().await.unwrap();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].instance_id, engine_b.instance_id());

    // The chart now belongs to B and still works.
    let row = store_b.read_chart(&chart).await.unwrap().unwrap();
    assert_eq!(row.owner_id, engine_b.instance_id());
    assert!(!row.paused);

    let closed = engine_b
        .send_event(&chart, "close")
        .await
        .expect("send close")
        .expect("state");
    assert!(closed.matches("closed"));

    engine_b.shutdown().await.expect("shutdown B");
    assert!(store_b.list_instances().await.unwrap().is_empty());
}
