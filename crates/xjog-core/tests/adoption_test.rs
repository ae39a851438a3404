// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Handover with a live activity: gentle adoption skips the busy chart,
//! the grace period expires, and the new instance adopts forcibly and
//! restarts the activity from the machine definition.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{StubbornMachine, TestHarness, wait_for};
use xjog_core::{CreateChartOptions, EnginePhase, PersistenceStore};

#[tokio::test(flavor = "multi_thread")]
async fn busy_chart_is_adopted_forcibly_and_activity_restarts() {
    let harness = TestHarness::new();

    let (engine_a, store_a) = harness.engine(&[Arc::new(StubbornMachine) as _]).await;
    engine_a.start().await.expect("start A");

    let chart = engine_a
        .create_chart("stubborn", CreateChartOptions::default())
        .await
        .expect("create chart");
    let working = engine_a
        .send_event(&chart, "begin")
        .await
        .expect("send begin")
        .expect("state");
    assert!(working.matches("working"));

    // The never-resolving activity is running on A and marked in the
    // database.
    assert_eq!(engine_a.ongoing_activity_count(&chart).await, 1);
    assert_eq!(store_a.count_activities(&chart).await.unwrap(), 1);

    // Second engine starts in the background; its startup blocks on
    // adoption until the grace period expires.
    let (engine_b, store_b) = harness.engine(&[Arc::new(StubbornMachine) as _]).await;
    let starter = {
        let engine_b = engine_b.clone();
        tokio::spawn(async move { engine_b.start().await })
    };

    // Mid-adoption: A is flagged dying, the chart is paused, and the
    // activity marker keeps gentle adoption away from it.
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(store_b.is_instance_dying(engine_a.instance_id()).await.unwrap());
    assert_eq!(store_b.count_paused_charts().await.unwrap(), 1);
    assert_eq!(store_b.count_activities(&chart).await.unwrap(), 1);
    assert_eq!(engine_b.phase(), EnginePhase::Adopting);

    // Grace expiry: B adopts forcibly and becomes ready.
    starter
        .await
        .expect("starter task")
        .expect("B starts");
    assert_eq!(engine_b.phase(), EnginePhase::Ready);

    let row = store_b.read_chart(&chart).await.unwrap().unwrap();
    assert_eq!(row.owner_id, engine_b.instance_id());
    assert!(!row.paused);

    // B re-ran the entry actions: the activity lives on B now, with its
    // marker re-registered.
    wait_for(Duration::from_secs(5), "activity restarted on B", || {
        let engine = engine_b.clone();
        let chart = chart.clone();
        async move { engine.ongoing_activity_count(&chart).await == 1 }
    })
    .await;
    assert_eq!(store_b.count_activities(&chart).await.unwrap(), 1);

    // A drains: its activity is gone once it halts.
    tokio::time::timeout(Duration::from_secs(10), engine_a.wait_halted())
        .await
        .expect("A halts");
    assert_eq!(engine_a.ongoing_activity_count(&chart).await, 0);

    engine_b.shutdown().await.expect("shutdown B");
}

#[tokio::test(flavor = "multi_thread")]
async fn idle_charts_are_adopted_gently_before_the_grace_expires() {
    let harness = TestHarness::new();

    let (engine_a, _store_a) = harness.engine(&[Arc::new(common::DoorMachine) as _]).await;
    engine_a.start().await.expect("start A");
    let chart = engine_a
        .create_chart("door", CreateChartOptions::default())
        .await
        .expect("create chart");

    let (engine_b, store_b) = harness.engine(&[Arc::new(common::DoorMachine) as _]).await;
    let started = std::time::Instant::now();
    engine_b.start().await.expect("start B");

    // No activities were involved, so adoption finished well inside the
    // grace period.
    assert!(started.elapsed() < common::fast_options().startup.grace_period);
    let row = store_b.read_chart(&chart).await.unwrap().unwrap();
    assert_eq!(row.owner_id, engine_b.instance_id());

    tokio::time::timeout(Duration::from_secs(10), engine_a.wait_halted())
        .await
        .expect("A halts");
    engine_b.shutdown().await.expect("shutdown B");
}
