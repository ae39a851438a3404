// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! External id round-trips and chart queries.

mod common;

use std::sync::Arc;

use common::{DoorMachine, TestHarness, WalkingMachine};
use xjog_core::{ChartError, ChartFilter, CreateChartOptions};

#[tokio::test(flavor = "multi_thread")]
async fn external_id_round_trip() {
    let harness = TestHarness::new();
    let (engine, _store) = harness.engine(&[Arc::new(DoorMachine) as _]).await;
    engine.start().await.expect("start");

    let chart_x = engine
        .create_chart(
            "door",
            CreateChartOptions {
                chart_id: Some("chartX".into()),
                ..CreateChartOptions::default()
            },
        )
        .await
        .expect("create chart");

    engine
        .register_external_id("orderNo", "42", &chart_x)
        .await
        .expect("register external id");

    assert_eq!(
        engine
            .get_chart_by_external_id("orderNo", "42")
            .await
            .unwrap(),
        Some(chart_x.clone())
    );

    // The pair is unique per database.
    let other = engine
        .create_chart("door", CreateChartOptions::default())
        .await
        .unwrap();
    let conflict = engine
        .register_external_id("orderNo", "42", &other)
        .await
        .unwrap_err();
    assert!(matches!(conflict, ChartError::Conflict { .. }));

    engine
        .drop_external_id("orderNo", "42")
        .await
        .expect("drop external id");
    assert_eq!(
        engine
            .get_chart_by_external_id("orderNo", "42")
            .await
            .unwrap(),
        None
    );

    engine.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread")]
async fn chart_queries_compose_identity_state_and_external_ids() {
    let harness = TestHarness::new();
    let (engine, _store) = harness
        .engine(&[Arc::new(DoorMachine) as _, Arc::new(WalkingMachine) as _])
        .await;
    engine.start().await.expect("start");

    let door = engine
        .create_chart(
            "door",
            CreateChartOptions {
                chart_id: Some("front".into()),
                ..CreateChartOptions::default()
            },
        )
        .await
        .unwrap();
    engine.send_event(&door, "open").await.unwrap();
    engine
        .register_external_id("building", "hq", &door)
        .await
        .unwrap();

    let walker = engine
        .create_chart("walkingAround", CreateChartOptions::default())
        .await
        .unwrap();
    engine.send_event(&walker, "go to park").await.unwrap();

    // By machine id.
    let doors = engine
        .query_charts(&ChartFilter::MachineIdMatches("^door$".into()))
        .await
        .unwrap();
    assert_eq!(doors, vec![door.clone()]);

    // By state value.
    let at_park = engine
        .query_charts(&ChartFilter::StateMatches("at the park".into()))
        .await
        .unwrap();
    assert_eq!(at_park, vec![walker.clone()]);

    // By external id, composed.
    let open_hq_doors = engine
        .query_charts(&ChartFilter::And(vec![
            ChartFilter::StateMatches("open".into()),
            ChartFilter::ExternalIdMatches {
                key: "building".into(),
                pattern: "^hq$".into(),
            },
        ]))
        .await
        .unwrap();
    assert_eq!(open_hq_doors, vec![door.clone()]);

    // A closed-door query matches nothing.
    let closed = engine
        .query_charts(&ChartFilter::And(vec![
            ChartFilter::MachineIdMatches("^door$".into()),
            ChartFilter::StateMatches("closed".into()),
        ]))
        .await
        .unwrap();
    assert!(closed.is_empty());

    engine.shutdown().await.expect("shutdown");
}
