// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL backend smoke test, gated on `TEST_DATABASE_URL`.

use xjog_core::persistence::{NewChart, NewDeferredEvent, PersistenceStore, PostgresStore};
use xjog_core::{ChartReference, Event};

/// Skip the test silently when no test database is configured.
macro_rules! skip_if_no_db {
    () => {
        match std::env::var("TEST_DATABASE_URL") {
            Ok(url) => url,
            Err(_) => {
                eprintln!("Skipping test: TEST_DATABASE_URL not set");
                return;
            }
        }
    };
}

#[tokio::test]
async fn postgres_chart_and_queue_round_trip() {
    let url = skip_if_no_db!();
    let store = PostgresStore::connect(&url).await.expect("connect");

    let reference = ChartReference::new(
        "smoke",
        format!("chart-{}", uuid::Uuid::new_v4().simple()),
    );
    let state = serde_json::to_vec(&serde_json::json!({
        "value": "closed",
        "context": {},
    }))
    .unwrap();

    store.overthrow_other_instances("smoke-engine").await.unwrap();
    store
        .insert_chart(&NewChart {
            reference: &reference,
            parent: None,
            owner_id: "smoke-engine",
            state: &state,
        })
        .await
        .unwrap();

    let row = store.read_chart(&reference).await.unwrap().unwrap();
    assert_eq!(row.owner_id, "smoke-engine");

    let deferred = store
        .insert_deferred_event(&NewDeferredEvent {
            reference: reference.clone(),
            event: Event::new("tick"),
            event_id: serde_json::json!("tick-1"),
            event_to: None,
            delay_ms: 0,
        })
        .await
        .unwrap();

    let batch = store
        .read_deferred_event_batch("smoke-engine", 10, std::time::Duration::from_secs(60))
        .await
        .unwrap();
    assert!(batch.iter().any(|row| row.id == deferred.id));

    store.delete_deferred_event(deferred.id).await.unwrap();
    store.destroy_chart(&reference).await.unwrap();
    store.remove_instance("smoke-engine").await.unwrap();
}
