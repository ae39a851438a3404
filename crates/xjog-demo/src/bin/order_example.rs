// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Order Example - Demonstrates the fundamental xjog engine lifecycle.
//!
//! This example shows:
//! - Engine construction over a SQLite store
//! - Machine registration and startup
//! - Chart creation, transitions, activities and deferred events
//! - External id lookup and digest queries
//! - Journal time travel
//!
//! Run with: cargo run -p xjog-demo --bin order_example

use std::sync::Arc;

use tracing::info;

use xjog_core::{
    CreateChartOptions, DigestFilter, Engine, JournalQuery, SqliteStore, StateChange,
};
use xjog_demo::OrderMachine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("=== Order Example: xjog engine lifecycle ===");

    let store = Arc::new(SqliteStore::from_path(".data/xjog-demo.db").await?);
    let engine = Engine::builder().store(store).build()?;

    engine.register_machine(Arc::new(OrderMachine))?;
    engine.register_digest_mapper(
        "order",
        Arc::new(|change: &StateChange| {
            let Some(new) = &change.new else {
                return Vec::new();
            };
            vec![(
                "stage".to_string(),
                new.value.as_str().unwrap_or("unknown").to_string(),
            )]
        }),
    );

    engine.start().await?;
    info!(instance = engine.instance_id(), "engine ready");

    // Create an order chart and tag it with its order number.
    let order = engine
        .create_chart("order", CreateChartOptions::default())
        .await?;
    engine.register_external_id("orderNo", "1042", &order).await?;
    info!(chart = %order, "order chart created");

    // Place the order: starts the stock-reservation activity and schedules
    // a one-second reminder.
    let state = engine.send_event(&order, "place").await?.expect("state");
    info!(value = %state.value, "order placed");

    // Wait for the warehouse slot to come back through the deferred queue.
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    let state = engine.get_chart(&order).await?.expect("state");
    info!(context = %state.context, "stock reserved");

    // Pick the order before the reminder fires; the reminder is cancelled.
    let state = engine.send_event(&order, "picked").await?.expect("state");
    info!(value = %state.value, "order shipped");

    // Look the chart up by its order number.
    let by_number = engine.get_chart_by_external_id("orderNo", "1042").await?;
    info!(found = ?by_number, "external id lookup");

    // Query digests: which orders are shipped?
    let shipped = engine
        .query_digests(
            Some("order"),
            Some(&DigestFilter::Eq {
                key: "stage".into(),
                value: "shipped".into(),
            }),
        )
        .await?;
    info!(count = shipped.len(), "shipped orders by digest");

    // Walk the journal: every transition left a reversible delta.
    let entries = engine
        .journal()
        .query_entries(&JournalQuery::for_chart(order.clone()))
        .await?;
    info!(entries = entries.len(), "journal entries for the order");
    if let Some(first) = entries.first() {
        let merged = engine.journal().read_merged_entry(first.id).await?;
        if let Some(merged) = merged {
            info!(id = merged.id, state = %merged.state, "state as of the first entry");
        }
    }

    engine.shutdown().await?;
    info!("=== Order Example Complete ===");
    Ok(())
}
