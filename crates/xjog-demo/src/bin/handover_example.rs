// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Handover Example - Two engine instances sharing one database.
//!
//! This example shows:
//! - A second instance overthrowing the first
//! - Graceful adoption of the first instance's charts
//! - The first instance noticing its death note and draining
//! - The chart continuing to work on the new instance
//!
//! Run with: cargo run -p xjog-demo --bin handover_example

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use xjog_core::{CreateChartOptions, Engine, EngineOptions, SqliteStore};
use xjog_demo::OrderMachine;

const DB_PATH: &str = ".data/xjog-handover.db";

fn options() -> EngineOptions {
    let mut options = EngineOptions::default();
    // Short adoption cadence so the handover is visible in seconds.
    options.startup.adoption_frequency = Duration::from_millis(200);
    options.startup.grace_period = Duration::from_millis(1_000);
    options
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("=== Handover Example: overthrow and adoption ===");

    // First engine: create an order and leave it mid-flight.
    let store_a = Arc::new(SqliteStore::from_path(DB_PATH).await?);
    let engine_a = Engine::builder()
        .store(store_a)
        .options(options())
        .build()?;
    engine_a.register_machine(Arc::new(OrderMachine))?;
    engine_a.start().await?;
    info!(instance = engine_a.instance_id(), "engine A ready");

    let order = engine_a
        .create_chart("order", CreateChartOptions::default())
        .await?;
    engine_a.send_event(&order, "place").await?;
    info!(chart = %order, "order placed on engine A");

    // Second engine on the same database: overthrows A, pausing every
    // chart, then adopts them. Idle charts transfer on the first gentle
    // pass; a chart with a live activity would wait out the grace period
    // and be adopted forcibly.
    let store_b = Arc::new(SqliteStore::from_path(DB_PATH).await?);
    let engine_b = Engine::builder()
        .store(store_b)
        .options(options())
        .build()?;
    engine_b.register_machine(Arc::new(OrderMachine))?;
    engine_b.start().await?;
    info!(instance = engine_b.instance_id(), "engine B ready, charts adopted");

    // A notices the death note and drains on its own.
    engine_a.wait_halted().await;
    info!(instance = engine_a.instance_id(), "engine A halted");

    // The order continues on B as if nothing happened.
    let state = engine_b.send_event(&order, "picked").await?.expect("state");
    info!(value = %state.value, "order shipped on engine B");

    engine_b.shutdown().await?;
    info!("=== Handover Example Complete ===");
    Ok(())
}
