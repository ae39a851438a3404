// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Engine configuration.
//!
//! Every option has a default and a minimum. [`EngineOptions::clamped`]
//! enforces the minimums, warning when a value is raised, so a misconfigured
//! deployment degrades to safe settings instead of busy-looping.

use std::time::Duration;

use tracing::warn;

/// Top-level engine options.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Per-chart mutex acquisition timeout. Default 2000 ms, min 50 ms.
    pub chart_mutex_timeout: Duration,
    /// Startup and adoption options.
    pub startup: StartupOptions,
    /// Deferred-event scheduler options.
    pub deferred_events: DeferredEventOptions,
    /// Shutdown options.
    pub shutdown: ShutdownOptions,
    /// Per-machine chart cache options.
    pub machine: MachineOptions,
}

/// Startup and adoption options.
#[derive(Debug, Clone)]
pub struct StartupOptions {
    /// Delay between adoption passes. Default 2000 ms, min 10 ms.
    pub adoption_frequency: Duration,
    /// Quiescence period before paused charts with live activities are
    /// adopted forcibly. Default 30 s, min 2.5 × `adoption_frequency`.
    pub grace_period: Duration,
}

/// Deferred-event scheduler options.
#[derive(Debug, Clone)]
pub struct DeferredEventOptions {
    /// Maximum rows reserved per batch read. Default 100, min 1.
    pub batch_size: i64,
    /// Regular delay between batch reads. Default 30 s, min 50 ms.
    pub interval: Duration,
    /// How far ahead of now a batch read reserves rows. Default 30 s,
    /// min `interval`.
    pub look_ahead: Duration,
}

/// Shutdown options.
#[derive(Debug, Clone)]
pub struct ShutdownOptions {
    /// Polling period while waiting for other instances to adopt our
    /// charts. Default 500 ms, min 50 ms.
    pub own_chart_polling_frequency: Duration,
}

/// Per-machine chart cache options.
#[derive(Debug, Clone)]
pub struct MachineOptions {
    /// Executor cache capacity per machine. Default 1000, min 10.
    pub cache_size: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            chart_mutex_timeout: Duration::from_millis(2000),
            startup: StartupOptions {
                adoption_frequency: Duration::from_millis(2000),
                grace_period: Duration::from_millis(30_000),
            },
            deferred_events: DeferredEventOptions {
                batch_size: 100,
                interval: Duration::from_millis(30_000),
                look_ahead: Duration::from_millis(30_000),
            },
            shutdown: ShutdownOptions {
                own_chart_polling_frequency: Duration::from_millis(500),
            },
            machine: MachineOptions { cache_size: 1000 },
        }
    }
}

fn raise(name: &str, value: Duration, min: Duration) -> Duration {
    if value < min {
        warn!(
            option = name,
            configured_ms = value.as_millis() as u64,
            minimum_ms = min.as_millis() as u64,
            "option below minimum, raising"
        );
        min
    } else {
        value
    }
}

impl EngineOptions {
    /// Enforce all option minimums, warning for each raised value.
    pub fn clamped(mut self) -> Self {
        self.chart_mutex_timeout = raise(
            "engine.chartMutexTimeout",
            self.chart_mutex_timeout,
            Duration::from_millis(50),
        );
        self.startup.adoption_frequency = raise(
            "startup.adoptionFrequency",
            self.startup.adoption_frequency,
            Duration::from_millis(10),
        );
        let grace_min = self.startup.adoption_frequency.mul_f64(2.5);
        self.startup.grace_period =
            raise("startup.gracePeriod", self.startup.grace_period, grace_min);
        if self.deferred_events.batch_size < 1 {
            warn!(
                option = "deferredEvents.batchSize",
                configured = self.deferred_events.batch_size,
                "option below minimum, raising"
            );
            self.deferred_events.batch_size = 1;
        }
        self.deferred_events.interval = raise(
            "deferredEvents.interval",
            self.deferred_events.interval,
            Duration::from_millis(50),
        );
        self.deferred_events.look_ahead = raise(
            "deferredEvents.lookAhead",
            self.deferred_events.look_ahead,
            self.deferred_events.interval,
        );
        self.shutdown.own_chart_polling_frequency = raise(
            "shutdown.ownChartPollingFrequency",
            self.shutdown.own_chart_polling_frequency,
            Duration::from_millis(50),
        );
        if self.machine.cache_size < 10 {
            warn!(
                option = "machine.cacheSize",
                configured = self.machine.cache_size,
                "option below minimum, raising"
            );
            self.machine.cache_size = 10;
        }
        self
    }

    /// The machine-cache mutex timeout, derived from the chart mutex
    /// timeout.
    pub fn cache_mutex_timeout(&self) -> Duration {
        self.chart_mutex_timeout * 2
    }
}
