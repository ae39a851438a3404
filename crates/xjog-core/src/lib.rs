// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! xjog-core - Durable Statechart Execution Engine
//!
//! This crate runs many long-lived, hierarchical state machines ("charts"),
//! each persisted transactionally in SQLite or PostgreSQL so that work
//! resumes after crashes and migrates between processes. Deferred
//! transitions fire on schedule from a persistent timer queue; running side
//! effects ("activities") are tracked so they restart after a handover.
//! Multiple engine instances can share one database, with ownership
//! transferring from older instances to newer ones without losing charts or
//! double-firing events.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            Engine                                │
//! │          (composition root, change broadcast, hooks)             │
//! └──────────────────────────────────────────────────────────────────┘
//!      │             │               │                 │
//!      ▼             ▼               ▼                 ▼
//! ┌──────────┐ ┌────────────┐ ┌──────────────┐ ┌───────────────┐
//! │ Startup  │ │  Machine   │ │  Deferred    │ │   Activity    │
//! │ Manager  │ │  Registry  │ │  Events      │ │   Manager     │
//! │ (adopt)  │ │ (LRU cache)│ │ (timer queue)│ │ (side effects)│
//! └──────────┘ └────────────┘ └──────────────┘ └───────────────┘
//!      │             │               │                 │
//!      │             ▼               │                 │
//!      │      ┌────────────┐         │                 │
//!      │      │   Chart    │         │                 │
//!      │      │  Executor  │◄────────┘                 │
//!      │      │ (per chart)│                           │
//!      │      └────────────┘                           │
//!      │             │                                 │
//!      ▼             ▼                                 ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │              PersistenceStore + Journal (sqlx)                   │
//! │                   SQLite / PostgreSQL                            │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Engine lifecycle
//!
//! ```text
//!     initial → starting → adopting → ready → dying → halted
//! ```
//!
//! - `starting`: the new instance overthrows every other instance in one
//!   transaction: all existing instances are flagged dying and every chart
//!   is paused.
//! - `adopting`: idle paused charts (no live activities) are adopted
//!   gently; charts with activity markers wait until a grace period
//!   (quiescence-based) expires, then are adopted forcibly with their
//!   markers wiped. Each adopted chart re-runs its entry actions, which
//!   restarts its activities.
//! - `ready`: the engine serves sends; machine registration is closed.
//! - `dying`: deferred-event locks are released, activities stopped, the
//!   instance row removed, and, if another live instance remains, the
//!   engine waits until its charts have been adopted before halting.
//!
//! # Delivery contract
//!
//! Events deferred to the persistent queue are delivered at least once
//! across instance crashes and exactly once per owning instance: the row is
//! reserved under an instance lease, delivered, then deleted, so a retry
//! after delivery finds nothing to redo.
//!
//! # Modules
//!
//! - [`config`]: engine options with normative defaults and minimums
//! - [`error`]: error taxonomy for engine operations
//! - [`persistence`]: store traits and the SQLite / PostgreSQL backends
//! - [`migrations`]: embedded schema migrations for both backends
//! - [`journal`]: append-only delta log, snapshots, subscriptions
//! - [`digest`]: per-chart key/value summaries for queries
//! - [`startup`]: instance registration, overthrow and adoption
//! - [`deferred`]: persistent timer queue with batched lookahead
//! - [`activity`]: in-memory registry of running side effects
//! - [`executor`]: per-chart serialization and the send pipeline
//! - [`registry`]: per-machine chart cache
//! - [`engine`]: the composition root

#![deny(missing_docs)]

pub mod activity;
pub mod change;
pub mod config;
pub mod deferred;
pub mod digest;
pub mod engine;
pub mod error;
pub mod executor;
pub mod journal;
pub mod migrations;
pub mod persistence;
pub mod registry;
pub mod startup;
mod util;

pub use change::{ChangeKind, StateChange, UpdateHook};
pub use config::EngineOptions;
pub use digest::{DigestMapper, DigestWriter};
pub use engine::{CreateChartOptions, Engine, EngineBuilder, HookHandle};
pub use error::{ChartError, Result};
pub use executor::{ChartExecutor, ContextPatch};
pub use journal::{Journal, JournalNotification, JournalQuery, MergedJournalEntry};
pub use persistence::{EngineStore, JournalStore, PersistenceStore, PostgresStore, SqliteStore};
pub use startup::EnginePhase;

pub use xjog_machine::{
    Action, ActivityJob, ActivitySpawn, ChartFacts, ChartFilter, ChartReference, ChartSnapshot,
    DigestFilter, Event, Machine, MachineError, SendTarget, State,
};
