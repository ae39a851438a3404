// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared statechart model types for the xjog durable execution engine.
//!
//! This crate is the interface boundary between the engine (`xjog-core`) and
//! the statechart evaluator. The engine never interprets machine definitions
//! itself: it consumes [`Machine`] implementations that compute a next
//! [`State`] from a previous state and an [`Event`], and it executes the
//! pure-data [`Action`]s the evaluator attaches to each state.
//!
//! # Contents
//!
//! - [`ChartReference`]: the globally unique identity of one running chart,
//!   serializable as an `xjog+chart:` URI.
//! - [`Event`]: an opaque tagged JSON value with at least a `type` string.
//! - [`State`]: the full composed snapshot the evaluator produces (value,
//!   context, actions, done-data). Snapshots round-trip through JSON so a
//!   chart can be rehydrated on another engine instance.
//! - [`Action`] / [`SendTarget`]: the effect vocabulary the engine executes
//!   after a transition (delayed sends, cancellations, activity start/stop,
//!   log records).
//! - [`Machine`] / [`ActivitySpawn`]: the evaluator interface and the
//!   side-effect descriptors it hands to the engine's activity manager.
//! - [`filter`]: composable boolean query trees over charts and digests.

#![deny(missing_docs)]

pub mod action;
pub mod event;
pub mod filter;
pub mod ident;
pub mod machine;
pub mod state;

pub use action::{Action, SendTarget};
pub use event::Event;
pub use filter::{ChartFacts, ChartFilter, DigestFilter};
pub use ident::{ChartReference, UriError};
pub use machine::{ActivityJob, ActivitySpawn, Machine, MachineError};
pub use state::{ChartSnapshot, State};
