// Copyright (c) Chronicle Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The Append Coordinator (component C): serializes writes, enforces
//! expected-version semantics, assigns event numbers and log positions,
//! and publishes commit notifications on the commit bus.

pub mod commit_bus;
pub mod coordinator;

pub use coordinator::{AppendCoordinator, AppendOutcome};
use serde::{Deserialize, Serialize};

/// §4.A "Durability": whether `append()` fsyncs before acknowledging, or
/// groups acks behind one fsync per `batch_max_delay`/`batch_max_writes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteMode {
    Synchronous,
    Batched,
}

impl Default for WriteMode {
    fn default() -> Self {
        WriteMode::Synchronous
    }
}
