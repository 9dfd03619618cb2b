// Copyright (c) Chronicle Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Settings and identity types for a persistent subscription group (§4.F).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ids::{EventNumber, StreamId};

/// How buffered events are distributed across a group's connected
/// consumers (§4.F "named-consumer-strategy").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatchStrategy {
    RoundRobin,
    DispatchToSingle,
    Pinned,
}

/// Where a newly created group's read cursor starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartFrom {
    EventNumber(EventNumber),
    Live,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistentSubscriptionSettings {
    pub start_from: StartFrom,
    pub resolve_links: bool,
    pub message_timeout: Duration,
    pub max_retries: u32,
    pub live_buffer_size: usize,
    pub read_batch_size: usize,
    pub history_buffer_size: usize,
    pub checkpoint_after: Duration,
    pub min_checkpoint_count: u64,
    pub max_checkpoint_count: u64,
    /// 0 = unlimited.
    pub max_subscribers: usize,
    pub named_consumer_strategy: DispatchStrategy,
}

impl Default for PersistentSubscriptionSettings {
    fn default() -> Self {
        Self {
            start_from: StartFrom::EventNumber(0),
            resolve_links: true,
            message_timeout: Duration::from_secs(30),
            max_retries: 10,
            live_buffer_size: 500,
            read_batch_size: 20,
            history_buffer_size: 500,
            checkpoint_after: Duration::from_secs(2),
            min_checkpoint_count: 10,
            max_checkpoint_count: 1000,
            max_subscribers: 0,
            named_consumer_strategy: DispatchStrategy::RoundRobin,
        }
    }
}

/// Identifies a group uniquely across the engine: one stream can host many
/// named groups, and the same group name on different streams is unrelated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PersistentSubscriptionKey {
    pub stream_id: StreamId,
    pub group_name: String,
}

impl PersistentSubscriptionKey {
    pub fn new(stream_id: StreamId, group_name: impl Into<String>) -> Self {
        Self {
            stream_id,
            group_name: group_name.into(),
        }
    }
}

impl std::fmt::Display for PersistentSubscriptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}::{}", self.stream_id, self.group_name)
    }
}
