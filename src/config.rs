// Copyright (c) Chronicle Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Process-wide configuration. Loading this from TOML/env is the embedding
//! application's job; this crate only defines the shape and a sane default.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::append::WriteMode;
use crate::index::IndexConfig;
use crate::log::LogConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub max_chunk_size: u64,
    pub write_mode: WriteMode,
    pub batch_max_delay: Duration,
    pub batch_max_writes: usize,
    pub memtable_flush_threshold: usize,
    pub merge_trigger_count: usize,
    pub midpoint_stride: usize,
    pub reader_cache_entries: usize,
    pub subscription_buffer_size: usize,
    pub send_checkpoint_message_count: u64,
    pub persistent_live_buffer_size: usize,
    pub persistent_read_batch_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let log = LogConfig::default();
        let index = IndexConfig::default();
        Self {
            max_chunk_size: log.max_chunk_size,
            write_mode: WriteMode::Synchronous,
            batch_max_delay: Duration::from_millis(5),
            batch_max_writes: 128,
            memtable_flush_threshold: index.memtable_flush_threshold,
            merge_trigger_count: index.merge_trigger_count,
            midpoint_stride: index.midpoint_stride,
            reader_cache_entries: 4096,
            subscription_buffer_size: 1024,
            send_checkpoint_message_count: 100,
            persistent_live_buffer_size: 500,
            persistent_read_batch_size: 100,
        }
    }
}

impl StoreConfig {
    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            max_chunk_size: self.max_chunk_size,
        }
    }

    pub fn index_config(&self) -> IndexConfig {
        IndexConfig {
            memtable_flush_threshold: self.memtable_flush_threshold,
            merge_trigger_count: self.merge_trigger_count,
            midpoint_stride: self.midpoint_stride,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_round_trips_through_json() {
        let config = StoreConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: StoreConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.max_chunk_size, config.max_chunk_size);
    }
}
