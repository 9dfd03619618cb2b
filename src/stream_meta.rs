// Copyright (c) Chronicle Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Per-stream metadata: tombstone flag, truncation watermark, max-age /
//! max-count retention, and cache-control, per the `StreamState` data model.
//!
//! Metadata for stream `S` is itself stored as JSON in the system stream
//! `$$S`, the same way the event path stores everything else; this module
//! is a read-through cache over that stream so the Append Coordinator and
//! Reader don't hit the log on every check.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::ids::{EventNumber, StreamId};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamMetadata {
    pub tombstoned: bool,
    pub metadata_version: u64,
    /// `$tb`: event numbers strictly below this are excluded from reads.
    pub truncate_before: Option<EventNumber>,
    pub max_age: Option<Duration>,
    pub max_count: Option<u64>,
    pub cache_control: Option<Duration>,
}

impl Default for StreamMetadata {
    fn default() -> Self {
        Self {
            tombstoned: false,
            metadata_version: 0,
            truncate_before: None,
            max_age: None,
            max_count: None,
            cache_control: None,
        }
    }
}

impl StreamMetadata {
    /// Whether an event at `event_number`, created at `created_at_ms`
    /// (milliseconds since epoch), is visible given `tail`, `now_ms`, and
    /// these retention settings. Per Open Question (i): `truncate_before`
    /// takes precedence over `max_count` when both would exclude the event.
    pub fn is_visible(&self, event_number: EventNumber, created_at_ms: u64, now_ms: u64, tail: EventNumber) -> bool {
        if let Some(tb) = self.truncate_before {
            if event_number < tb {
                return false;
            }
        }
        if let Some(max_age) = self.max_age {
            let age_ms = now_ms.saturating_sub(created_at_ms);
            if age_ms as u128 > max_age.as_millis() {
                return false;
            }
        }
        if let Some(max_count) = self.max_count {
            let retained_from = tail.saturating_sub(max_count as i64 - 1).max(0);
            if self.truncate_before.is_none() && event_number < retained_from {
                return false;
            }
        }
        true
    }
}

/// In-memory read-through cache of every stream's metadata, keyed by the
/// data stream name (not the `$$`-prefixed metadata stream name).
#[derive(Default)]
pub struct MetadataStore {
    entries: DashMap<StreamId, Arc<StreamMetadata>>,
}

impl MetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, stream_id: &StreamId) -> Arc<StreamMetadata> {
        self.entries
            .get(stream_id)
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn set(&self, stream_id: &StreamId, metadata: StreamMetadata) {
        self.entries.insert(stream_id.clone(), Arc::new(metadata));
    }

    pub fn mark_tombstoned(&self, stream_id: &StreamId) {
        let mut current = (*self.get(stream_id)).clone();
        current.tombstoned = true;
        self.set(stream_id, current);
    }

    pub fn is_tombstoned(&self, stream_id: &StreamId) -> bool {
        self.get(stream_id).tombstoned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_before_wins_over_max_count() {
        let meta = StreamMetadata {
            truncate_before: Some(5),
            max_count: Some(3),
            ..StreamMetadata::default()
        };
        // max_count alone would exclude event 4 too (retained_from = tail-2),
        // but truncate_before is the one whose exclusion rule applies.
        assert!(!meta.is_visible(4, 0, 0, 10));
        assert!(meta.is_visible(5, 0, 0, 10));
    }

    #[test]
    fn max_age_excludes_stale_events() {
        let meta = StreamMetadata {
            max_age: Some(Duration::from_secs(60)),
            ..StreamMetadata::default()
        };
        assert!(!meta.is_visible(0, 0, 120_000, 0));
        assert!(meta.is_visible(0, 100_000, 120_000, 0));
    }

    #[test]
    fn mark_tombstoned_is_sticky() {
        let store = MetadataStore::new();
        let s = StreamId::new("s").unwrap();
        assert!(!store.is_tombstoned(&s));
        store.mark_tombstoned(&s);
        assert!(store.is_tombstoned(&s));
    }
}
