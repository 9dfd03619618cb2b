// Copyright (c) Chronicle Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Checkpoint and park buffer storage (§4.F). Both are ordinary streams
//! written through the shared Append Coordinator, so they are durable and
//! queryable the same way the data streams they shadow are.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::append::AppendCoordinator;
use crate::error::ChronicleResult;
use crate::event::{Event, EventRecord};
use crate::ids::{EventId, EventNumber, ExpectedVersion, StreamId};
use crate::read::Reader;

pub fn checkpoint_stream_name(stream_id: &StreamId, group_name: &str) -> StreamId {
    StreamId::new(format!("$persistentsubscription-{stream_id}::{group_name}-checkpoint"))
        .expect("constructed checkpoint stream name is never empty")
}

pub fn parked_stream_name(stream_id: &StreamId, group_name: &str) -> StreamId {
    StreamId::new(format!("$persistentsubscription-{stream_id}::{group_name}-parked"))
        .expect("constructed parked stream name is never empty")
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointPayload {
    checkpoint: EventNumber,
}

#[derive(Debug, Serialize, Deserialize)]
struct ParkedPayload {
    original_stream_id: String,
    original_event_number: EventNumber,
    event_type: String,
    data: Vec<u8>,
    metadata: Vec<u8>,
}

/// Reads and writes a single group's checkpoint and park streams.
#[derive(Clone)]
pub struct CheckpointStore {
    coordinator: Arc<AppendCoordinator>,
    reader: Arc<Reader>,
}

impl CheckpointStore {
    pub fn new(coordinator: Arc<AppendCoordinator>, reader: Arc<Reader>) -> Self {
        Self { coordinator, reader }
    }

    /// The last persisted checkpoint for `(stream_id, group_name)`, or
    /// `None` if the group has never checkpointed (§4.F "Recovery").
    pub fn load(&self, stream_id: &StreamId, group_name: &str) -> ChronicleResult<Option<EventNumber>> {
        let checkpoint_stream = checkpoint_stream_name(stream_id, group_name);
        let slice = self.reader.read_stream_backward(&checkpoint_stream, EventNumber::MAX, 1, false)?;
        let Some(event) = slice.events.into_iter().next() else {
            return Ok(None);
        };
        let payload: CheckpointPayload = serde_json::from_slice(&event.event.event.data)
            .map_err(|e| crate::error::FatalError::CheckpointInconsistency(e.to_string()))?;
        Ok(Some(payload.checkpoint))
    }

    pub fn persist(&self, stream_id: &StreamId, group_name: &str, checkpoint: EventNumber) -> ChronicleResult<()> {
        let checkpoint_stream = checkpoint_stream_name(stream_id, group_name);
        let payload = CheckpointPayload { checkpoint };
        let data = bytes::Bytes::from(serde_json::to_vec(&payload).expect("checkpoint payload always serializes"));
        let event = Event::new(EventId::new_v4(), "Checkpoint", data).json();
        self.coordinator.append(&checkpoint_stream, ExpectedVersion::Any, vec![event])?;
        Ok(())
    }

    /// Moves `record` into the park buffer, preserving enough of the
    /// original event to replay it later (§4.F "park buffer").
    pub fn park(&self, stream_id: &StreamId, group_name: &str, record: &EventRecord) -> ChronicleResult<()> {
        let parked_stream = parked_stream_name(stream_id, group_name);
        let payload = ParkedPayload {
            original_stream_id: record.stream_id.as_str().to_string(),
            original_event_number: record.event_number,
            event_type: record.event.event_type.clone(),
            data: record.event.data.to_vec(),
            metadata: record.event.metadata.to_vec(),
        };
        let data = bytes::Bytes::from(serde_json::to_vec(&payload).expect("parked payload always serializes"));
        let event = Event::new(EventId::new_v4(), "ParkedEvent", data).json();
        self.coordinator.append(&parked_stream, ExpectedVersion::Any, vec![event])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::append::commit_bus::CommitBus;
    use crate::config::StoreConfig;
    use crate::index::{IndexConfig, StreamIndex};
    use crate::log::{Log, LogConfig};
    use crate::metrics::StoreMetrics;
    use crate::stream_meta::MetadataStore;

    fn harness(dir: &std::path::Path) -> (Arc<AppendCoordinator>, Arc<Reader>) {
        let log = Arc::new(Log::open(dir, LogConfig::default()).unwrap());
        let index = Arc::new(StreamIndex::open(&dir.join("index"), IndexConfig::default()).unwrap());
        let metadata = Arc::new(MetadataStore::new());
        let commit_bus = CommitBus::new();
        let metrics = Arc::new(StoreMetrics::new_for_test());
        let coordinator = Arc::new(AppendCoordinator::new(
            log.clone(),
            index.clone(),
            metadata.clone(),
            commit_bus,
            StoreConfig::default(),
            metrics.clone(),
        ));
        let reader = Arc::new(Reader::new(log, index, metadata, metrics, 128));
        (coordinator, reader)
    }

    #[test]
    fn load_returns_none_before_any_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, reader) = harness(dir.path());
        let store = CheckpointStore::new(coordinator, reader);
        let stream = StreamId::new("q").unwrap();
        assert_eq!(store.load(&stream, "G").unwrap(), None);
    }

    #[test]
    fn persist_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, reader) = harness(dir.path());
        let store = CheckpointStore::new(coordinator, reader);
        let stream = StreamId::new("q").unwrap();
        store.persist(&stream, "G", 0).unwrap();
        store.persist(&stream, "G", 5).unwrap();
        assert_eq!(store.load(&stream, "G").unwrap(), Some(5));
    }
}
