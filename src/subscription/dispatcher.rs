// Copyright (c) Chronicle Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Entry point for opening subscriptions: wires a caller up with a bounded
//! output channel and a cancellation signal, then hands the actual work off
//! to `live::run`/`catchup::run_stream`/`catchup::run_all_filtered` as a
//! spawned task.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::append::commit_bus::CommitBus;
use crate::config::StoreConfig;
use crate::filter::Filter;
use crate::ids::{EventNumber, LogPosition, StreamId};
use crate::log::LogOffset;
use crate::metrics::StoreMetrics;
use crate::read::Reader;

use super::{catchup, live, SubscriptionEvent};

/// Default search window (in records examined) for a single `read-all`
/// slice backing a filtered subscription, matching the Reader's own
/// default for `read_all_forward`.
const DEFAULT_MAX_SEARCH_WINDOW: usize = 10_000;

/// Opens live, catch-up, and filtered all-stream subscriptions (§4.E).
/// Cheap to clone: holds only `Arc`s.
#[derive(Clone)]
pub struct SubscriptionDispatcher {
    reader: Arc<Reader>,
    commit_bus: Arc<CommitBus>,
    config: Arc<StoreConfig>,
    metrics: Arc<StoreMetrics>,
}

impl SubscriptionDispatcher {
    pub fn new(
        reader: Arc<Reader>,
        commit_bus: Arc<CommitBus>,
        config: Arc<StoreConfig>,
        metrics: Arc<StoreMetrics>,
    ) -> Self {
        Self {
            reader,
            commit_bus,
            config,
            metrics,
        }
    }

    /// §4.E mode 1: forward every commit from "now" on, optionally filtered.
    pub fn subscribe_live(&self, filter: Option<Arc<Filter>>) -> SubscriptionHandle {
        let (output_tx, output_rx) = mpsc::channel(self.config.subscription_buffer_size);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let task = tokio::spawn(live::run(
            self.commit_bus.clone(),
            filter,
            output_tx,
            cancel_rx,
            self.metrics.clone(),
        ));
        SubscriptionHandle::new(output_rx, cancel_tx, task)
    }

    /// §4.E mode 2: replay `stream_id` from `from`, then cross over to live.
    pub fn subscribe_catchup(
        &self,
        stream_id: StreamId,
        from: EventNumber,
        resolve_links: bool,
    ) -> SubscriptionHandle {
        let (output_tx, output_rx) = mpsc::channel(self.config.subscription_buffer_size);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let task = tokio::spawn(catchup::run_stream(
            self.reader.clone(),
            self.commit_bus.clone(),
            stream_id,
            from,
            resolve_links,
            self.config.persistent_read_batch_size,
            self.config.persistent_live_buffer_size,
            output_tx,
            cancel_rx,
            self.metrics.clone(),
        ));
        SubscriptionHandle::new(output_rx, cancel_tx, task)
    }

    /// §4.E mode 3: replay the global "all" order from `from_position`
    /// through `filter`, then cross over to live with periodic checkpoints.
    pub fn subscribe_all_filtered(
        &self,
        from_position: LogOffset,
        filter: Arc<Filter>,
    ) -> SubscriptionHandle {
        let (output_tx, output_rx) = mpsc::channel(self.config.subscription_buffer_size);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let task = tokio::spawn(catchup::run_all_filtered(
            self.reader.clone(),
            self.commit_bus.clone(),
            filter,
            from_position,
            DEFAULT_MAX_SEARCH_WINDOW,
            self.config.send_checkpoint_message_count,
            self.config.persistent_live_buffer_size,
            output_tx,
            cancel_rx,
            self.metrics.clone(),
        ));
        SubscriptionHandle::new(output_rx, cancel_tx, task)
    }
}

/// A live handle to a running subscription task. `events` is where push
/// frames arrive; `unsubscribe` is the only way to stop the task, and it is
/// idempotent by construction since it consumes `self`.
pub struct SubscriptionHandle {
    pub events: mpsc::Receiver<SubscriptionEvent>,
    cancel: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SubscriptionHandle {
    fn new(
        events: mpsc::Receiver<SubscriptionEvent>,
        cancel: oneshot::Sender<()>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            events,
            cancel: Some(cancel),
            task: Some(task),
        }
    }

    /// Signals the subscription task to stop and waits for it to finish, so
    /// no `SubscriptionEvent` can be delivered after this returns.
    pub async fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::append::AppendCoordinator;
    use crate::event::Event;
    use crate::index::{IndexConfig, StreamIndex};
    use crate::ids::ExpectedVersion;
    use crate::log::{Log, LogConfig};
    use crate::stream_meta::MetadataStore;

    fn event(event_type: &str, data: &[u8]) -> Event {
        Event::new(crate::ids::EventId::new_v4(), event_type, bytes::Bytes::copy_from_slice(data))
    }

    fn harness(dir: &std::path::Path) -> (SubscriptionDispatcher, Arc<AppendCoordinator>) {
        let log = Arc::new(Log::open(dir, LogConfig::default()).unwrap());
        let index = Arc::new(StreamIndex::open(&dir.join("index"), IndexConfig::default()).unwrap());
        let metadata = Arc::new(MetadataStore::new());
        let commit_bus = CommitBus::new();
        let metrics = Arc::new(StoreMetrics::new_for_test());
        let config = Arc::new(StoreConfig::default());
        let coordinator = Arc::new(AppendCoordinator::new(
            log.clone(),
            index.clone(),
            metadata.clone(),
            commit_bus.clone(),
            (*config).clone(),
            metrics.clone(),
        ));
        let reader = Arc::new(Reader::new(log, index, metadata, metrics.clone(), 128));
        let dispatcher = SubscriptionDispatcher::new(reader, commit_bus, config, metrics);
        (dispatcher, coordinator)
    }

    #[tokio::test]
    async fn catchup_subscription_replays_history_then_crosses_to_live() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, coordinator) = harness(dir.path());
        let stream = StreamId::new("orders-1").unwrap();

        coordinator
            .append(&stream, ExpectedVersion::NoStream, vec![event("Placed", b"a")])
            .unwrap();

        let mut handle = dispatcher.subscribe_catchup(stream.clone(), 0, false);

        match handle.events.recv().await.unwrap() {
            SubscriptionEvent::EventAppeared(e) => assert_eq!(e.event.event_number, 0),
            other => panic!("unexpected frame: {other:?}"),
        }
        match handle.events.recv().await.unwrap() {
            SubscriptionEvent::LiveProcessingStarted => {}
            other => panic!("unexpected frame: {other:?}"),
        }

        coordinator
            .append(&stream, ExpectedVersion::Exact(0), vec![event("Shipped", b"b")])
            .unwrap();

        match handle.events.recv().await.unwrap() {
            SubscriptionEvent::EventAppeared(e) => assert_eq!(e.event.event_number, 1),
            other => panic!("unexpected frame: {other:?}"),
        }

        handle.unsubscribe().await;
    }

    #[tokio::test]
    async fn live_subscription_emits_nothing_before_an_append() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, coordinator) = harness(dir.path());
        let stream = StreamId::new("orders-2").unwrap();

        let mut handle = dispatcher.subscribe_live(None);

        coordinator
            .append(&stream, ExpectedVersion::NoStream, vec![event("Placed", b"a")])
            .unwrap();

        match handle.events.recv().await.unwrap() {
            SubscriptionEvent::EventAppeared(e) => assert_eq!(e.event.stream_id, stream),
            other => panic!("unexpected frame: {other:?}"),
        }

        handle.unsubscribe().await;
    }
}
