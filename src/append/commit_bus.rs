// Copyright (c) Chronicle Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Internal pub/sub bus the Append Coordinator publishes committed writes
//! on; the Subscription Dispatcher and Persistent Subscription Engine are
//! its consumers. Each subscriber gets its own unbounded queue (mirroring
//! the teacher's per-consumer `unbounded_channel` in `commit_consumer.rs`)
//! so a slow subscriber cannot stall the publisher; subscription-level
//! back-pressure is applied one layer up, by the Subscription Dispatcher.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};

use crate::event::EventRecord;
use crate::ids::{EventNumber, LogPosition, StreamId};

#[derive(Debug, Clone)]
pub struct Committed {
    pub record: EventRecord,
    pub log_position: LogPosition,
    pub first_event_number: EventNumber,
}

struct Subscriber {
    id: u64,
    sender: mpsc::UnboundedSender<Committed>,
}

pub struct CommitBus {
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
    /// Latest published commit position, polled by catch-up subscriptions
    /// deciding whether they have caught up to the live tail.
    tail: watch::Sender<LogPosition>,
}

pub struct CommitSubscription {
    bus: Arc<CommitBus>,
    id: u64,
    pub receiver: mpsc::UnboundedReceiver<Committed>,
}

impl Drop for CommitSubscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}

impl CommitBus {
    pub fn new() -> Arc<Self> {
        let (tail, _) = watch::channel(LogPosition::START);
        Arc::new(Self {
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
            tail,
        })
    }

    pub fn subscribe(self: &Arc<Self>) -> CommitSubscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().push(Subscriber { id, sender: tx });
        CommitSubscription {
            bus: self.clone(),
            id,
            receiver: rx,
        }
    }

    fn unsubscribe(&self, id: u64) {
        self.subscribers.write().retain(|s| s.id != id);
    }

    pub fn tail(&self) -> LogPosition {
        *self.tail.borrow()
    }

    pub fn watch_tail(&self) -> watch::Receiver<LogPosition> {
        self.tail.subscribe()
    }

    /// Publishes to every live subscriber and advances the tail watch.
    /// Subscribers whose receiver has been dropped are pruned lazily on
    /// the next call.
    pub fn publish(&self, committed: Committed) {
        self.tail.send_replace(committed.log_position);
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|s| s.sender.send(committed.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl Default for CommitBus {
    fn default() -> Self {
        let (tail, _) = watch::channel(LogPosition::START);
        Self {
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
            tail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_committed(stream_id: StreamId, event_number: EventNumber, log_position: LogPosition) -> Committed {
        use crate::event::{Event, EventRecord};
        use crate::ids::EventId;
        Committed {
            record: EventRecord {
                stream_id,
                event_number,
                event: Event::new(EventId::new_v4(), "Test", bytes::Bytes::new()),
                log_position,
                created_at_ms: 0,
            },
            log_position,
            first_event_number: event_number,
        }
    }

    #[test]
    fn publish_reaches_all_subscribers() {
        let bus = CommitBus::new();
        let mut sub_a = bus.subscribe();
        let mut sub_b = bus.subscribe();
        let committed = sample_committed(StreamId::new("s").unwrap(), 0, LogPosition::new(10, 0));
        bus.publish(committed.clone());

        assert_eq!(sub_a.receiver.try_recv().unwrap().first_event_number, 0);
        assert_eq!(sub_b.receiver.try_recv().unwrap().first_event_number, 0);
        assert_eq!(bus.tail(), LogPosition::new(10, 0));
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let bus = CommitBus::new();
        let sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
