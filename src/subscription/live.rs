// Copyright (c) Chronicle Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Live subscriptions (§4.E mode 1): forward every `Committed` message
//! published after registration, in commit order, exactly once per
//! subscription.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::append::commit_bus::CommitBus;
use crate::error::DropReason;
use crate::event::ResolvedEvent;
use crate::filter::Filter;
use crate::metrics::StoreMetrics;

use super::{try_deliver, SubscriptionEvent};

pub(super) async fn run(
    commit_bus: Arc<CommitBus>,
    filter: Option<Arc<Filter>>,
    output: mpsc::Sender<SubscriptionEvent>,
    mut cancel: oneshot::Receiver<()>,
    metrics: Arc<StoreMetrics>,
) {
    let mut subscription = commit_bus.subscribe();
    metrics.active_live_subscriptions.inc();

    loop {
        tokio::select! {
            biased;
            _ = &mut cancel => break,
            maybe = subscription.receiver.recv() => {
                let Some(committed) = maybe else { break };
                if let Some(filter) = &filter {
                    if !filter.matches(&committed.record.stream_id, &committed.record.event.event_type) {
                        continue;
                    }
                }
                let resolved = ResolvedEvent {
                    event: committed.record,
                    link: None,
                    is_resolved: true,
                };
                if !try_deliver(&output, &metrics, SubscriptionEvent::EventAppeared(resolved), DropReason::SubscriberMaxCountReached) {
                    break;
                }
            }
        }
    }

    debug!("live subscription stopped");
    metrics.active_live_subscriptions.dec();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::append::commit_bus::Committed;
    use crate::event::{Event, EventRecord};
    use crate::ids::{EventId, LogPosition, StreamId};
    use crate::filter::FilterSpec;

    fn committed(stream: &str, event_type: &str) -> Committed {
        let stream_id = StreamId::new(stream).unwrap();
        Committed {
            record: EventRecord {
                stream_id,
                event_number: 0,
                event: Event::new(EventId::new_v4(), event_type, bytes::Bytes::new()),
                log_position: LogPosition::new(10, 0),
                created_at_ms: 0,
            },
            log_position: LogPosition::new(10, 0),
            first_event_number: 0,
        }
    }

    #[tokio::test]
    async fn forwards_matching_commits_only() {
        let bus = CommitBus::new();
        let (output_tx, mut output_rx) = mpsc::channel(8);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let metrics = Arc::new(StoreMetrics::new_for_test());
        let filter = Some(Arc::new(Filter::compile(&FilterSpec::stream_prefix("billing-")).unwrap()));

        let task = tokio::spawn(run(bus.clone(), filter, output_tx, cancel_rx, metrics));

        bus.publish(committed("orders-1", "Placed"));
        bus.publish(committed("billing-1", "Invoiced"));

        match output_rx.recv().await.unwrap() {
            SubscriptionEvent::EventAppeared(e) => assert_eq!(e.event.stream_id.as_str(), "billing-1"),
            other => panic!("unexpected frame: {other:?}"),
        }

        let _ = cancel_tx.send(());
        let _ = task.await;
    }
}
