// Copyright (c) Chronicle Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Catch-up (§4.E mode 2) and filtered all-stream (§4.E mode 3)
//! subscriptions: replay history via the Reader, then cross over to the
//! commit bus without a gap or a duplicate.
//!
//! Both share the same three-phase shape (`Reading` → `CatchingUpLive` →
//! `Live`) but key their cursor and de-duplication differently: per-stream
//! catch-up by `EventNumber`, filtered all-stream by `LogPosition`. Kept as
//! two concrete functions rather than one generalized over the key type —
//! the de-dup/checkpoint logic differs enough (all-stream also counts
//! examined-but-filtered-out records) that a shared abstraction would cost
//! more than it saves.

use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::append::commit_bus::{CommitBus, Committed};
use crate::error::DropReason;
use crate::event::ResolvedEvent;
use crate::filter::Filter;
use crate::ids::{EventNumber, LogPosition, StreamId};
use crate::log::LogOffset;
use crate::metrics::StoreMetrics;
use crate::read::Reader;

use super::{try_deliver, SubscriptionEvent};

/// Per-stream catch-up subscription (§4.E mode 2, §8 scenario 3).
#[allow(clippy::too_many_arguments)]
pub(super) async fn run_stream(
    reader: Arc<Reader>,
    commit_bus: Arc<CommitBus>,
    stream_id: StreamId,
    from: EventNumber,
    resolve_links: bool,
    read_batch_size: usize,
    live_buffer_capacity: usize,
    output: mpsc::Sender<SubscriptionEvent>,
    mut cancel: oneshot::Receiver<()>,
    metrics: Arc<StoreMetrics>,
) {
    metrics.active_catchup_subscriptions.inc();
    let mut cursor = from;
    let mut last_delivered = from - 1;

    // Reading: drain history in batches until the Reader reports the
    // current tail.
    loop {
        if cancel.try_recv().is_ok() {
            metrics.active_catchup_subscriptions.dec();
            return;
        }
        let slice = match reader.read_stream_forward(&stream_id, cursor, read_batch_size.max(1), resolve_links) {
            Ok(slice) => slice,
            Err(e) => {
                warn!(stream = %stream_id, error = %e, "catch-up read failed");
                try_deliver(&output, &metrics, SubscriptionEvent::Dropped(DropReason::ServerError), DropReason::ServerError);
                metrics.active_catchup_subscriptions.dec();
                return;
            }
        };
        for event in slice.events {
            last_delivered = event.event.event_number;
            if !try_deliver(&output, &metrics, SubscriptionEvent::EventAppeared(event), DropReason::SubscriberMaxCountReached) {
                metrics.active_catchup_subscriptions.dec();
                return;
            }
        }
        cursor = slice.next_event_number;
        if slice.is_end_of_stream {
            break;
        }
    }

    // CatchingUpLive: subscribe to the bus first, then close the remaining
    // gap with one more historical read so nothing committed between the
    // last Reading-phase slice and this subscribe is missed.
    let mut commit_sub = commit_bus.subscribe();
    let mut live_buffer: VecDeque<Committed> = VecDeque::new();

    let gap = match reader.read_stream_forward(&stream_id, cursor, read_batch_size.max(1) * 64, resolve_links) {
        Ok(slice) => slice,
        Err(e) => {
            warn!(stream = %stream_id, error = %e, "catch-up gap read failed");
            try_deliver(&output, &metrics, SubscriptionEvent::Dropped(DropReason::ServerError), DropReason::ServerError);
            metrics.active_catchup_subscriptions.dec();
            return;
        }
    };
    for event in gap.events {
        if event.event.event_number > last_delivered {
            last_delivered = event.event.event_number;
            if !try_deliver(&output, &metrics, SubscriptionEvent::EventAppeared(event), DropReason::SubscriberMaxCountReached) {
                metrics.active_catchup_subscriptions.dec();
                return;
            }
        }
    }

    // Drain whatever the bus buffered while we were reading, de-duplicating
    // anything already covered by the gap read.
    loop {
        match commit_sub.receiver.try_recv() {
            Ok(committed) => {
                if committed.record.stream_id != stream_id || committed.record.event_number <= last_delivered {
                    continue;
                }
                if live_buffer.len() >= live_buffer_capacity {
                    try_deliver(&output, &metrics, SubscriptionEvent::Dropped(DropReason::ProcessingQueueOverflow), DropReason::ProcessingQueueOverflow);
                    metrics.active_catchup_subscriptions.dec();
                    return;
                }
                live_buffer.push_back(committed);
            }
            Err(_) => break,
        }
    }

    // Live: emit the boundary marker once, then drain the buffer before
    // forwarding the bus directly.
    if !try_deliver(&output, &metrics, SubscriptionEvent::LiveProcessingStarted, DropReason::SubscriberMaxCountReached) {
        metrics.active_catchup_subscriptions.dec();
        return;
    }
    while let Some(committed) = live_buffer.pop_front() {
        if committed.record.event_number <= last_delivered {
            continue;
        }
        last_delivered = committed.record.event_number;
        let resolved = reader.resolve_record(committed.record, resolve_links);
        if !try_deliver(&output, &metrics, SubscriptionEvent::EventAppeared(resolved), DropReason::SubscriberMaxCountReached) {
            metrics.active_catchup_subscriptions.dec();
            return;
        }
    }

    loop {
        tokio::select! {
            biased;
            _ = &mut cancel => break,
            maybe = commit_sub.receiver.recv() => {
                let Some(committed) = maybe else { break };
                if committed.record.stream_id != stream_id || committed.record.event_number <= last_delivered {
                    continue;
                }
                last_delivered = committed.record.event_number;
                let resolved = reader.resolve_record(committed.record, resolve_links);
                if !try_deliver(&output, &metrics, SubscriptionEvent::EventAppeared(resolved), DropReason::SubscriberMaxCountReached) {
                    break;
                }
            }
        }
    }

    debug!(stream = %stream_id, "catch-up subscription stopped");
    metrics.active_catchup_subscriptions.dec();
}

fn handle_filtered_commit(
    committed: Committed,
    filter: &Filter,
    last_delivered: &mut Option<LogPosition>,
    examined_since_checkpoint: &mut u64,
    send_checkpoint_message_count: u64,
    output: &mpsc::Sender<SubscriptionEvent>,
    metrics: &StoreMetrics,
) -> ControlFlow<()> {
    *examined_since_checkpoint += 1;
    if filter.matches(&committed.record.stream_id, &committed.record.event.event_type)
        && last_delivered.map_or(true, |lp| committed.log_position > lp)
    {
        *last_delivered = Some(committed.log_position);
        let resolved = ResolvedEvent {
            event: committed.record,
            link: None,
            is_resolved: true,
        };
        if !try_deliver(output, metrics, SubscriptionEvent::EventAppeared(resolved), DropReason::SubscriberMaxCountReached) {
            return ControlFlow::Break(());
        }
    }
    if *examined_since_checkpoint >= send_checkpoint_message_count.max(1) {
        *examined_since_checkpoint = 0;
        let position = last_delivered.unwrap_or(LogPosition::START);
        if !try_deliver(output, metrics, SubscriptionEvent::Checkpoint(position), DropReason::SubscriberMaxCountReached) {
            return ControlFlow::Break(());
        }
    }
    ControlFlow::Continue(())
}

/// Filtered all-stream subscription (§4.E mode 3, §8 scenario 4).
#[allow(clippy::too_many_arguments)]
pub(super) async fn run_all_filtered(
    reader: Arc<Reader>,
    commit_bus: Arc<CommitBus>,
    filter: Arc<Filter>,
    from_position: LogOffset,
    max_search_window: usize,
    send_checkpoint_message_count: u64,
    live_buffer_capacity: usize,
    output: mpsc::Sender<SubscriptionEvent>,
    mut cancel: oneshot::Receiver<()>,
    metrics: Arc<StoreMetrics>,
) {
    metrics.active_catchup_subscriptions.inc();
    let mut cursor = from_position;
    let mut last_delivered: Option<LogPosition> = None;
    let window = max_search_window.max(256);

    loop {
        if cancel.try_recv().is_ok() {
            metrics.active_catchup_subscriptions.dec();
            return;
        }
        let slice = match reader.read_all_forward(cursor, 256, Some(&filter), window) {
            Ok(slice) => slice,
            Err(e) => {
                warn!(error = %e, "filtered all-stream read failed");
                try_deliver(&output, &metrics, SubscriptionEvent::Dropped(DropReason::ServerError), DropReason::ServerError);
                metrics.active_catchup_subscriptions.dec();
                return;
            }
        };
        for (position, event) in slice.events {
            last_delivered = Some(position);
            if !try_deliver(&output, &metrics, SubscriptionEvent::EventAppeared(event), DropReason::SubscriberMaxCountReached) {
                metrics.active_catchup_subscriptions.dec();
                return;
            }
        }
        cursor = slice.next_position;
        if slice.is_end_of_stream {
            break;
        }
    }

    let mut commit_sub = commit_bus.subscribe();
    let mut live_buffer: VecDeque<Committed> = VecDeque::new();

    let gap = match reader.read_all_forward(cursor, usize::MAX, Some(&filter), usize::MAX) {
        Ok(slice) => slice,
        Err(e) => {
            warn!(error = %e, "filtered all-stream gap read failed");
            try_deliver(&output, &metrics, SubscriptionEvent::Dropped(DropReason::ServerError), DropReason::ServerError);
            metrics.active_catchup_subscriptions.dec();
            return;
        }
    };
    for (position, event) in gap.events {
        if last_delivered.map_or(true, |lp| position > lp) {
            last_delivered = Some(position);
            if !try_deliver(&output, &metrics, SubscriptionEvent::EventAppeared(event), DropReason::SubscriberMaxCountReached) {
                metrics.active_catchup_subscriptions.dec();
                return;
            }
        }
    }

    loop {
        match commit_sub.receiver.try_recv() {
            Ok(committed) => {
                if live_buffer.len() >= live_buffer_capacity {
                    try_deliver(&output, &metrics, SubscriptionEvent::Dropped(DropReason::ProcessingQueueOverflow), DropReason::ProcessingQueueOverflow);
                    metrics.active_catchup_subscriptions.dec();
                    return;
                }
                live_buffer.push_back(committed);
            }
            Err(_) => break,
        }
    }

    if !try_deliver(&output, &metrics, SubscriptionEvent::LiveProcessingStarted, DropReason::SubscriberMaxCountReached) {
        metrics.active_catchup_subscriptions.dec();
        return;
    }

    let mut examined_since_checkpoint: u64 = 0;
    while let Some(committed) = live_buffer.pop_front() {
        if handle_filtered_commit(
            committed,
            &filter,
            &mut last_delivered,
            &mut examined_since_checkpoint,
            send_checkpoint_message_count,
            &output,
            &metrics,
        )
        .is_break()
        {
            metrics.active_catchup_subscriptions.dec();
            return;
        }
    }

    loop {
        tokio::select! {
            biased;
            _ = &mut cancel => break,
            maybe = commit_sub.receiver.recv() => {
                let Some(committed) = maybe else { break };
                if handle_filtered_commit(
                    committed,
                    &filter,
                    &mut last_delivered,
                    &mut examined_since_checkpoint,
                    send_checkpoint_message_count,
                    &output,
                    &metrics,
                )
                .is_break()
                {
                    break;
                }
            }
        }
    }

    debug!("filtered all-stream subscription stopped");
    metrics.active_catchup_subscriptions.dec();
}
