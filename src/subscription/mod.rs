// Copyright (c) Chronicle Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The Subscription Dispatcher (component E): live subscriptions, catch-up
//! (historical then live), and filtered all-stream subscriptions with
//! periodic checkpoints (§4.E).

pub mod catchup;
pub mod dispatcher;
pub mod live;

pub use dispatcher::{SubscriptionDispatcher, SubscriptionHandle};

use tokio::sync::mpsc;

use crate::error::DropReason;
use crate::event::ResolvedEvent;
use crate::ids::LogPosition;
use crate::metrics::StoreMetrics;

/// A push frame delivered to a subscriber, matching the wire contract's
/// `EventAppeared`/`Checkpoint`/`SubscriptionDropped` frames (§6) minus the
/// transport framing itself.
#[derive(Debug, Clone)]
pub enum SubscriptionEvent {
    EventAppeared(ResolvedEvent),
    Checkpoint(LogPosition),
    LiveProcessingStarted,
    Dropped(DropReason),
}

/// Attempts to deliver `event` to a subscriber's bounded output queue. On
/// overflow, records the drop and pushes a best-effort `Dropped(reason)`
/// frame so the client knows why its channel went silent. Returns `false`
/// when the dispatch task should stop (overflow, or the receiver is gone).
pub(super) fn try_deliver(
    output: &mpsc::Sender<SubscriptionEvent>,
    metrics: &StoreMetrics,
    event: SubscriptionEvent,
    overflow_reason: DropReason,
) -> bool {
    match output.try_send(event) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            let label = drop_reason_label(overflow_reason);
            metrics.subscription_drops_total.with_label_values(&[label]).inc();
            let _ = output.try_send(SubscriptionEvent::Dropped(overflow_reason));
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

fn drop_reason_label(reason: DropReason) -> &'static str {
    match reason {
        DropReason::Unsubscribed => "Unsubscribed",
        DropReason::AccessDenied => "AccessDenied",
        DropReason::NotFound => "NotFound",
        DropReason::PersistentSubscriptionDeleted => "PersistentSubscriptionDeleted",
        DropReason::SubscriberMaxCountReached => "SubscriberMaxCountReached",
        DropReason::ProcessingQueueOverflow => "ProcessingQueueOverflow",
        DropReason::ServerError => "ServerError",
        DropReason::ConnectionClosed => "ConnectionClosed",
    }
}
