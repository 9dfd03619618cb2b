// Copyright (c) Chronicle Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! `chronicle-store`: an append-only, stream-oriented event log with
//! optimistic concurrency, live/catch-up/filtered subscriptions, and
//! server-managed competing-consumer (persistent) subscriptions.
//!
//! The crate is organized around the components named in the system
//! design: a [`log`] of immutable chunks is the source of truth; an
//! [`index`] maps `(stream, event-number)` to a position in it; an
//! [`append`] coordinator is the sole writer; a [`read`] handle serves
//! point/range queries; [`subscription`] and [`persistent`] build push
//! delivery on top of the append coordinator's commit bus.

pub mod append;
pub mod config;
pub mod error;
pub mod event;
pub mod filter;
pub mod ids;
pub mod index;
pub mod log;
pub mod metrics;
pub mod persistent;
pub mod read;
pub mod stream_meta;
pub mod subscription;

pub use append::{AppendCoordinator, AppendOutcome};
pub use config::StoreConfig;
pub use error::{ChronicleError, ChronicleResult, DropReason, FatalError, InputError, TransientError};
pub use event::{Event, EventRecord, ResolvedEvent};
pub use filter::{Filter, FilterSpec, PredicateSpec};
pub use ids::{EventId, EventNumber, ExpectedVersion, LogPosition, StreamId, StreamTail};
pub use index::{IndexConfig, StreamIndex};
pub use log::{Log, LogConfig, LogOffset};
pub use metrics::StoreMetrics;
pub use persistent::{
    CheckpointStore, DispatchStrategy, NackAction, PersistentSession, PersistentSubscriptionEngine,
    PersistentSubscriptionKey, PersistentSubscriptionSettings, StartFrom,
};
pub use read::{AllSlice, ReadEventResult, Reader, StreamSlice};
pub use stream_meta::{MetadataStore, StreamMetadata};
pub use subscription::{SubscriptionDispatcher, SubscriptionEvent, SubscriptionHandle};
