// Copyright (c) Chronicle Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The Persistent Subscription Engine (component F): server-managed,
//! competing-consumer delivery with acknowledgement tracking, retries, a
//! park buffer, and its own checkpoint stream (§4.F).

pub mod checkpoint;
pub mod group;
pub mod session;

pub use checkpoint::{checkpoint_stream_name, parked_stream_name, CheckpointStore};
pub use group::{DispatchStrategy, PersistentSubscriptionKey, PersistentSubscriptionSettings, StartFrom};
pub use session::{NackAction, PersistentSession, PersistentSubscriptionEngine};
