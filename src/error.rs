// Copyright (c) Chronicle Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::ids::EventNumber;
use thiserror::Error;

/// Errors a client-facing operation can return.
///
/// Mirrors the three-tier taxonomy from the error handling design: input
/// errors are never retried by the server, transient errors may be retried
/// within the caller's deadline, fatal errors stop the affected component.
#[derive(Debug, Error)]
pub enum ChronicleError {
    #[error(transparent)]
    Input(#[from] InputError),

    #[error(transparent)]
    Transient(#[from] TransientError),

    #[error(transparent)]
    Fatal(#[from] FatalError),
}

#[derive(Debug, Error)]
pub enum InputError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("access denied")]
    AccessDenied,

    #[error("stream deleted")]
    StreamDeleted,

    #[error("wrong expected version, current version is {current_version:?}")]
    WrongExpectedVersion { current_version: Option<EventNumber> },

    #[error("not found")]
    NotFound,
}

#[derive(Debug, Error)]
pub enum TransientError {
    #[error("commit timed out")]
    CommitTimeout,

    #[error("not ready")]
    NotReady,

    #[error("too busy")]
    TooBusy,

    #[error("operation timed out")]
    OperationTimeout,
}

#[derive(Debug, Error)]
pub enum FatalError {
    #[error("chunk {chunk} corrupt: {reason}")]
    ChunkCorrupt { chunk: u32, reason: String },

    #[error("index manifest corrupt: {0}")]
    ManifestCorrupt(String),

    #[error("checkpoint inconsistency: {0}")]
    CheckpointInconsistency(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ChronicleResult<T> = Result<T, ChronicleError>;

/// Reasons a live/catch-up subscription can be dropped, per the wire
/// contract's `SubscriptionDropped{reason}` frame. Kept as a plain enum
/// (not part of [`ChronicleError`]) because a drop is delivered to the
/// subscriber out-of-band, not returned from a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Unsubscribed,
    AccessDenied,
    NotFound,
    PersistentSubscriptionDeleted,
    SubscriberMaxCountReached,
    ProcessingQueueOverflow,
    ServerError,
    ConnectionClosed,
}
