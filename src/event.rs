// Copyright (c) Chronicle Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::ids::{EventId, EventNumber, LogPosition, StreamId};

/// Immutable event record as appended by a client. `created_at` is stamped
/// by the writer (monotonic wall clock), never by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub event_id: EventId,
    pub event_type: String,
    pub is_json: bool,
    pub data: bytes::Bytes,
    pub metadata: bytes::Bytes,
}

impl Event {
    pub fn new(event_id: EventId, event_type: impl Into<String>, data: bytes::Bytes) -> Self {
        Self {
            event_id,
            event_type: event_type.into(),
            is_json: false,
            data,
            metadata: bytes::Bytes::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: bytes::Bytes) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn json(mut self) -> Self {
        self.is_json = true;
        self
    }

    /// A link event (`$>`) points at `event_number@target_stream`. Used by
    /// the Reader's link resolution and by projections (out of scope here,
    /// but the data shape is part of the on-disk format).
    pub fn is_link(&self) -> bool {
        self.event_type == "$>"
    }

    pub fn link_target(&self) -> Option<(EventNumber, StreamId)> {
        if !self.is_link() {
            return None;
        }
        let text = std::str::from_utf8(&self.data).ok()?;
        let (num, stream) = text.split_once('@')?;
        let num: EventNumber = num.parse().ok()?;
        let stream = StreamId::new(stream.to_string()).ok()?;
        Some((num, stream))
    }
}

/// An event as it exists once committed: the original [`Event`] plus the
/// coordinates assigned by the Append Coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub stream_id: StreamId,
    pub event_number: EventNumber,
    pub event: Event,
    pub log_position: LogPosition,
    pub created_at_ms: u64,
}

impl EventRecord {
    /// Resolve this record if it is an unresolved link, given a lookup
    /// closure that fetches the target record by (stream, event number).
    /// Returns `self` unchanged if it is not a link; returns a
    /// [`ResolvedEvent`] wrapping either the resolved target or a marker
    /// that resolution failed, matching the Reader's `resolve-links`
    /// contract ("if the target is missing return the link with
    /// `is-resolved = false`").
    pub fn resolve_links<F>(self, lookup: F) -> ResolvedEvent
    where
        F: FnOnce(&StreamId, EventNumber) -> Option<EventRecord>,
    {
        if let Some((num, target_stream)) = self.event.link_target() {
            if let Some(target) = lookup(&target_stream, num) {
                return ResolvedEvent {
                    link: Some(self),
                    event: target,
                    is_resolved: true,
                };
            }
            return ResolvedEvent {
                event: self.clone(),
                link: Some(self),
                is_resolved: false,
            };
        }
        ResolvedEvent {
            event: self,
            link: None,
            is_resolved: true,
        }
    }
}

/// Result of applying link resolution to an [`EventRecord`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEvent {
    /// The event ultimately surfaced to the caller: the link's target if
    /// resolution succeeded, otherwise the link itself.
    pub event: EventRecord,
    /// The original link record, if `event` came from a `$>` link.
    pub link: Option<EventRecord>,
    pub is_resolved: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_link_event_has_no_target() {
        let e = Event::new(EventId::new_v4(), "OrderPlaced", bytes::Bytes::from_static(b"{}"));
        assert!(!e.is_link());
        assert_eq!(e.link_target(), None);
    }

    #[test]
    fn link_event_parses_target() {
        let e = Event::new(EventId::new_v4(), "$>", bytes::Bytes::from_static(b"7@orders-1"));
        assert!(e.is_link());
        let (num, stream) = e.link_target().unwrap();
        assert_eq!(num, 7);
        assert_eq!(stream.as_str(), "orders-1");
    }
}
