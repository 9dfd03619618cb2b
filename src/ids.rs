// Copyright (c) Chronicle Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::cmp::Ordering;
use std::fmt;

/// Non-empty UTF-8 stream name. Names starting with `$` are system streams;
/// the metadata stream for stream `S` is `$$S`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct StreamId(String);

impl StreamId {
    pub fn new(name: impl Into<String>) -> Result<Self, crate::error::InputError> {
        let name = name.into();
        if name.is_empty() {
            return Err(crate::error::InputError::BadRequest(
                "stream id must not be empty".to_string(),
            ));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_system(&self) -> bool {
        self.0.starts_with('$')
    }

    /// The metadata stream name for this stream (`$$S`).
    pub fn metadata_stream(&self) -> StreamId {
        StreamId(format!("$${}", self.0))
    }

    /// A stable 64-bit hash used as the primary key in the stream index.
    /// Collisions are expected and resolved by dereferencing the candidate
    /// log record (see the Stream Index component design).
    pub fn hash64(&self) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.0.hash(&mut hasher);
        hasher.finish()
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for StreamId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Dense, non-negative per-stream sequence number starting at 0.
pub type EventNumber = i64;

/// Caller's claim about a stream's tail at write time, checked for
/// optimistic concurrency on append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    Any,
    NoStream,
    StreamExists,
    Exact(EventNumber),
}

impl ExpectedVersion {
    pub const ANY: i64 = -2;
    pub const NO_STREAM: i64 = -1;
    pub const STREAM_EXISTS: i64 = -4;

    pub fn from_raw(raw: i64) -> Self {
        match raw {
            Self::ANY => ExpectedVersion::Any,
            Self::NO_STREAM => ExpectedVersion::NoStream,
            Self::STREAM_EXISTS => ExpectedVersion::StreamExists,
            n if n >= 0 => ExpectedVersion::Exact(n),
            _ => ExpectedVersion::Any,
        }
    }

    pub fn to_raw(self) -> i64 {
        match self {
            ExpectedVersion::Any => Self::ANY,
            ExpectedVersion::NoStream => Self::NO_STREAM,
            ExpectedVersion::StreamExists => Self::STREAM_EXISTS,
            ExpectedVersion::Exact(n) => n,
        }
    }
}

/// Current tail of a stream as tracked by the Append Coordinator / Stream
/// Index, or one of the two terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTail {
    NoStream,
    Deleted,
    At(EventNumber),
}

/// Byte offset pair into the global transaction log. `commit` defines the
/// global "all" order; ties break on `prepare`. Strictly increasing on the
/// writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct LogPosition {
    pub commit: i64,
    pub prepare: i64,
}

impl LogPosition {
    pub const START: LogPosition = LogPosition {
        commit: 0,
        prepare: 0,
    };

    pub fn new(commit: i64, prepare: i64) -> Self {
        Self { commit, prepare }
    }
}

impl PartialOrd for LogPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LogPosition {
    fn cmp(&self, other: &Self) -> Ordering {
        self.commit
            .cmp(&other.commit)
            .then_with(|| self.prepare.cmp(&other.prepare))
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.commit, self.prepare)
    }
}

/// Client-supplied 128-bit unique event identifier.
pub type EventId = uuid::Uuid;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_stream_name() {
        let s = StreamId::new("orders-1").unwrap();
        assert_eq!(s.metadata_stream().as_str(), "$$orders-1");
    }

    #[test]
    fn system_stream_detection() {
        assert!(StreamId::new("$stats").unwrap().is_system());
        assert!(!StreamId::new("orders-1").unwrap().is_system());
    }

    #[test]
    fn expected_version_roundtrip() {
        for raw in [-2, -1, -4, 0, 5, 1000] {
            let v = ExpectedVersion::from_raw(raw);
            assert_eq!(v.to_raw(), raw);
        }
    }

    #[test]
    fn log_position_ordering() {
        let a = LogPosition::new(10, 0);
        let b = LogPosition::new(10, 5);
        let c = LogPosition::new(11, 0);
        assert!(a < b);
        assert!(b < c);
    }
}
