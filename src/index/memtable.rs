// Copyright (c) Chronicle Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! In-memory tier of the Stream Index: a sorted map from
//! `(stream-hash, event-number)` to log position, plus an exact
//! stream-tail map used to answer `tail()` without touching disk.

use std::collections::BTreeMap;

use dashmap::DashMap;

use crate::ids::{EventNumber, StreamId, StreamTail};
use crate::log::LogOffset;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MemtableKey {
    pub stream_hash: u64,
    pub event_number: EventNumber,
}

#[derive(Default)]
pub struct Memtable {
    /// Candidate log offsets for a given (hash, event-number) pair. Usually
    /// one entry; more than one means a hash collision between streams.
    entries: parking_lot::RwLock<BTreeMap<MemtableKey, Vec<LogOffset>>>,
    tails: DashMap<StreamId, StreamTail>,
    len: std::sync::atomic::AtomicUsize,
}

impl Memtable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, stream_id: &StreamId, event_number: EventNumber, offset: LogOffset) {
        let key = MemtableKey {
            stream_hash: stream_id.hash64(),
            event_number,
        };
        self.entries.write().entry(key).or_default().push(offset);
        self.len.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.tails
            .insert(stream_id.clone(), StreamTail::At(event_number));
    }

    pub fn candidates(&self, stream_id: &StreamId, event_number: EventNumber) -> Vec<LogOffset> {
        let key = MemtableKey {
            stream_hash: stream_id.hash64(),
            event_number,
        };
        self.entries
            .read()
            .get(&key)
            .cloned()
            .unwrap_or_default()
    }

    /// All entries with `event_number` in `[from, from + count)` (or, for
    /// backward scans, in `(from - count, from]`) for the given stream
    /// hash. Returned unordered by caller's desired direction; the caller
    /// sorts.
    pub fn range_candidates(
        &self,
        stream_hash: u64,
        from: EventNumber,
        to_exclusive: EventNumber,
    ) -> Vec<(EventNumber, LogOffset)> {
        let lo = MemtableKey {
            stream_hash,
            event_number: from.min(to_exclusive),
        };
        let hi = MemtableKey {
            stream_hash,
            event_number: from.max(to_exclusive),
        };
        self.entries
            .read()
            .range(lo..=hi)
            .flat_map(|(k, offs)| offs.iter().map(move |o| (k.event_number, *o)))
            .collect()
    }

    pub fn tail(&self, stream_id: &StreamId) -> StreamTail {
        self.tails
            .get(stream_id)
            .map(|r| *r)
            .unwrap_or(StreamTail::NoStream)
    }

    pub fn set_tail(&self, stream_id: &StreamId, tail: StreamTail) {
        self.tails.insert(stream_id.clone(), tail);
    }

    pub fn mark_deleted(&self, stream_id: &StreamId) {
        self.tails.insert(stream_id.clone(), StreamTail::Deleted);
    }

    pub fn len(&self) -> usize {
        self.len.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drains all entries for an out-of-band flush to a new PTable,
    /// leaving the memtable empty. Tail cache is left untouched, it
    /// remains the fast path for `tail()` regardless of what tier backs
    /// `lookup()`.
    pub fn drain_sorted(&self) -> Vec<(MemtableKey, LogOffset)> {
        let mut entries = self.entries.write();
        let drained = std::mem::take(&mut *entries);
        self.len.store(0, std::sync::atomic::Ordering::Relaxed);
        drained
            .into_iter()
            .flat_map(|(k, offs)| offs.into_iter().map(move |o| (k, o)))
            .collect()
    }
}

/// The memtable stores raw log offsets, not [`crate::ids::LogPosition`]
/// pairs -- the commit/prepare pairing is reconstructed by the caller from
/// the dereferenced commit record.
pub type StoredOffset = LogOffset;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_lookup() {
        let mt = Memtable::new();
        let s = StreamId::new("orders-1").unwrap();
        mt.insert(&s, 0, 100);
        mt.insert(&s, 1, 200);
        assert_eq!(mt.candidates(&s, 0), vec![100]);
        assert_eq!(mt.candidates(&s, 1), vec![200]);
        assert_eq!(mt.tail(&s), StreamTail::At(1));
    }

    #[test]
    fn range_candidates_inclusive() {
        let mt = Memtable::new();
        let s = StreamId::new("s").unwrap();
        for i in 0..5 {
            mt.insert(&s, i, i * 10);
        }
        let range = mt.range_candidates(s.hash64(), 1, 3);
        let mut nums: Vec<_> = range.iter().map(|(n, _)| *n).collect();
        nums.sort();
        assert_eq!(nums, vec![1, 2, 3]);
    }

    #[test]
    fn mark_deleted_overrides_tail() {
        let mt = Memtable::new();
        let s = StreamId::new("s").unwrap();
        mt.insert(&s, 0, 0);
        mt.mark_deleted(&s);
        assert_eq!(mt.tail(&s), StreamTail::Deleted);
    }
}
