// Copyright (c) Chronicle Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Point and range reads, in both the per-stream and global "all" order
//! (§4.D). A `Reader` is a cheap, `Arc`-only handle: any worker can
//! construct/clone one, since the Append Coordinator is the only component
//! that needs exclusive access to the log's writable tail.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use lru::LruCache;
use parking_lot::Mutex;

use crate::error::{ChronicleResult, InputError};
use crate::event::{EventRecord, ResolvedEvent};
use crate::filter::Filter;
use crate::ids::{EventNumber, LogPosition, StreamId, StreamTail};
use crate::index::StreamIndex;
use crate::log::record;
use crate::log::{Log, LogOffset};
use crate::metrics::StoreMetrics;
use crate::stream_meta::MetadataStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadEventResult {
    Found(ResolvedEvent),
    NotFound,
    NoStream,
    StreamDeleted,
}

/// A bounded slice of one stream's events, per §4.D "read-stream-forward/
/// backward".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSlice {
    pub events: Vec<ResolvedEvent>,
    /// Event number to resume from on the next call in the same direction.
    pub next_event_number: EventNumber,
    pub is_end_of_stream: bool,
    /// Tail version at read time, `None` if the stream does not exist.
    pub tail_event_number: Option<EventNumber>,
}

/// A bounded slice of the global "all" order, per §4.D "read-all-forward/
/// backward". `position` is a byte offset into the log (the glossary's
/// "commit position"), the same coordinate `Log::scan_forward/backward`
/// resume from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllSlice {
    pub events: Vec<(LogPosition, ResolvedEvent)>,
    pub next_position: LogOffset,
    pub is_end_of_stream: bool,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn tail_event_number(tail: StreamTail) -> Option<EventNumber> {
    match tail {
        StreamTail::At(n) => Some(n),
        _ => None,
    }
}

fn is_deleted(metadata: &MetadataStore, index: &StreamIndex, stream_id: &StreamId) -> bool {
    metadata.is_tombstoned(stream_id) || matches!(index.tail(stream_id), StreamTail::Deleted)
}

pub struct Reader {
    log: Arc<Log>,
    index: Arc<StreamIndex>,
    metadata: Arc<MetadataStore>,
    metrics: Arc<StoreMetrics>,
    cache: Arc<Mutex<LruCache<LogOffset, EventRecord>>>,
}

impl Clone for Reader {
    fn clone(&self) -> Self {
        Self {
            log: self.log.clone(),
            index: self.index.clone(),
            metadata: self.metadata.clone(),
            metrics: self.metrics.clone(),
            cache: self.cache.clone(),
        }
    }
}

impl Reader {
    pub fn new(log: Arc<Log>, index: Arc<StreamIndex>, metadata: Arc<MetadataStore>, metrics: Arc<StoreMetrics>, cache_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_capacity).unwrap_or(NonZeroUsize::new(1).unwrap());
        Self {
            log,
            index,
            metadata,
            metrics,
            cache: Arc::new(Mutex::new(LruCache::new(capacity))),
        }
    }

    /// Decodes the record at `offset`, going through the cache first.
    fn record_at(&self, offset: LogOffset) -> ChronicleResult<EventRecord> {
        if let Some(hit) = self.cache.lock().get(&offset) {
            self.metrics.reader_cache_hits_total.inc();
            return Ok(hit.clone());
        }
        self.metrics.reader_cache_misses_total.inc();
        let (body, next) = self.log.read(offset)?;
        let prepare = body.prepare().ok_or_else(|| crate::error::FatalError::ChunkCorrupt {
            chunk: 0,
            reason: format!("record at offset {offset} has no prepare body"),
        })?.clone();
        // Single-event appends combine prepare and commit in one record, so
        // the commit's own offset is `offset` itself. Multi-event batches
        // write bare prepares first; the batch's single writer guarantees
        // its commit is the next record sharing this `transaction_position`
        // (no other transaction can interleave while the write lock is
        // held), so we scan forward to find it.
        let commit = match body.commit() {
            Some(commit) => *commit,
            None => self.find_commit_after(next, prepare.transaction_position)?,
        };
        let log_position = LogPosition::new(commit.log_position, offset);
        let record = EventRecord {
            stream_id: prepare.stream_id.clone(),
            event_number: prepare.event_number,
            event: crate::event::Event {
                event_id: prepare.event_id,
                event_type: prepare.event_type.clone(),
                is_json: prepare.is_json,
                data: prepare.data.clone(),
                metadata: prepare.metadata.clone(),
            },
            log_position,
            created_at_ms: prepare.created_at_ms,
        };
        self.cache.lock().put(offset, record.clone());
        Ok(record)
    }

    fn find_commit_after(&self, from: LogOffset, transaction_position: i64) -> ChronicleResult<record::CommitBody> {
        for item in self.log.scan_forward(from) {
            let (_offset, body) = item?;
            if let Some(commit) = body.commit() {
                if commit.transaction_position == transaction_position {
                    return Ok(*commit);
                }
            }
        }
        Err(crate::error::FatalError::ChunkCorrupt {
            chunk: 0,
            reason: format!("no commit found for transaction at {transaction_position}"),
        }
        .into())
    }

    /// Looks up `(stream, event_number)` in the index and dereferences the
    /// first candidate whose decoded record actually matches the stream
    /// name, disambiguating `stream-hash` collisions (§4.B).
    fn lookup_record(&self, stream_id: &StreamId, event_number: EventNumber) -> ChronicleResult<Option<EventRecord>> {
        for offset in self.index.lookup(stream_id, event_number)? {
            let record = self.record_at(offset)?;
            if &record.stream_id == stream_id && record.event_number == event_number {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    fn resolve(&self, record: EventRecord, resolve_links: bool) -> ResolvedEvent {
        if !resolve_links {
            return ResolvedEvent {
                event: record,
                link: None,
                is_resolved: true,
            };
        }
        record.resolve_links(|stream, number| self.lookup_record(stream, number).ok().flatten())
    }

    /// Resolves a bare record the way `read_event`/`read_stream` do, for
    /// callers (the Subscription Dispatcher, the Persistent Subscription
    /// Engine) that receive unresolved records straight off the commit bus.
    pub fn resolve_record(&self, record: EventRecord, resolve_links: bool) -> ResolvedEvent {
        self.resolve(record, resolve_links)
    }

    /// Current tail of `stream_id`, for callers that need to decide a
    /// starting cursor (e.g. a persistent subscription's `start-from: live`).
    pub fn stream_tail(&self, stream_id: &StreamId) -> StreamTail {
        self.index.tail(stream_id)
    }

    pub fn read_event(&self, stream_id: &StreamId, event_number: EventNumber, resolve_links: bool) -> ChronicleResult<ReadEventResult> {
        if is_deleted(&self.metadata, &self.index, stream_id) {
            return Ok(ReadEventResult::StreamDeleted);
        }
        let tail = self.index.tail(stream_id);
        if matches!(tail, StreamTail::NoStream) {
            return Ok(ReadEventResult::NoStream);
        }
        let Some(record) = self.lookup_record(stream_id, event_number)? else {
            return Ok(ReadEventResult::NotFound);
        };
        let meta = self.metadata.get(stream_id);
        let tail_number = tail_event_number(tail).unwrap_or(event_number);
        if !meta.is_visible(event_number, record.created_at_ms, now_ms(), tail_number) {
            return Ok(ReadEventResult::NotFound);
        }
        Ok(ReadEventResult::Found(self.resolve(record, resolve_links)))
    }

    fn read_stream(
        &self,
        stream_id: &StreamId,
        from: EventNumber,
        count: usize,
        resolve_links: bool,
        forward: bool,
    ) -> ChronicleResult<StreamSlice> {
        if is_deleted(&self.metadata, &self.index, stream_id) {
            return Err(InputError::StreamDeleted.into());
        }
        let tail = self.index.tail(stream_id);
        let tail_number = tail_event_number(tail);

        let empty = |next: EventNumber| StreamSlice {
            events: Vec::new(),
            next_event_number: next,
            is_end_of_stream: true,
            tail_event_number: tail_number,
        };

        let Some(tail_number) = tail_number else {
            return Ok(empty(from));
        };
        if forward && from > tail_number {
            return Ok(empty(from));
        }
        if !forward && from < 0 {
            return Ok(empty(-1));
        }

        let (range_from, range_to_exclusive) = if forward {
            let to = from.saturating_add(count as i64).min(tail_number + 1);
            (from, to)
        } else {
            let to = from.saturating_add(1).min(tail_number + 1);
            let span = (count as i64).min(to);
            (to - span, to)
        };

        let entries = self.index.range(stream_id, range_from, range_to_exclusive)?;
        let meta = self.metadata.get(stream_id);
        let now = now_ms();
        let mut events = Vec::with_capacity(entries.len());
        let iter: Box<dyn Iterator<Item = (EventNumber, LogOffset)>> = if forward {
            Box::new(entries.into_iter())
        } else {
            Box::new(entries.into_iter().rev())
        };
        for (number, offset) in iter {
            let record = self.record_at(offset)?;
            if &record.stream_id != stream_id || record.event_number != number {
                continue;
            }
            if !meta.is_visible(number, record.created_at_ms, now, tail_number) {
                continue;
            }
            events.push(self.resolve(record, resolve_links));
        }

        let next_event_number = if forward { range_to_exclusive } else { range_from - 1 };
        let is_end_of_stream = if forward {
            range_to_exclusive > tail_number
        } else {
            range_from <= 0
        };

        Ok(StreamSlice {
            events,
            next_event_number,
            is_end_of_stream,
            tail_event_number: Some(tail_number),
        })
    }

    pub fn read_stream_forward(&self, stream_id: &StreamId, from: EventNumber, count: usize, resolve_links: bool) -> ChronicleResult<StreamSlice> {
        self.read_stream(stream_id, from, count, resolve_links, true)
    }

    pub fn read_stream_backward(&self, stream_id: &StreamId, from: EventNumber, count: usize, resolve_links: bool) -> ChronicleResult<StreamSlice> {
        self.read_stream(stream_id, from, count, resolve_links, false)
    }

    fn read_all(
        &self,
        position: LogOffset,
        max_count: usize,
        filter: Option<&Filter>,
        max_search_window: usize,
        forward: bool,
    ) -> ChronicleResult<AllSlice> {
        let writer_position = self.log.writer_position();
        if forward && position >= writer_position {
            return Ok(AllSlice {
                events: Vec::new(),
                next_position: writer_position,
                is_end_of_stream: true,
            });
        }
        if !forward && position <= 0 {
            return Ok(AllSlice {
                events: Vec::new(),
                next_position: 0,
                is_end_of_stream: true,
            });
        }

        let mut events = Vec::new();
        let mut examined = 0usize;
        let mut cursor = position;
        let mut is_end_of_stream = false;

        if forward {
            for item in self.log.scan_forward(position) {
                if examined >= max_search_window || events.len() >= max_count {
                    break;
                }
                let (offset, body) = item?;
                cursor = offset;
                let Some(prepare) = body.prepare() else {
                    continue;
                };
                examined += 1;
                if filter.map_or(false, |f| !f.matches(&prepare.stream_id, &prepare.event_type)) {
                    continue;
                }
                let record = self.record_at(offset)?;
                let meta = self.metadata.get(&record.stream_id);
                if is_deleted(&self.metadata, &self.index, &record.stream_id) {
                    continue;
                }
                let tail_number = tail_event_number(self.index.tail(&record.stream_id)).unwrap_or(record.event_number);
                if !meta.is_visible(record.event_number, record.created_at_ms, now_ms(), tail_number) {
                    continue;
                }
                let position = record.log_position;
                events.push((position, self.resolve(record, false)));
            }
            let next_position = if examined == 0 && events.is_empty() {
                writer_position
            } else {
                self.log.read(cursor).map(|(_, next)| next).unwrap_or(writer_position)
            };
            is_end_of_stream = next_position >= writer_position;
            return Ok(AllSlice {
                events,
                next_position,
                is_end_of_stream,
            });
        }

        for item in self.log.scan_backward(position) {
            if examined >= max_search_window || events.len() >= max_count {
                break;
            }
            let (offset, body) = item?;
            cursor = offset;
            let Some(prepare) = body.prepare() else {
                continue;
            };
            examined += 1;
            if filter.map_or(false, |f| !f.matches(&prepare.stream_id, &prepare.event_type)) {
                continue;
            }
            let record = self.record_at(offset)?;
            if is_deleted(&self.metadata, &self.index, &record.stream_id) {
                continue;
            }
            let meta = self.metadata.get(&record.stream_id);
            let tail_number = tail_event_number(self.index.tail(&record.stream_id)).unwrap_or(record.event_number);
            if !meta.is_visible(record.event_number, record.created_at_ms, now_ms(), tail_number) {
                continue;
            }
            let position = record.log_position;
            events.push((position, self.resolve(record, false)));
        }
        let next_position = cursor;
        is_end_of_stream = next_position <= 0;
        Ok(AllSlice {
            events,
            next_position,
            is_end_of_stream,
        })
    }

    pub fn read_all_forward(&self, position: LogOffset, max_count: usize, filter: Option<&Filter>, max_search_window: usize) -> ChronicleResult<AllSlice> {
        self.read_all(position, max_count, filter, max_search_window, true)
    }

    pub fn read_all_backward(&self, position: LogOffset, max_count: usize, filter: Option<&Filter>, max_search_window: usize) -> ChronicleResult<AllSlice> {
        self.read_all(position, max_count, filter, max_search_window, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::append::commit_bus::CommitBus;
    use crate::append::AppendCoordinator;
    use crate::config::StoreConfig;
    use crate::event::Event;
    use crate::ids::{EventId, ExpectedVersion};
    use crate::index::{IndexConfig, StreamIndex};
    use crate::log::LogConfig;

    fn harness(dir: &std::path::Path) -> (AppendCoordinator, Reader, Arc<MetadataStore>) {
        let log = Arc::new(Log::open(dir, LogConfig::default()).unwrap());
        let index = Arc::new(StreamIndex::open(&dir.join("index"), IndexConfig::default()).unwrap());
        let metadata = Arc::new(MetadataStore::new());
        let commit_bus = CommitBus::new();
        let metrics = Arc::new(StoreMetrics::new_for_test());
        let coordinator = AppendCoordinator::new(
            log.clone(),
            index.clone(),
            metadata.clone(),
            commit_bus,
            StoreConfig::default(),
            metrics.clone(),
        );
        let reader = Reader::new(log, index, metadata.clone(), metrics, 128);
        (coordinator, reader, metadata)
    }

    fn event(event_type: &str, data: &'static [u8]) -> Event {
        Event::new(EventId::new_v4(), event_type, bytes::Bytes::from_static(data))
    }

    #[test]
    fn read_event_on_nonexistent_stream_is_no_stream() {
        let dir = tempfile::tempdir().unwrap();
        let (_coordinator, reader, _metadata) = harness(dir.path());
        let s = StreamId::new("s").unwrap();
        assert_eq!(reader.read_event(&s, 0, false).unwrap(), ReadEventResult::NoStream);
    }

    #[test]
    fn read_event_finds_appended_event() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, reader, _metadata) = harness(dir.path());
        let s = StreamId::new("s").unwrap();
        coordinator.append(&s, ExpectedVersion::NoStream, vec![event("Evt", b"x")]).unwrap();

        match reader.read_event(&s, 0, false).unwrap() {
            ReadEventResult::Found(resolved) => assert_eq!(resolved.event.event_number, 0),
            other => panic!("expected Found, got {other:?}"),
        }
        assert_eq!(reader.read_event(&s, 1, false).unwrap(), ReadEventResult::NotFound);
    }

    #[test]
    fn read_stream_forward_returns_batch_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, reader, _metadata) = harness(dir.path());
        let s = StreamId::new("s").unwrap();
        let batch = vec![event("A", b"1"), event("B", b"2"), event("C", b"3")];
        coordinator.append(&s, ExpectedVersion::NoStream, batch).unwrap();

        let slice = reader.read_stream_forward(&s, 0, 10, false).unwrap();
        assert_eq!(slice.events.len(), 3);
        assert!(slice.is_end_of_stream);
        assert_eq!(slice.tail_event_number, Some(2));
        for (i, resolved) in slice.events.iter().enumerate() {
            assert_eq!(resolved.event.event_number, i as i64);
        }
    }

    #[test]
    fn read_stream_backward_reverses_order() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, reader, _metadata) = harness(dir.path());
        let s = StreamId::new("s").unwrap();
        for _ in 0..3 {
            coordinator.append(&s, ExpectedVersion::Any, vec![event("Evt", b"x")]).unwrap();
        }
        let slice = reader.read_stream_backward(&s, 2, 10, false).unwrap();
        let numbers: Vec<_> = slice.events.iter().map(|r| r.event.event_number).collect();
        assert_eq!(numbers, vec![2, 1, 0]);
        assert!(slice.is_end_of_stream);
    }

    #[test]
    fn read_all_forward_returns_cross_stream_order() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, reader, _metadata) = harness(dir.path());
        let a = StreamId::new("a").unwrap();
        let b = StreamId::new("b").unwrap();
        coordinator.append(&a, ExpectedVersion::NoStream, vec![event("A1", b"1")]).unwrap();
        coordinator.append(&b, ExpectedVersion::NoStream, vec![event("B1", b"1")]).unwrap();

        let slice = reader.read_all_forward(0, 10, None, 1000).unwrap();
        assert_eq!(slice.events.len(), 2);
        assert!(slice.is_end_of_stream);
    }

    #[test]
    fn read_all_forward_applies_filter() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, reader, _metadata) = harness(dir.path());
        let billing = StreamId::new("billing-1").unwrap();
        let orders = StreamId::new("orders-1").unwrap();
        coordinator.append(&billing, ExpectedVersion::NoStream, vec![event("Invoiced", b"1")]).unwrap();
        coordinator.append(&orders, ExpectedVersion::NoStream, vec![event("Placed", b"1")]).unwrap();

        let filter = Filter::compile(&crate::filter::FilterSpec::stream_prefix("billing-")).unwrap();
        let slice = reader.read_all_forward(0, 10, Some(&filter), 1000).unwrap();
        assert_eq!(slice.events.len(), 1);
        assert_eq!(slice.events[0].1.event.stream_id, billing);
    }

    #[test]
    fn read_past_tail_returns_empty_end_of_stream() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, reader, _metadata) = harness(dir.path());
        let s = StreamId::new("s").unwrap();
        coordinator.append(&s, ExpectedVersion::NoStream, vec![event("Evt", b"x")]).unwrap();

        let slice = reader.read_stream_forward(&s, 5, 10, false).unwrap();
        assert!(slice.events.is_empty());
        assert!(slice.is_end_of_stream);
    }

    #[test]
    fn tombstoned_stream_read_event_is_stream_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, reader, metadata) = harness(dir.path());
        let s = StreamId::new("s").unwrap();
        coordinator.append(&s, ExpectedVersion::NoStream, vec![event("Evt", b"x")]).unwrap();
        metadata.mark_tombstoned(&s);

        assert_eq!(reader.read_event(&s, 0, false).unwrap(), ReadEventResult::StreamDeleted);
        assert!(reader.read_stream_forward(&s, 0, 10, false).is_err());
    }
}
