// Copyright (c) Chronicle Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The single writer path: every append for every stream passes through
//! here, serialized by one lock, matching "the Append Coordinator owns the
//! log writer thread" (§5). Readers and subscriptions run as async tasks;
//! this component deliberately does not.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::append::commit_bus::{CommitBus, Committed};
use crate::append::WriteMode;
use crate::config::StoreConfig;
use crate::error::{ChronicleError, ChronicleResult, FatalError, InputError, TransientError};
use crate::event::{Event, EventRecord};
use crate::ids::{EventId, EventNumber, ExpectedVersion, LogPosition, StreamId, StreamTail};
use crate::index::StreamIndex;
use crate::log::record::{self, CommitBody, RecordBody};
use crate::log::{Log, LogOffset};
use crate::metrics::StoreMetrics;
use crate::stream_meta::MetadataStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    pub log_position: LogPosition,
    pub first_event_number: EventNumber,
}

struct BatchState {
    pending_since_flush: AtomicUsize,
    last_flush: Mutex<Instant>,
}

pub struct AppendCoordinator {
    log: Arc<Log>,
    index: Arc<StreamIndex>,
    metadata: Arc<MetadataStore>,
    commit_bus: Arc<CommitBus>,
    config: StoreConfig,
    metrics: Arc<StoreMetrics>,
    write_lock: Mutex<()>,
    batch: BatchState,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl AppendCoordinator {
    pub fn new(
        log: Arc<Log>,
        index: Arc<StreamIndex>,
        metadata: Arc<MetadataStore>,
        commit_bus: Arc<CommitBus>,
        config: StoreConfig,
        metrics: Arc<StoreMetrics>,
    ) -> Self {
        // Reconstruct any memtable entries lost when the process crashed
        // between a commit and the next index flush (§8 scenario 6): the
        // log itself is durable past the recovered writer position, but the
        // index's in-memory tier is not, so replay forward from the last
        // published watermark.
        if let Err(err) = index.recover_from_log(&log) {
            tracing::warn!(error = %err, "stream index recovery scan failed");
        }
        Self {
            log,
            index,
            metadata,
            commit_bus,
            config,
            metrics,
            write_lock: Mutex::new(()),
            batch: BatchState {
                pending_since_flush: AtomicUsize::new(0),
                last_flush: Mutex::new(Instant::now()),
            },
        }
    }

    /// Fetches the event-id at `(stream_id, event_number)` by dereferencing
    /// the index and then the log, verifying the stream name matches in
    /// case of a hash collision (§4.B "Hash collisions").
    fn event_id_at(&self, stream_id: &StreamId, event_number: EventNumber) -> ChronicleResult<Option<EventId>> {
        for offset in self.index.lookup(stream_id, event_number)? {
            let (body, _next) = self.log.read(offset)?;
            if let Some(prepare) = body.prepare() {
                if &prepare.stream_id == stream_id && prepare.event_number == event_number {
                    return Ok(Some(prepare.event_id));
                }
            }
        }
        Ok(None)
    }

    /// Checks whether `events[..]` exactly matches the already-committed
    /// event-ids starting at `from`, per §4.C "Idempotency".
    fn batch_matches_existing(&self, stream_id: &StreamId, from: EventNumber, events: &[Event]) -> ChronicleResult<bool> {
        for (i, event) in events.iter().enumerate() {
            match self.event_id_at(stream_id, from + i as i64)? {
                Some(id) if id == event.event_id => continue,
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    fn outcome_for_existing(&self, stream_id: &StreamId, first_event_number: EventNumber) -> ChronicleResult<AppendOutcome> {
        let offsets = self.index.lookup(stream_id, first_event_number)?;
        let offset = offsets
            .first()
            .copied()
            .ok_or_else(|| ChronicleError::from(crate::error::FatalError::ManifestCorrupt(
                "idempotent replay target missing from index".to_string(),
            )))?;
        let (body, _) = self.log.read(offset)?;
        let commit = body.commit().ok_or_else(|| {
            ChronicleError::from(crate::error::FatalError::ManifestCorrupt(
                "idempotent replay target is not a commit record".to_string(),
            ))
        })?;
        Ok(AppendOutcome {
            log_position: LogPosition::new(commit.log_position, offset),
            first_event_number,
        })
    }

    /// `append(stream, expected-version, events[])` from §4.C.
    pub fn append(&self, stream_id: &StreamId, expected_version: ExpectedVersion, events: Vec<Event>) -> ChronicleResult<AppendOutcome> {
        if events.is_empty() {
            return Err(InputError::BadRequest("append batch must not be empty".to_string()).into());
        }
        if self.metadata.is_tombstoned(stream_id) {
            return Err(InputError::StreamDeleted.into());
        }

        let _guard = self.write_lock.lock();
        let tail = self.index.tail(stream_id);

        let first_event_number = match self.resolve(stream_id, expected_version, tail, &events)? {
            Ok(n) => n,
            Err(outcome) => return Ok(outcome),
        };

        let outcome = self.write_batch(stream_id, first_event_number, &events)?;
        self.metrics.appends_total.inc();

        let created_at_ms = now_ms();
        for (i, event) in events.into_iter().enumerate() {
            let event_number = first_event_number + i as i64;
            let record = EventRecord {
                stream_id: stream_id.clone(),
                event_number,
                event,
                log_position: outcome.log_position,
                created_at_ms,
            };
            self.commit_bus.publish(Committed {
                record,
                log_position: outcome.log_position,
                first_event_number,
            });
        }

        Ok(outcome)
    }

    /// Resolves expected-version against the current tail (§4.C), returning
    /// the first event-number to assign, or an idempotent-replay outcome if
    /// the batch was already applied, or a `WrongExpectedVersion`/
    /// `StreamDeleted` error.
    fn resolve(
        &self,
        stream_id: &StreamId,
        expected_version: ExpectedVersion,
        tail: StreamTail,
        events: &[Event],
    ) -> ChronicleResult<Result<EventNumber, AppendOutcome>> {
        let current_version = match tail {
            StreamTail::At(n) => Some(n),
            _ => None,
        };
        match tail {
            StreamTail::Deleted => return Err(InputError::StreamDeleted.into()),
            _ => {}
        }

        let is_conflict_case = matches!(
            (expected_version, tail),
            (ExpectedVersion::StreamExists, StreamTail::NoStream)
                | (ExpectedVersion::Exact(_), StreamTail::NoStream)
        ) || matches!(
            (expected_version, tail),
            (ExpectedVersion::NoStream, StreamTail::At(_))
        ) || matches!(
            (expected_version, tail),
            (ExpectedVersion::Exact(n), StreamTail::At(m)) if m != n
        );

        if is_conflict_case {
            let from = match (expected_version, tail) {
                (ExpectedVersion::NoStream, _) => Some(0),
                (ExpectedVersion::Exact(n), _) => Some(n + 1),
                _ => None,
            };
            if let Some(from) = from {
                if from >= 0 && self.batch_matches_existing(stream_id, from, events)? {
                    return Ok(Err(self.outcome_for_existing(stream_id, from)?));
                }
            }
            self.metrics.append_conflicts_total.inc();
            return Err(InputError::WrongExpectedVersion { current_version }.into());
        }

        match (expected_version, tail) {
            (ExpectedVersion::Any, StreamTail::NoStream) => Ok(Ok(0)),
            (ExpectedVersion::Any, StreamTail::At(n)) => {
                if let Some(first) = events.first() {
                    let from = n - events.len() as i64 + 1;
                    if from >= 0 {
                        if let Some(first_existing_id) = self.event_id_at(stream_id, from)? {
                            if first_existing_id == first.event_id {
                                if self.batch_matches_existing(stream_id, from, events)? {
                                    return Ok(Err(self.outcome_for_existing(stream_id, from)?));
                                }
                                // The batch lines up with an already-committed run but doesn't
                                // match it event-for-event: a retried batch must replay in full
                                // or not at all (Open Question ii), never partially.
                                self.metrics.append_conflicts_total.inc();
                                return Err(InputError::WrongExpectedVersion { current_version }.into());
                            }
                        }
                    }
                }
                Ok(Ok(n + 1))
            }
            (ExpectedVersion::NoStream, StreamTail::NoStream) => Ok(Ok(0)),
            (ExpectedVersion::StreamExists, StreamTail::At(n)) => Ok(Ok(n + 1)),
            (ExpectedVersion::Exact(n), StreamTail::At(_)) => Ok(Ok(n + 1)),
            _ => unreachable!("conflict cases handled above"),
        }
    }

    /// Appends a framed record, turning a disk I/O failure into the
    /// transient `CommitTimeout` the caller is expected to retry (§4.C
    /// "Failures"), rather than the fatal variant `Log::append` raises for
    /// e.g. a corrupt chunk.
    fn write_framed(&self, framed: &[u8]) -> ChronicleResult<LogOffset> {
        self.log.append(framed).map_err(|e| match e {
            ChronicleError::Fatal(FatalError::Io(_)) => TransientError::CommitTimeout.into(),
            other => other,
        })
    }

    fn write_batch(&self, stream_id: &StreamId, first_event_number: EventNumber, events: &[Event]) -> ChronicleResult<AppendOutcome> {
        let transaction_position = self.log.writer_position();
        let created_at_ms = now_ms();

        if events.len() == 1 {
            let prepare = record::prepare_body_for_event(
                stream_id,
                first_event_number,
                &events[0],
                transaction_position,
                0,
                created_at_ms,
            );
            let commit = CommitBody {
                transaction_position,
                first_event_number,
                log_position: transaction_position,
            };
            let framed = record::encode(&RecordBody::PrepareCommit(prepare, commit));
            let offset = self.write_framed(&framed)?;
            self.index.insert(stream_id, first_event_number, offset)?;
            self.index.set_tail(stream_id, StreamTail::At(first_event_number));
            self.flush_per_write_mode()?;
            return Ok(AppendOutcome {
                log_position: LogPosition::new(offset, offset),
                first_event_number,
            });
        }

        let mut prepare_offsets: Vec<LogOffset> = Vec::with_capacity(events.len());
        for (i, event) in events.iter().enumerate() {
            let prepare = record::prepare_body_for_event(
                stream_id,
                first_event_number + i as i64,
                event,
                transaction_position,
                i as i32,
                created_at_ms,
            );
            let framed = record::encode(&RecordBody::Prepare(prepare));
            let offset = self.write_framed(&framed)?;
            prepare_offsets.push(offset);
        }

        // The commit record is self-referential: its `log_position` is the
        // offset it will be written at. Since we hold `write_lock` for the
        // whole batch, the writer position observed right before encoding
        // is exactly that offset.
        let expected_commit_offset = self.log.writer_position();
        let commit = CommitBody {
            transaction_position,
            first_event_number,
            log_position: expected_commit_offset,
        };
        let framed = record::encode(&RecordBody::Commit(commit));
        let commit_offset = self.write_framed(&framed)?;
        debug_assert_eq!(commit_offset, expected_commit_offset);

        for (i, offset) in prepare_offsets.iter().enumerate() {
            self.index.insert(stream_id, first_event_number + i as i64, *offset)?;
        }
        self.index.set_tail(stream_id, StreamTail::At(first_event_number + events.len() as i64 - 1));
        self.flush_per_write_mode()?;

        Ok(AppendOutcome {
            log_position: LogPosition::new(commit_offset, *prepare_offsets.last().unwrap()),
            first_event_number,
        })
    }

    fn flush_per_write_mode(&self) -> ChronicleResult<()> {
        let flush = |log: &Log| {
            log.flush().map_err(|e| match e {
                ChronicleError::Fatal(FatalError::Io(_)) => TransientError::CommitTimeout.into(),
                other => other,
            })
        };
        match self.config.write_mode {
            WriteMode::Synchronous => flush(&self.log),
            WriteMode::Batched => {
                let pending = self.batch.pending_since_flush.fetch_add(1, Ordering::SeqCst) + 1;
                let elapsed = self.batch.last_flush.lock().elapsed();
                if pending >= self.config.batch_max_writes || elapsed >= self.config.batch_max_delay {
                    flush(&self.log)?;
                    self.batch.pending_since_flush.store(0, Ordering::SeqCst);
                    *self.batch.last_flush.lock() = Instant::now();
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_coordinator(dir: &std::path::Path) -> AppendCoordinator {
        let log = Arc::new(Log::open(dir, crate::log::LogConfig::default()).unwrap());
        let index = Arc::new(StreamIndex::open(&dir.join("index"), crate::index::IndexConfig::default()).unwrap());
        let metadata = Arc::new(MetadataStore::new());
        let commit_bus = CommitBus::new();
        let metrics = Arc::new(StoreMetrics::new_for_test());
        AppendCoordinator::new(log, index, metadata, commit_bus, StoreConfig::default(), metrics)
    }

    fn event() -> Event {
        Event::new(EventId::new_v4(), "Test", bytes::Bytes::from_static(b"{}"))
    }

    #[test]
    fn first_append_at_no_stream_succeeds_at_zero() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = new_coordinator(dir.path());
        let s = StreamId::new("s").unwrap();
        let outcome = coordinator.append(&s, ExpectedVersion::NoStream, vec![event()]).unwrap();
        assert_eq!(outcome.first_event_number, 0);
    }

    #[test]
    fn second_no_stream_append_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = new_coordinator(dir.path());
        let s = StreamId::new("s").unwrap();
        coordinator.append(&s, ExpectedVersion::NoStream, vec![event()]).unwrap();
        let err = coordinator.append(&s, ExpectedVersion::NoStream, vec![event()]).unwrap_err();
        assert!(matches!(err, ChronicleError::Input(InputError::WrongExpectedVersion { current_version: Some(0) })));
    }

    #[test]
    fn exact_version_after_no_stream_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = new_coordinator(dir.path());
        let s = StreamId::new("s").unwrap();
        coordinator.append(&s, ExpectedVersion::NoStream, vec![event()]).unwrap();
        let outcome = coordinator.append(&s, ExpectedVersion::Exact(0), vec![event()]).unwrap();
        assert_eq!(outcome.first_event_number, 1);
    }

    #[test]
    fn idempotent_replay_returns_same_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = new_coordinator(dir.path());
        let s = StreamId::new("s").unwrap();
        let e1 = event();
        let e2 = event();
        let batch = vec![e1.clone(), e2.clone()];
        let first = coordinator.append(&s, ExpectedVersion::NoStream, batch.clone()).unwrap();
        let second = coordinator.append(&s, ExpectedVersion::NoStream, batch).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn any_version_replays_full_batch_idempotently() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = new_coordinator(dir.path());
        let s = StreamId::new("s").unwrap();
        let batch = vec![event(), event()];
        let first = coordinator.append(&s, ExpectedVersion::Any, batch.clone()).unwrap();
        let second = coordinator.append(&s, ExpectedVersion::Any, batch).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn any_version_rejects_partially_matching_batch() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = new_coordinator(dir.path());
        let s = StreamId::new("s").unwrap();
        let e1 = event();
        let e2 = event();
        coordinator.append(&s, ExpectedVersion::Any, vec![e1.clone(), e2]).unwrap();
        // Same lead event, but the second event differs: not a clean replay.
        let err = coordinator
            .append(&s, ExpectedVersion::Any, vec![e1, event()])
            .unwrap_err();
        assert!(matches!(err, ChronicleError::Input(InputError::WrongExpectedVersion { current_version: Some(1) })));
    }

    #[test]
    fn stream_exists_on_no_stream_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = new_coordinator(dir.path());
        let s = StreamId::new("s").unwrap();
        let err = coordinator.append(&s, ExpectedVersion::StreamExists, vec![event()]).unwrap_err();
        assert!(matches!(err, ChronicleError::Input(InputError::WrongExpectedVersion { current_version: None })));
    }

    #[test]
    fn index_recovers_unflushed_entries_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let s = StreamId::new("s").unwrap();
        {
            let coordinator = new_coordinator(dir.path());
            coordinator.append(&s, ExpectedVersion::NoStream, vec![event(), event()]).unwrap();
            coordinator.append(&s, ExpectedVersion::Exact(1), vec![event()]).unwrap();
            // No `index.flush()` here: the memtable entries above are only
            // in memory, simulating a crash before the flush threshold (or
            // a clean shutdown without a final flush) at this point.
        }

        let log = Arc::new(Log::open(dir.path(), crate::log::LogConfig::default()).unwrap());
        let index = Arc::new(StreamIndex::open(&dir.path().join("index"), crate::index::IndexConfig::default()).unwrap());
        assert!(index.lookup(&s, 0).unwrap().is_empty(), "fresh index should start empty before recovery");

        let metadata = Arc::new(MetadataStore::new());
        let commit_bus = CommitBus::new();
        let metrics = Arc::new(StoreMetrics::new_for_test());
        let _coordinator = AppendCoordinator::new(log, index.clone(), metadata, commit_bus, StoreConfig::default(), metrics);

        assert_eq!(index.lookup(&s, 0).unwrap().len(), 1);
        assert_eq!(index.lookup(&s, 1).unwrap().len(), 1);
        assert_eq!(index.lookup(&s, 2).unwrap().len(), 1);
        assert_eq!(index.tail(&s), StreamTail::At(2));
    }

    #[test]
    fn tombstoned_stream_rejects_append() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = new_coordinator(dir.path());
        let s = StreamId::new("s").unwrap();
        coordinator.metadata.mark_tombstoned(&s);
        let err = coordinator.append(&s, ExpectedVersion::Any, vec![event()]).unwrap_err();
        assert!(matches!(err, ChronicleError::Input(InputError::StreamDeleted)));
    }
}
