// Copyright (c) Chronicle Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The chunked transaction log (component A): an append-only byte log split
//! into fixed-size chunks. The writer (the Append Coordinator) appends;
//! readers pread from immutable completed chunks or, briefly locked, from
//! the active one.

pub mod chunk;
pub mod record;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use crate::error::{ChronicleError, ChronicleResult, FatalError};
use chunk::{chunk_file_name, Chunk};
use record::{decode, RecordBody, LENGTH_PREFIX_BYTES};

/// A raw byte offset into the conceptual global log address space, shared
/// monotonically across chunk boundaries (chunk N's logical range starts
/// exactly where chunk N-1's ends).
pub type LogOffset = i64;

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub max_chunk_size: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: 256 * 1024 * 1024,
        }
    }
}

/// Out-of-band notice emitted when the active chunk is truncated on open
/// due to a torn write (§4.A "Failure"). Not an error surfaced to callers.
#[derive(Debug, Clone)]
pub struct TruncationNotice {
    pub chunk_number: u32,
    pub truncated_bytes: usize,
}

pub struct Log {
    dir: PathBuf,
    config: LogConfig,
    completed: RwLock<Vec<Arc<Chunk>>>,
    active: Mutex<Chunk>,
    next_chunk_number: AtomicU32,
    writer_position: AtomicI64,
    pub last_truncation: RwLock<Option<TruncationNotice>>,
}

impl Log {
    /// Opens (or creates) the log directory, recovering the active chunk
    /// per the torn-write rule. Returns the log along with any truncation
    /// notice for the caller to forward to its out-of-band diagnostics
    /// channel.
    pub fn open(dir: &Path, config: LogConfig) -> ChronicleResult<Self> {
        std::fs::create_dir_all(dir)?;
        let mut chunk_files: Vec<(u32, u32, PathBuf)> = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some((num, gen)) = parse_chunk_file_name(&name) {
                chunk_files.push((num, gen, entry.path()));
            }
        }
        chunk_files.sort_by_key(|(num, gen, _)| (*num, *gen));

        // Keep only the highest generation per chunk number.
        let mut by_number: std::collections::BTreeMap<u32, (u32, PathBuf)> =
            std::collections::BTreeMap::new();
        for (num, gen, path) in chunk_files {
            by_number
                .entry(num)
                .and_modify(|(g, p)| {
                    if gen > *g {
                        *g = gen;
                        *p = path.clone();
                    }
                })
                .or_insert((gen, path));
        }

        let mut completed = Vec::new();
        let mut active: Option<Chunk> = None;
        let mut truncation = None;
        let mut next_chunk_number = 0u32;

        for (num, (_, path)) in by_number {
            let mut chunk = Chunk::open(path, config.max_chunk_size)?;
            next_chunk_number = next_chunk_number.max(num + 1);
            if chunk.completed {
                completed.push(Arc::new(chunk));
            } else {
                let valid_before = chunk.record_region_len();
                chunk.recover()?;
                let valid_after = chunk.record_region_len();
                if valid_after < valid_before {
                    truncation = Some(TruncationNotice {
                        chunk_number: num,
                        truncated_bytes: (valid_before - valid_after) as usize,
                    });
                }
                active = Some(chunk);
            }
        }

        let active = match active {
            Some(c) => c,
            None => {
                let start = completed.last().map(|c: &Arc<Chunk>| c.logical_end()).unwrap_or(0);
                let chunk = Chunk::create(dir, next_chunk_number, 0, config.max_chunk_size, start)?;
                next_chunk_number += 1;
                chunk
            }
        };
        let writer_position = active.logical_end();

        Ok(Self {
            dir: dir.to_path_buf(),
            config,
            completed: RwLock::new(completed),
            active: Mutex::new(active),
            next_chunk_number: AtomicU32::new(next_chunk_number),
            writer_position: AtomicI64::new(writer_position),
            last_truncation: RwLock::new(truncation),
        })
    }

    /// Appends a fully-framed record to the active chunk, rolling to a new
    /// chunk first if it would not fit. Returns the logical offset the
    /// record's length-prefix starts at.
    pub fn append(&self, framed: &[u8]) -> ChronicleResult<LogOffset> {
        let mut guard = self.active.lock();
        if (framed.len() as u64) > guard.remaining_capacity() {
            self.roll_chunk(&mut guard)?;
        }
        let pos = guard.append(framed)?;
        self.writer_position.store(guard.logical_end(), Ordering::SeqCst);
        Ok(pos)
    }

    fn roll_chunk(&self, guard: &mut Chunk) -> ChronicleResult<()> {
        guard.complete()?;
        let chunk_number = self.next_chunk_number.fetch_add(1, Ordering::SeqCst);
        let logical_start = guard.logical_end();
        let new_chunk = Chunk::create(&self.dir, chunk_number, 0, self.config.max_chunk_size, logical_start)?;
        let old = std::mem::replace(guard, new_chunk);
        self.completed.write().push(Arc::new(old));
        Ok(())
    }

    pub fn flush(&self) -> ChronicleResult<()> {
        self.active.lock().flush()
    }

    pub fn complete_active_chunk(&self) -> ChronicleResult<()> {
        let mut guard = self.active.lock();
        self.roll_chunk(&mut guard)
    }

    /// Current writer position: the logical end of the active chunk. Reads
    /// past this point are defined to be empty / end-of-log.
    pub fn writer_position(&self) -> LogOffset {
        self.writer_position.load(Ordering::SeqCst)
    }

    fn read_raw(&self, offset: LogOffset, len: usize) -> ChronicleResult<Vec<u8>> {
        {
            let completed = self.completed.read();
            if let Some(chunk) = completed
                .iter()
                .find(|c| offset >= c.logical_start() && offset < c.logical_end())
            {
                return chunk.read_at((offset - chunk.logical_start()) as u64, len);
            }
        }
        let active = self.active.lock();
        if offset >= active.logical_start() && offset < active.logical_end() {
            return active.read_at((offset - active.logical_start()) as u64, len);
        }
        Err(FatalError::ChunkCorrupt {
            chunk: 0,
            reason: format!("offset {offset} is outside any known chunk"),
        }
        .into())
    }

    /// Reads and decodes one framed record starting at `offset` (the
    /// position of its length prefix).
    pub fn read(&self, offset: LogOffset) -> ChronicleResult<(RecordBody, LogOffset)> {
        let len_bytes = self.read_raw(offset, LENGTH_PREFIX_BYTES)?;
        let len = record::read_length_prefix(&len_bytes) as usize;
        let payload = self.read_raw(offset + LENGTH_PREFIX_BYTES as i64, len)?;
        let body = decode(Bytes::from(payload))?;
        let next = offset + (LENGTH_PREFIX_BYTES * 2) as i64 + len as i64;
        Ok((body, next))
    }

    pub fn scan_forward(self: &Arc<Self>, from: LogOffset) -> ForwardScan {
        ForwardScan {
            log: self.clone(),
            next_offset: from,
        }
    }

    pub fn scan_backward(self: &Arc<Self>, from: LogOffset) -> BackwardScan {
        BackwardScan {
            log: self.clone(),
            next_end: from,
        }
    }
}

fn parse_chunk_file_name(name: &str) -> Option<(u32, u32)> {
    let rest = name.strip_prefix("chunk-")?;
    let (num, gen) = rest.split_once('.')?;
    Some((num.parse().ok()?, gen.parse().ok()?))
}

pub struct ForwardScan {
    log: Arc<Log>,
    next_offset: LogOffset,
}

impl Iterator for ForwardScan {
    type Item = ChronicleResult<(LogOffset, RecordBody)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_offset >= self.log.writer_position() {
            return None;
        }
        match self.log.read(self.next_offset) {
            Ok((body, next)) => {
                let pos = self.next_offset;
                self.next_offset = next;
                Some(Ok((pos, body)))
            }
            Err(e) => {
                self.next_offset = self.log.writer_position();
                Some(Err(e))
            }
        }
    }
}

pub struct BackwardScan {
    log: Arc<Log>,
    next_end: LogOffset,
}

impl Iterator for BackwardScan {
    type Item = ChronicleResult<(LogOffset, RecordBody)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_end <= 0 {
            return None;
        }
        let suffix_offset = self.next_end - LENGTH_PREFIX_BYTES as i64;
        let len = match self.log.read_raw(suffix_offset, LENGTH_PREFIX_BYTES) {
            Ok(bytes) => record::read_length_prefix(&bytes) as i64,
            Err(e) => {
                self.next_end = 0;
                return Some(Err(e));
            }
        };
        let frame_start = suffix_offset - LENGTH_PREFIX_BYTES as i64 - len;
        match self.log.read(frame_start) {
            Ok((body, _next)) => {
                self.next_end = frame_start;
                Some(Ok((frame_start, body)))
            }
            Err(e) => {
                self.next_end = 0;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::StreamId;
    use crate::log::record::{encode, CommitBody, PrepareBody, RecordBody};
    use bytes::Bytes;

    fn sample_prepare_commit(event_number: i64, tx_pos: i64) -> RecordBody {
        let prepare = PrepareBody {
            transaction_position: tx_pos,
            transaction_offset: 0,
            stream_id: StreamId::new("s").unwrap(),
            event_number,
            event_id: crate::ids::EventId::new_v4(),
            event_type: "Evt".to_string(),
            is_json: false,
            created_at_ms: 0,
            data: Bytes::from_static(b"x"),
            metadata: Bytes::new(),
        };
        let commit = CommitBody {
            transaction_position: tx_pos,
            first_event_number: event_number,
            log_position: tx_pos,
        };
        RecordBody::PrepareCommit(prepare, commit)
    }

    #[test]
    fn append_and_scan_forward() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(Log::open(dir.path(), LogConfig::default()).unwrap());
        let mut positions = Vec::new();
        for i in 0..5 {
            let body = sample_prepare_commit(i, 0);
            let framed = encode(&body);
            let pos = log.append(&framed).unwrap();
            positions.push(pos);
        }
        log.flush().unwrap();

        let scanned: Vec<_> = log.scan_forward(0).collect::<Result<Vec<_>, _>>().unwrap();
        assert_eq!(scanned.len(), 5);
        for (i, (pos, _body)) in scanned.iter().enumerate() {
            assert_eq!(*pos, positions[i]);
        }
    }

    #[test]
    fn scan_backward_is_reverse_of_forward() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(Log::open(dir.path(), LogConfig::default()).unwrap());
        for i in 0..4 {
            let framed = encode(&sample_prepare_commit(i, 0));
            log.append(&framed).unwrap();
        }
        log.flush().unwrap();

        let forward: Vec<_> = log.scan_forward(0).collect::<Result<Vec<_>, _>>().unwrap();
        let mut backward: Vec<_> = log
            .scan_backward(log.writer_position())
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        backward.reverse();
        assert_eq!(forward, backward);
    }

    #[test]
    fn chunk_rollover_creates_new_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig { max_chunk_size: chunk::HEADER_SIZE as u64 + 64 };
        let log = Arc::new(Log::open(dir.path(), config).unwrap());
        for i in 0..20 {
            let framed = encode(&sample_prepare_commit(i, 0));
            log.append(&framed).unwrap();
        }
        log.flush().unwrap();
        assert!(log.completed.read().len() >= 1);
        let scanned: Vec<_> = log.scan_forward(0).collect::<Result<Vec<_>, _>>().unwrap();
        assert_eq!(scanned.len(), 20);
    }

    #[test]
    fn reopen_recovers_completed_chunks() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = Arc::new(Log::open(dir.path(), LogConfig::default()).unwrap());
            for i in 0..3 {
                let framed = encode(&sample_prepare_commit(i, 0));
                log.append(&framed).unwrap();
            }
            log.flush().unwrap();
        }
        let reopened = Arc::new(Log::open(dir.path(), LogConfig::default()).unwrap());
        let scanned: Vec<_> = reopened.scan_forward(0).collect::<Result<Vec<_>, _>>().unwrap();
        assert_eq!(scanned.len(), 3);
    }
}
