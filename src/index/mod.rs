// Copyright (c) Chronicle Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The Stream Index (component B): a two-tier structure mapping
//! `(stream, event-number)` to a log position. The memtable absorbs
//! writes; PTables hold flushed, immutable sorted runs; the manifest
//! tracks which PTables are live.

pub mod manifest;
pub mod memtable;
pub mod ptable;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::error::ChronicleResult;
use crate::ids::{EventNumber, StreamId, StreamTail};
use crate::log::LogOffset;
use manifest::Manifest;
use memtable::Memtable;
use ptable::{PTable, PTableEntry};

#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Flush the memtable to a new PTable once it holds this many entries.
    pub memtable_flush_threshold: usize,
    /// Trigger a merge once the manifest holds this many PTables.
    pub merge_trigger_count: usize,
    pub midpoint_stride: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            memtable_flush_threshold: 1 << 16,
            merge_trigger_count: 8,
            midpoint_stride: 128,
        }
    }
}

pub struct StreamIndex {
    dir: PathBuf,
    config: IndexConfig,
    memtable: Memtable,
    manifest: Manifest,
    next_ptable_id: AtomicU32,
    /// Streams that have been hard-deleted (tombstoned), kept in memory so
    /// lookups and merges can drop their entries without a disk round trip.
    hard_deleted: parking_lot::RwLock<HashSet<u64>>,
    /// Truncate-before watermark per stream hash, applied the same way.
    truncate_before: parking_lot::RwLock<HashMap<u64, EventNumber>>,
}

impl StreamIndex {
    pub fn open(dir: &Path, config: IndexConfig) -> ChronicleResult<Self> {
        std::fs::create_dir_all(dir)?;
        let manifest = Manifest::open(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            config,
            memtable: Memtable::new(),
            manifest,
            next_ptable_id: AtomicU32::new(0),
            hard_deleted: parking_lot::RwLock::new(HashSet::new()),
            truncate_before: parking_lot::RwLock::new(HashMap::new()),
        })
    }

    pub fn insert(&self, stream_id: &StreamId, event_number: EventNumber, offset: LogOffset) -> ChronicleResult<()> {
        self.memtable.insert(stream_id, event_number, offset);
        if self.memtable.len() >= self.config.memtable_flush_threshold {
            self.flush()?;
        }
        Ok(())
    }

    /// Candidate log offsets for `(stream, event_number)`: memtable first
    /// (freshest), then every live PTable, newest generation first.
    pub fn lookup(&self, stream_id: &StreamId, event_number: EventNumber) -> ChronicleResult<Vec<LogOffset>> {
        let hash = stream_id.hash64();
        let mut found = self.memtable.candidates(stream_id, event_number);
        if !found.is_empty() {
            return Ok(found);
        }
        let mut tables = (*self.manifest.tables()).clone();
        tables.sort_by(|a, b| b.generation.cmp(&a.generation));
        for table in &tables {
            let matches = table.lookup(hash, event_number)?;
            if !matches.is_empty() {
                found.extend(matches.into_iter().map(|e| e.log_position));
                break;
            }
        }
        Ok(found)
    }

    pub fn range(
        &self,
        stream_id: &StreamId,
        from: EventNumber,
        to_exclusive: EventNumber,
    ) -> ChronicleResult<Vec<(EventNumber, LogOffset)>> {
        let hash = stream_id.hash64();
        let mut merged: std::collections::BTreeMap<EventNumber, LogOffset> = std::collections::BTreeMap::new();

        let tables = self.manifest.tables();
        if to_exclusive > from {
            for table in tables.iter() {
                for entry in table.range(hash, from, to_exclusive - 1)? {
                    merged.insert(entry.event_number, entry.log_position);
                }
            }
        }
        for (num, offset) in self.memtable.range_candidates(hash, from, to_exclusive - 1) {
            merged.insert(num, offset);
        }
        Ok(merged.into_iter().collect())
    }

    pub fn tail(&self, stream_id: &StreamId) -> StreamTail {
        self.memtable.tail(stream_id)
    }

    pub fn set_tail(&self, stream_id: &StreamId, tail: StreamTail) {
        self.memtable.set_tail(stream_id, tail);
    }

    pub fn mark_deleted(&self, stream_id: &StreamId) {
        self.memtable.mark_deleted(stream_id);
        self.hard_deleted.write().insert(stream_id.hash64());
    }

    pub fn set_truncate_before(&self, stream_id: &StreamId, watermark: EventNumber) {
        self.truncate_before.write().insert(stream_id.hash64(), watermark);
    }

    /// Drains the memtable into a new PTable and publishes it via the
    /// manifest. Triggers a merge afterward if the live PTable count
    /// crosses the configured threshold.
    pub fn flush(&self) -> ChronicleResult<()> {
        let drained = self.memtable.drain_sorted();
        if drained.is_empty() {
            return Ok(());
        }
        let max_offset = drained.iter().map(|(_, offset)| *offset).max().unwrap_or(self.manifest.indexed_through());
        let entries: Vec<PTableEntry> = drained
            .into_iter()
            .map(|(key, offset)| PTableEntry {
                stream_hash: key.stream_hash,
                event_number: key.event_number,
                log_position: offset,
            })
            .collect();

        let id = self.next_ptable_id.fetch_add(1, Ordering::SeqCst);
        let generation = self.manifest.next_generation();
        let path = self.dir.join(format!("ptable-{id:08}"));
        let new_table = Arc::new(PTable::write(&path, entries, self.config.midpoint_stride, generation)?);

        let mut tables = (*self.manifest.tables()).clone();
        tables.push(new_table);
        let indexed_through = self.manifest.indexed_through().max(max_offset);
        self.manifest.publish_through(tables, indexed_through)?;

        if self.manifest.tables().len() >= self.config.merge_trigger_count {
            self.merge()?;
        }
        Ok(())
    }

    /// Highest log offset already durably represented by a published
    /// PTable. Recovery replays the log from here forward (§8 scenario 6).
    pub fn indexed_through(&self) -> LogOffset {
        self.manifest.indexed_through()
    }

    /// Reinserts every event record between `indexed_through() + 1` and
    /// `log`'s writer position, reconstructing whatever the memtable held
    /// in memory at the moment of a crash.
    pub fn recover_from_log(&self, log: &Arc<crate::log::Log>) -> ChronicleResult<()> {
        for entry in log.scan_forward(self.indexed_through() + 1) {
            let (offset, body) = entry?;
            if let Some(prepare) = body.prepare() {
                self.insert(&prepare.stream_id, prepare.event_number, offset)?;
            }
        }
        Ok(())
    }

    /// Merges every live PTable into a single new run, dropping entries for
    /// hard-deleted streams or below their truncation watermark.
    pub fn merge(&self) -> ChronicleResult<()> {
        let tables = self.manifest.tables();
        if tables.len() < 2 {
            return Ok(());
        }
        let refs: Vec<&PTable> = tables.iter().map(|t| t.as_ref()).collect();
        let hard_deleted = self.hard_deleted.read().clone();
        let truncate_before = self.truncate_before.read().clone();

        let id = self.next_ptable_id.fetch_add(1, Ordering::SeqCst);
        let generation = self.manifest.next_generation();
        let path = self.dir.join(format!("ptable-{id:08}"));
        let merged = ptable::merge(
            &refs,
            &hard_deleted,
            &truncate_before,
            &path,
            self.config.midpoint_stride,
            generation,
        )?;

        self.manifest.publish(vec![Arc::new(merged)])?;
        for table in tables.iter() {
            let _ = std::fs::remove_file(&table.path);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_flush_then_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let config = IndexConfig {
            memtable_flush_threshold: usize::MAX,
            ..IndexConfig::default()
        };
        let index = StreamIndex::open(dir.path(), config).unwrap();
        let s = StreamId::new("orders-1").unwrap();
        index.insert(&s, 0, 10).unwrap();
        index.insert(&s, 1, 20).unwrap();
        index.flush().unwrap();

        assert_eq!(index.lookup(&s, 0).unwrap(), vec![10]);
        assert_eq!(index.lookup(&s, 1).unwrap(), vec![20]);
    }

    #[test]
    fn memtable_shadows_flushed_ptable() {
        let dir = tempfile::tempdir().unwrap();
        let config = IndexConfig {
            memtable_flush_threshold: usize::MAX,
            ..IndexConfig::default()
        };
        let index = StreamIndex::open(dir.path(), config).unwrap();
        let s = StreamId::new("s").unwrap();
        index.insert(&s, 0, 10).unwrap();
        index.flush().unwrap();
        index.insert(&s, 1, 20).unwrap();

        assert_eq!(index.lookup(&s, 0).unwrap(), vec![10]);
        assert_eq!(index.lookup(&s, 1).unwrap(), vec![20]);
    }

    #[test]
    fn auto_flush_past_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let config = IndexConfig {
            memtable_flush_threshold: 2,
            ..IndexConfig::default()
        };
        let index = StreamIndex::open(dir.path(), config).unwrap();
        let s = StreamId::new("s").unwrap();
        index.insert(&s, 0, 10).unwrap();
        index.insert(&s, 1, 20).unwrap();
        assert!(index.memtable.is_empty());
        assert_eq!(index.manifest.tables().len(), 1);
    }

    #[test]
    fn merge_triggers_after_threshold_ptables() {
        let dir = tempfile::tempdir().unwrap();
        let config = IndexConfig {
            memtable_flush_threshold: 1,
            merge_trigger_count: 3,
            ..IndexConfig::default()
        };
        let index = StreamIndex::open(dir.path(), config).unwrap();
        let s = StreamId::new("s").unwrap();
        for i in 0..3 {
            index.insert(&s, i, i * 10).unwrap();
        }
        assert_eq!(index.manifest.tables().len(), 1);
        assert_eq!(index.lookup(&s, 2).unwrap(), vec![20]);
    }
}
