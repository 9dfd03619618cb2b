// Copyright (c) Chronicle Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Immutable, sorted on-disk run of stream-index entries ("PTable" in the
//! component design). Each PTable covers a monotonic range of log
//! positions and is produced either by flushing the memtable or by
//! merging older PTables together.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{ChronicleResult, FatalError};
use crate::ids::EventNumber;
use crate::log::LogOffset;

const PTABLE_MAGIC: u32 = 0x9A17_AB1E;
const PREAMBLE_SIZE: usize = 32;
const ENTRY_SIZE: usize = 24;
const MIDPOINT_SIZE: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PTableEntry {
    pub stream_hash: u64,
    pub event_number: EventNumber,
    pub log_position: LogOffset,
}

struct Midpoint {
    stream_hash: u64,
    event_number: EventNumber,
    entry_index: u32,
}

pub struct PTable {
    pub path: PathBuf,
    file: File,
    pub entry_count: u32,
    entries_offset: u64,
    midpoints: Vec<Midpoint>,
    pub generation: u64,
}

fn sort_key(e: &PTableEntry) -> (u64, EventNumber) {
    (e.stream_hash, e.event_number)
}

impl PTable {
    /// Writes `entries` (will be sorted in place) to `path` as a new
    /// PTable, recording a midpoint every `stride` entries.
    pub fn write(path: &Path, mut entries: Vec<PTableEntry>, stride: usize, generation: u64) -> ChronicleResult<Self> {
        entries.sort_by_key(sort_key);
        let midpoint_count = if entries.is_empty() {
            0
        } else {
            (entries.len() - 1) / stride.max(1) + 1
        };

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .truncate(true)
            .open(path)?;

        let mut preamble = [0u8; PREAMBLE_SIZE];
        LittleEndian::write_u32(&mut preamble[0..4], PTABLE_MAGIC);
        LittleEndian::write_u32(&mut preamble[4..8], 1); // version
        LittleEndian::write_u32(&mut preamble[8..12], 0); // hash algo id
        LittleEndian::write_u32(&mut preamble[12..16], entries.len() as u32);
        LittleEndian::write_u32(&mut preamble[16..20], midpoint_count as u32);
        LittleEndian::write_u32(&mut preamble[20..24], stride as u32);
        file.write_all(&preamble)?;

        for (i, entry) in entries.iter().enumerate() {
            if i % stride.max(1) == 0 {
                let mut buf = [0u8; MIDPOINT_SIZE];
                LittleEndian::write_u64(&mut buf[0..8], entry.stream_hash);
                LittleEndian::write_i64(&mut buf[8..16], entry.event_number);
                LittleEndian::write_u32(&mut buf[16..20], i as u32);
                file.write_all(&buf)?;
            }
        }

        let entries_offset = file.stream_position()?;
        for entry in &entries {
            let mut buf = [0u8; ENTRY_SIZE];
            LittleEndian::write_u64(&mut buf[0..8], entry.stream_hash);
            LittleEndian::write_i64(&mut buf[8..16], entry.event_number);
            LittleEndian::write_i64(&mut buf[16..24], entry.log_position);
            file.write_all(&buf)?;
        }
        file.flush()?;
        file.sync_all()?;

        Self::open_with_entry_count(path.to_path_buf(), file, entries.len() as u32, entries_offset, generation)
    }

    pub fn open(path: PathBuf, generation: u64) -> ChronicleResult<Self> {
        let file = OpenOptions::new().read(true).open(&path)?;
        Self::open_with_entry_count(path, file, 0, 0, generation)
    }

    fn open_with_entry_count(
        path: PathBuf,
        mut file: File,
        entry_count_hint: u32,
        entries_offset_hint: u64,
        generation: u64,
    ) -> ChronicleResult<Self> {
        let _ = entry_count_hint;
        use std::io::Seek;
        file.seek(std::io::SeekFrom::Start(0))?;
        let mut preamble = [0u8; PREAMBLE_SIZE];
        file.read_exact(&mut preamble)?;
        let magic = LittleEndian::read_u32(&preamble[0..4]);
        if magic != PTABLE_MAGIC {
            return Err(FatalError::ManifestCorrupt(format!("bad ptable magic {magic:#x}")).into());
        }
        let entry_count = LittleEndian::read_u32(&preamble[12..16]);
        let midpoint_count = LittleEndian::read_u32(&preamble[16..20]) as usize;

        let mut midpoints = Vec::with_capacity(midpoint_count);
        for _ in 0..midpoint_count {
            let mut buf = [0u8; MIDPOINT_SIZE];
            file.read_exact(&mut buf)?;
            midpoints.push(Midpoint {
                stream_hash: LittleEndian::read_u64(&buf[0..8]),
                event_number: LittleEndian::read_i64(&buf[8..16]),
                entry_index: LittleEndian::read_u32(&buf[16..20]),
            });
        }
        let entries_offset = if entries_offset_hint != 0 {
            entries_offset_hint
        } else {
            file.stream_position()?
        };

        Ok(Self {
            path,
            file,
            entry_count,
            entries_offset,
            midpoints,
            generation,
        })
    }

    fn read_entry(&self, index: u32) -> ChronicleResult<PTableEntry> {
        use std::os::unix::fs::FileExt;
        let mut buf = [0u8; ENTRY_SIZE];
        self.file
            .read_exact_at(&mut buf, self.entries_offset + index as u64 * ENTRY_SIZE as u64)?;
        Ok(PTableEntry {
            stream_hash: LittleEndian::read_u64(&buf[0..8]),
            event_number: LittleEndian::read_i64(&buf[8..16]),
            log_position: LittleEndian::read_i64(&buf[16..24]),
        })
    }

    /// All entries matching `stream_hash`/`event_number` exactly (normally
    /// zero or one; more than one indicates a 64-bit hash collision between
    /// streams, resolved by the caller dereferencing the log).
    pub fn lookup(&self, stream_hash: u64, event_number: EventNumber) -> ChronicleResult<Vec<PTableEntry>> {
        let key = (stream_hash, event_number);
        let (mut lo, mut hi) = self.bracket(key);
        let mut found = Vec::new();
        while lo < hi {
            let entry = self.read_entry(lo)?;
            if sort_key(&entry) == key {
                found.push(entry);
            } else if sort_key(&entry) > key {
                break;
            }
            lo += 1;
        }
        Ok(found)
    }

    /// All entries for `stream_hash` with event number in `[lo, hi]`
    /// inclusive, in ascending order.
    pub fn range(&self, stream_hash: u64, lo_num: EventNumber, hi_num: EventNumber) -> ChronicleResult<Vec<PTableEntry>> {
        let (mut lo, _) = self.bracket((stream_hash, lo_num));
        let mut out = Vec::new();
        while lo < self.entry_count {
            let entry = self.read_entry(lo)?;
            if entry.stream_hash > stream_hash
                || (entry.stream_hash == stream_hash && entry.event_number > hi_num)
            {
                break;
            }
            if entry.stream_hash == stream_hash && entry.event_number >= lo_num {
                out.push(entry);
            }
            lo += 1;
        }
        Ok(out)
    }

    /// Returns `[lo, hi)` entry indices that might contain `key`, narrowed
    /// via the midpoint table.
    fn bracket(&self, key: (u64, EventNumber)) -> (u32, u32) {
        if self.midpoints.is_empty() {
            return (0, self.entry_count);
        }
        let mut lo_mid = 0usize;
        let mut hi_mid = self.midpoints.len();
        while lo_mid < hi_mid {
            let mid = (lo_mid + hi_mid) / 2;
            let mk = (self.midpoints[mid].stream_hash, self.midpoints[mid].event_number);
            if mk <= key {
                lo_mid = mid + 1;
            } else {
                hi_mid = mid;
            }
        }
        let lo_idx = if lo_mid == 0 {
            0
        } else {
            self.midpoints[lo_mid - 1].entry_index
        };
        let hi_idx = if lo_mid < self.midpoints.len() {
            self.midpoints[lo_mid].entry_index
        } else {
            self.entry_count
        };
        (lo_idx, hi_idx)
    }

    pub fn iter_all(&self) -> ChronicleResult<Vec<PTableEntry>> {
        let mut out = Vec::with_capacity(self.entry_count as usize);
        for i in 0..self.entry_count {
            out.push(self.read_entry(i)?);
        }
        Ok(out)
    }
}

/// K-way merges several PTables into one, discarding entries for streams
/// in `hard_deleted` and entries with event numbers below the matching
/// truncation watermark in `truncate_before`.
pub fn merge(
    tables: &[&PTable],
    hard_deleted: &std::collections::HashSet<u64>,
    truncate_before: &std::collections::HashMap<u64, EventNumber>,
    out_path: &Path,
    stride: usize,
    generation: u64,
) -> ChronicleResult<PTable> {
    let mut all = Vec::new();
    for table in tables {
        all.extend(table.iter_all()?);
    }
    all.retain(|e| {
        if hard_deleted.contains(&e.stream_hash) {
            return false;
        }
        if let Some(watermark) = truncate_before.get(&e.stream_hash) {
            if e.event_number < *watermark {
                return false;
            }
        }
        true
    });
    // Keep only the newest log position for a given (hash, event-number):
    // later tables in `tables` are assumed newer.
    all.sort_by_key(sort_key);
    all.dedup_by(|a, b| sort_key(a) == sort_key(b) && {
        b.log_position = a.log_position;
        true
    });
    PTable::write(out_path, all, stride, generation)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(hash: u64, num: i64, pos: i64) -> PTableEntry {
        PTableEntry {
            stream_hash: hash,
            event_number: num,
            log_position: pos,
        }
    }

    #[test]
    fn write_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p0");
        let entries = vec![entry(1, 0, 10), entry(1, 1, 20), entry(2, 0, 30)];
        let table = PTable::write(&path, entries, 2, 0).unwrap();
        let found = table.lookup(1, 1).unwrap();
        assert_eq!(found, vec![entry(1, 1, 20)]);
        let missing = table.lookup(3, 0).unwrap();
        assert!(missing.is_empty());
    }

    #[test]
    fn reopen_preserves_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p0");
        let entries = vec![entry(1, 0, 10), entry(1, 1, 20)];
        PTable::write(&path, entries, 1, 0).unwrap();
        let reopened = PTable::open(path, 0).unwrap();
        assert_eq!(reopened.lookup(1, 0).unwrap(), vec![entry(1, 0, 10)]);
    }

    #[test]
    fn range_returns_ascending_slice() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p0");
        let entries: Vec<_> = (0..10).map(|i| entry(5, i, i * 10)).collect();
        let table = PTable::write(&path, entries, 3, 0).unwrap();
        let r = table.range(5, 2, 5).unwrap();
        let nums: Vec<_> = r.iter().map(|e| e.event_number).collect();
        assert_eq!(nums, vec![2, 3, 4, 5]);
    }

    #[test]
    fn merge_discards_hard_deleted_streams() {
        let dir = tempfile::tempdir().unwrap();
        let p0 = PTable::write(&dir.path().join("p0"), vec![entry(1, 0, 10), entry(2, 0, 20)], 4, 0).unwrap();
        let mut deleted = std::collections::HashSet::new();
        deleted.insert(1u64);
        let merged = merge(&[&p0], &deleted, &Default::default(), &dir.path().join("m0"), 4, 1).unwrap();
        let all = merged.iter_all().unwrap();
        assert_eq!(all, vec![entry(2, 0, 20)]);
    }
}
