// Copyright (c) Chronicle Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Durable record of which PTable files currently back the on-disk tier of
//! the Stream Index, swapped atomically whenever a flush or merge
//! completes.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::error::ChronicleResult;
use crate::index::ptable::PTable;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub generation: u64,
    pub file_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct ManifestState {
    entries: Vec<ManifestEntry>,
    /// Highest log offset fully represented by `entries`. Recovery replays
    /// the log from `indexed_through + 1` onward to reconstruct whatever was
    /// only in the volatile memtable at crash time (§8 scenario 6).
    #[serde(default = "default_indexed_through")]
    indexed_through: i64,
}

fn default_indexed_through() -> i64 {
    -1
}

/// Holds the current set of on-disk PTables, published via [`ArcSwap`] so
/// readers never block behind a flush or merge publishing a new set.
pub struct Manifest {
    dir: PathBuf,
    manifest_path: PathBuf,
    tables: ArcSwap<Vec<Arc<PTable>>>,
    indexed_through: std::sync::atomic::AtomicI64,
}

impl Manifest {
    pub fn open(dir: &Path) -> ChronicleResult<Self> {
        std::fs::create_dir_all(dir)?;
        let manifest_path = dir.join("MANIFEST");
        let state = match std::fs::read(&manifest_path) {
            Ok(bytes) => serde_json::from_slice::<ManifestState>(&bytes).unwrap_or_default(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ManifestState::default(),
            Err(e) => return Err(e.into()),
        };

        let mut tables = Vec::with_capacity(state.entries.len());
        for entry in &state.entries {
            let path = dir.join(&entry.file_name);
            tables.push(Arc::new(PTable::open(path, entry.generation)?));
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            manifest_path,
            tables: ArcSwap::from_pointee(tables),
            indexed_through: std::sync::atomic::AtomicI64::new(state.indexed_through),
        })
    }

    pub fn tables(&self) -> Arc<Vec<Arc<PTable>>> {
        self.tables.load_full()
    }

    /// Highest log offset already represented by the published PTables.
    pub fn indexed_through(&self) -> i64 {
        self.indexed_through.load(Ordering::Relaxed)
    }

    /// Atomically publishes a new table set and persists the manifest to
    /// disk (write-to-temp, `fsync`, rename) so a crash mid-publish leaves
    /// the previous manifest intact.
    pub fn publish(&self, new_tables: Vec<Arc<PTable>>) -> ChronicleResult<()> {
        self.publish_through(new_tables, self.indexed_through())
    }

    /// Like [`publish`], but also advances the `indexed_through` watermark —
    /// used by a memtable flush, which is the one event that makes a run of
    /// previously-volatile entries durable.
    pub fn publish_through(&self, new_tables: Vec<Arc<PTable>>, indexed_through: i64) -> ChronicleResult<()> {
        let state = ManifestState {
            entries: new_tables
                .iter()
                .map(|t| ManifestEntry {
                    generation: t.generation,
                    file_name: t
                        .path
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_default(),
                })
                .collect(),
            indexed_through,
        };
        let json = serde_json::to_vec_pretty(&state)?;
        let tmp_path = self.dir.join("MANIFEST.tmp");
        {
            let mut tmp = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            tmp.write_all(&json)?;
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.manifest_path)?;
        self.tables.store(Arc::new(new_tables));
        self.indexed_through.store(indexed_through, Ordering::Relaxed);
        Ok(())
    }

    pub fn next_generation(&self) -> u64 {
        self.tables()
            .iter()
            .map(|t| t.generation)
            .max()
            .map(|g| g + 1)
            .unwrap_or(0)
    }
}

impl From<serde_json::Error> for crate::error::ChronicleError {
    fn from(e: serde_json::Error) -> Self {
        crate::error::FatalError::ManifestCorrupt(e.to_string()).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::ptable::PTableEntry;

    #[test]
    fn publish_and_reopen_restores_tables() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = Manifest::open(dir.path()).unwrap();
        assert!(manifest.tables().is_empty());

        let ptable_path = dir.path().join("p0");
        let entries = vec![PTableEntry {
            stream_hash: 1,
            event_number: 0,
            log_position: 10,
        }];
        let table = Arc::new(PTable::write(&ptable_path, entries, 4, 0).unwrap());
        manifest.publish(vec![table]).unwrap();

        let reopened = Manifest::open(dir.path()).unwrap();
        assert_eq!(reopened.tables().len(), 1);
        assert_eq!(reopened.next_generation(), 1);
    }
}
