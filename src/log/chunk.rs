// Copyright (c) Chronicle Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! A single on-disk chunk file: fixed max size, append-only while active,
//! immutable and footer-stamped once complete.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use sha2::{Digest, Sha256};

use crate::error::{ChronicleError, FatalError};

pub const CHUNK_MAGIC: u32 = 0xE57D_A7A1;
pub const CHUNK_VERSION: u8 = 1;
pub const HEADER_SIZE: usize = 128;
pub const FOOTER_SIZE: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub chunk_number: u32,
    pub logical_start: i64,
    pub logical_end: i64,
}

impl ChunkHeader {
    fn write_to(&self, buf: &mut [u8; HEADER_SIZE]) {
        LittleEndian::write_u32(&mut buf[0..4], CHUNK_MAGIC);
        buf[4] = CHUNK_VERSION;
        buf[5] = 0; // chunk-type: reserved, always a data chunk today
        LittleEndian::write_u16(&mut buf[6..8], 0);
        LittleEndian::write_u32(&mut buf[8..12], self.chunk_number);
        LittleEndian::write_i64(&mut buf[12..20], self.logical_start);
        LittleEndian::write_i64(&mut buf[20..28], self.logical_end);
        LittleEndian::write_u64(&mut buf[28..36], 0); // physical-size, patched on completion
    }

    fn read_from(buf: &[u8; HEADER_SIZE]) -> Result<Self, ChronicleError> {
        let magic = LittleEndian::read_u32(&buf[0..4]);
        if magic != CHUNK_MAGIC {
            return Err(FatalError::ChunkCorrupt {
                chunk: 0,
                reason: format!("bad magic {magic:#x}"),
            }
            .into());
        }
        Ok(ChunkHeader {
            chunk_number: LittleEndian::read_u32(&buf[8..12]),
            logical_start: LittleEndian::read_i64(&buf[12..20]),
            logical_end: LittleEndian::read_i64(&buf[20..28]),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFooter {
    pub is_complete: bool,
    pub hash: [u8; 32],
    pub record_count: u32,
}

impl ChunkFooter {
    fn write_to(&self, buf: &mut [u8; FOOTER_SIZE]) {
        buf[0] = self.is_complete as u8;
        buf[1..33].copy_from_slice(&self.hash);
        LittleEndian::write_u32(&mut buf[33..37], self.record_count);
    }

    fn read_from(buf: &[u8; FOOTER_SIZE]) -> Self {
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&buf[1..33]);
        ChunkFooter {
            is_complete: buf[0] != 0,
            hash,
            record_count: LittleEndian::read_u32(&buf[33..37]),
        }
    }
}

pub fn chunk_file_name(chunk_number: u32, generation: u32) -> String {
    format!("chunk-{chunk_number:06}.{generation}")
}

/// A single chunk file on disk. The active chunk is append-only and owned
/// exclusively by the Append Coordinator; completed chunks are immutable
/// and safely shared for concurrent reads.
pub struct Chunk {
    pub path: PathBuf,
    pub header: ChunkHeader,
    file: File,
    /// Byte offset within the chunk file where record data begins/ends.
    write_cursor: u64,
    record_count: u32,
    hasher: Sha256,
    pub completed: bool,
    pub max_size: u64,
}

impl Chunk {
    pub fn create(dir: &Path, chunk_number: u32, generation: u32, max_size: u64, logical_start: i64) -> Result<Self, ChronicleError> {
        let path = dir.join(chunk_file_name(chunk_number, generation));
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        let header = ChunkHeader {
            chunk_number,
            logical_start,
            logical_end: logical_start,
        };
        let mut buf = [0u8; HEADER_SIZE];
        header.write_to(&mut buf);
        file.write_all(&buf)?;
        file.flush()?;
        Ok(Self {
            path,
            header,
            file,
            write_cursor: HEADER_SIZE as u64,
            record_count: 0,
            hasher: Sha256::new(),
            completed: false,
            max_size,
        })
    }

    /// Open an existing chunk file. If `expect_complete` is false, the
    /// caller is expected to run [`Chunk::recover`] afterwards (used for
    /// the active chunk on startup, see §4.A "Failure").
    pub fn open(path: PathBuf, max_size: u64) -> Result<Self, ChronicleError> {
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let mut header_buf = [0u8; HEADER_SIZE];
        file.read_exact(&mut header_buf)?;
        let header = ChunkHeader::read_from(&header_buf)?;

        let len = file.metadata()?.len();
        let footer = if len >= (HEADER_SIZE + FOOTER_SIZE) as u64 {
            file.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
            let mut footer_buf = [0u8; FOOTER_SIZE];
            file.read_exact(&mut footer_buf)?;
            let footer = ChunkFooter::read_from(&footer_buf);
            footer.is_complete.then_some(footer)
        } else {
            None
        };
        let completed = footer.is_some();

        let write_cursor = if completed {
            len - FOOTER_SIZE as u64
        } else {
            len
        };

        if let Some(footer) = &footer {
            let mut remaining = write_cursor - HEADER_SIZE as u64;
            let mut hasher = Sha256::new();
            let mut buf = [0u8; 64 * 1024];
            file.seek(SeekFrom::Start(HEADER_SIZE as u64))?;
            while remaining > 0 {
                let take = remaining.min(buf.len() as u64) as usize;
                file.read_exact(&mut buf[..take])?;
                hasher.update(&buf[..take]);
                remaining -= take as u64;
            }
            let computed: [u8; 32] = hasher.finalize().into();
            if computed != footer.hash {
                return Err(FatalError::ChunkCorrupt {
                    chunk: header.chunk_number,
                    reason: "footer hash mismatch on a completed chunk".to_string(),
                }
                .into());
            }
        }
        file.seek(SeekFrom::Start(HEADER_SIZE as u64))?;

        Ok(Self {
            path,
            header,
            file,
            write_cursor,
            record_count: 0,
            hasher: Sha256::new(),
            completed,
            max_size,
        })
    }

    pub fn remaining_capacity(&self) -> u64 {
        self.max_size.saturating_sub(self.write_cursor)
    }

    pub fn logical_start(&self) -> i64 {
        self.header.logical_start
    }

    pub fn logical_end(&self) -> i64 {
        self.header.logical_end
    }

    /// Append a fully-framed record (as produced by [`crate::log::record::encode`]).
    /// Returns the logical position the record was written at (offset from
    /// the start of the chunk, matching `logical_start + local_offset`).
    pub fn append(&mut self, framed: &[u8]) -> Result<i64, ChronicleError> {
        assert!(!self.completed, "cannot append to a completed chunk");
        let local_offset = self.write_cursor - HEADER_SIZE as u64;
        self.file.seek(SeekFrom::Start(self.write_cursor))?;
        self.file.write_all(framed)?;
        self.hasher.update(framed);
        self.write_cursor += framed.len() as u64;
        self.record_count += 1;
        self.header.logical_end = self.header.logical_start + local_offset as i64 + framed.len() as i64;
        Ok(self.header.logical_start + local_offset as i64)
    }

    pub fn flush(&mut self) -> Result<(), ChronicleError> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Mark the chunk complete: writes the footer and truncates the file to
    /// exactly header + records + footer, making it read-only from here on.
    pub fn complete(&mut self) -> Result<(), ChronicleError> {
        self.flush()?;
        let hash: [u8; 32] = self.hasher.clone().finalize().into();
        let footer = ChunkFooter {
            is_complete: true,
            hash,
            record_count: self.record_count,
        };
        let mut buf = [0u8; FOOTER_SIZE];
        footer.write_to(&mut buf);
        self.file.seek(SeekFrom::Start(self.write_cursor))?;
        self.file.write_all(&buf)?;
        self.file.set_len(self.write_cursor + FOOTER_SIZE as u64)?;
        self.file.flush()?;
        self.file.sync_all()?;
        self.completed = true;
        Ok(())
    }

    /// Read `len` bytes at `local_offset` (offset within the chunk's
    /// record region, i.e. not counting the header).
    pub fn read_at(&self, local_offset: u64, len: usize) -> Result<Vec<u8>, ChronicleError> {
        use std::os::unix::fs::FileExt;
        let mut buf = vec![0u8; len];
        self.file
            .read_exact_at(&mut buf, HEADER_SIZE as u64 + local_offset)?;
        Ok(buf)
    }

    pub fn read_u32_at(&self, local_offset: u64) -> Result<u32, ChronicleError> {
        let bytes = self.read_at(local_offset, 4)?;
        Ok(LittleEndian::read_u32(&bytes))
    }

    /// Highest valid local offset (exclusive) containing record bytes; does
    /// not include the footer even if the chunk is complete.
    pub fn record_region_len(&self) -> u64 {
        self.write_cursor - HEADER_SIZE as u64
    }

    /// Scan forward from byte 0, truncating at the first invalid
    /// length-prefix or length-mismatch, per the torn-write recovery rule
    /// in §4.A. Returns the valid record-region length and the list of
    /// `(local_offset, len)` pairs found valid.
    pub fn recover(&mut self) -> Result<Vec<(u64, u32)>, ChronicleError> {
        assert!(!self.completed);
        let total = self.record_region_len();
        let mut offset = 0u64;
        let mut valid = Vec::new();
        while offset + super::record::LENGTH_PREFIX_BYTES as u64 * 2 <= total {
            let len = match self.read_u32_at(offset) {
                Ok(l) => l as u64,
                Err(_) => break,
            };
            let frame_len = super::record::LENGTH_PREFIX_BYTES as u64 * 2 + len;
            if offset + frame_len > total {
                break;
            }
            let suffix = match self.read_u32_at(offset + 4 + len) {
                Ok(l) => l as u64,
                Err(_) => break,
            };
            if suffix != len {
                break;
            }
            valid.push((offset + 4, len as u32));
            offset += frame_len;
        }
        if offset != total {
            tracing::warn!(
                chunk = self.header.chunk_number,
                truncated_from = offset,
                truncated_to = total,
                "torn write detected on startup, truncating active chunk"
            );
            self.file.set_len(HEADER_SIZE as u64 + offset)?;
            self.write_cursor = HEADER_SIZE as u64 + offset;
            self.header.logical_end = self.header.logical_start + offset as i64;
        }
        Ok(valid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::record::{encode, RecordBody, CommitBody};

    fn sample_commit() -> RecordBody {
        RecordBody::Commit(CommitBody {
            transaction_position: 0,
            first_event_number: 0,
            log_position: 0,
        })
    }

    #[test]
    fn create_append_complete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut chunk = Chunk::create(dir.path(), 0, 0, 1 << 20, 0).unwrap();
        let framed = encode(&sample_commit());
        let pos = chunk.append(&framed).unwrap();
        assert_eq!(pos, 0);
        chunk.complete().unwrap();
        assert!(chunk.completed);

        let reopened = Chunk::open(chunk.path.clone(), 1 << 20).unwrap();
        assert!(reopened.completed);
        assert_eq!(reopened.header.logical_end, framed.len() as i64);
    }

    #[test]
    fn torn_write_truncated_on_recover() {
        let dir = tempfile::tempdir().unwrap();
        let path;
        {
            let mut chunk = Chunk::create(dir.path(), 0, 0, 1 << 20, 0).unwrap();
            let framed = encode(&sample_commit());
            chunk.append(&framed).unwrap();
            chunk.flush().unwrap();
            path = chunk.path.clone();
        }
        // Simulate a torn write: append a partial frame directly to the file.
        {
            use std::io::Write as _;
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[1, 2, 3]).unwrap();
        }
        let mut reopened = Chunk::open(path, 1 << 20).unwrap();
        assert!(!reopened.completed);
        let valid = reopened.recover().unwrap();
        assert_eq!(valid.len(), 1);
    }

    #[test]
    fn completed_chunk_with_corrupted_bytes_fails_hash_check_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path;
        {
            let mut chunk = Chunk::create(dir.path(), 0, 0, 1 << 20, 0).unwrap();
            let framed = encode(&sample_commit());
            chunk.append(&framed).unwrap();
            chunk.complete().unwrap();
            path = chunk.path.clone();
        }
        // Flip a byte inside the record region after the footer was stamped,
        // simulating silent corruption of an immutable chunk.
        {
            use std::io::{Seek, SeekFrom, Write as _};
            let mut f = OpenOptions::new().write(true).open(&path).unwrap();
            f.seek(SeekFrom::Start(HEADER_SIZE as u64)).unwrap();
            f.write_all(&[0xFF]).unwrap();
        }
        let err = Chunk::open(path, 1 << 20).unwrap_err();
        assert!(matches!(err, ChronicleError::Fatal(FatalError::ChunkCorrupt { .. })));
    }
}
