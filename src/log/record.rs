// Copyright (c) Chronicle Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! On-disk record framing for the chunked log.
//!
//! Every record is length-prefixed on both ends (`u32 length | payload |
//! u32 length`) so the log can be scanned backward as well as forward. The
//! payload always starts with a one-byte record-type discriminator.

use byteorder::{ByteOrder, LittleEndian};
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ChronicleError, FatalError};
use crate::event::Event;
use crate::ids::{EventId, EventNumber, LogPosition, StreamId};

const FLAG_IS_JSON: u8 = 0b0000_0001;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    Prepare = 0,
    Commit = 1,
    System = 2,
    PrepareCommit = 3,
}

impl RecordType {
    fn from_byte(b: u8) -> Result<Self, ChronicleError> {
        match b {
            0 => Ok(RecordType::Prepare),
            1 => Ok(RecordType::Commit),
            2 => Ok(RecordType::System),
            3 => Ok(RecordType::PrepareCommit),
            other => Err(FatalError::ChunkCorrupt {
                chunk: 0,
                reason: format!("unknown record type discriminator {other}"),
            }
            .into()),
        }
    }
}

/// The prepare portion of a record: the event payload plus transaction
/// bookkeeping. Carried alone for multi-event transactions, or combined
/// with a [`CommitBody`] for single-event appends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareBody {
    pub transaction_position: i64,
    pub transaction_offset: i32,
    pub stream_id: StreamId,
    pub event_number: EventNumber,
    pub event_id: EventId,
    pub event_type: String,
    pub is_json: bool,
    pub created_at_ms: u64,
    pub data: Bytes,
    pub metadata: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitBody {
    pub transaction_position: i64,
    pub first_event_number: EventNumber,
    pub log_position: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordBody {
    Prepare(PrepareBody),
    Commit(CommitBody),
    PrepareCommit(PrepareBody, CommitBody),
    System { key: String, payload: Bytes },
}

impl RecordBody {
    pub fn record_type(&self) -> RecordType {
        match self {
            RecordBody::Prepare(_) => RecordType::Prepare,
            RecordBody::Commit(_) => RecordType::Commit,
            RecordBody::PrepareCommit(_, _) => RecordType::PrepareCommit,
            RecordBody::System { .. } => RecordType::System,
        }
    }

    pub fn prepare(&self) -> Option<&PrepareBody> {
        match self {
            RecordBody::Prepare(p) => Some(p),
            RecordBody::PrepareCommit(p, _) => Some(p),
            _ => None,
        }
    }

    pub fn commit(&self) -> Option<&CommitBody> {
        match self {
            RecordBody::Commit(c) => Some(c),
            RecordBody::PrepareCommit(_, c) => Some(c),
            _ => None,
        }
    }
}

fn put_bytes_field(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32_le(data.len() as u32);
    buf.put_slice(data);
}

fn get_bytes_field(buf: &mut Bytes) -> Result<Bytes, ChronicleError> {
    if buf.remaining() < 4 {
        return Err(corrupt("truncated length field"));
    }
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len {
        return Err(corrupt("truncated bytes field"));
    }
    Ok(buf.split_to(len))
}

fn put_str_field(buf: &mut BytesMut, s: &str) {
    put_bytes_field(buf, s.as_bytes());
}

fn get_str_field(buf: &mut Bytes) -> Result<String, ChronicleError> {
    let bytes = get_bytes_field(buf)?;
    String::from_utf8(bytes.to_vec()).map_err(|e| corrupt(&format!("invalid utf8: {e}")))
}

fn corrupt(reason: &str) -> ChronicleError {
    FatalError::ChunkCorrupt {
        chunk: 0,
        reason: reason.to_string(),
    }
    .into()
}

fn encode_prepare(buf: &mut BytesMut, body: &PrepareBody) {
    buf.put_i64_le(body.transaction_position);
    buf.put_i32_le(body.transaction_offset);
    put_str_field(buf, body.stream_id.as_str());
    buf.put_i64_le(body.event_number);
    buf.put_u128_le(body.event_id.as_u128());
    put_str_field(buf, &body.event_type);
    let flags = if body.is_json { FLAG_IS_JSON } else { 0 };
    buf.put_u8(flags);
    buf.put_u64_le(body.created_at_ms);
    put_bytes_field(buf, &body.data);
    put_bytes_field(buf, &body.metadata);
}

fn decode_prepare(buf: &mut Bytes) -> Result<PrepareBody, ChronicleError> {
    if buf.remaining() < 8 + 4 {
        return Err(corrupt("truncated prepare header"));
    }
    let transaction_position = buf.get_i64_le();
    let transaction_offset = buf.get_i32_le();
    let stream_id = StreamId::new(get_str_field(buf)?)
        .map_err(|_| corrupt("empty stream id in prepare record"))?;
    let event_number = buf.get_i64_le();
    let event_id = EventId::from_u128(buf.get_u128_le());
    let event_type = get_str_field(buf)?;
    let flags = buf.get_u8();
    let created_at_ms = buf.get_u64_le();
    let data = get_bytes_field(buf)?;
    let metadata = get_bytes_field(buf)?;
    Ok(PrepareBody {
        transaction_position,
        transaction_offset,
        stream_id,
        event_number,
        event_id,
        event_type,
        is_json: flags & FLAG_IS_JSON != 0,
        created_at_ms,
        data,
        metadata,
    })
}

fn encode_commit(buf: &mut BytesMut, body: &CommitBody) {
    buf.put_i64_le(body.transaction_position);
    buf.put_i64_le(body.first_event_number);
    buf.put_i64_le(body.log_position);
}

fn decode_commit(buf: &mut Bytes) -> Result<CommitBody, ChronicleError> {
    if buf.remaining() < 24 {
        return Err(corrupt("truncated commit body"));
    }
    Ok(CommitBody {
        transaction_position: buf.get_i64_le(),
        first_event_number: buf.get_i64_le(),
        log_position: buf.get_i64_le(),
    })
}

/// Serialize a record body to its on-disk framed form (length-prefixed on
/// both ends, as described in the Chunked Log component design).
pub fn encode(body: &RecordBody) -> BytesMut {
    let mut payload = BytesMut::new();
    payload.put_u8(body.record_type() as u8);
    match body {
        RecordBody::Prepare(p) => encode_prepare(&mut payload, p),
        RecordBody::Commit(c) => encode_commit(&mut payload, c),
        RecordBody::PrepareCommit(p, c) => {
            encode_prepare(&mut payload, p);
            encode_commit(&mut payload, c);
        }
        RecordBody::System { key, payload: data } => {
            put_str_field(&mut payload, key);
            put_bytes_field(&mut payload, data);
        }
    }

    let mut framed = BytesMut::with_capacity(payload.len() + 8);
    framed.put_u32_le(payload.len() as u32);
    framed.put_slice(&payload);
    framed.put_u32_le(payload.len() as u32);
    framed
}

/// Parse a framed record out of `buf`, which must contain exactly one
/// record's bytes (the caller is responsible for locating the frame
/// boundaries via the length prefixes).
pub fn decode(mut payload: Bytes) -> Result<RecordBody, ChronicleError> {
    if payload.is_empty() {
        return Err(corrupt("empty record payload"));
    }
    let record_type = RecordType::from_byte(payload.get_u8())?;
    match record_type {
        RecordType::Prepare => Ok(RecordBody::Prepare(decode_prepare(&mut payload)?)),
        RecordType::Commit => Ok(RecordBody::Commit(decode_commit(&mut payload)?)),
        RecordType::PrepareCommit => {
            let prepare = decode_prepare(&mut payload)?;
            let commit = decode_commit(&mut payload)?;
            Ok(RecordBody::PrepareCommit(prepare, commit))
        }
        RecordType::System => {
            let key = get_str_field(&mut payload)?;
            let payload = get_bytes_field(&mut payload)?;
            Ok(RecordBody::System { key, payload })
        }
    }
}

pub fn prepare_body_for_event(
    stream_id: &StreamId,
    event_number: EventNumber,
    event: &Event,
    transaction_position: i64,
    transaction_offset: i32,
    created_at_ms: u64,
) -> PrepareBody {
    PrepareBody {
        transaction_position,
        transaction_offset,
        stream_id: stream_id.clone(),
        event_number,
        event_id: event.event_id,
        event_type: event.event_type.clone(),
        is_json: event.is_json,
        created_at_ms,
        data: event.data.clone(),
        metadata: event.metadata.clone(),
    }
}

/// Length prefix size, exposed so the chunk scanner can peek the next
/// frame's size without fully decoding it.
pub const LENGTH_PREFIX_BYTES: usize = 4;

pub fn read_length_prefix(bytes: &[u8]) -> u32 {
    LittleEndian::read_u32(bytes)
}

impl From<&CommitBody> for LogPosition {
    fn from(c: &CommitBody) -> Self {
        LogPosition::new(c.log_position, c.transaction_position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_prepare() -> PrepareBody {
        PrepareBody {
            transaction_position: 128,
            transaction_offset: 0,
            stream_id: StreamId::new("orders-1").unwrap(),
            event_number: 0,
            event_id: EventId::new_v4(),
            event_type: "OrderPlaced".to_string(),
            is_json: true,
            created_at_ms: 1234,
            data: Bytes::from_static(b"{\"x\":1}"),
            metadata: Bytes::new(),
        }
    }

    #[test]
    fn prepare_roundtrip() {
        let body = RecordBody::Prepare(sample_prepare());
        let framed = encode(&body);
        let len = read_length_prefix(&framed[0..4]) as usize;
        let suffix_len = read_length_prefix(&framed[framed.len() - 4..]) as usize;
        assert_eq!(len, suffix_len);
        let payload = Bytes::copy_from_slice(&framed[4..4 + len]);
        let decoded = decode(payload).unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn prepare_commit_roundtrip() {
        let prepare = sample_prepare();
        let commit = CommitBody {
            transaction_position: prepare.transaction_position,
            first_event_number: 0,
            log_position: 128,
        };
        let body = RecordBody::PrepareCommit(prepare, commit);
        let framed = encode(&body);
        let len = read_length_prefix(&framed[0..4]) as usize;
        let payload = Bytes::copy_from_slice(&framed[4..4 + len]);
        let decoded = decode(payload).unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn corrupt_discriminator_is_rejected() {
        let mut framed = BytesMut::new();
        framed.put_u32_le(1);
        framed.put_u8(0xFF);
        framed.put_u32_le(1);
        let payload = Bytes::copy_from_slice(&framed[4..5]);
        assert!(decode(payload).is_err());
    }
}
