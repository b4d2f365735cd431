//! WAL record framing and entry payload codec.
//!
//! Record: `crc32 LE(4) ‖ length LE(2) ‖ type(1) ‖ payload`.
//!
//! The checksum is the IEEE CRC-32 (polynomial 0xEDB88320, final XOR)
//! of the byte stream `type ‖ payload ‖ length(2 LE)` — the length
//! bytes are folded in last, so any bit flip in the header or payload
//! fails verification. Writer and reader share this one definition.
//!
//! Entry payload:
//!
//! ```text
//! kind(1) ‖ sequence(8 LE) ‖ key_len(varint32) ‖ key ‖ value_len(varint32) ‖ value
//! ```
//!
//! Deletions carry `value_len = 0`.

use std::io;

use bytes::Bytes;
use thiserror::Error;

use strata_core::coding;
use strata_core::types::SequenceNumber;

/// Record header: crc (4) + length (2) + type (1).
pub const HEADER_SIZE: usize = 7;

/// The only record type this log emits; other values are reserved for
/// future chunked records.
pub const RECORD_TYPE_FULL: u8 = 1;

/// Largest payload a record can frame (the length field is u16).
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

#[derive(Debug, Error)]
pub enum WalError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("CRC mismatch: expected {expected:#010x}, got {actual:#010x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("corrupt WAL record: {0}")]
    Corruption(&'static str),

    #[error("WAL entry too large: {0} bytes exceeds the record payload limit")]
    RecordTooLarge(usize),
}

impl WalError {
    /// True for errors that recovery treats as a (soft) end of segment
    /// rather than a hard failure.
    pub fn is_corruption(&self) -> bool {
        matches!(self, WalError::CrcMismatch { .. } | WalError::Corruption(_))
    }
}

/// Distinguishes insertions from deletions in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WalEntryKind {
    Put = 1,
    Delete = 2,
}

impl WalEntryKind {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(WalEntryKind::Put),
            2 => Some(WalEntryKind::Delete),
            _ => None,
        }
    }
}

/// One logged mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalEntry {
    pub kind: WalEntryKind,
    pub sequence: SequenceNumber,
    pub key: Bytes,
    pub value: Bytes,
}

impl WalEntry {
    pub fn put(
        sequence: SequenceNumber,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Self {
        Self {
            kind: WalEntryKind::Put,
            sequence,
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(sequence: SequenceNumber, key: impl Into<Bytes>) -> Self {
        Self {
            kind: WalEntryKind::Delete,
            sequence,
            key: key.into(),
            value: Bytes::new(),
        }
    }

    /// Encodes the entry payload (no record framing).
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + 8 + 5 + self.key.len() + 5 + self.value.len());
        buf.push(self.kind as u8);
        coding::put_fixed64(&mut buf, self.sequence);
        coding::put_varint32(&mut buf, self.key.len() as u32);
        buf.extend_from_slice(&self.key);
        coding::put_varint32(&mut buf, self.value.len() as u32);
        buf.extend_from_slice(&self.value);
        buf
    }

    /// Decodes an entry payload produced by [`encode`](Self::encode).
    pub fn decode(payload: &[u8]) -> Result<Self, WalError> {
        let mut input = payload;

        let &kind_byte = input
            .first()
            .ok_or(WalError::Corruption("empty WAL entry"))?;
        input = &input[1..];
        let kind = WalEntryKind::from_u8(kind_byte)
            .ok_or(WalError::Corruption("reserved WAL entry type"))?;

        if input.len() < 8 {
            return Err(WalError::Corruption("truncated WAL entry sequence"));
        }
        let sequence = coding::decode_fixed64(input);
        input = &input[8..];

        let key_len = coding::get_varint32(&mut input)
            .ok_or(WalError::Corruption("bad WAL entry key length"))?
            as usize;
        if input.len() < key_len {
            return Err(WalError::Corruption("truncated WAL entry key"));
        }
        let key = Bytes::copy_from_slice(&input[..key_len]);
        input = &input[key_len..];

        let value_len = coding::get_varint32(&mut input)
            .ok_or(WalError::Corruption("bad WAL entry value length"))?
            as usize;
        if input.len() < value_len {
            return Err(WalError::Corruption("truncated WAL entry value"));
        }
        let value = Bytes::copy_from_slice(&input[..value_len]);
        input = &input[value_len..];

        if !input.is_empty() {
            return Err(WalError::Corruption("trailing bytes after WAL entry"));
        }

        Ok(Self {
            kind,
            sequence,
            key,
            value,
        })
    }
}

/// Computes the record checksum over `type ‖ payload ‖ length(2 LE)`.
pub fn record_crc(record_type: u8, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&[record_type]);
    hasher.update(payload);
    hasher.update(&(payload.len() as u16).to_le_bytes());
    hasher.finalize()
}

/// Frames a payload into a full record: header plus payload bytes.
pub fn encode_record(payload: &[u8]) -> Result<Vec<u8>, WalError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(WalError::RecordTooLarge(payload.len()));
    }

    let mut record = Vec::with_capacity(HEADER_SIZE + payload.len());
    let crc = record_crc(RECORD_TYPE_FULL, payload);
    record.extend_from_slice(&crc.to_le_bytes());
    record.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    record.push(RECORD_TYPE_FULL);
    record.extend_from_slice(payload);
    Ok(record)
}

/// Parses the record at the front of `data`.
///
/// Returns the payload and the number of bytes consumed. `data` must
/// begin at a record boundary; the caller handles positioning.
pub fn decode_record(data: &[u8]) -> Result<(&[u8], usize), WalError> {
    if data.len() < HEADER_SIZE {
        return Err(WalError::Corruption("truncated record header"));
    }

    let stored_crc = coding::decode_fixed32(&data[0..4]);
    let length = u16::from_le_bytes([data[4], data[5]]) as usize;
    let record_type = data[6];

    if data.len() < HEADER_SIZE + length {
        return Err(WalError::Corruption("truncated record payload"));
    }
    let payload = &data[HEADER_SIZE..HEADER_SIZE + length];

    let computed = record_crc(record_type, payload);
    if stored_crc != computed {
        return Err(WalError::CrcMismatch {
            expected: stored_crc,
            actual: computed,
        });
    }

    if record_type != RECORD_TYPE_FULL {
        return Err(WalError::Corruption("unsupported record type"));
    }

    Ok((payload, HEADER_SIZE + length))
}
