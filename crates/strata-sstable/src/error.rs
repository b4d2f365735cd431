//! Error types for SSTable operations.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SSTableError {
    /// I/O failure from the filesystem.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Checksum mismatch in a block trailer or record.
    #[error("CRC mismatch: expected {expected:#010x}, got {actual:#010x}")]
    CrcMismatch { expected: u32, actual: u32 },

    /// Entries were not supplied in strictly increasing internal-key
    /// order.
    #[error("keys must be added in sorted order: {0:?} then {1:?}")]
    KeysNotSorted(Vec<u8>, Vec<u8>),

    /// Structural damage: bad magic, reserved type tag, malformed
    /// varint, restart array out of bounds.
    #[error("invalid SSTable format: {0}")]
    InvalidFormat(String),

    /// Input ended before a complete structure could be decoded.
    #[error("incomplete data")]
    Incomplete,
}

pub type Result<T> = std::result::Result<T, SSTableError>;
