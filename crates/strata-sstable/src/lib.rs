//! Immutable sorted-table (SSTable) writer for the strata engine.
//!
//! File layout:
//!
//! ```text
//! ┌──────────────┬──────────────┬─────┬─────────────┬─────────────┬────────┐
//! │ data block 0 │ data block 1 │ ... │ index block │ bloom block │ footer │
//! └──────────────┴──────────────┴─────┴─────────────┴─────────────┴────────┘
//! ```
//!
//! Data and index blocks carry a 5-byte trailer (type byte + CRC-32 of
//! contents‖type). The bloom block is raw filter bytes followed by the
//! hash count. The footer names the index and bloom blocks, records the
//! entry count, sequence range, and min/max user keys, and ends with
//! the magic `0x53535461626C6531` ("SSTable1").
//!
//! Keys inside blocks are *internal keys*: `user_key ‖ ((seq << 8) |
//! type)` encoded little-endian, so entries for one user key sort
//! newest-first. Entries must be fed to the writer in strictly
//! increasing internal-key order; iterating a memtable does this
//! naturally.

pub mod block;
pub mod bloom;
pub mod error;
pub mod format;
pub mod writer;

pub use block::{Block, BlockBuilder, BlockIter, IndexBlockBuilder};
pub use bloom::{BloomFilterBuilder, BloomFilterPolicy, BloomFilterReader};
pub use error::{Result, SSTableError};
pub use format::{BlockHandle, BlockType, Footer, SSTableOptions};
pub use writer::{SSTableWriteStats, SSTableWriter};
