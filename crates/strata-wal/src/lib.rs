//! Append-only write-ahead log with CRC-framed records, pluggable sync
//! policies, size-based segment rotation, and crash-safe recovery.
//!
//! Layout on disk: a directory `<db>/wal` of numbered segments
//! (`log.000001`, `log.000002`, …). Each segment is a sequence of
//! records:
//!
//! ```text
//! crc32 LE(4) ‖ length LE(2) ‖ type(1) ‖ payload(length)
//! ```
//!
//! Every record is self-contained (type `Full`); the payload carries one
//! Put or Delete entry. Recovery replays segments in ascending order and
//! treats corruption at a segment's tail as a clean end of that segment
//! — the expected signature of a crash mid-write.

pub mod manager;
pub mod reader;
pub mod record;
pub mod writer;

pub use manager::WalManager;
pub use reader::{RecoveryStats, WalReader};
pub use record::{WalEntry, WalEntryKind, WalError};
pub use writer::{SyncPolicy, WalOptions, WalWriter};

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, WalError>;
