//! Shared vocabulary for the strata storage engine.
//!
//! Every other crate in the workspace builds on these pieces:
//! - [`types`]: sequence numbers, value types, internal keys and their
//!   ordering, and lookup results.
//! - [`coding`]: varint and fixed-width little-endian integer encodings
//!   used by the WAL and SSTable formats.
//! - [`hash`]: MurmurHash-64A, the hash behind the Bloom filter.
//!
//! Nothing here touches the filesystem; this crate is pure data plumbing.

pub mod coding;
pub mod hash;
pub mod types;

pub use types::{
    InternalKey, LookupResult, SequenceNumber, ValueType, MAX_SEQUENCE,
};
