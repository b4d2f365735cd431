//! In-memory write path of the strata engine.
//!
//! Writes land in a [`MemTable`]: an arena-backed, single-writer /
//! multi-reader skip list of internal keys. The [`MemTableManager`]
//! owns the active memtable plus the chain of frozen (immutable)
//! memtables awaiting flush, allocates sequence numbers, and rotates
//! the active table when it fills.
//!
//! ```text
//!         writes (one at a time, under the manager's write lock)
//!            │
//!            ▼
//!     ┌─────────────┐   rotation   ┌──────────────┐
//!     │   active    │ ───────────► │  immutables  │ ──► SSTable flush
//!     │  MemTable   │              │ (newest last)│
//!     └─────────────┘              └──────────────┘
//!            ▲
//!   lock-free reads (any thread, snapshot-consistent)
//! ```

pub mod arena;
pub mod manager;
pub mod memtable;
pub mod skiplist;

pub use arena::Arena;
pub use manager::{FlushCallback, MemTableManager, MemTableSet};
pub use memtable::{MemTable, MemTableIter, MemTableOptions};
