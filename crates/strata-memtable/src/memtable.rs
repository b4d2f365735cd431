//! Memtable: one skip list of internal keys plus MVCC lookup semantics.
//!
//! Each entry is encoded into the arena as
//!
//! ```text
//! varint32(internal_key_len) ‖ user_key ‖ packed(8 LE) ‖ varint32(value_len) ‖ value
//! ```
//!
//! and the skip-list key is a (pointer, length) view of those bytes, so
//! entry payloads and node memory share the arena's lifetime and nothing
//! requires per-entry destruction.
//!
//! Sharing: a memtable is held through `Arc`. Clones are taken under the
//! manager's lock; dropping the last handle releases the arena and with
//! it every node and entry.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use strata_core::coding;
use strata_core::types::{
    self, pack_sequence_and_type, LookupResult, SequenceNumber, ValueType, MAX_SEQUENCE,
    PACKED_SUFFIX_LEN,
};

use crate::arena::Arena;
use crate::skiplist::{Comparator, Iter as ListIter, SkipList};

/// Memtable tuning knobs.
#[derive(Debug, Clone)]
pub struct MemTableOptions {
    /// Rotation threshold: `should_flush` fires at or above this many
    /// bytes of approximate usage.
    pub max_size: usize,
}

impl Default for MemTableOptions {
    fn default() -> Self {
        Self {
            max_size: 4 * 1024 * 1024,
        }
    }
}

/// A (pointer, length) view of one arena-encoded entry.
#[derive(Clone, Copy)]
pub(crate) struct EntryRef {
    ptr: *const u8,
    len: u32,
}

impl Default for EntryRef {
    fn default() -> Self {
        // Placeholder for the skip-list head; never decoded or compared.
        Self {
            ptr: std::ptr::null(),
            len: 0,
        }
    }
}

// EntryRef points into the arena owned by the same memtable; the arena
// outlives every node that references it.
unsafe impl Send for EntryRef {}
unsafe impl Sync for EntryRef {}

impl EntryRef {
    #[inline]
    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len as usize) }
    }

    /// The encoded internal key (`user_key ‖ packed`).
    fn internal_key(&self) -> &[u8] {
        let mut input = self.as_slice();
        let klen = coding::get_varint32(&mut input).expect("corrupt memtable entry") as usize;
        &input[..klen]
    }

    fn user_key(&self) -> &[u8] {
        types::extract_user_key(self.internal_key())
    }

    fn sequence(&self) -> SequenceNumber {
        types::extract_packed(self.internal_key()) >> 8
    }

    fn value_type(&self) -> ValueType {
        let tag = (types::extract_packed(self.internal_key()) & 0xff) as u8;
        ValueType::from_u8(tag).expect("corrupt value type in memtable entry")
    }

    fn value(&self) -> &[u8] {
        let mut input = self.as_slice();
        let klen = coding::get_varint32(&mut input).expect("corrupt memtable entry") as usize;
        input = &input[klen..];
        let vlen = coding::get_varint32(&mut input).expect("corrupt memtable entry") as usize;
        &input[..vlen]
    }
}

/// Orders entries by internal key: user key ascending, sequence
/// descending. The value type is not part of the order.
pub(crate) struct EntryComparator;

impl Comparator<EntryRef> for EntryComparator {
    #[inline]
    fn compare(&self, a: &EntryRef, b: &EntryRef) -> CmpOrdering {
        types::compare_encoded(a.internal_key(), b.internal_key())
    }
}

/// Per-entry accounting overhead: packed suffix, type tag, and the
/// entry-header view stored in the node.
const ENTRY_OVERHEAD: usize =
    std::mem::size_of::<SequenceNumber>() + 1 + std::mem::size_of::<EntryRef>();

pub struct MemTable {
    options: MemTableOptions,
    arena: Arc<Arena>,
    table: SkipList<EntryRef, EntryComparator>,
    approximate_memory_usage: AtomicUsize,
    entry_count: AtomicUsize,
    min_sequence: AtomicU64,
    max_sequence: AtomicU64,
}

impl MemTable {
    pub fn new(options: MemTableOptions) -> Self {
        let arena = Arc::new(Arena::new());
        let table = SkipList::new(EntryComparator, Arc::clone(&arena));
        Self {
            options,
            arena,
            table,
            approximate_memory_usage: AtomicUsize::new(0),
            entry_count: AtomicUsize::new(0),
            min_sequence: AtomicU64::new(MAX_SEQUENCE),
            max_sequence: AtomicU64::new(0),
        }
    }

    /// Inserts a value entry. Caller must hold the manager's write lock
    /// (single-writer discipline).
    pub fn put(&self, seq: SequenceNumber, key: &[u8], value: &[u8]) {
        self.add(seq, ValueType::Value, key, value);
    }

    /// Inserts a tombstone.
    pub fn delete(&self, seq: SequenceNumber, key: &[u8]) {
        self.add(seq, ValueType::Deletion, key, &[]);
    }

    /// Snapshot lookup: returns the entry with the largest sequence
    /// ≤ `snapshot` for `key`, interpreted as found/deleted, or
    /// `NotFound`.
    pub fn get(&self, key: &[u8], snapshot: SequenceNumber) -> LookupResult {
        let probe = encode_probe(key, snapshot);
        let probe_ref = EntryRef {
            ptr: probe.as_ptr(),
            len: probe.len() as u32,
        };

        let mut iter = self.table.iter();
        iter.seek(&probe_ref);
        if iter.valid() {
            let entry = iter.key();
            // Sequences sort descending within a user key, so the seek
            // lands on the newest entry with sequence ≤ snapshot.
            if entry.user_key() == key {
                return match entry.value_type() {
                    ValueType::Deletion => LookupResult::Deleted,
                    ValueType::Value => LookupResult::Found(Bytes::copy_from_slice(entry.value())),
                };
            }
        }
        LookupResult::NotFound
    }

    /// Approximate bytes consumed by entries; monotonically
    /// non-decreasing for the memtable's lifetime.
    pub fn approximate_memory_usage(&self) -> usize {
        self.approximate_memory_usage.load(Ordering::Relaxed)
    }

    /// Arena bytes actually reserved.
    pub fn arena_usage(&self) -> usize {
        self.arena.memory_usage()
    }

    pub fn should_flush(&self) -> bool {
        self.approximate_memory_usage() >= self.options.max_size
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count.load(Ordering::Relaxed)
    }

    pub fn min_sequence(&self) -> SequenceNumber {
        self.min_sequence.load(Ordering::Relaxed)
    }

    pub fn max_sequence(&self) -> SequenceNumber {
        self.max_sequence.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count() == 0
    }

    pub fn iter(&self) -> MemTableIter<'_> {
        MemTableIter {
            inner: self.table.iter(),
        }
    }

    fn add(&self, seq: SequenceNumber, ty: ValueType, key: &[u8], value: &[u8]) {
        let entry = self.encode_entry(seq, ty, key, value);
        self.table.insert(entry);

        let entry_size = key.len() + value.len() + ENTRY_OVERHEAD;
        self.approximate_memory_usage
            .fetch_add(entry_size, Ordering::Relaxed);
        self.entry_count.fetch_add(1, Ordering::Relaxed);
        self.min_sequence.fetch_min(seq, Ordering::Relaxed);
        self.max_sequence.fetch_max(seq, Ordering::Relaxed);
    }

    fn encode_entry(
        &self,
        seq: SequenceNumber,
        ty: ValueType,
        key: &[u8],
        value: &[u8],
    ) -> EntryRef {
        let ikey_len = key.len() + PACKED_SUFFIX_LEN;
        let mut buf =
            Vec::with_capacity(ikey_len + value.len() + 2 * coding::varint_length(u32::MAX as u64));
        coding::put_varint32(&mut buf, ikey_len as u32);
        buf.extend_from_slice(key);
        coding::put_fixed64(&mut buf, pack_sequence_and_type(seq, ty));
        coding::put_varint32(&mut buf, value.len() as u32);
        buf.extend_from_slice(value);

        let dst = self.arena.allocate(buf.len());
        unsafe {
            std::ptr::copy_nonoverlapping(buf.as_ptr(), dst, buf.len());
        }
        EntryRef {
            ptr: dst,
            len: buf.len() as u32,
        }
    }
}

/// Encodes a probe entry `(key, snapshot, Value)` in the same layout as
/// stored entries so it can be compared against them.
fn encode_probe(key: &[u8], snapshot: SequenceNumber) -> Vec<u8> {
    let ikey_len = key.len() + PACKED_SUFFIX_LEN;
    let mut buf = Vec::with_capacity(ikey_len + 6);
    coding::put_varint32(&mut buf, ikey_len as u32);
    buf.extend_from_slice(key);
    coding::put_fixed64(&mut buf, pack_sequence_and_type(snapshot, ValueType::Value));
    coding::put_varint32(&mut buf, 0);
    buf
}

/// Cursor over a memtable in internal-key order.
pub struct MemTableIter<'a> {
    inner: ListIter<'a, EntryRef, EntryComparator>,
}

impl<'a> MemTableIter<'a> {
    pub fn valid(&self) -> bool {
        self.inner.valid()
    }

    pub fn seek_to_first(&mut self) {
        self.inner.seek_to_first();
    }

    pub fn seek_to_last(&mut self) {
        self.inner.seek_to_last();
    }

    /// Positions at the first entry with internal key ≥ (key, seq).
    pub fn seek(&mut self, key: &[u8], seq: SequenceNumber) {
        let probe = encode_probe(key, seq);
        let probe_ref = EntryRef {
            ptr: probe.as_ptr(),
            len: probe.len() as u32,
        };
        self.inner.seek(&probe_ref);
    }

    pub fn next(&mut self) {
        self.inner.next();
    }

    pub fn prev(&mut self) {
        self.inner.prev();
    }

    pub fn user_key(&self) -> &[u8] {
        self.inner.key().user_key()
    }

    pub fn sequence(&self) -> SequenceNumber {
        self.inner.key().sequence()
    }

    pub fn value_type(&self) -> ValueType {
        self.inner.key().value_type()
    }

    pub fn value(&self) -> &[u8] {
        self.inner.key().value()
    }

    /// The encoded internal key (`user_key ‖ packed`).
    pub fn internal_key(&self) -> &[u8] {
        self.inner.key().internal_key()
    }
}
