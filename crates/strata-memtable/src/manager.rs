//! Active + immutable memtable chain with atomic rotation.
//!
//! One reader/writer lock guards the active-vs-immutable split; the
//! sequence counter is a plain atomic reachable without the lock.
//! Rotation freezes the active table onto the back of the immutable
//! queue and fires the flush callback synchronously, still under the
//! write lock, so the flusher observes the frozen table before any
//! later write.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::debug;

use strata_core::types::{LookupResult, SequenceNumber, ValueType};

use crate::memtable::{MemTable, MemTableOptions};

/// Invoked with the frozen memtable when rotation occurs, synchronously
/// under the manager's write lock.
pub type FlushCallback = Box<dyn Fn(&Arc<MemTable>) + Send + Sync>;

/// Accounting charge per write used for the manager-wide total.
const WRITE_OVERHEAD: usize = 32;

struct State {
    active: Arc<MemTable>,
    /// Frozen memtables, oldest at the front.
    immutables: VecDeque<Arc<MemTable>>,
    flush_callback: Option<FlushCallback>,
}

pub struct MemTableManager {
    options: MemTableOptions,
    state: RwLock<State>,
    current_sequence: AtomicU64,
    total_memory_usage: AtomicUsize,
    immutable_count: AtomicUsize,
    // The flush condvar pairs with its own mutex; the predicate is the
    // atomic immutable count.
    flush_mutex: Mutex<()>,
    flush_cv: Condvar,
}

impl MemTableManager {
    pub fn new(options: MemTableOptions) -> Self {
        let active = Arc::new(MemTable::new(options.clone()));
        Self {
            options,
            state: RwLock::new(State {
                active,
                immutables: VecDeque::new(),
                flush_callback: None,
            }),
            current_sequence: AtomicU64::new(0),
            total_memory_usage: AtomicUsize::new(0),
            immutable_count: AtomicUsize::new(0),
            flush_mutex: Mutex::new(()),
            flush_cv: Condvar::new(),
        }
    }

    /// Inserts a value. Returns true when the write rotated the active
    /// memtable.
    pub fn put(&self, key: &[u8], value: &[u8]) -> bool {
        self.write(ValueType::Value, key, value)
    }

    /// Inserts a tombstone. Returns true when the write rotated the
    /// active memtable.
    pub fn delete(&self, key: &[u8]) -> bool {
        self.write(ValueType::Deletion, key, &[])
    }

    /// Reads at the current sequence snapshot.
    pub fn get(&self, key: &[u8]) -> LookupResult {
        let snapshot = self.current_sequence.load(Ordering::Acquire);
        self.get_at(key, snapshot)
    }

    /// Reads at an explicit snapshot: active first, then immutables
    /// newest to oldest; the first conclusive answer wins.
    pub fn get_at(&self, key: &[u8], snapshot: SequenceNumber) -> LookupResult {
        let state = self.state.read();

        let result = state.active.get(key, snapshot);
        if result.is_conclusive() {
            return result;
        }
        for imm in state.immutables.iter().rev() {
            let result = imm.get(key, snapshot);
            if result.is_conclusive() {
                return result;
            }
        }
        LookupResult::NotFound
    }

    /// Freezes the active memtable regardless of its size.
    pub fn force_rotation(&self) {
        let mut state = self.state.write();
        self.rotate_locked(&mut state);
    }

    /// Pops the oldest immutable after its flush completed and wakes
    /// writers blocked in [`wait_for_flush`](Self::wait_for_flush).
    pub fn remove_flushed_memtable(&self) {
        let removed = {
            let mut state = self.state.write();
            state.immutables.pop_front()
        };
        if let Some(oldest) = removed {
            self.total_memory_usage
                .fetch_sub(oldest.approximate_memory_usage(), Ordering::Relaxed);
            self.immutable_count.fetch_sub(1, Ordering::Release);
            drop(oldest);

            // Touch the mutex so a waiter between its predicate check
            // and its wait cannot miss the notification.
            drop(self.flush_mutex.lock());
            self.flush_cv.notify_all();
        }
    }

    /// Oldest frozen memtable, if any, kept alive by the returned Arc.
    pub fn oldest_immutable(&self) -> Option<Arc<MemTable>> {
        self.state.read().immutables.front().cloned()
    }

    /// Blocks until fewer than `max_pending` immutables remain or the
    /// timeout elapses. Returns whether the predicate held.
    pub fn wait_for_flush(&self, max_pending: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.flush_mutex.lock();
        while self.immutable_count.load(Ordering::Acquire) >= max_pending {
            if self.flush_cv.wait_until(&mut guard, deadline).timed_out() {
                return self.immutable_count.load(Ordering::Acquire) < max_pending;
            }
        }
        true
    }

    pub fn current_sequence(&self) -> SequenceNumber {
        self.current_sequence.load(Ordering::Acquire)
    }

    /// Hands out the next sequence number.
    pub fn allocate_sequence(&self) -> SequenceNumber {
        self.current_sequence.fetch_add(1, Ordering::AcqRel)
    }

    /// Resumes the allocator above a recovered maximum. Used once after
    /// WAL replay, before writes start.
    pub fn store_sequence(&self, seq: SequenceNumber) {
        self.current_sequence.store(seq, Ordering::Release);
    }

    pub fn total_memory_usage(&self) -> usize {
        self.total_memory_usage.load(Ordering::Relaxed)
    }

    pub fn immutable_count(&self) -> usize {
        self.immutable_count.load(Ordering::Relaxed)
    }

    pub fn active_memory_usage(&self) -> usize {
        self.state.read().active.approximate_memory_usage()
    }

    pub fn set_flush_callback(&self, callback: FlushCallback) {
        self.state.write().flush_callback = Some(callback);
    }

    /// Snapshot of every live memtable plus the sequence to read at.
    /// The returned set keeps its tables alive until dropped.
    pub fn get_current_memtables(&self) -> MemTableSet {
        let state = self.state.read();
        let snapshot = self.current_sequence.load(Ordering::Acquire);

        let mut tables = Vec::with_capacity(1 + state.immutables.len());
        tables.push(Arc::clone(&state.active));
        // Lookup-priority order: active, then immutables newest first.
        for imm in state.immutables.iter().rev() {
            tables.push(Arc::clone(imm));
        }

        MemTableSet { tables, snapshot }
    }

    fn write(&self, ty: ValueType, key: &[u8], value: &[u8]) -> bool {
        let mut state = self.state.write();

        let rotated = if state.active.should_flush() {
            self.rotate_locked(&mut state);
            true
        } else {
            false
        };

        let seq = self.current_sequence.fetch_add(1, Ordering::AcqRel);
        match ty {
            ValueType::Value => state.active.put(seq, key, value),
            ValueType::Deletion => state.active.delete(seq, key),
        }

        self.total_memory_usage
            .fetch_add(key.len() + value.len() + WRITE_OVERHEAD, Ordering::Relaxed);

        rotated
    }

    fn rotate_locked(&self, state: &mut State) {
        let frozen = std::mem::replace(
            &mut state.active,
            Arc::new(MemTable::new(self.options.clone())),
        );
        debug!(
            entries = frozen.entry_count(),
            bytes = frozen.approximate_memory_usage(),
            "memtable rotated"
        );
        state.immutables.push_back(Arc::clone(&frozen));
        self.immutable_count.fetch_add(1, Ordering::Release);

        if let Some(callback) = &state.flush_callback {
            callback(&frozen);
        }
    }
}

impl Default for MemTableManager {
    fn default() -> Self {
        Self::new(MemTableOptions::default())
    }
}

/// Reference-counted bundle of memtables pinned for external traversal
/// (e.g. a flusher or an engine-level read path). Tables are listed in
/// lookup-priority order: active first, then immutables newest to
/// oldest. Dropping the set releases every table.
pub struct MemTableSet {
    pub tables: Vec<Arc<MemTable>>,
    pub snapshot: SequenceNumber,
}

impl MemTableSet {
    /// Looks `key` up across the chain at the set's snapshot.
    pub fn get(&self, key: &[u8]) -> LookupResult {
        for table in &self.tables {
            let result = table.get(key, self.snapshot);
            if result.is_conclusive() {
                return result;
            }
        }
        LookupResult::NotFound
    }
}
