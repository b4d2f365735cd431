//! Bump-pointer arena backing a memtable's skip list.
//!
//! Memory is carved from 4 KiB blocks. Allocations never move and are
//! never freed individually; the whole arena is released when the
//! owning memtable is dropped. `reset` keeps the first block for reuse.
//!
//! Concurrency: exactly one thread allocates at a time (the memtable
//! writer). Other threads may only read `memory_usage` and dereference
//! pointers the writer previously published.

use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

/// Granularity of normal arena blocks.
pub const BLOCK_SIZE: usize = 4096;

/// Accounting overhead charged per block, covering the block pointer
/// bookkeeping.
const BLOCK_OVERHEAD: usize = std::mem::size_of::<Block>();

struct Block {
    ptr: *mut u8,
    layout: Layout,
}

struct Inner {
    /// Bump pointer into the current block.
    alloc_ptr: *mut u8,
    /// Bytes left in the current block.
    alloc_remaining: usize,
    blocks: Vec<Block>,
}

pub struct Arena {
    inner: Mutex<Inner>,
    memory_usage: AtomicUsize,
}

// Blocks are owned raw allocations; the mutex serializes the allocator
// state and published pointers are immutable once handed out.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                alloc_ptr: std::ptr::null_mut(),
                alloc_remaining: 0,
                blocks: Vec::new(),
            }),
            memory_usage: AtomicUsize::new(0),
        }
    }

    /// Allocates `bytes` with no particular alignment.
    ///
    /// Panics if `bytes` is zero.
    pub fn allocate(&self, bytes: usize) -> *mut u8 {
        assert!(bytes > 0);
        let mut inner = self.inner.lock();
        if bytes <= inner.alloc_remaining {
            let result = inner.alloc_ptr;
            inner.alloc_ptr = unsafe { inner.alloc_ptr.add(bytes) };
            inner.alloc_remaining -= bytes;
            return result;
        }
        self.allocate_fallback(&mut inner, bytes, 1)
    }

    /// Allocates `bytes` aligned to `align`, which must be a power of
    /// two. The bump pointer is padded up to the alignment first.
    pub fn allocate_aligned(&self, bytes: usize, align: usize) -> *mut u8 {
        assert!(bytes > 0);
        assert!(align.is_power_of_two());

        let mut inner = self.inner.lock();
        let current = inner.alloc_ptr as usize;
        let padding = (align - (current & (align - 1))) & (align - 1);
        let needed = bytes + padding;

        if needed <= inner.alloc_remaining {
            let result = unsafe { inner.alloc_ptr.add(padding) };
            inner.alloc_ptr = unsafe { inner.alloc_ptr.add(needed) };
            inner.alloc_remaining -= needed;
            debug_assert_eq!(result as usize & (align - 1), 0);
            return result;
        }
        self.allocate_fallback(&mut inner, bytes, align)
    }

    /// Total bytes owned by the arena, including per-block bookkeeping.
    /// Monotonically non-decreasing across allocations.
    pub fn memory_usage(&self) -> usize {
        self.memory_usage.load(Ordering::Relaxed)
    }

    /// Retains the first block, frees all later blocks, and rewinds the
    /// bump pointer to the start of the first block.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        if inner.blocks.is_empty() {
            return;
        }
        for block in inner.blocks.drain(1..) {
            unsafe { dealloc(block.ptr, block.layout) };
        }
        let first = &inner.blocks[0];
        let (ptr, size) = (first.ptr, first.layout.size());
        inner.alloc_ptr = ptr;
        inner.alloc_remaining = size;
        self.memory_usage
            .store(size + BLOCK_OVERHEAD, Ordering::Relaxed);
    }

    fn allocate_fallback(&self, inner: &mut Inner, bytes: usize, align: usize) -> *mut u8 {
        if bytes > BLOCK_SIZE / 4 {
            // Large allocations get a dedicated block so the current
            // block keeps serving small requests.
            return self.new_block(inner, bytes, align);
        }

        // Start a fresh block; the remainder of the old one is wasted.
        let block = self.new_block(inner, BLOCK_SIZE, align);
        inner.alloc_ptr = unsafe { block.add(bytes) };
        inner.alloc_remaining = BLOCK_SIZE - bytes;
        block
    }

    fn new_block(&self, inner: &mut Inner, size: usize, align: usize) -> *mut u8 {
        let layout = Layout::from_size_align(size, align.max(std::mem::align_of::<usize>()))
            .expect("arena block layout");
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            handle_alloc_error(layout);
        }
        inner.blocks.push(Block { ptr, layout });
        self.memory_usage
            .fetch_add(size + BLOCK_OVERHEAD, Ordering::Relaxed);
        ptr
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        for block in inner.blocks.drain(..) {
            unsafe { dealloc(block.ptr, block.layout) };
        }
    }
}
