//! Lock-free single-writer / multi-reader skip list.
//!
//! Nodes live in the arena as a fixed header followed by a
//! variable-height array of atomic next pointers; they are never freed
//! individually. Readers traverse with acquire loads and may race with
//! the single writer without locks.
//!
//! The publication protocol is the load-bearing part of `insert`: at
//! each level the new node's successor is filled in with a relaxed
//! store *before* the node is published into the predecessor with a
//! release store. A reader that observes the node at level L therefore
//! also observes its initialized successors at every level ≤ L.

use std::cmp::Ordering as CmpOrdering;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::arena::Arena;
use std::sync::Arc;

/// Height cap; the head node always owns this many next pointers.
pub const MAX_HEIGHT: usize = 12;

/// Geometric height distribution: P(height > h) = (1/BRANCHING)^h.
const BRANCHING: u32 = 4;

/// Total order over keys stored in the list.
pub trait Comparator<K> {
    fn compare(&self, a: &K, b: &K) -> CmpOrdering;
}

#[repr(C)]
struct Node<K> {
    key: K,
    // Over-allocated: a node of height h owns h slots starting here.
    next: [AtomicPtr<Node<K>>; 1],
}

impl<K> Node<K> {
    /// Pointer to the level-`level` next slot. Caller guarantees the
    /// node was allocated with at least `level + 1` slots.
    #[inline]
    unsafe fn next_slot(node: *const Node<K>, level: usize) -> *const AtomicPtr<Node<K>> {
        (ptr::addr_of!((*node).next) as *const AtomicPtr<Node<K>>).add(level)
    }

    #[inline]
    unsafe fn next(node: *const Node<K>, level: usize) -> *mut Node<K> {
        (*Self::next_slot(node, level)).load(Ordering::Acquire)
    }

    #[inline]
    unsafe fn set_next(node: *const Node<K>, level: usize, x: *mut Node<K>) {
        (*Self::next_slot(node, level)).store(x, Ordering::Release)
    }

    #[inline]
    unsafe fn next_relaxed(node: *const Node<K>, level: usize) -> *mut Node<K> {
        (*Self::next_slot(node, level)).load(Ordering::Relaxed)
    }

    #[inline]
    unsafe fn set_next_relaxed(node: *const Node<K>, level: usize, x: *mut Node<K>) {
        (*Self::next_slot(node, level)).store(x, Ordering::Relaxed)
    }
}

pub struct SkipList<K, C> {
    cmp: C,
    arena: Arc<Arena>,
    head: *mut Node<K>,
    /// Tallest live level; grows monotonically, read/written relaxed.
    max_height: AtomicUsize,
    /// Height generator; only the single writer draws from it.
    rng: Mutex<StdRng>,
}

// Nodes are reachable only through the list; readers follow the
// acquire/release protocol above and the arena keeps node memory alive
// for the list's whole lifetime.
unsafe impl<K: Send, C: Send> Send for SkipList<K, C> {}
unsafe impl<K: Send + Sync, C: Sync> Sync for SkipList<K, C> {}

impl<K: Copy + Default, C: Comparator<K>> SkipList<K, C> {
    pub fn new(cmp: C, arena: Arc<Arena>) -> Self {
        // The head's key is a placeholder: no traversal ever compares it.
        let head = Self::new_node(&arena, K::default(), MAX_HEIGHT);
        Self {
            cmp,
            arena,
            head,
            max_height: AtomicUsize::new(1),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Inserts `key`. Requires that no equal key is present (every
    /// internal key carries a unique sequence number) and that only one
    /// thread inserts at a time.
    pub fn insert(&self, key: K) {
        let mut prev: [*mut Node<K>; MAX_HEIGHT] = [ptr::null_mut(); MAX_HEIGHT];
        let existing = self.find_greater_or_equal(&key, Some(&mut prev));
        debug_assert!(
            existing.is_null()
                || self.cmp.compare(unsafe { &(*existing).key }, &key) != CmpOrdering::Equal,
            "duplicate key inserted into skip list"
        );

        let height = self.random_height();
        if height > self.height() {
            for slot in prev.iter_mut().take(height).skip(self.height()) {
                *slot = self.head;
            }
            // Relaxed is fine: a reader seeing the old height just
            // starts its descent one level lower.
            self.max_height.store(height, Ordering::Relaxed);
        }

        let node = Self::new_node(&self.arena, key, height);
        for level in 0..height {
            unsafe {
                // Link in, then publish: the release store makes the
                // relaxed successor write visible to acquire readers.
                Node::set_next_relaxed(node, level, Node::next_relaxed(prev[level], level));
                Node::set_next(prev[level], level, node);
            }
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        let node = self.find_greater_or_equal(key, None);
        !node.is_null() && self.cmp.compare(unsafe { &(*node).key }, key) == CmpOrdering::Equal
    }

    pub fn iter(&self) -> Iter<'_, K, C> {
        Iter {
            list: self,
            node: ptr::null(),
        }
    }

    fn new_node(arena: &Arena, key: K, height: usize) -> *mut Node<K> {
        debug_assert!((1..=MAX_HEIGHT).contains(&height));
        let size = std::mem::size_of::<Node<K>>()
            + (height - 1) * std::mem::size_of::<AtomicPtr<Node<K>>>();
        let mem = arena.allocate_aligned(size, std::mem::align_of::<Node<K>>()) as *mut Node<K>;
        unsafe {
            ptr::addr_of_mut!((*mem).key).write(key);
            for level in 0..height {
                (Node::next_slot(mem, level) as *mut AtomicPtr<Node<K>>)
                    .write(AtomicPtr::new(ptr::null_mut()));
            }
        }
        mem
    }

    fn random_height(&self) -> usize {
        let mut rng = self.rng.lock();
        let mut height = 1;
        while height < MAX_HEIGHT && rng.gen_ratio(1, BRANCHING) {
            height += 1;
        }
        height
    }

    #[inline]
    fn height(&self) -> usize {
        self.max_height.load(Ordering::Relaxed)
    }

    #[inline]
    fn key_is_after_node(&self, key: &K, node: *mut Node<K>) -> bool {
        !node.is_null() && self.cmp.compare(unsafe { &(*node).key }, key) == CmpOrdering::Less
    }

    /// First node with key ≥ `key`, or null. When `prev` is supplied it
    /// receives the predecessor at every live level.
    fn find_greater_or_equal(
        &self,
        key: &K,
        mut prev: Option<&mut [*mut Node<K>; MAX_HEIGHT]>,
    ) -> *mut Node<K> {
        let mut x = self.head;
        let mut level = self.height() - 1;
        loop {
            let next = unsafe { Node::next(x, level) };
            if self.key_is_after_node(key, next) {
                x = next;
            } else {
                if let Some(p) = prev.as_deref_mut() {
                    p[level] = x;
                }
                if level == 0 {
                    return next;
                }
                level -= 1;
            }
        }
    }

    /// Rightmost node with key < `key`; the head when there is none.
    fn find_less_than(&self, key: &K) -> *mut Node<K> {
        let mut x = self.head;
        let mut level = self.height() - 1;
        loop {
            let next = unsafe { Node::next(x, level) };
            let past = next.is_null()
                || self.cmp.compare(unsafe { &(*next).key }, key) != CmpOrdering::Less;
            if past {
                if level == 0 {
                    return x;
                }
                level -= 1;
            } else {
                x = next;
            }
        }
    }

    /// Last node in the list; the head when empty.
    fn find_last(&self) -> *mut Node<K> {
        let mut x = self.head;
        let mut level = self.height() - 1;
        loop {
            let next = unsafe { Node::next(x, level) };
            if next.is_null() {
                if level == 0 {
                    return x;
                }
                level -= 1;
            } else {
                x = next;
            }
        }
    }
}

/// Cursor over the list. Safe for reads concurrent with the single
/// writer; no external locking needed.
pub struct Iter<'a, K, C> {
    list: &'a SkipList<K, C>,
    node: *const Node<K>,
}

impl<'a, K: Copy + Default, C: Comparator<K>> Iter<'a, K, C> {
    #[inline]
    pub fn valid(&self) -> bool {
        !self.node.is_null()
    }

    /// Key at the current position. Panics when invalid.
    #[inline]
    pub fn key(&self) -> &K {
        assert!(self.valid());
        unsafe { &(*self.node).key }
    }

    pub fn next(&mut self) {
        assert!(self.valid());
        self.node = unsafe { Node::next(self.node, 0) };
    }

    /// Steps to the previous entry by searching for the last node
    /// before the current key; invalidates at the front.
    pub fn prev(&mut self) {
        assert!(self.valid());
        let prev = self.list.find_less_than(unsafe { &(*self.node).key });
        self.node = if prev == self.list.head {
            ptr::null()
        } else {
            prev as *const Node<K>
        };
    }

    pub fn seek(&mut self, target: &K) {
        self.node = self.list.find_greater_or_equal(target, None);
    }

    pub fn seek_to_first(&mut self) {
        self.node = unsafe { Node::next(self.list.head, 0) };
    }

    pub fn seek_to_last(&mut self) {
        let last = self.list.find_last();
        self.node = if last == self.list.head {
            ptr::null()
        } else {
            last as *const Node<K>
        };
    }
}
