//! Prefix-compressed block building and decoding.
//!
//! Block layout:
//!
//! ```text
//! entry*  restart_offset:u32[num_restarts]  num_restarts:u32
//! ```
//!
//! Entry: `shared(varint32) ‖ unshared(varint32) ‖ value_len(varint32)
//! ‖ key_delta ‖ value`. Every `restart_interval` entries the full key
//! is stored (shared forced to 0); the restart array makes those
//! positions findable. The first restart is always offset 0.

use bytes::Bytes;

use strata_core::coding;

use crate::error::{Result, SSTableError};
use crate::format::{BlockHandle, DEFAULT_RESTART_INTERVAL};

/// Builds one block. Keys must arrive in increasing order; ordering is
/// enforced by the table writer, which compares internal keys.
pub struct BlockBuilder {
    buffer: Vec<u8>,
    restarts: Vec<u32>,
    restart_interval: usize,
    counter: usize,
    last_key: Vec<u8>,
    finished: bool,
}

impl BlockBuilder {
    pub fn new(restart_interval: usize) -> Self {
        assert!(restart_interval >= 1);
        Self {
            buffer: Vec::new(),
            restarts: vec![0],
            restart_interval,
            counter: 0,
            last_key: Vec::new(),
            finished: false,
        }
    }

    /// Clears all state for reuse on the next block.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.restarts.clear();
        self.restarts.push(0);
        self.counter = 0;
        self.last_key.clear();
        self.finished = false;
    }

    /// Appends a key-value pair, prefix-compressing against the
    /// previous key except at restart points.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        debug_assert!(!self.finished);
        debug_assert!(self.counter <= self.restart_interval);

        let shared = if self.counter < self.restart_interval {
            shared_prefix_len(&self.last_key, key)
        } else {
            self.restarts.push(self.buffer.len() as u32);
            self.counter = 0;
            0
        };
        let unshared = key.len() - shared;

        coding::put_varint32(&mut self.buffer, shared as u32);
        coding::put_varint32(&mut self.buffer, unshared as u32);
        coding::put_varint32(&mut self.buffer, value.len() as u32);
        self.buffer.extend_from_slice(&key[shared..]);
        self.buffer.extend_from_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.counter += 1;
    }

    /// Appends the restart array and count, returning the finished
    /// block contents (without trailer).
    pub fn finish(&mut self) -> &[u8] {
        for &restart in &self.restarts {
            coding::put_fixed32(&mut self.buffer, restart);
        }
        coding::put_fixed32(&mut self.buffer, self.restarts.len() as u32);
        self.finished = true;
        &self.buffer
    }

    /// Size the block would occupy if finished now; used to decide when
    /// to cut a block.
    pub fn current_size_estimate(&self) -> usize {
        self.buffer.len() + self.restarts.len() * 4 + 4
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Most recently added key.
    pub fn last_key(&self) -> &[u8] {
        &self.last_key
    }
}

impl Default for BlockBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_RESTART_INTERVAL)
    }
}

/// Builds the index block: maps each data block's last key to its
/// handle. Restart interval 1 — index keys are stored uncompressed.
pub struct IndexBlockBuilder {
    inner: BlockBuilder,
    entry_count: usize,
}

impl IndexBlockBuilder {
    pub fn new() -> Self {
        Self {
            inner: BlockBuilder::new(1),
            entry_count: 0,
        }
    }

    pub fn add_entry(&mut self, last_key: &[u8], handle: BlockHandle) {
        self.inner.add(last_key, &handle.encode());
        self.entry_count += 1;
    }

    pub fn finish(&mut self) -> &[u8] {
        self.inner.finish()
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn reset(&mut self) {
        self.inner.reset();
        self.entry_count = 0;
    }
}

impl Default for IndexBlockBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn shared_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// A decoded block: the inverse of [`BlockBuilder`].
#[derive(Debug, Clone)]
pub struct Block {
    data: Bytes,
    /// Offset where entry data ends and the restart array begins.
    entries_end: usize,
    restarts: Vec<u32>,
}

impl Block {
    /// Parses the restart array from bare block contents (trailer
    /// already stripped and verified).
    pub fn decode(data: Bytes) -> Result<Self> {
        if data.len() < 4 {
            return Err(SSTableError::Incomplete);
        }
        let num_restarts = coding::decode_fixed32(&data[data.len() - 4..]) as usize;
        let restart_array = num_restarts
            .checked_mul(4)
            .and_then(|n| n.checked_add(4))
            .ok_or(SSTableError::Incomplete)?;
        if data.len() < restart_array {
            return Err(SSTableError::Incomplete);
        }

        let entries_end = data.len() - restart_array;
        let mut restarts = Vec::with_capacity(num_restarts);
        for i in 0..num_restarts {
            let offset = coding::decode_fixed32(&data[entries_end + i * 4..]);
            if offset as usize > entries_end {
                return Err(SSTableError::InvalidFormat(
                    "restart offset out of bounds".to_string(),
                ));
            }
            restarts.push(offset);
        }

        Ok(Self {
            data,
            entries_end,
            restarts,
        })
    }

    pub fn iter(&self) -> BlockIter<'_> {
        BlockIter {
            block: self,
            offset: 0,
            last_key: Vec::new(),
        }
    }

    pub fn num_restarts(&self) -> usize {
        self.restarts.len()
    }

    pub fn restart_offset(&self, i: usize) -> u32 {
        self.restarts[i]
    }
}

/// Sequential decoder over a block's entries, reconstructing full keys
/// from shared prefixes.
pub struct BlockIter<'a> {
    block: &'a Block,
    offset: usize,
    last_key: Vec<u8>,
}

impl<'a> BlockIter<'a> {
    /// Decodes the next entry, or `Ok(None)` past the last one.
    pub fn try_next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.offset >= self.block.entries_end {
            return Ok(None);
        }

        let mut input = &self.block.data[self.offset..self.block.entries_end];
        let before = input.len();

        let shared = coding::get_varint32(&mut input).ok_or(SSTableError::Incomplete)? as usize;
        let unshared = coding::get_varint32(&mut input).ok_or(SSTableError::Incomplete)? as usize;
        let value_len = coding::get_varint32(&mut input).ok_or(SSTableError::Incomplete)? as usize;

        if shared > self.last_key.len() {
            return Err(SSTableError::InvalidFormat(format!(
                "shared prefix {shared} exceeds previous key length {}",
                self.last_key.len()
            )));
        }
        if input.len() < unshared + value_len {
            return Err(SSTableError::Incomplete);
        }

        let mut key = Vec::with_capacity(shared + unshared);
        key.extend_from_slice(&self.last_key[..shared]);
        key.extend_from_slice(&input[..unshared]);
        let value = input[unshared..unshared + value_len].to_vec();

        let consumed = (before - input.len()) + unshared + value_len;
        self.offset += consumed;
        self.last_key = key.clone();

        Ok(Some((key, value)))
    }
}
