//! Double-hashed Bloom filter over user keys.
//!
//! Serialized form: `filter_bytes ‖ k(1 byte)` where `k` is the number
//! of hash functions. Probe positions are `pos_i = (h1 + i·h2) mod
//! num_bits` with `(h1, h2)` from MurmurHash-64A ([`strata_core::hash`]).
//! A filter with no bits set to zero (including the empty filter)
//! conservatively answers "may contain".

use strata_core::hash;

use crate::error::{Result, SSTableError};

/// Sizing policy for the filter.
#[derive(Debug, Clone, Copy)]
pub struct BloomFilterPolicy {
    /// Bits allocated per key; 10 gives roughly a 1% false-positive
    /// rate.
    pub bits_per_key: usize,
}

impl BloomFilterPolicy {
    pub fn new(bits_per_key: usize) -> Self {
        Self { bits_per_key }
    }

    /// Optimal hash-function count `k = round(bits_per_key · ln 2)`,
    /// clamped to `[1, 30]`.
    pub fn optimal_num_hashes(&self) -> u8 {
        let k = (self.bits_per_key as f64 * std::f64::consts::LN_2).round() as usize;
        k.clamp(1, 30) as u8
    }
}

impl Default for BloomFilterPolicy {
    fn default() -> Self {
        Self { bits_per_key: 10 }
    }
}

/// Accumulates keys and produces the serialized filter.
///
/// Hashes are computed at insertion time, so `finish` only sets bits.
pub struct BloomFilterBuilder {
    policy: BloomFilterPolicy,
    hashes: Vec<(u64, u64)>,
}

impl BloomFilterBuilder {
    pub fn new(policy: BloomFilterPolicy) -> Self {
        Self {
            policy,
            hashes: Vec::new(),
        }
    }

    pub fn add_key(&mut self, key: &[u8]) {
        self.hashes.push(hash::hash_pair(key));
    }

    pub fn num_keys(&self) -> usize {
        self.hashes.len()
    }

    /// Builds the filter: `ceil(num_keys · bits_per_key / 8)` bytes,
    /// minimum 8 (64 bits), followed by the `k` byte. An empty builder
    /// still emits the trailing `k` byte.
    pub fn finish(&self) -> Vec<u8> {
        let num_hashes = self.policy.optimal_num_hashes();

        if self.hashes.is_empty() {
            return vec![num_hashes];
        }

        let mut bits = self.hashes.len() * self.policy.bits_per_key;
        bits = bits.div_ceil(8) * 8;
        bits = bits.max(64);

        let num_bytes = bits / 8;
        let mut filter = vec![0u8; num_bytes + 1];
        for &(h1, h2) in &self.hashes {
            for i in 0..num_hashes {
                let pos = (h1.wrapping_add((i as u64).wrapping_mul(h2)) % bits as u64) as usize;
                filter[pos / 8] |= 1 << (pos % 8);
            }
        }
        filter[num_bytes] = num_hashes;
        filter
    }

    pub fn reset(&mut self) {
        self.hashes.clear();
    }
}

/// Probes a serialized filter.
pub struct BloomFilterReader<'a> {
    data: &'a [u8],
    num_bits: usize,
    num_hashes: u8,
}

impl<'a> BloomFilterReader<'a> {
    /// Validates the trailing `k` byte; rejects empty input and
    /// `k ∉ [1, 30]`.
    pub fn new(filter: &'a [u8]) -> Result<Self> {
        if filter.is_empty() {
            return Err(SSTableError::Incomplete);
        }
        let num_hashes = filter[filter.len() - 1];
        if num_hashes == 0 || num_hashes > 30 {
            return Err(SSTableError::InvalidFormat(format!(
                "bloom filter hash count {num_hashes} out of range"
            )));
        }
        Ok(Self {
            data: &filter[..filter.len() - 1],
            num_bits: (filter.len() - 1) * 8,
            num_hashes,
        })
    }

    /// False means definitely absent; true means possibly present.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        if self.num_bits == 0 {
            return true;
        }

        let (h1, h2) = hash::hash_pair(key);
        for i in 0..self.num_hashes {
            let pos = (h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.num_bits as u64) as usize;
            if self.data[pos / 8] & (1 << (pos % 8)) == 0 {
                return false;
            }
        }
        true
    }

    pub fn num_bits(&self) -> usize {
        self.num_bits
    }

    pub fn num_hashes(&self) -> u8 {
        self.num_hashes
    }
}
