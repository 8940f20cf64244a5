//! Approximate-membership set
//!
//! Bit-vector bloom filter backing the flow-rate filter. Sizing is derived
//! from a projected element count and a target false-positive rate
//! (`m = -n·ln p / ln²2`, `k = m/n · ln 2`); probing uses double hashing
//! over two independent 64-bit hashes of the key.

use std::collections::hash_map::DefaultHasher;
use std::f64::consts::LN_2;
use std::hash::Hasher;

#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: Vec<u64>,
    num_bits: u64,
    num_hashes: u32,
}

impl BloomFilter {
    /// Build a filter sized for `expected_items` elements at `fp_rate`
    /// false positives.
    pub fn with_rate(expected_items: usize, fp_rate: f64) -> Self {
        let n = expected_items.max(1) as f64;
        let p = fp_rate.clamp(1e-9, 0.5);

        let num_bits = ((-n * p.ln()) / (LN_2 * LN_2)).ceil().max(64.0) as u64;
        let num_hashes = ((num_bits as f64 / n) * LN_2).round().max(1.0) as u32;
        let num_words = (num_bits as usize).div_ceil(64);

        Self {
            bits: vec![0; num_words],
            num_bits,
            num_hashes,
        }
    }

    fn hash_pair(key: &[u8]) -> (u64, u64) {
        let mut h1 = DefaultHasher::new();
        h1.write(key);
        let first = h1.finish();

        // second, independent hash: same hasher seeded by the first digest
        let mut h2 = DefaultHasher::new();
        h2.write_u64(first);
        h2.write(key);
        (first, h2.finish())
    }

    pub fn insert(&mut self, key: &[u8]) {
        let (h1, h2) = Self::hash_pair(key);
        for i in 0..self.num_hashes {
            let pos = h1.wrapping_add(u64::from(i).wrapping_mul(h2)) % self.num_bits;
            self.bits[(pos / 64) as usize] |= 1 << (pos % 64);
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        let (h1, h2) = Self::hash_pair(key);
        for i in 0..self.num_hashes {
            let pos = h1.wrapping_add(u64::from(i).wrapping_mul(h2)) % self.num_bits;
            if self.bits[(pos / 64) as usize] & (1 << (pos % 64)) == 0 {
                return false;
            }
        }
        true
    }

    /// Reset all bits without releasing the allocation; rotation reuses the
    /// same backing storage for the lifetime of the process.
    pub fn clear(&mut self) {
        self.bits.fill(0);
    }

    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }
}
