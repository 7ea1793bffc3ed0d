//! Bloom filter for table files.
//!
//! Double hashing over FNV-1a with two seeds: probe `i` tests bit
//! `h1 + i * h2`. Depending on tuning a table carries a filter over whole
//! keys, over the fixed 8-byte partition prefix of each key, or both
//! folded into one filter (a prefix is never a valid whole key, the
//! lengths differ).

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Bit-vector bloom filter with `k` derived hash probes.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: Vec<u8>,
    num_bits: u64,
    num_hashes: u32,
}

impl BloomFilter {
    /// Sized for `expected_items` at the target false positive rate.
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        let n = (expected_items.max(1)) as f64;
        let m = (-n * false_positive_rate.ln() / std::f64::consts::LN_2.powi(2)).ceil() as u64;
        let m = m.max(64);
        let k = ((m as f64 / n) * std::f64::consts::LN_2).ceil() as u32;
        BloomFilter {
            bits: vec![0u8; ((m + 7) / 8) as usize],
            num_bits: m,
            num_hashes: k.max(1),
        }
    }

    pub fn insert(&mut self, key: &[u8]) {
        let (h1, h2) = hash_pair(key);
        for i in 0..self.num_hashes {
            let bit = (h1.wrapping_add((i as u64).wrapping_mul(h2))) % self.num_bits;
            self.bits[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    }

    /// False means definitely absent; true means possibly present.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        let (h1, h2) = hash_pair(key);
        for i in 0..self.num_hashes {
            let bit = (h1.wrapping_add((i as u64).wrapping_mul(h2))) % self.num_bits;
            if self.bits[(bit / 8) as usize] & (1 << (bit % 8)) == 0 {
                return false;
            }
        }
        true
    }

    /// Layout: `num_bits(u64) + num_hashes(u32) + bits_len(u32) + bits`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.write_u64::<LittleEndian>(self.num_bits).unwrap();
        out.write_u32::<LittleEndian>(self.num_hashes).unwrap();
        out.write_u32::<LittleEndian>(self.bits.len() as u32).unwrap();
        out.extend_from_slice(&self.bits);
    }

    pub fn decode(mut buf: &[u8]) -> Option<Self> {
        let num_bits = buf.read_u64::<LittleEndian>().ok()?;
        let num_hashes = buf.read_u32::<LittleEndian>().ok()?;
        let len = buf.read_u32::<LittleEndian>().ok()? as usize;
        if buf.len() < len || num_bits == 0 {
            return None;
        }
        Some(BloomFilter {
            bits: buf[..len].to_vec(),
            num_bits,
            num_hashes,
        })
    }
}

fn fnv1a(key: &[u8], seed: u64) -> u64 {
    let mut hash = FNV_OFFSET ^ seed;
    for &b in key {
        hash ^= b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

fn hash_pair(key: &[u8]) -> (u64, u64) {
    (fnv1a(key, 0), fnv1a(key, 0x9e37_79b9_7f4a_7c15) | 1)
}
