//! Partition key-prefix encoding.
//!
//! Every engine key is scoped to one `(space, partition)` pair by a
//! fixed-length 8-byte prefix: 4 bytes of space id followed by 4 bytes of
//! partition id, little-endian. The fixed length lets the engine build a
//! prefix bloom filter over exactly these bytes and lets scans stay inside
//! one partition by prefix alone.

use crate::types::{PartitionId, SpaceId};

/// Length of the `(space, partition)` prefix on every engine key.
pub const PART_PREFIX_LEN: usize = 8;

/// The 8-byte scope prefix for a partition.
pub fn part_prefix(space: SpaceId, part: PartitionId) -> [u8; PART_PREFIX_LEN] {
    let mut out = [0u8; PART_PREFIX_LEN];
    out[..4].copy_from_slice(&space.to_le_bytes());
    out[4..].copy_from_slice(&part.to_le_bytes());
    out
}

/// A full engine key: partition prefix followed by the caller's key bytes.
pub fn part_key(space: SpaceId, part: PartitionId, user_key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(PART_PREFIX_LEN + user_key.len());
    out.extend_from_slice(&part_prefix(space, part));
    out.extend_from_slice(user_key);
    out
}

/// The smallest byte string greater than every key starting with
/// `prefix`: the exclusive upper bound of a prefix scan. `None` when the
/// prefix is all 0xFF bytes (scan to the end instead).
pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.last_mut() {
        if *last < 0xFF {
            *last += 1;
            return Some(end);
        }
        end.pop();
    }
    None
}

/// Splits an engine key into its scope and the caller's key bytes.
/// Returns `None` when the key is shorter than the prefix.
pub fn split_part_key(key: &[u8]) -> Option<((SpaceId, PartitionId), &[u8])> {
    if key.len() < PART_PREFIX_LEN {
        return None;
    }
    let space = SpaceId::from_le_bytes(key[..4].try_into().ok()?);
    let part = PartitionId::from_le_bytes(key[4..8].try_into().ok()?);
    Some(((space, part), &key[PART_PREFIX_LEN..]))
}
