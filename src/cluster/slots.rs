//! Hash slot calculation
//!
//! Redis Cluster uses CRC16 to distribute keys across 16384 hash slots.
//! The target side of a migration needs this to split a pipeline by
//! destination node; the source side uses [`SlotRange`] to describe which
//! part of the keyspace each shard owns.

use serde::{Deserialize, Serialize};

/// Total number of hash slots in a Redis cluster
pub const CLUSTER_SLOTS: u16 = 16384;

/// CRC16 lookup table (XMODEM polynomial 0x1021), built at compile time.
const CRC16_TABLE: [u16; 256] = build_crc16_table();

const fn build_crc16_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Calculate CRC16 using XMODEM polynomial (Redis compatible)
fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |crc, byte| {
        let index = ((crc >> 8) ^ (*byte as u16)) as usize;
        (crc << 8) ^ CRC16_TABLE[index & 0xff]
    })
}

/// Hash slot utilities
pub struct HashSlot;

impl HashSlot {
    /// Calculate the hash slot for a key
    ///
    /// If the key contains a hash tag (e.g., "{user}:1000"), only the content
    /// within the first pair of curly braces is used for hashing.
    pub fn for_key(key: &[u8]) -> u16 {
        crc16(Self::hash_tag(key)) % CLUSTER_SLOTS
    }

    /// The part of the key that is hashed.
    fn hash_tag(key: &[u8]) -> &[u8] {
        let Some(open) = key.iter().position(|&b| b == b'{') else {
            return key;
        };
        match key[open + 1..].iter().position(|&b| b == b'}') {
            Some(len) if len > 0 => &key[open + 1..open + 1 + len],
            _ => key,
        }
    }
}

/// A range of hash slots (both ends inclusive)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotRange {
    /// Start slot (inclusive)
    pub start: u16,
    /// End slot (inclusive)
    pub end: u16,
}

impl SlotRange {
    /// Create a new slot range
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start: start.min(CLUSTER_SLOTS - 1),
            end: end.min(CLUSTER_SLOTS - 1),
        }
    }

    /// The whole keyspace
    pub fn full() -> Self {
        Self::new(0, CLUSTER_SLOTS - 1)
    }

    /// Check if a slot is contained in this range
    pub fn contains(&self, slot: u16) -> bool {
        slot >= self.start && slot <= self.end
    }

    /// Get the number of slots in this range
    pub fn count(&self) -> usize {
        if self.end >= self.start {
            (self.end - self.start + 1) as usize
        } else {
            0
        }
    }

    /// Merge two adjacent or overlapping ranges
    pub fn merge(&self, other: &SlotRange) -> Option<SlotRange> {
        if self.end + 1 >= other.start && other.end + 1 >= self.start {
            Some(SlotRange::new(
                self.start.min(other.start),
                self.end.max(other.end),
            ))
        } else {
            None
        }
    }
}

impl std::fmt::Display for SlotRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Sort ranges and merge the adjacent ones.
pub fn coalesce(mut ranges: Vec<SlotRange>) -> Vec<SlotRange> {
    ranges.sort();
    let mut merged: Vec<SlotRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(last) => match last.merge(&range) {
                Some(joined) => *last = joined,
                None => merged.push(range),
            },
            None => merged.push(range),
        }
    }
    merged
}
