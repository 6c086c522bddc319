//! Checksum and hashing utilities
//!
//! Binlog blocks are protected with CRC-64 (ISO polynomial). Records are
//! routed to shards and SQL workers by a 64-bit string hash.

use crc_fast::{CrcAlgorithm, checksum};

/// CRC-64/GO-ISO over `data`
#[must_use]
pub fn crc64(data: &[u8]) -> u64 {
    checksum(CrcAlgorithm::Crc64GoIso, data)
}

/// Stable 64-bit hash of a string
#[must_use]
pub fn string_hash(s: &str) -> u64 {
    xxhash_rust::xxh64::xxh64(s.as_bytes(), 0)
}

/// Slot in `0..n` a string hashes to
#[must_use]
pub fn slot_of(s: &str, n: usize) -> usize {
    debug_assert!(n > 0);
    (string_hash(s) % n as u64) as usize
}
