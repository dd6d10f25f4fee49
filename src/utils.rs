//! Utility functions for partition assignment, sampling randomness and
//! encoding bucket identifiers.

use hex::ToHex;
use rand_core::{OsRng, RngCore};

use crate::errors::{C3Error, Result};

/// Returns the partition that the key is assigned to, out of
/// `num_partitions` partitions. The assignment only depends on the key
/// bytes, so a bucket always lands on the same partition.
pub fn partition_for(key: &[u8], num_partitions: usize) -> usize {
  assert!(num_partitions > 0, "partition count must be non-zero");
  (seahash::hash(key) % num_partitions as u64) as usize
}

/// Returns `ceil(bits / 8)` bytes sampled from the OS RNG
pub fn generate_random_bytes(bits: usize) -> Result<Vec<u8>> {
  let len = (bits + 7) / 8;
  let mut bytes = vec![0u8; len];
  OsRng
    .try_fill_bytes(&mut bytes)
    .map_err(|e| C3Error::Randomness(e.to_string()))?;
  Ok(bytes)
}

/// Returns the first `hex_len` hex characters of `bytes`
pub fn hex_prefix(bytes: &[u8], hex_len: usize) -> String {
  let mut h = bytes.encode_hex::<String>();
  h.truncate(hex_len);
  h
}
