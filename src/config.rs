//! Configuration for the bucket store and the ingestion pipeline.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::{C3Error, Result};

pub const DEFAULT_PARTITIONS: usize = 4;
pub const DEFAULT_MAX_COLLISION_RETRIES: usize = 64;
pub const DEFAULT_RESAMPLE_BITS: usize = 256;

/// Where the store lives and how many partitions it is split into. The
/// partition count is fixed for the lifetime of the store files.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
  pub path: Option<PathBuf>,
  pub partitions: usize,
}
impl Default for StoreConfig {
  fn default() -> Self {
    Self {
      path: None,
      partitions: DEFAULT_PARTITIONS,
    }
  }
}
impl StoreConfig {
  pub fn validate(&self) -> Result<()> {
    if self.partitions == 0 {
      return Err(C3Error::Config("partition count must be non-zero".into()));
    }
    Ok(())
  }
}

/// Tunables for similar-password ingestion
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestConfig {
  /// Resamples allowed per variant before giving up with
  /// `C3Error::CollisionExhausted`
  pub max_collision_retries: usize,
  /// Bit length of the random strings that are mutated when resampling
  pub resample_bits: usize,
}
impl Default for IngestConfig {
  fn default() -> Self {
    Self {
      max_collision_retries: DEFAULT_MAX_COLLISION_RETRIES,
      resample_bits: DEFAULT_RESAMPLE_BITS,
    }
  }
}
impl IngestConfig {
  pub fn validate(&self) -> Result<()> {
    if self.resample_bits == 0 {
      return Err(C3Error::Config("resample bits must be non-zero".into()));
    }
    Ok(())
  }
}
