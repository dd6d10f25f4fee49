use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use rayon::prelude::*;

use super::{BucketStore, EntryStore, PartitionStats, UniquenessIndex};
use crate::errors::{C3Error, Result};
use crate::protocol::BucketId;
use crate::utils::partition_for;

#[derive(Default)]
struct Partition {
  buckets: HashMap<BucketId, Vec<u8>>,
  shadow: HashSet<(BucketId, Vec<u8>)>,
}

/// In-process store with the same partitioning as `SqliteStore`. Nothing
/// is persisted.
pub struct MemoryStore {
  partitions: Vec<Mutex<Partition>>,
}
impl MemoryStore {
  pub fn new(num_partitions: usize) -> Result<Self> {
    if num_partitions == 0 {
      return Err(C3Error::Config("partition count must be non-zero".into()));
    }
    Ok(Self {
      partitions: (0..num_partitions)
        .map(|_| Mutex::new(Partition::default()))
        .collect(),
    })
  }

  fn partition(&self, id: &BucketId) -> &Mutex<Partition> {
    &self.partitions[partition_for(id.as_bytes(), self.partitions.len())]
  }
}

impl BucketStore for MemoryStore {
  fn get(&self, id: &BucketId) -> Result<Vec<u8>> {
    Ok(
      self
        .partition(id)
        .lock()
        .buckets
        .get(id)
        .cloned()
        .unwrap_or_default(),
    )
  }

  fn put(&self, id: &BucketId, value: &[u8]) -> Result<()> {
    self
      .partition(id)
      .lock()
      .buckets
      .insert(id.clone(), value.to_vec());
    Ok(())
  }

  fn append(&self, id: &BucketId, entry: &[u8]) -> Result<()> {
    let mut p = self.partition(id).lock();
    p.buckets
      .entry(id.clone())
      .or_default()
      .extend_from_slice(entry);
    Ok(())
  }

  fn bucket_ids(&self) -> Result<Vec<BucketId>> {
    Ok(
      self
        .partitions
        .par_iter()
        .flat_map_iter(|p| p.lock().buckets.keys().cloned().collect::<Vec<_>>())
        .collect(),
    )
  }

  fn partition_stats(&self) -> Result<Vec<PartitionStats>> {
    Ok(
      self
        .partitions
        .par_iter()
        .enumerate()
        .map(|(i, p)| {
          let p = p.lock();
          PartitionStats {
            partition: i,
            buckets: p.buckets.len(),
            bytes: p.buckets.values().map(|v| v.len() as u64).sum(),
          }
        })
        .collect(),
    )
  }

  fn num_partitions(&self) -> usize {
    self.partitions.len()
  }
}

impl UniquenessIndex for MemoryStore {
  fn is_unique(&self, id: &BucketId, entry: &[u8]) -> Result<bool> {
    let key = (id.clone(), entry.to_vec());
    Ok(!self.partition(id).lock().shadow.contains(&key))
  }

  fn record_if_absent(&self, id: &BucketId, entry: &[u8]) -> Result<bool> {
    let key = (id.clone(), entry.to_vec());
    Ok(self.partition(id).lock().shadow.insert(key))
  }
}

impl EntryStore for MemoryStore {
  fn append_recorded(&self, id: &BucketId, entry: &[u8]) -> Result<()> {
    let mut p = self.partition(id).lock();
    p.buckets
      .entry(id.clone())
      .or_default()
      .extend_from_slice(entry);
    p.shadow.insert((id.clone(), entry.to_vec()));
    Ok(())
  }

  fn append_if_absent(&self, id: &BucketId, entry: &[u8]) -> Result<bool> {
    let mut p = self.partition(id).lock();
    if !p.shadow.insert((id.clone(), entry.to_vec())) {
      return Ok(false);
    }
    p.buckets
      .entry(id.clone())
      .or_default()
      .extend_from_slice(entry);
    Ok(true)
  }
}
