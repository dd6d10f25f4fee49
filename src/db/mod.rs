//! The `db` module holds the partitioned append store, which maps a
//! bucket identifier to the concatenation of all entries appended to
//! it, and the uniqueness index that records which entries each bucket
//! already holds.
//!
//! Both backends assign a bucket to a partition with
//! [`partition_for`](crate::utils::partition_for), and keep a bucket's
//! shadow records in the same partition as the bucket itself. Appends
//! and conditional inserts are atomic per partition.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::protocol::BucketId;

/// The `BucketStore` trait is the partitioned append store. A bucket
/// that has never been written reads as an empty value.
pub trait BucketStore: Send + Sync {
  /// Returns the concatenated value of the bucket, empty if missing
  fn get(&self, id: &BucketId) -> Result<Vec<u8>>;

  /// Replaces the value of the bucket
  fn put(&self, id: &BucketId, value: &[u8]) -> Result<()>;

  /// Atomically extends the value of the bucket with `entry`. Concurrent
  /// appends to the same bucket are serialized, so none are lost.
  fn append(&self, id: &BucketId, entry: &[u8]) -> Result<()>;

  /// Returns the identifiers of all buckets, scanning partitions in
  /// parallel
  fn bucket_ids(&self) -> Result<Vec<BucketId>>;

  /// Returns bucket counts and sizes for each partition
  fn partition_stats(&self) -> Result<Vec<PartitionStats>>;

  fn num_partitions(&self) -> usize;
}

/// The `UniquenessIndex` trait records (bucket, entry) pairs so that
/// duplicate entries can be rejected with a point lookup.
pub trait UniquenessIndex: Send + Sync {
  /// Records the pair, doing nothing if it is already present
  fn record(&self, id: &BucketId, entry: &[u8]) -> Result<()> {
    self.record_if_absent(id, entry).map(|_| ())
  }

  /// Returns true iff the pair has never been recorded
  fn is_unique(&self, id: &BucketId, entry: &[u8]) -> Result<bool>;

  /// Records the pair if absent, in a single atomic step, and returns
  /// whether this call inserted it
  fn record_if_absent(&self, id: &BucketId, entry: &[u8]) -> Result<bool>;
}

/// A backend that holds both the buckets and their uniqueness index, and
/// can update the two together. Each method commits both writes or
/// neither.
pub trait EntryStore: BucketStore + UniquenessIndex {
  /// Appends `entry` and records it, whether or not it was recorded
  /// before
  fn append_recorded(&self, id: &BucketId, entry: &[u8]) -> Result<()>;

  /// Records and appends `entry` only if it was never recorded for the
  /// bucket. Returns whether it was appended.
  fn append_if_absent(&self, id: &BucketId, entry: &[u8]) -> Result<bool>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionStats {
  pub partition: usize,
  pub buckets: usize,
  pub bytes: u64,
}

#[cfg(test)]
pub(crate) mod tests {
  //! Behaviour shared by every backend, run against each of them from
  //! the backend modules.

  use super::*;
  use std::collections::HashSet;

  pub fn id(s: &str) -> BucketId {
    BucketId::from_hex(s).unwrap()
  }

  pub fn get_missing_is_empty<S: BucketStore>(store: &S) {
    assert!(store.get(&id("abcde")).unwrap().is_empty());
  }

  pub fn appends_concatenate_in_order<S: BucketStore>(store: &S) {
    let b = id("0a1b2");
    let entries: Vec<Vec<u8>> =
      (0u8..10).map(|i| vec![i; (i as usize) + 1]).collect();
    for e in &entries {
      store.append(&b, e).unwrap();
    }
    assert_eq!(store.get(&b).unwrap(), entries.concat());
  }

  pub fn put_replaces_value<S: BucketStore>(store: &S) {
    let b = id("ffff0");
    store.append(&b, b"first").unwrap();
    store.put(&b, b"second").unwrap();
    assert_eq!(store.get(&b).unwrap(), b"second");
    store.put(&b, b"second").unwrap();
    assert_eq!(store.get(&b).unwrap(), b"second");
    store.append(&b, b"+").unwrap();
    assert_eq!(store.get(&b).unwrap(), b"second+");
  }

  pub fn concurrent_appends_are_not_lost<S: BucketStore>(store: &S) {
    let b = id("c0ffe");
    let threads = 8;
    let per_thread = 25;
    std::thread::scope(|s| {
      for t in 0..threads {
        let b = &b;
        s.spawn(move || {
          for i in 0..per_thread {
            store.append(b, &[t as u8, i as u8]).unwrap();
          }
        });
      }
    });
    let value = store.get(&b).unwrap();
    assert_eq!(value.len(), threads * per_thread * 2);
    let pairs: HashSet<(u8, u8)> =
      value.chunks(2).map(|c| (c[0], c[1])).collect();
    assert_eq!(pairs.len(), threads * per_thread);
    // each writer's entries keep their relative order
    for t in 0..threads as u8 {
      let seq: Vec<u8> = value
        .chunks(2)
        .filter(|c| c[0] == t)
        .map(|c| c[1])
        .collect();
      assert_eq!(seq, (0..per_thread as u8).collect::<Vec<u8>>());
    }
  }

  pub fn scans_cover_all_partitions<S: BucketStore>(store: &S) {
    let ids: Vec<BucketId> = (0..32u32).map(|i| id(&format!("{:05x}", i))).collect();
    for b in &ids {
      store.append(b, b"xy").unwrap();
    }
    let mut found = store.bucket_ids().unwrap();
    found.sort();
    assert_eq!(found, ids);

    let stats = store.partition_stats().unwrap();
    assert_eq!(stats.len(), store.num_partitions());
    assert_eq!(stats.iter().map(|s| s.buckets).sum::<usize>(), 32);
    assert_eq!(stats.iter().map(|s| s.bytes).sum::<u64>(), 64);
  }

  pub fn recorded_entries_are_not_unique<I: UniquenessIndex>(index: &I) {
    let b = id("12345");
    assert!(index.is_unique(&b, b"entry").unwrap());
    index.record(&b, b"entry").unwrap();
    for _ in 0..3 {
      assert!(!index.is_unique(&b, b"entry").unwrap());
    }
    // idempotent
    index.record(&b, b"entry").unwrap();
    assert!(index.is_unique(&id("54321"), b"entry").unwrap());
    assert!(index.is_unique(&b, b"entry2").unwrap());
  }

  pub fn record_if_absent_reports_insertion<I: UniquenessIndex>(index: &I) {
    let b = id("aaaaa");
    assert!(index.record_if_absent(&b, b"v").unwrap());
    assert!(!index.record_if_absent(&b, b"v").unwrap());
    assert!(!index.is_unique(&b, b"v").unwrap());
  }

  pub fn concurrent_claims_admit_one_winner<I: UniquenessIndex>(index: &I) {
    let b = id("bbbbb");
    let wins = std::sync::atomic::AtomicUsize::new(0);
    std::thread::scope(|s| {
      for _ in 0..8 {
        s.spawn(|| {
          if index.record_if_absent(&b, b"contested").unwrap() {
            wins.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
          }
        });
      }
    });
    assert_eq!(wins.into_inner(), 1);
  }

  pub fn recorded_appends_allow_duplicates<S: EntryStore>(store: &S) {
    let b = id("dddd1");
    store.append_recorded(&b, b"rec").unwrap();
    store.append_recorded(&b, b"rec").unwrap();
    assert_eq!(store.get(&b).unwrap(), b"recrec");
    assert!(!store.is_unique(&b, b"rec").unwrap());
  }

  pub fn append_if_absent_appends_once<S: EntryStore>(store: &S) {
    let b = id("dddd2");
    assert!(store.append_if_absent(&b, b"one").unwrap());
    assert!(!store.append_if_absent(&b, b"one").unwrap());
    assert!(store.append_if_absent(&b, b"two").unwrap());
    assert_eq!(store.get(&b).unwrap(), b"onetwo");

    // an entry recorded on its own is never appended
    store.record(&b, b"three").unwrap();
    assert!(!store.append_if_absent(&b, b"three").unwrap());
    assert_eq!(store.get(&b).unwrap(), b"onetwo");
  }

  pub fn contested_append_if_absent_appends_once<S: EntryStore>(store: &S) {
    let b = id("dddd3");
    std::thread::scope(|s| {
      for _ in 0..8 {
        s.spawn(|| store.append_if_absent(&b, b"contested").unwrap());
      }
    });
    assert_eq!(store.get(&b).unwrap(), b"contested");
  }
}
