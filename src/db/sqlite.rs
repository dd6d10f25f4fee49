use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use rayon::prelude::*;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::info;

use super::{BucketStore, EntryStore, PartitionStats, UniquenessIndex};
use crate::config::StoreConfig;
use crate::errors::{C3Error, Result};
use crate::protocol::BucketId;
use crate::utils::partition_for;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
  CREATE TABLE IF NOT EXISTS kv_store (
    id TEXT NOT NULL PRIMARY KEY,
    value BLOB NOT NULL
  );

  CREATE TABLE IF NOT EXISTS kv_store_shadow (
    id TEXT NOT NULL,
    value BLOB NOT NULL,
    PRIMARY KEY (id, value)
  );

  CREATE INDEX IF NOT EXISTS kv_store_shadow_value ON kv_store_shadow (value);

  CREATE TABLE IF NOT EXISTS store_meta (
    partition_index INTEGER NOT NULL,
    partition_count INTEGER NOT NULL
  );";

/// Durable store backed by one SQLite database per partition. Each
/// partition connection sits behind its own lock, so operations on
/// different partitions proceed in parallel while read-modify-write
/// sequences on a single partition are serialized.
pub struct SqliteStore {
  partitions: Vec<Mutex<Connection>>,
}
impl SqliteStore {
  /// Opens (creating if necessary) the partition files under
  /// `config.path`, or in-memory databases if no path is set. Fails if
  /// the files were created with a different partition count.
  pub fn open(config: &StoreConfig) -> Result<Self> {
    config.validate()?;
    if let Some(dir) = &config.path {
      std::fs::create_dir_all(dir).map_err(|e| {
        C3Error::StoreConnection(format!("{}: {}", dir.display(), e))
      })?;
    }
    let partitions = (0..config.partitions)
      .map(|i| -> Result<Mutex<Connection>> {
        let conn = match &config.path {
          Some(dir) => open_partition_file(&partition_path(dir, i))?,
          None => Connection::open_in_memory()
            .map_err(|e| C3Error::StoreConnection(e.to_string()))?,
        };
        migrate(&conn, i, config.partitions)?;
        Ok(Mutex::new(conn))
      })
      .collect::<Result<Vec<_>>>()?;
    info!(
      partitions = config.partitions,
      path = ?config.path,
      "opened bucket store"
    );
    Ok(Self { partitions })
  }

  /// Like `open`, but fails instead of creating partition files that are
  /// not there yet
  pub fn open_existing(config: &StoreConfig) -> Result<Self> {
    let dir = config.path.as_ref().ok_or_else(|| {
      C3Error::Config("an in-memory store cannot be reopened".into())
    })?;
    if let Some(missing) = (0..config.partitions)
      .map(|i| partition_path(dir, i))
      .find(|p| !p.exists())
    {
      return Err(C3Error::StoreConnection(format!(
        "{}: no such partition file",
        missing.display()
      )));
    }
    Self::open(config)
  }

  /// Opens a fresh in-memory store with `num_partitions` partitions
  pub fn in_memory(num_partitions: usize) -> Result<Self> {
    Self::open(&StoreConfig {
      path: None,
      partitions: num_partitions,
    })
  }

  fn partition(&self, id: &BucketId) -> &Mutex<Connection> {
    &self.partitions[partition_for(id.as_bytes(), self.partitions.len())]
  }

  // Runs `f` in an IMMEDIATE transaction on the partition of `id`. The
  // write lock is taken up front, which also serializes writers from
  // other processes sharing the partition file. The transaction rolls
  // back if `f` fails.
  fn write<T, F>(&self, id: &BucketId, f: F) -> Result<T>
  where
    F: FnOnce(&Connection) -> Result<T>,
  {
    let mut conn = self.partition(id).lock();
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let out = f(&tx)?;
    tx.commit()?;
    Ok(out)
  }
}

fn append_value(conn: &Connection, id: &BucketId, entry: &[u8]) -> Result<()> {
  let existing: Option<Vec<u8>> = conn
    .query_row(
      "SELECT value FROM kv_store WHERE id = ?1",
      params![id.as_str()],
      |row| row.get(0),
    )
    .optional()?;
  let mut value = existing.unwrap_or_default();
  value.extend_from_slice(entry);
  conn.execute(
    "INSERT INTO kv_store (id, value) VALUES (?1, ?2)
     ON CONFLICT (id) DO UPDATE SET value = excluded.value",
    params![id.as_str(), value],
  )?;
  Ok(())
}

fn insert_shadow(conn: &Connection, id: &BucketId, entry: &[u8]) -> Result<bool> {
  let inserted = conn.execute(
    "INSERT INTO kv_store_shadow (id, value) VALUES (?1, ?2)
     ON CONFLICT (id, value) DO NOTHING",
    params![id.as_str(), entry],
  )?;
  Ok(inserted == 1)
}

fn partition_path(dir: &Path, i: usize) -> PathBuf {
  dir.join(format!("kv_store_p{}.sqlite", i))
}

fn open_partition_file(path: &Path) -> Result<Connection> {
  let conn = Connection::open(path).map_err(|e| {
    C3Error::StoreConnection(format!("{}: {}", path.display(), e))
  })?;
  conn
    .execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = FULL;")
    .map_err(|e| C3Error::StoreConnection(e.to_string()))?;
  Ok(conn)
}

fn migrate(conn: &Connection, partition: usize, partitions: usize) -> Result<()> {
  conn
    .busy_timeout(BUSY_TIMEOUT)
    .map_err(|e| C3Error::StoreConnection(e.to_string()))?;
  conn
    .execute_batch(SCHEMA)
    .map_err(|e| C3Error::StoreConnection(e.to_string()))?;
  let existing: Option<(i64, i64)> = conn
    .query_row(
      "SELECT partition_index, partition_count FROM store_meta LIMIT 1",
      [],
      |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .optional()?;
  match existing {
    None => {
      conn.execute(
        "INSERT INTO store_meta (partition_index, partition_count) VALUES (?1, ?2)",
        params![partition as i64, partitions as i64],
      )?;
    }
    Some((p, n)) if p == partition as i64 && n == partitions as i64 => {}
    Some((p, n)) => {
      return Err(C3Error::Config(format!(
        "partition file {} of {} opened as partition {} of {}",
        p, n, partition, partitions
      )))
    }
  }
  Ok(())
}

impl BucketStore for SqliteStore {
  fn get(&self, id: &BucketId) -> Result<Vec<u8>> {
    let conn = self.partition(id).lock();
    let value: Option<Vec<u8>> = conn
      .query_row(
        "SELECT value FROM kv_store WHERE id = ?1",
        params![id.as_str()],
        |row| row.get(0),
      )
      .optional()?;
    Ok(value.unwrap_or_default())
  }

  fn put(&self, id: &BucketId, value: &[u8]) -> Result<()> {
    let conn = self.partition(id).lock();
    conn.execute(
      "INSERT INTO kv_store (id, value) VALUES (?1, ?2)
       ON CONFLICT (id) DO UPDATE SET value = excluded.value",
      params![id.as_str(), value],
    )?;
    Ok(())
  }

  fn append(&self, id: &BucketId, entry: &[u8]) -> Result<()> {
    self.write(id, |conn| append_value(conn, id, entry))
  }

  fn bucket_ids(&self) -> Result<Vec<BucketId>> {
    let per_partition = self
      .partitions
      .par_iter()
      .map(|conn| -> Result<Vec<BucketId>> {
        let conn = conn.lock();
        let mut stmt = conn.prepare("SELECT id FROM kv_store")?;
        let ids = stmt
          .query_map([], |row| row.get::<_, String>(0))?
          .collect::<std::result::Result<Vec<String>, _>>()?;
        ids.iter().map(|h| BucketId::from_hex(h)).collect()
      })
      .collect::<Result<Vec<_>>>()?;
    Ok(per_partition.into_iter().flatten().collect())
  }

  fn partition_stats(&self) -> Result<Vec<PartitionStats>> {
    self
      .partitions
      .par_iter()
      .enumerate()
      .map(|(i, conn)| -> Result<PartitionStats> {
        let conn = conn.lock();
        let (buckets, bytes): (i64, i64) = conn.query_row(
          "SELECT COUNT(*), COALESCE(SUM(LENGTH(value)), 0) FROM kv_store",
          [],
          |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(PartitionStats {
          partition: i,
          buckets: buckets as usize,
          bytes: bytes as u64,
        })
      })
      .collect()
  }

  fn num_partitions(&self) -> usize {
    self.partitions.len()
  }
}

impl UniquenessIndex for SqliteStore {
  fn is_unique(&self, id: &BucketId, entry: &[u8]) -> Result<bool> {
    let conn = self.partition(id).lock();
    let exists: Option<i64> = conn
      .query_row(
        "SELECT 1 FROM kv_store_shadow WHERE id = ?1 AND value = ?2",
        params![id.as_str(), entry],
        |row| row.get(0),
      )
      .optional()?;
    Ok(exists.is_none())
  }

  fn record_if_absent(&self, id: &BucketId, entry: &[u8]) -> Result<bool> {
    let conn = self.partition(id).lock();
    insert_shadow(&conn, id, entry)
  }
}

impl EntryStore for SqliteStore {
  fn append_recorded(&self, id: &BucketId, entry: &[u8]) -> Result<()> {
    self.write(id, |conn| {
      append_value(conn, id, entry)?;
      insert_shadow(conn, id, entry)?;
      Ok(())
    })
  }

  fn append_if_absent(&self, id: &BucketId, entry: &[u8]) -> Result<bool> {
    self.write(id, |conn| {
      if !insert_shadow(conn, id, entry)? {
        return Ok(false);
      }
      append_value(conn, id, entry)?;
      Ok(true)
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::tests::*;

  fn store() -> SqliteStore {
    SqliteStore::in_memory(4).unwrap()
  }

  #[test]
  fn get_missing() {
    get_missing_is_empty(&store());
  }

  #[test]
  fn append_order() {
    appends_concatenate_in_order(&store());
  }

  #[test]
  fn put() {
    put_replaces_value(&store());
  }

  #[test]
  fn concurrent_appends() {
    concurrent_appends_are_not_lost(&SqliteStore::in_memory(2).unwrap());
  }

  #[test]
  fn scans() {
    scans_cover_all_partitions(&store());
  }

  #[test]
  fn uniqueness() {
    recorded_entries_are_not_unique(&store());
    record_if_absent_reports_insertion(&store());
    concurrent_claims_admit_one_winner(&store());
  }

  #[test]
  fn combined_writes() {
    recorded_appends_allow_duplicates(&store());
    append_if_absent_appends_once(&store());
    contested_append_if_absent_appends_once(&SqliteStore::in_memory(2).unwrap());
  }

  #[test]
  fn failed_append_leaves_entry_unrecorded() {
    let store = SqliteStore::in_memory(1).unwrap();
    store.partitions[0]
      .lock()
      .execute_batch(
        "CREATE TRIGGER reject_buckets BEFORE INSERT ON kv_store
         BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
      )
      .unwrap();
    let b = id("eeee1");
    assert!(store.append_if_absent(&b, b"entry").is_err());
    assert!(store.append_recorded(&b, b"other").is_err());
    assert!(store.is_unique(&b, b"entry").unwrap());
    assert!(store.is_unique(&b, b"other").unwrap());

    store.partitions[0]
      .lock()
      .execute_batch("DROP TRIGGER reject_buckets;")
      .unwrap();
    assert!(store.append_if_absent(&b, b"entry").unwrap());
    assert_eq!(store.get(&b).unwrap(), b"entry");
  }

  #[test]
  fn open_existing_requires_partition_files() {
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig {
      path: Some(dir.path().join("missing")),
      partitions: 2,
    };
    assert!(matches!(
      SqliteStore::open_existing(&config),
      Err(C3Error::StoreConnection(_))
    ));
    assert!(!dir.path().join("missing").exists());

    SqliteStore::open(&config).unwrap();
    assert!(SqliteStore::open_existing(&config).is_ok());
    assert!(SqliteStore::open_existing(&StoreConfig::default()).is_err());
  }

  #[test]
  fn values_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig {
      path: Some(dir.path().to_path_buf()),
      partitions: 4,
    };
    let b = id("d00d1");
    {
      let store = SqliteStore::open(&config).unwrap();
      store.append(&b, b"one").unwrap();
      store.append(&b, b"two").unwrap();
      store.record(&b, b"two").unwrap();
    }
    let store = SqliteStore::open(&config).unwrap();
    assert_eq!(store.get(&b).unwrap(), b"onetwo");
    assert!(!store.is_unique(&b, b"two").unwrap());
    assert!(dir.path().join("kv_store_p3.sqlite").exists());
  }

  #[test]
  fn reopen_with_other_partition_count_fails() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = StoreConfig {
      path: Some(dir.path().to_path_buf()),
      partitions: 4,
    };
    SqliteStore::open(&config).unwrap();
    config.partitions = 2;
    assert!(matches!(
      SqliteStore::open(&config),
      Err(C3Error::Config(_))
    ));
  }

  #[test]
  fn two_handles_on_one_directory_do_not_lose_appends() {
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig {
      path: Some(dir.path().to_path_buf()),
      partitions: 1,
    };
    let a = SqliteStore::open(&config).unwrap();
    let b = SqliteStore::open(&config).unwrap();
    let bucket = id("0000f");
    std::thread::scope(|s| {
      for store in [&a, &b] {
        let bucket = &bucket;
        s.spawn(move || {
          for i in 0..20u8 {
            store.append(bucket, &[i]).unwrap();
          }
        });
      }
    });
    assert_eq!(a.get(&bucket).unwrap().len(), 40);
  }
}
