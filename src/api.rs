//! The `api` module is the ingestion entry point. It turns breached
//! credential pairs into encrypted bucket entries, either as
//! authoritative breach records or as similar-password decoys, and
//! commits them to the bucket store and the uniqueness index.
//!
//! Each entry is appended and recorded in the uniqueness index in one
//! atomic store write. Ingestion of several entries for one credential
//! is not transactional: if a later entry fails, the entries appended
//! before it stay in the store.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::IngestConfig;
use crate::db::EntryStore;
use crate::errors::{C3Error, Result};
use crate::mutator::Mutator;
use crate::protocol::{BucketId, EntryKind, ProtocolEngine};
use crate::utils::generate_random_bytes;

/// A breached credential pair, with the metadata that is encrypted into
/// each of its entries
#[derive(Clone, Copy, Debug)]
pub struct Credential<'a> {
  pub username: &'a [u8],
  pub password: &'a [u8],
  pub metadata: &'a [u8],
}
impl<'a> Credential<'a> {
  pub fn new(username: &'a [u8], password: &'a [u8]) -> Self {
    Self {
      username,
      password,
      metadata: &[],
    }
  }

  pub fn with_metadata(mut self, metadata: &'a [u8]) -> Self {
    self.metadata = metadata;
    self
  }
}

/// Which records an ingestion request produces
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IngestMode {
  /// The breach record itself, optionally with a username-only record
  Breach { include_username_variant: bool },
  /// `num_variants` similar-password decoys
  SimilarPasswords { num_variants: usize },
}

/// Summary of what one ingestion request appended
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IngestReport {
  pub bucket_id: BucketId,
  pub appended: Vec<EntryKind>,
  pub resamples: usize,
}

/// The `Ingestor` owns handles to the store, which also holds the
/// uniqueness index, and to the collaborators that produce entries. It
/// holds no per-request state, so one instance can serve concurrent
/// requests.
pub struct Ingestor {
  store: Arc<dyn EntryStore>,
  engine: Arc<dyn ProtocolEngine>,
  mutator: Arc<dyn Mutator>,
  config: IngestConfig,
}
impl Ingestor {
  pub fn new(
    store: Arc<dyn EntryStore>,
    engine: Arc<dyn ProtocolEngine>,
    mutator: Arc<dyn Mutator>,
    config: IngestConfig,
  ) -> Result<Self> {
    config.validate()?;
    Ok(Self {
      store,
      engine,
      mutator,
      config,
    })
  }

  /// Dispatches to `insert_breach` or `insert_variants`
  pub fn insert(&self, cred: Credential, mode: IngestMode) -> Result<IngestReport> {
    match mode {
      IngestMode::Breach {
        include_username_variant,
      } => self.insert_breach(cred, include_username_variant),
      IngestMode::SimilarPasswords { num_variants } => {
        self.insert_variants(cred, num_variants)
      }
    }
  }

  /// Appends the breach record for `cred`, followed by a username-only
  /// record if `include_username_variant` is set. Breach records are
  /// authoritative and are appended without a uniqueness check.
  pub fn insert_breach(
    &self,
    cred: Credential,
    include_username_variant: bool,
  ) -> Result<IngestReport> {
    let bucket_id = self.engine.bucket_id(cred.username)?;
    let mut report = IngestReport {
      bucket_id: bucket_id.clone(),
      appended: Vec::with_capacity(2),
      resamples: 0,
    };

    let entry = self.engine.encrypt_entry(
      cred.username,
      Some(cred.password),
      EntryKind::BreachedPassword,
      cred.metadata,
    )?;
    self.commit(&bucket_id, &entry, EntryKind::BreachedPassword)?;
    report.appended.push(EntryKind::BreachedPassword);

    if include_username_variant {
      let entry = self.engine.encrypt_entry(
        cred.username,
        None,
        EntryKind::BreachedUsername,
        cred.metadata,
      )?;
      self.commit(&bucket_id, &entry, EntryKind::BreachedUsername)?;
      report.appended.push(EntryKind::BreachedUsername);
    }
    Ok(report)
  }

  /// Appends `num_variants` similar-password entries derived from the
  /// password of `cred`. Every appended entry is unique within its
  /// bucket; a colliding candidate is replaced by a mutation of a fresh
  /// random string, at most `max_collision_retries` times per variant.
  pub fn insert_variants(
    &self,
    cred: Credential,
    num_variants: usize,
  ) -> Result<IngestReport> {
    let bucket_id = self.engine.bucket_id(cred.username)?;
    let mut report = IngestReport {
      bucket_id: bucket_id.clone(),
      appended: Vec::with_capacity(num_variants),
      resamples: 0,
    };

    let variants = self.mutator.mutate(cred.password, num_variants)?;
    if variants.len() != num_variants {
      return Err(C3Error::Mutation(format!(
        "requested {} variants, got {}",
        num_variants,
        variants.len()
      )));
    }

    for variant in variants {
      let (entry, resamples) = self.append_unique(&bucket_id, cred, &variant)?;
      report.resamples += resamples;
      log_entry(&bucket_id, EntryKind::SimilarPassword, &entry);
      report.appended.push(EntryKind::SimilarPassword);
    }

    debug!(
      bucket = %bucket_id,
      variants = num_variants,
      resamples = report.resamples,
      "similar password ingestion complete"
    );
    Ok(report)
  }

  // Appends the entry for `variant`, or for a resampled replacement,
  // that is not yet recorded in the bucket. Returns the entry and the
  // number of resamples it took.
  fn append_unique(
    &self,
    bucket_id: &BucketId,
    cred: Credential,
    variant: &[u8],
  ) -> Result<(Vec<u8>, usize)> {
    let mut entry = self.engine.encrypt_entry(
      cred.username,
      Some(variant),
      EntryKind::SimilarPassword,
      cred.metadata,
    )?;
    let mut tried: HashSet<Vec<u8>> = HashSet::new();
    let mut resamples = 0;
    loop {
      // candidates seen before are known collisions
      if tried.insert(entry.clone())
        && self.store.append_if_absent(bucket_id, &entry)?
      {
        return Ok((entry, resamples));
      }
      if resamples >= self.config.max_collision_retries {
        return Err(C3Error::CollisionExhausted {
          bucket_id: bucket_id.to_string(),
          attempts: resamples + 1,
        });
      }
      resamples += 1;
      warn!(bucket = %bucket_id, attempt = resamples, "variant collision, resampling");

      let seed = generate_random_bytes(self.config.resample_bits)?;
      let alt = self
        .mutator
        .mutate(&seed, 1)?
        .into_iter()
        .next()
        .ok_or_else(|| C3Error::Mutation("no replacement variant".into()))?;
      entry = self.engine.encrypt_entry(
        cred.username,
        Some(&alt),
        EntryKind::SimilarPassword,
        cred.metadata,
      )?;
    }
  }

  fn commit(&self, bucket_id: &BucketId, entry: &[u8], kind: EntryKind) -> Result<()> {
    self.store.append_recorded(bucket_id, entry)?;
    log_entry(bucket_id, kind, entry);
    Ok(())
  }
}

fn log_entry(bucket_id: &BucketId, kind: EntryKind, entry: &[u8]) {
  debug!(
    bucket = %bucket_id,
    kind = ?kind,
    entry = %base64::encode(entry),
    "appended entry"
  );
}
