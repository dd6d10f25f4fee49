//! The `protocol` module defines the interface to the protocol engine
//! that derives bucket identifiers, encrypts bucket entries and answers
//! client queries. The oblivious lookup cryptography lives behind the
//! `ProtocolEngine` trait; `HashedEngine` is a keyed-hash engine that
//! produces entries with the same shape, used by the loader and in tests.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::db::BucketStore;
use crate::errors::{C3Error, Result};
use crate::utils::hex_prefix;

/// Hex-encoded identifier of a bucket, derived from a username.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BucketId(String);
impl BucketId {
  /// Wraps an already hex-encoded identifier.
  pub fn from_hex(hex: &str) -> Result<Self> {
    if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
      return Err(C3Error::Protocol(format!(
        "bucket identifier {:?} is not hex-encoded",
        hex
      )));
    }
    Ok(Self(hex.to_ascii_lowercase()))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  pub fn as_bytes(&self) -> &[u8] {
    self.0.as_bytes()
  }
}
impl fmt::Display for BucketId {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// The kind of credential record that an entry encodes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
  BreachedPassword,
  BreachedUsername,
  SimilarPassword,
}
impl EntryKind {
  pub fn tag(self) -> u8 {
    match self {
      EntryKind::BreachedPassword => 0x01,
      EntryKind::BreachedUsername => 0x02,
      EntryKind::SimilarPassword => 0x03,
    }
  }

  pub fn from_tag(tag: u8) -> Option<Self> {
    match tag {
      0x01 => Some(EntryKind::BreachedPassword),
      0x02 => Some(EntryKind::BreachedUsername),
      0x03 => Some(EntryKind::SimilarPassword),
      _ => None,
    }
  }
}

/// The `ProtocolEngine` trait is the seam to the cryptographic protocol.
/// Bucket identifiers must be deterministic in the username; entries are
/// opaque and compared byte-for-byte by the store.
pub trait ProtocolEngine: Send + Sync {
  /// Maps a username to the bucket that holds its entries
  fn bucket_id(&self, username: &[u8]) -> Result<BucketId>;

  /// Produces the encrypted entry for a credential. `secret` is `None`
  /// for username-only records.
  fn encrypt_entry(
    &self,
    username: &[u8],
    secret: Option<&[u8]>,
    kind: EntryKind,
    metadata: &[u8],
  ) -> Result<Vec<u8>>;

  /// Answers a serialized client query using the bucket store, and
  /// returns a serialized binary response.
  fn handle_request(
    &self,
    request: &[u8],
    store: &dyn BucketStore,
  ) -> Result<Vec<u8>>;

  /// Returns the non-secret protocol parameters
  fn config(&self) -> &ProtocolConfig;
}

/// Public protocol parameters, safe to publish to clients
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolConfig {
  pub version: u32,
  pub bucket_id_hex_len: usize,
}
impl Default for ProtocolConfig {
  fn default() -> Self {
    Self {
      version: 1,
      bucket_id_hex_len: 5,
    }
  }
}

/// Protocol parameters together with the engine key, as loaded by the
/// server and loader processes.
#[derive(Clone, Serialize, Deserialize)]
pub struct ServerProtocolConfig {
  #[serde(flatten)]
  pub config: ProtocolConfig,
  pub key: String, // base64-encoded engine key
}
impl ServerProtocolConfig {
  pub fn from_json(json: &str) -> Result<Self> {
    Ok(serde_json::from_str(json)?)
  }
}
impl fmt::Debug for ServerProtocolConfig {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.debug_struct("ServerProtocolConfig")
      .field("config", &self.config)
      .field("key", &"<redacted>")
      .finish()
  }
}

// The message that a client sends to look up a bucket
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRequest {
  pub bucket_id: String,
}

// The response to a `ClientRequest`, containing the concatenated entries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerResponse {
  pub bucket_id: String,
  pub bucket_contents: Vec<u8>,
}

const DIGEST_LEN: usize = 32;
const MAX_METADATA_LEN: usize = u16::MAX as usize;

/// `HashedEngine` derives identifiers from SHA-256 of the username and
/// produces entries as:
///
/// `tag (1) || SHA-256(key || tag || username || 0x00 || secret) (32) ||
///  metadata_len (2, LE) || metadata XOR keystream`
///
/// Equal inputs always give equal entries, which is what the uniqueness
/// index relies on.
pub struct HashedEngine {
  key: Vec<u8>,
  config: ProtocolConfig,
}
impl HashedEngine {
  pub fn new(key: &[u8], config: ProtocolConfig) -> Result<Self> {
    if key.is_empty() {
      return Err(C3Error::Protocol("engine key must not be empty".into()));
    }
    if config.bucket_id_hex_len == 0 || config.bucket_id_hex_len > 64 {
      return Err(C3Error::Protocol(format!(
        "bucket id length {} not in 1..=64",
        config.bucket_id_hex_len
      )));
    }
    Ok(Self {
      key: key.to_vec(),
      config,
    })
  }

  pub fn from_server_config(cfg: &ServerProtocolConfig) -> Result<Self> {
    let key = base64::decode(&cfg.key)
      .map_err(|e| C3Error::Protocol(format!("invalid engine key: {}", e)))?;
    Self::new(&key, cfg.config.clone())
  }

  fn credential_digest(
    &self,
    username: &[u8],
    secret: Option<&[u8]>,
    kind: EntryKind,
  ) -> [u8; DIGEST_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(&self.key);
    hasher.update([kind.tag()]);
    hasher.update(username);
    hasher.update([0u8]);
    if let Some(s) = secret {
      hasher.update(s);
    }
    hasher.finalize().into()
  }

  fn mask_metadata(&self, digest: &[u8], metadata: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(metadata.len());
    for (counter, chunk) in metadata.chunks(DIGEST_LEN).enumerate() {
      let block = Sha256::new()
        .chain_update(&self.key)
        .chain_update(b"metadata")
        .chain_update(digest)
        .chain_update((counter as u32).to_le_bytes())
        .finalize();
      out.extend(chunk.iter().zip(block.iter()).map(|(m, k)| m ^ k));
    }
    out
  }

  /// Recovers the kind and metadata of an entry that was produced for the
  /// given credential, or `None` if the entry belongs to another one.
  pub fn open_entry(
    &self,
    entry: &[u8],
    username: &[u8],
    secret: Option<&[u8]>,
  ) -> Option<(EntryKind, Vec<u8>)> {
    let header = 1 + DIGEST_LEN + 2;
    if entry.len() < header {
      return None;
    }
    let kind = EntryKind::from_tag(entry[0])?;
    let digest = self.credential_digest(username, secret, kind);
    if entry[1..1 + DIGEST_LEN] != digest {
      return None;
    }
    let len =
      u16::from_le_bytes([entry[1 + DIGEST_LEN], entry[2 + DIGEST_LEN]]) as usize;
    if entry.len() != header + len {
      return None;
    }
    Some((kind, self.mask_metadata(&digest, &entry[header..])))
  }

  /// Splits a concatenated bucket value into the entries it holds
  pub fn split_entries(bucket: &[u8]) -> Result<Vec<&[u8]>> {
    let header = 1 + DIGEST_LEN + 2;
    let mut entries = Vec::new();
    let mut rest = bucket;
    while !rest.is_empty() {
      if rest.len() < header {
        return Err(C3Error::Protocol("truncated bucket entry".into()));
      }
      let len =
        u16::from_le_bytes([rest[1 + DIGEST_LEN], rest[2 + DIGEST_LEN]]) as usize;
      if rest.len() < header + len {
        return Err(C3Error::Protocol("truncated bucket entry".into()));
      }
      let (entry, tail) = rest.split_at(header + len);
      entries.push(entry);
      rest = tail;
    }
    Ok(entries)
  }
}

impl ProtocolEngine for HashedEngine {
  fn bucket_id(&self, username: &[u8]) -> Result<BucketId> {
    let digest = Sha256::digest(username);
    BucketId::from_hex(&hex_prefix(&digest, self.config.bucket_id_hex_len))
  }

  fn encrypt_entry(
    &self,
    username: &[u8],
    secret: Option<&[u8]>,
    kind: EntryKind,
    metadata: &[u8],
  ) -> Result<Vec<u8>> {
    if metadata.len() > MAX_METADATA_LEN {
      return Err(C3Error::Protocol(format!(
        "metadata of {} bytes exceeds {} bytes",
        metadata.len(),
        MAX_METADATA_LEN
      )));
    }
    let digest = self.credential_digest(username, secret, kind);
    let mut entry = Vec::with_capacity(1 + DIGEST_LEN + 2 + metadata.len());
    entry.push(kind.tag());
    entry.extend_from_slice(&digest);
    entry.extend_from_slice(&(metadata.len() as u16).to_le_bytes());
    entry.extend(self.mask_metadata(&digest, metadata));
    Ok(entry)
  }

  fn handle_request(
    &self,
    request: &[u8],
    store: &dyn BucketStore,
  ) -> Result<Vec<u8>> {
    let req: ClientRequest = serde_json::from_slice(request)?;
    if req.bucket_id.len() != self.config.bucket_id_hex_len {
      return Err(C3Error::Protocol(format!(
        "bucket identifier length {} does not match configured {}",
        req.bucket_id.len(),
        self.config.bucket_id_hex_len
      )));
    }
    let bucket_id = BucketId::from_hex(&req.bucket_id)?;
    let bucket_contents = store.get(&bucket_id)?;
    let resp = ServerResponse {
      bucket_id: bucket_id.to_string(),
      bucket_contents,
    };
    Ok(bincode::serialize(&resp)?)
  }

  fn config(&self) -> &ProtocolConfig {
    &self.config
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::MemoryStore;

  fn engine() -> HashedEngine {
    HashedEngine::new(b"test-engine-key", ProtocolConfig::default()).unwrap()
  }

  #[test]
  fn bucket_id_is_deterministic() {
    let e = engine();
    let a = e.bucket_id(b"alice").unwrap();
    assert_eq!(a, e.bucket_id(b"alice").unwrap());
    assert_eq!(a.as_str().len(), 5);
    assert_ne!(a, e.bucket_id(b"bob").unwrap());
  }

  #[test]
  fn entries_open_with_matching_credential_only() {
    let e = engine();
    let entry = e
      .encrypt_entry(
        b"alice",
        Some(b"hunter2"),
        EntryKind::BreachedPassword,
        b"breach:2019",
      )
      .unwrap();
    let (kind, meta) = e.open_entry(&entry, b"alice", Some(b"hunter2")).unwrap();
    assert_eq!(kind, EntryKind::BreachedPassword);
    assert_eq!(meta, b"breach:2019");
    assert!(e.open_entry(&entry, b"alice", Some(b"hunter3")).is_none());
  }

  #[test]
  fn kinds_produce_distinct_entries() {
    let e = engine();
    let a = e
      .encrypt_entry(b"alice", Some(b"pw"), EntryKind::BreachedPassword, b"")
      .unwrap();
    let b = e
      .encrypt_entry(b"alice", Some(b"pw"), EntryKind::SimilarPassword, b"")
      .unwrap();
    assert_ne!(a, b);
  }

  #[test]
  fn split_entries_recovers_concatenation() {
    let e = engine();
    let a = e
      .encrypt_entry(b"alice", Some(b"pw"), EntryKind::BreachedPassword, b"m1")
      .unwrap();
    let b = e
      .encrypt_entry(b"alice", None, EntryKind::BreachedUsername, b"")
      .unwrap();
    let bucket = [a.clone(), b.clone()].concat();
    let split = HashedEngine::split_entries(&bucket).unwrap();
    assert_eq!(split, vec![a.as_slice(), b.as_slice()]);
    assert!(HashedEngine::split_entries(&bucket[..bucket.len() - 1]).is_err());
  }

  #[test]
  fn handle_request_returns_bucket_contents() {
    let e = engine();
    let store = MemoryStore::new(4).unwrap();
    let id = e.bucket_id(b"alice").unwrap();
    store.append(&id, b"abc").unwrap();
    let req = serde_json::to_vec(&ClientRequest {
      bucket_id: id.to_string(),
    })
    .unwrap();
    let resp: ServerResponse =
      bincode::deserialize(&e.handle_request(&req, &store).unwrap()).unwrap();
    assert_eq!(resp.bucket_contents, b"abc");

    let other = serde_json::to_vec(&ClientRequest {
      bucket_id: "00000".into(),
    })
    .unwrap();
    let resp: ServerResponse =
      bincode::deserialize(&e.handle_request(&other, &store).unwrap()).unwrap();
    assert!(resp.bucket_contents.is_empty());
  }

  #[test]
  fn handle_request_rejects_bad_ids() {
    let e = engine();
    let store = MemoryStore::new(1).unwrap();
    let req = br#"{"bucket_id":"zzzzz"}"#;
    assert!(e.handle_request(req, &store).is_err());
    let req = br#"{"bucket_id":"abc"}"#;
    assert!(e.handle_request(req, &store).is_err());
  }

  #[test]
  fn server_config_parses_and_redacts() {
    let json = r#"{"version":1,"bucket_id_hex_len":6,"key":"c2VjcmV0"}"#;
    let cfg = ServerProtocolConfig::from_json(json).unwrap();
    assert_eq!(cfg.config.bucket_id_hex_len, 6);
    assert!(!format!("{:?}", cfg).contains("c2VjcmV0"));
    let e = HashedEngine::from_server_config(&cfg).unwrap();
    assert_eq!(e.bucket_id(b"alice").unwrap().as_str().len(), 6);
  }
}
