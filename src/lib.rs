//! The c3-store crate is the bucket storage and ingestion engine of a
//! compromised credential checker. Breached credential pairs, and
//! "similar password" decoys derived from them, are encrypted by a
//! protocol engine into opaque entries and appended to hash buckets
//! keyed by the username. Clients later retrieve a whole bucket and
//! match their credential against it without revealing the password.
//!
//! # Example usage
//!
//! ```
//! # use std::sync::Arc;
//! # use c3_store::api::{Credential, Ingestor};
//! # use c3_store::config::IngestConfig;
//! # use c3_store::db::{BucketStore, SqliteStore};
//! # use c3_store::mutator::RuleMutator;
//! # use c3_store::protocol::{HashedEngine, ProtocolConfig, ProtocolEngine};
//! let store = Arc::new(SqliteStore::in_memory(4).unwrap());
//! let engine = Arc::new(HashedEngine::new(b"engine-key", ProtocolConfig::default()).unwrap());
//! let ingestor = Ingestor::new(
//!   store.clone(),
//!   engine.clone(),
//!   Arc::new(RuleMutator::new()),
//!   IngestConfig::default(),
//! ).unwrap();
//!
//! // the breach record, plus a username-only record
//! let cred = Credential::new(b"alice", b"hunter2");
//! ingestor.insert_breach(cred, true).unwrap();
//!
//! // five decoys, unique within alice's bucket
//! ingestor.insert_variants(cred, 5).unwrap();
//!
//! let bucket = store.get(&engine.bucket_id(b"alice").unwrap()).unwrap();
//! assert_eq!(HashedEngine::split_entries(&bucket).unwrap().len(), 7);
//! ```

pub mod api;
pub mod config;
pub mod db;
pub mod errors;
pub mod mutator;
pub mod protocol;
pub mod utils;
