//! The `errors` module provides the error cases that are surfaced by the
//! bucket store and the ingestion pipeline.

use std::{error::Error, fmt};

// Result returns a value of a given type or a `C3Error`
pub type Result<T> = std::result::Result<T, C3Error>;

// C3Error (Compromised Credential Checker Error) encapsulates the possible
// error cases of the bucket store and ingestion engine
#[derive(Debug)]
pub enum C3Error {
  StoreConnection(String),
  Store(String),
  Protocol(String),
  Mutation(String),
  CollisionExhausted { bucket_id: String, attempts: usize },
  Randomness(String),
  Config(String),
  SerdeError(bincode::Error),
  SerdeJSON(serde_json::Error),
}

impl C3Error {
  /// Returns true if the error is fatal for the process, i.e. the store
  /// could not be reached at all.
  pub fn is_fatal(&self) -> bool {
    matches!(self, C3Error::StoreConnection(_) | C3Error::Config(_))
  }
}

impl Error for C3Error {
  fn source(&self) -> Option<&(dyn Error + 'static)> {
    match self {
      C3Error::SerdeError(e) => Some(e),
      C3Error::SerdeJSON(e) => Some(e),
      _ => None,
    }
  }
}

impl fmt::Display for C3Error {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      C3Error::StoreConnection(s) => {
        write!(f, "Error occurred connecting to the bucket store: {}.", s)
      }
      C3Error::Store(s) => {
        write!(f, "Error occurred during bucket store operation: {}.", s)
      }
      C3Error::Protocol(s) => {
        write!(f, "Error occurred in underlying protocol engine: {}.", s)
      }
      C3Error::Mutation(s) => {
        write!(f, "Error occurred generating password variants: {}.", s)
      }
      C3Error::CollisionExhausted { bucket_id, attempts } => write!(
        f,
        "Unable to find a unique variant for bucket {} after {} attempts.",
        bucket_id, attempts
      ),
      C3Error::Randomness(s) => {
        write!(f, "Error occurred sampling randomness: {}.", s)
      }
      C3Error::Config(s) => write!(f, "Configuration error: {}.", s),
      C3Error::SerdeError(e) => {
        write!(f, "Error occurred during serialization of data: {}.", e)
      }
      C3Error::SerdeJSON(e) => write!(
        f,
        "Error occurred during JSON serialization of data: {}.",
        e
      ),
    }
  }
}

impl From<rusqlite::Error> for C3Error {
  fn from(e: rusqlite::Error) -> Self {
    C3Error::Store(e.to_string())
  }
}

impl From<bincode::Error> for C3Error {
  fn from(e: bincode::Error) -> Self {
    C3Error::SerdeError(e)
  }
}

impl From<serde_json::Error> for C3Error {
  fn from(e: serde_json::Error) -> Self {
    C3Error::SerdeJSON(e)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn collision_exhausted_names_bucket() {
    let e = C3Error::CollisionExhausted {
      bucket_id: "ab12".into(),
      attempts: 3,
    };
    let msg = e.to_string();
    assert!(msg.contains("ab12"));
    assert!(msg.contains('3'));
    assert!(!e.is_fatal());
  }

  #[test]
  fn connection_failures_are_fatal() {
    assert!(C3Error::StoreConnection("refused".into()).is_fatal());
    assert!(!C3Error::Store("busy".into()).is_fatal());
  }
}
