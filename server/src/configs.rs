use std::path::PathBuf;
use std::{env, fmt};

use c3_store::config::{StoreConfig, DEFAULT_PARTITIONS};
use c3_store::protocol::ServerProtocolConfig;

const DEFAULT_PORT: &str = "8080";
const DEFAULT_DB_PATH: &str = "./c3-db";

#[derive(Debug, Clone)]
pub struct ServerConfig {
  pub port: String,
  pub store: StoreConfig,
  pub protocol: ServerProtocolConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfigErr {
  reason: String,
}

impl fmt::Display for ServerConfigErr {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "Server configs error: {}", self.reason)
  }
}

impl std::error::Error for ServerConfigErr {}

impl ServerConfigErr {
  fn throw(reason: &str) -> Self {
    Self {
      reason: reason.to_string(),
    }
  }
}

pub fn get_env_configs() -> Result<ServerConfig, ServerConfigErr> {
  from_lookup(|k| env::var(k).ok())
}

// Reads the configuration through `lookup`, so that it can be tested
// without touching the process environment
fn from_lookup<F>(lookup: F) -> Result<ServerConfig, ServerConfigErr>
where
  F: Fn(&str) -> Option<String>,
{
  let port = lookup("FUNCTIONS_CUSTOMHANDLER_PORT")
    .or_else(|| lookup("PORT"))
    .unwrap_or_else(|| DEFAULT_PORT.to_string());
  if port.parse::<u16>().is_err() {
    return Err(ServerConfigErr::throw(&format!("invalid port {:?}", port)));
  }

  let path = match lookup("DB_PATH") {
    Some(v) => PathBuf::from(v),
    None => {
      tracing::warn!(
        "DB_PATH environment variable not set, using {}",
        DEFAULT_DB_PATH
      );
      PathBuf::from(DEFAULT_DB_PATH)
    }
  };

  let partitions = match lookup("PARTITIONS") {
    Some(v) => v.parse::<usize>().map_err(|e| {
      ServerConfigErr::throw(&format!("invalid PARTITIONS {:?}: {}", v, e))
    })?,
    None => DEFAULT_PARTITIONS,
  };
  let store = StoreConfig {
    path: Some(path),
    partitions,
  };
  store
    .validate()
    .map_err(|e| ServerConfigErr::throw(&e.to_string()))?;

  let config_json = match lookup("CONFIG_JSON") {
    Some(v) => v,
    None => {
      return Err(ServerConfigErr::throw(
        "CONFIG_JSON environment variable not set",
      ))
    }
  };
  let protocol = ServerProtocolConfig::from_json(&config_json)
    .map_err(|e| ServerConfigErr::throw(&format!("parsing CONFIG_JSON: {}", e)))?;

  Ok(ServerConfig {
    port,
    store,
    protocol,
  })
}
