use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use c3_store::api::{Credential, IngestMode, Ingestor};
use c3_store::config::{
  IngestConfig, StoreConfig, DEFAULT_MAX_COLLISION_RETRIES, DEFAULT_PARTITIONS,
};
use c3_store::db::{BucketStore, SqliteStore};
use c3_store::errors::{C3Error, Result};
use c3_store::mutator::RuleMutator;
use c3_store::protocol::{HashedEngine, ServerProtocolConfig};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
  name = "c3-loader",
  version,
  about = "Loads breached credentials into the bucket store"
)]
struct Cli {
  /// Directory holding the partition files
  #[arg(long, default_value = "./c3-db")]
  db_path: PathBuf,

  /// Number of store partitions, fixed once the store is created
  #[arg(long, default_value_t = DEFAULT_PARTITIONS)]
  partitions: usize,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Ingest a file with one `username:password` pair per line
  Ingest {
    input: PathBuf,

    /// JSON protocol parameters, including the base64 engine key
    #[arg(long, env = "CONFIG_JSON", hide_env_values = true)]
    config_json: String,

    #[arg(long, value_enum, default_value_t = Phase::Breach)]
    phase: Phase,

    /// Also add a username-only record for each breach record
    #[arg(long)]
    username_variant: bool,

    /// Similar-password variants per credential
    #[arg(long, default_value_t = 10)]
    variants: usize,

    /// Metadata encrypted into every entry
    #[arg(long, default_value = "")]
    metadata: String,

    #[arg(long, default_value_t = DEFAULT_MAX_COLLISION_RETRIES)]
    max_collision_retries: usize,
  },
  /// Print bucket counts and sizes per partition
  Stats,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Phase {
  /// Breach records only
  Breach,
  /// Similar-password variants only
  Similar,
  /// Breach records followed by variants
  Both,
}
impl Phase {
  fn modes(self, include_username_variant: bool, num_variants: usize) -> Vec<IngestMode> {
    let breach = IngestMode::Breach {
      include_username_variant,
    };
    let similar = IngestMode::SimilarPasswords { num_variants };
    match self {
      Phase::Breach => vec![breach],
      Phase::Similar => vec![similar],
      Phase::Both => vec![breach, similar],
    }
  }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Summary {
  ingested: usize,
  skipped: usize,
  failed: usize,
}

fn main() -> ExitCode {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info")),
    )
    .init();

  let cli = Cli::parse();
  match run(cli) {
    Ok(true) => ExitCode::SUCCESS,
    Ok(false) => ExitCode::FAILURE,
    Err(e) => {
      error!(err = %e, "loader failed");
      ExitCode::FAILURE
    }
  }
}

// Returns whether every line was ingested or skipped cleanly
fn run(cli: Cli) -> Result<bool> {
  let config = StoreConfig {
    path: Some(cli.db_path),
    partitions: cli.partitions,
  };

  match cli.command {
    Command::Stats => {
      let store = SqliteStore::open_existing(&config)?;
      for s in store.partition_stats()? {
        println!(
          "partition {}: {} buckets, {} bytes",
          s.partition, s.buckets, s.bytes
        );
      }
      Ok(true)
    }
    Command::Ingest {
      input,
      config_json,
      phase,
      username_variant,
      variants,
      metadata,
      max_collision_retries,
    } => {
      let protocol = ServerProtocolConfig::from_json(&config_json)?;
      let engine = HashedEngine::from_server_config(&protocol)?;
      let ingestor = Ingestor::new(
        Arc::new(SqliteStore::open(&config)?),
        Arc::new(engine),
        Arc::new(RuleMutator::new()),
        IngestConfig {
          max_collision_retries,
          ..Default::default()
        },
      )?;
      let file = File::open(&input).map_err(|e| {
        C3Error::Config(format!("{}: {}", input.display(), e))
      })?;
      let summary = ingest_lines(
        &ingestor,
        BufReader::new(file),
        &phase.modes(username_variant, variants),
        metadata.as_bytes(),
      )?;
      info!(
        ingested = summary.ingested,
        skipped = summary.skipped,
        failed = summary.failed,
        "ingestion finished"
      );
      Ok(summary.failed == 0)
    }
  }
}

fn parse_line(line: &str) -> Option<(&str, &str)> {
  let (username, password) = line.split_once(':')?;
  if username.is_empty() || password.is_empty() {
    return None;
  }
  Some((username, password))
}

// Per-credential failures are logged and counted; only errors that make
// the store unusable abort the run.
fn ingest_lines<R: BufRead>(
  ingestor: &Ingestor,
  reader: R,
  modes: &[IngestMode],
  metadata: &[u8],
) -> Result<Summary> {
  let mut summary = Summary::default();
  for (n, line) in reader.lines().enumerate() {
    let line = line.map_err(|e| C3Error::Config(format!("reading input: {}", e)))?;
    let line = line.trim_end_matches('\r');
    if line.trim().is_empty() {
      continue;
    }
    let (username, password) = match parse_line(line) {
      Some(pair) => pair,
      None => {
        warn!(line = n + 1, "malformed credential line, skipping");
        summary.skipped += 1;
        continue;
      }
    };
    let cred = Credential::new(username.as_bytes(), password.as_bytes())
      .with_metadata(metadata);
    let mut ok = true;
    for &mode in modes {
      if let Err(e) = ingestor.insert(cred, mode) {
        if e.is_fatal() {
          return Err(e);
        }
        error!(line = n + 1, err = %e, "ingestion failed");
        ok = false;
        break;
      }
    }
    if ok {
      summary.ingested += 1;
    } else {
      summary.failed += 1;
    }
  }
  Ok(summary)
}

#[cfg(test)]
mod tests {
  use super::*;
  use c3_store::protocol::{ProtocolConfig, ProtocolEngine};
  use clap::CommandFactory;
  use std::io::Cursor;

  fn setup() -> (Arc<SqliteStore>, Arc<HashedEngine>, Ingestor) {
    let store = Arc::new(SqliteStore::in_memory(4).unwrap());
    let engine = Arc::new(
      HashedEngine::new(b"loader-test-key", ProtocolConfig::default()).unwrap(),
    );
    let ingestor = Ingestor::new(
      store.clone(),
      engine.clone(),
      Arc::new(RuleMutator::seeded(11)),
      IngestConfig::default(),
    )
    .unwrap();
    (store, engine, ingestor)
  }

  #[test]
  fn cli_definition_is_valid() {
    Cli::command().debug_assert();
  }

  #[test]
  fn parse_line_splits_on_first_colon() {
    assert_eq!(parse_line("a@b.com:p:w"), Some(("a@b.com", "p:w")));
    assert_eq!(parse_line("nocolon"), None);
    assert_eq!(parse_line(":pw"), None);
    assert_eq!(parse_line("user:"), None);
  }

  #[test]
  fn ingests_breach_and_variants() {
    let (store, engine, ingestor) = setup();
    let input = "poc-test@mail.com:poc-pwd\n\nbroken line\r\nsome_email@email.com:some_password\r\n";
    let summary = ingest_lines(
      &ingestor,
      Cursor::new(input),
      &Phase::Both.modes(true, 3),
      b"",
    )
    .unwrap();
    assert_eq!(
      summary,
      Summary {
        ingested: 2,
        skipped: 1,
        failed: 0
      }
    );
    for user in ["poc-test@mail.com", "some_email@email.com"] {
      let bucket = store.get(&engine.bucket_id(user.as_bytes()).unwrap()).unwrap();
      assert_eq!(HashedEngine::split_entries(&bucket).unwrap().len(), 5);
    }
  }

  #[test]
  fn stats_on_missing_store_fails_without_creating_it() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("no-such-db");
    let cli = Cli::parse_from([
      "c3-loader",
      "--db-path",
      db_path.to_str().unwrap(),
      "stats",
    ]);
    assert!(matches!(run(cli), Err(C3Error::StoreConnection(_))));
    assert!(!db_path.exists());
  }

  #[test]
  fn breach_phase_only_appends_breach_records() {
    let (store, engine, ingestor) = setup();
    let summary = ingest_lines(
      &ingestor,
      Cursor::new("alice:hunter2\n"),
      &Phase::Breach.modes(false, 10),
      b"meta",
    )
    .unwrap();
    assert_eq!(summary.ingested, 1);
    let bucket = store.get(&engine.bucket_id(b"alice").unwrap()).unwrap();
    assert_eq!(HashedEngine::split_entries(&bucket).unwrap().len(), 1);
  }
}
