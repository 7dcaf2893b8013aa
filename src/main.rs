mod app;
mod cache;
mod config;
mod logging;
mod net;
mod scheduler;
mod storage;
mod sync;
mod tasks;
mod weather;

use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;
use std::sync::Arc;

use crate::app::{AppContext, Command};
use crate::config::Config;
use crate::net::{HttpTransport, Transport};
use crate::storage::{CacheStore, KeyValueStore, MemoryStore, SqliteStore};

#[derive(Parser, Debug)]
#[command(name = "nimbus")]
#[command(about = "Weather lookups that keep working on a flaky connection")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/nimbus/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Treat the device as offline: serve stored results and queue requests
  #[arg(long, global = true)]
  offline: bool,

  /// Keep every queue and cache in memory for this run only
  #[arg(long, global = true)]
  ephemeral: bool,

  /// Mirror logs to stderr
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  // Held until exit so buffered log lines are flushed
  let _log_guard = logging::init(&config.log.level, args.verbose)?;

  let transport = Arc::new(HttpTransport::new(&config.api.user_agent)?);
  let online = !args.offline;

  let output = if args.ephemeral {
    let store = Arc::new(MemoryStore::new());
    run(config, store, transport, online, args.command).await?
  } else {
    let store = match &config.storage.path {
      Some(path) => SqliteStore::open_at(path)?,
      None => SqliteStore::open()?,
    };
    run(config, Arc::new(store), transport, online, args.command).await?
  };

  println!("{}", output);
  Ok(())
}

/// Run one command, then wait for the background work it started.
async fn run<S: CacheStore + KeyValueStore + 'static>(
  config: Config,
  store: Arc<S>,
  transport: Arc<dyn Transport>,
  online: bool,
  command: Command,
) -> Result<String> {
  let app = AppContext::new(config, store, transport, online);
  let output = app.run(command).await;
  app.finish().await;
  output
}
