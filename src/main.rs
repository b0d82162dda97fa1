mod app;
mod cache;
mod config;
mod event;
mod network;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "orbit")]
#[command(about = "Offline cache controller for the space tourism site")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./orbit.yaml or $XDG_CONFIG_HOME/orbit/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Site origin to intercept
  #[arg(short, long)]
  origin: Option<String>,

  /// Cache database path
  #[arg(long)]
  database: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Read host events from stdin as JSON lines (default)
  Run,
  /// List cache stores
  Caches,
  /// List the entries of one cache store
  Entries { store: String },
  /// Delete every cache store
  Clear,
}

/// Log to a file so stdout stays free for replies.
fn init_logging() -> Option<WorkerGuard> {
  let filter = EnvFilter::try_from_env("ORBIT_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  match dirs::data_dir() {
    Some(data_dir) => {
      let appender = tracing_appender::rolling::never(data_dir.join("orbit"), "orbit.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
      Some(guard)
    }
    None => {
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
      None
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;
  let _guard = init_logging();

  let args = Args::parse();

  // Load configuration
  let mut config = config::Config::load(args.config.as_deref())?;

  // Command line overrides
  if let Some(origin) = args.origin {
    config.origin = origin;
  }
  if let Some(database) = args.database {
    config.database = Some(database);
  }

  let app = app::App::new(config)?;
  match args.command.unwrap_or(Command::Run) {
    Command::Run => app.run().await?,
    Command::Caches => app.list_caches()?,
    Command::Entries { store } => app.list_entries(&store)?,
    Command::Clear => app.clear()?,
  }

  Ok(())
}
