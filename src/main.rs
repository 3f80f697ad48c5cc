mod app;
mod cache;
mod config;
mod db;
mod error;
mod event;
mod logging;
mod net;
mod queue;
mod store;
mod sync;
mod tracker;
mod worker;

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::path::PathBuf;

use app::{App, Resolution};
use net::Method;
use tracker::EntityRef;
use worker::ClientMessage;

#[derive(Parser, Debug)]
#[command(name = "wardsync")]
#[command(about = "Offline-first request interception and sync for the hospital operations dashboard")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/wardsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Also log to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run the worker and sync triggers until Ctrl-C
  Run,
  /// Send one request through the worker
  Fetch {
    method: Method,
    /// Absolute URL or a path on the configured origin
    url: String,
    /// JSON request body
    #[arg(long)]
    data: Option<String>,
    /// Treat as a page navigation
    #[arg(long)]
    navigate: bool,
  },
  /// Save a local edit; it is pushed on the next sync
  Save {
    entity_type: String,
    id: String,
    json: String,
  },
  /// Show pending records, conflicts and queued writes
  Status,
  /// Run one sync pass now
  Sync,
  /// Settle a conflicting entity
  Resolve {
    entity_type: String,
    id: String,
    /// Push the local copy again
    #[arg(long, conflicts_with = "discard", required_unless_present = "discard")]
    keep: bool,
    /// Drop the local copy and its queued writes
    #[arg(long)]
    discard: bool,
    /// Replacement payload when keeping
    #[arg(long, requires = "keep")]
    data: Option<String>,
  },
  /// Post a message to the worker
  Message { message: MessageArg },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum MessageArg {
  SkipWaiting,
  GetVersion,
}

impl From<MessageArg> for ClientMessage {
  fn from(arg: MessageArg) -> Self {
    match arg {
      MessageArg::SkipWaiting => ClientMessage::SkipWaiting,
      MessageArg::GetVersion => ClientMessage::GetVersion,
    }
  }
}

fn parse_json(raw: &str) -> Result<Value> {
  serde_json::from_str(raw).map_err(|e| eyre!("Invalid JSON {}: {}", raw, e))
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  let log_dir = match &config.log.directory {
    Some(dir) => dir.clone(),
    None => config::data_dir()?.join("logs"),
  };
  let _log_guard = logging::init(&log_dir, &config.log.level, args.verbose)?;

  let mut app = App::new(config.clone())?;

  match args.command {
    Command::Run => app.run().await?,
    Command::Fetch {
      method,
      url,
      data,
      navigate,
    } => {
      let body = data.as_deref().map(parse_json).transpose()?;
      let request = app::build_request(&config, method, &url, body, navigate)?;

      let fetched = app.fetch(request).await?;
      println!("{} ({})", fetched.response.status, fetched.source);
      println!("{}", fetched.response.text());
    }
    Command::Save {
      entity_type,
      id,
      json,
    } => {
      let entity = EntityRef::new(entity_type, id);
      let record = app.save(&entity, parse_json(&json)?)?;
      println!("{} saved ({})", entity, record.sync_status);
    }
    Command::Status => {
      let status = app.status()?;
      if let Some(path) = app.database_path() {
        println!("database: {}", path.display());
      }
      println!(
        "cache generation: {}",
        status.active_generation.as_deref().unwrap_or("none")
      );
      println!("queued writes: {}", status.queued);
      println!("pending: {}", status.pending.len());
      for tracked in &status.pending {
        println!("  {}", tracked.entity());
      }
      println!("conflicts: {}", status.conflicts.len());
      for tracked in &status.conflicts {
        println!("  {}  {}", tracked.entity(), tracked.record.payload);
      }
    }
    Command::Sync => {
      let summary = app.sync().await?;
      println!(
        "synced {}, conflicts {}, deferred {}, skipped {}",
        summary.synced, summary.conflicts, summary.deferred, summary.skipped
      );
    }
    Command::Resolve {
      entity_type,
      id,
      keep,
      discard: _,
      data,
    } => {
      let entity = EntityRef::new(entity_type, id);
      let resolution = if keep {
        Resolution::KeepLocal(data.as_deref().map(parse_json).transpose()?)
      } else {
        Resolution::DiscardLocal
      };
      app.resolve(&entity, resolution)?;
      println!("{} resolved", entity);
    }
    Command::Message { message } => {
      if let Some(reply) = app.message(message.into()).await? {
        println!("{}", serde_json::to_string(&reply)?);
      }
    }
  }

  Ok(())
}
