use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

const LOG_FILE_PREFIX: &str = "wardsync.log";

/// Filter from WARDSYNC_LOG, then RUST_LOG, then the configured level.
fn env_filter(default_level: &str) -> EnvFilter {
  EnvFilter::try_from_env("WARDSYNC_LOG")
    .or_else(|_| EnvFilter::try_from_default_env())
    .unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Install the global subscriber: a daily rolling file in `directory`, plus
/// stderr when `verbose`. Keep the returned guard alive until exit so
/// buffered lines are flushed.
pub fn init(directory: &Path, default_level: &str, verbose: bool) -> Result<WorkerGuard> {
  std::fs::create_dir_all(directory)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", directory.display(), e))?;

  let appender = tracing_appender::rolling::daily(directory, LOG_FILE_PREFIX);
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let file_layer = fmt::layer().with_writer(writer).with_ansi(false);
  let stderr_layer = verbose.then(|| {
    fmt::layer()
      .with_writer(std::io::stderr)
      .with_target(false)
      .compact()
      .boxed()
  });

  tracing_subscriber::registry()
    .with(env_filter(default_level))
    .with(file_layer)
    .with(stderr_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to install log subscriber: {}", e))?;

  Ok(guard)
}

