//! Log setup for the command-line front end.
//!
//! Output goes to a file so stdout stays clean for JSON results.

use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

const LOG_FILE: &str = "edgecache.log";

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the configured level. Keep the returned guard alive
/// until exit so buffered lines are flushed.
pub fn init(config: &LoggingConfig) -> Result<WorkerGuard> {
  let filter = build_filter(&config.level)?;
  let dir = log_dir(config)?;
  std::fs::create_dir_all(&dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let appender = tracing_appender::rolling::never(&dir, LOG_FILE);
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::registry()
    .with(filter)
    .with(
      tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true),
    )
    .try_init()
    .map_err(|e| eyre!("Failed to install logger: {}", e))?;

  tracing::debug!(dir = %dir.display(), level = %config.level, "logger initialized");
  Ok(guard)
}

fn build_filter(level: &str) -> Result<EnvFilter> {
  if let Ok(filter) = EnvFilter::try_from_default_env() {
    return Ok(filter);
  }
  EnvFilter::try_new(level).map_err(|e| eyre!("Invalid log level '{}': {}", level, e))
}

fn log_dir(config: &LoggingConfig) -> Result<PathBuf> {
  if let Some(dir) = &config.dir {
    return Ok(dir.clone());
  }
  dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .map(|p| p.join("edgecache").join("logs"))
    .ok_or_else(|| eyre!("Could not determine a log directory; set logging.dir"))
}
