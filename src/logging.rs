//! Tracing setup for the demo binary.
//!
//! ## Log Levels
//! - `STOREFRONT_LOG=debug` - Show debug messages
//! - `STOREFRONT_LOG=storefront_sync=trace` - Trace this crate only
//! - Default: `storefront_sync=info`
//!
//! Output goes to `storefront-sync.log` in the data directory so command
//! output on stdout stays clean.

use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "STOREFRONT_LOG";
const DEFAULT_FILTER: &str = "storefront_sync=info";
const LOG_FILE: &str = "storefront-sync.log";

/// Install the global subscriber writing to `dir`. Keep the guard alive for
/// the life of the process or buffered lines are lost.
pub fn init(dir: &Path) -> Result<WorkerGuard> {
  std::fs::create_dir_all(dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let filter =
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

  let appender = tracing_appender::rolling::never(dir, LOG_FILE);
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .try_init()
    .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

  Ok(guard)
}
