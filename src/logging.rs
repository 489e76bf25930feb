//! Tracing setup. Logs go to a daily file so stdout stays clean for JSON.

use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use tracing::warn;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

fn log_dir() -> PathBuf {
  dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .unwrap_or_else(std::env::temp_dir)
    .join("pmcli")
    .join("logs")
}

fn file_writer(dir: &Path) -> Result<(NonBlocking, WorkerGuard)> {
  let file_appender = RollingFileAppender::builder()
    .rotation(Rotation::DAILY)
    .filename_prefix("pmcli")
    .filename_suffix("log")
    .build(dir)
    .map_err(|e| eyre!("Failed to open log file in {}: {}", dir.display(), e))?;
  Ok(tracing_appender::non_blocking(file_appender))
}

/// Install the global subscriber. Keep the guard alive until exit or
/// buffered lines are lost.
///
/// The filter comes from PMCLI_LOG; `verbose` defaults it to `debug` and
/// mirrors output to stderr. Logging never stops a command from running.
pub fn init(verbose: bool) -> Option<WorkerGuard> {
  init_in(&log_dir(), verbose)
}

/// `init` with an explicit log directory. An unusable directory falls back
/// to stderr only.
fn init_in(dir: &Path, verbose: bool) -> Option<WorkerGuard> {
  let filter = EnvFilter::try_from_env("PMCLI_LOG")
    .unwrap_or_else(|_| EnvFilter::new(if verbose { "pmcli=debug" } else { "warn" }));

  let (file, guard, file_error) = match file_writer(dir) {
    Ok((writer, guard)) => (
      Some(fmt::layer().with_writer(writer).with_ansi(false)),
      Some(guard),
      None,
    ),
    Err(e) => (None, None, Some(e)),
  };

  let stderr = (verbose || file.is_none())
    .then(|| fmt::layer().with_writer(std::io::stderr).with_target(false));

  // Only fails when a subscriber is already installed
  let installed = tracing_subscriber::registry()
    .with(filter)
    .with(file)
    .with(stderr)
    .try_init()
    .is_ok();

  if let (true, Some(e)) = (installed, file_error) {
    warn!(error = %e, "Logging to stderr only");
  }

  guard
}
