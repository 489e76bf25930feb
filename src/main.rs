mod api;
mod cache;
mod commands;
mod config;
mod logging;

use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use cache::{CacheStore, SqliteOpener, TtlPolicy};
use commands::{Command, Context};

#[derive(Parser, Debug)]
#[command(name = "pmcli")]
#[command(about = "A command-line client for a project-management API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/pmcli/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Organization id to use
  #[arg(long, global = true)]
  org: Option<String>,

  /// Bypass the local cache entirely
  #[arg(long, global = true)]
  no_cache: bool,

  /// Log debug output to stderr as well as the log file
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = logging::init(args.verbose);

  // Load configuration
  let mut config = config::Config::load(args.config.as_deref())?;

  // Command-line flags win over file and environment
  if let Some(org) = args.org {
    config.api.organization_id = Some(org);
  }
  if args.no_cache {
    config.cache.enabled = false;
  }

  let cache = build_cache(&config);
  let http = reqwest::Client::builder()
    .timeout(Duration::from_secs(config.api.timeout_secs))
    .build()
    .map_err(|e| color_eyre::eyre::eyre!("Failed to create HTTP client: {}", e))?;

  let ctx = Context {
    credentials: config.credentials(config::Config::get_api_token()),
    config,
    cache,
    http,
  };

  let result = commands::execute(args.command, &ctx).await;

  // Give background cache writes a chance to land before exiting
  ctx.cache.flush().await;

  result
}

fn build_cache(config: &config::Config) -> CacheStore {
  match config.cache_path() {
    Ok(path) => CacheStore::new(
      Arc::new(SqliteOpener::new(path)),
      TtlPolicy::with_overrides(&config.cache.ttl),
    )
    .with_enabled(config.cache.enabled),
    Err(e) => {
      warn!(error = %e, "No cache location, running without cache");
      CacheStore::disabled()
    }
  }
}
