//! CLI subcommands.

use clap::Subcommand;
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::api::{ApiClient, Credentials};
use crate::cache::{derive_key, CacheStats, CacheStore, QueryParams, RefreshProcessor};
use crate::config::Config;

#[derive(Subcommand, Debug)]
pub enum Command {
  /// Read a resource, served from the cache when possible
  Get {
    /// Endpoint path, e.g. /projects
    endpoint: String,
    /// Query parameter as key=value (repeatable)
    #[arg(short = 'p', long = "param", value_parser = parse_param)]
    params: Vec<(String, Value)>,
    /// Wrap the output with whether it came from a stale cache entry
    #[arg(long)]
    stale_info: bool,
  },
  /// Send a mutating request (POST, PATCH, PUT, DELETE)
  Request {
    method: String,
    endpoint: String,
    /// JSON request body
    #[arg(long)]
    data: Option<String>,
  },
  /// Inspect and manage the local cache
  #[command(subcommand)]
  Cache(CacheCommand),
}

#[derive(Subcommand, Debug)]
pub enum CacheCommand {
  /// Entry count, size, oldest entry and queue depth
  Stats,
  /// Delete cached entries, optionally only those under an endpoint prefix
  Clear {
    #[arg(long)]
    pattern: Option<String>,
  },
  /// Delete rows past the retention horizon
  Cleanup,
  /// Show the refresh queue
  Queue {
    /// List jobs instead of only counting them
    #[arg(long)]
    list: bool,
  },
  /// Drop every pending refresh job
  QueueClear,
  /// Replay pending refresh jobs now
  Refresh {
    #[arg(long)]
    max_jobs: Option<usize>,
  },
  /// Print the cache key a read would use
  Key {
    endpoint: String,
    #[arg(short = 'p', long = "param", value_parser = parse_param)]
    params: Vec<(String, Value)>,
  },
}

/// Everything a command needs, built once in `main`.
pub struct Context {
  pub config: Config,
  pub credentials: Credentials,
  pub cache: CacheStore,
  pub http: reqwest::Client,
}

impl Context {
  fn org_id(&self) -> Result<&str> {
    self
      .credentials
      .org_id
      .as_deref()
      .filter(|o| !o.is_empty())
      .ok_or_else(|| {
        eyre!("No organization id. Pass --org, set PMCLI_ORG_ID or api.organization_id.")
      })
  }

  fn client(&self) -> Result<ApiClient> {
    ApiClient::new(
      self.http.clone(),
      self.credentials.clone(),
      self.cache.clone(),
    )
  }

  /// Drain a batch of refresh jobs before doing the command's own work.
  async fn drain_refresh_queue(&self) {
    let processor = RefreshProcessor::new(self.cache.clone(), self.http.clone());
    let summary = processor
      .process(&self.credentials, self.config.cache.refresh_batch)
      .await;
    debug!(?summary, "Startup refresh");
  }
}

pub async fn execute(command: Command, ctx: &Context) -> Result<()> {
  match command {
    Command::Get {
      endpoint,
      params,
      stale_info,
    } => {
      ctx.drain_refresh_queue().await;
      let client = ctx.client()?;
      let params: QueryParams = params.into_iter().collect();

      if stale_info {
        let (data, stale) = client.get_with_staleness(&endpoint, &params).await?;
        print_json(&json!({ "data": data, "stale": stale }))
      } else {
        print_json(&client.get(&endpoint, &params).await?)
      }
    }
    Command::Request {
      method,
      endpoint,
      data,
    } => {
      let method = Method::from_bytes(method.to_uppercase().as_bytes())
        .map_err(|e| eyre!("Invalid HTTP method {}: {}", method, e))?;
      if method == Method::GET {
        return Err(eyre!("Use `get` for reads"));
      }
      let body = data
        .map(|d| serde_json::from_str::<Value>(&d))
        .transpose()
        .map_err(|e| eyre!("Failed to parse --data as JSON: {}", e))?;

      ctx.drain_refresh_queue().await;
      let client = ctx.client()?;
      print_json(&client.send(method, &endpoint, body.as_ref()).await?)
    }
    Command::Cache(cmd) => execute_cache(cmd, ctx).await,
  }
}

async fn execute_cache(command: CacheCommand, ctx: &Context) -> Result<()> {
  let org_id = ctx.org_id()?;
  ctx.cache.bind_organization(org_id);

  match command {
    CacheCommand::Stats => {
      #[derive(Serialize)]
      struct Report {
        enabled: bool,
        organization_id: String,
        #[serde(flatten)]
        stats: CacheStats,
        pending_refresh: u64,
      }

      print_json(&Report {
        enabled: ctx.cache.is_enabled(),
        organization_id: org_id.to_string(),
        stats: ctx.cache.load_stats().await,
        pending_refresh: ctx.cache.queue().count().await,
      })
    }
    CacheCommand::Clear { pattern } => {
      let deleted = match pattern {
        Some(pattern) => ctx.cache.invalidate(Some(&pattern)).await,
        None => ctx.cache.clear().await,
      };
      print_json(&json!({ "deleted": deleted }))
    }
    CacheCommand::Cleanup => {
      let deleted = ctx.cache.cleanup().await;
      print_json(&json!({ "deleted": deleted }))
    }
    CacheCommand::Queue { list } => {
      if list {
        print_json(&ctx.cache.queue().list_pending().await)
      } else {
        print_json(&json!({ "pending": ctx.cache.queue().count().await }))
      }
    }
    CacheCommand::QueueClear => {
      let deleted = ctx.cache.queue().clear_all().await;
      print_json(&json!({ "deleted": deleted }))
    }
    CacheCommand::Refresh { max_jobs } => {
      let processor = RefreshProcessor::new(ctx.cache.clone(), ctx.http.clone());
      let max_jobs = max_jobs.unwrap_or(ctx.config.cache.refresh_batch);
      print_json(&processor.process(&ctx.credentials, max_jobs).await)
    }
    CacheCommand::Key { endpoint, params } => {
      let params: QueryParams = params.into_iter().collect();
      print_json(&json!({ "key": derive_key(&endpoint, &params, org_id) }))
    }
  }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  let out =
    serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to format output: {}", e))?;
  println!("{}", out);
  Ok(())
}

/// Parse `key=value`. Values that read as JSON scalars keep their type
/// (`page=1` is a number), anything else is a string.
fn parse_param(s: &str) -> Result<(String, Value), String> {
  let (key, raw) = s
    .split_once('=')
    .ok_or_else(|| format!("expected key=value, got `{}`", s))?;
  if key.is_empty() {
    return Err(format!("empty parameter name in `{}`", s));
  }

  let value = match serde_json::from_str::<Value>(raw) {
    Ok(v @ (Value::Number(_) | Value::Bool(_) | Value::Null)) => v,
    _ => Value::String(raw.to_string()),
  };

  Ok((key.to_string(), value))
}
