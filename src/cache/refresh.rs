//! Startup-time replay of queued refresh jobs.
//!
//! Each job is replayed as a plain authenticated GET. A job is removed after
//! one attempt whatever the outcome; a failed refresh comes back on its own
//! the next time the entry is read while stale.

use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::api::request::{read_json, Auth, Credentials};

use super::layer::CacheStore;
use super::traits::RefreshJob;

/// Jobs replayed per invocation unless configured otherwise.
pub const DEFAULT_MAX_JOBS: usize = 10;

/// Outcome counts for one `process` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RefreshSummary {
  pub processed: usize,
  pub succeeded: usize,
  pub failed: usize,
  /// Jobs left queued because of the batch cap
  pub skipped: usize,
}

/// Drains the refresh queue into the cache.
pub struct RefreshProcessor {
  cache: CacheStore,
  http: reqwest::Client,
}

impl RefreshProcessor {
  pub fn new(cache: CacheStore, http: reqwest::Client) -> Self {
    Self { cache, http }
  }

  /// Replay up to `max_jobs` pending jobs, oldest first.
  ///
  /// Never fails: missing credentials or a disabled cache yield an empty
  /// summary, and a failing job only counts towards `failed`.
  pub async fn process(&self, credentials: &Credentials, max_jobs: usize) -> RefreshSummary {
    let mut summary = RefreshSummary::default();

    if !self.cache.is_enabled() {
      return summary;
    }
    let Some(auth) = credentials.auth() else {
      debug!("Skipping refresh queue: credentials incomplete");
      return summary;
    };

    self.cache.bind_organization(auth.org_id);
    let queue = self.cache.queue();

    let pending = queue.list_pending().await;
    if pending.is_empty() {
      return summary;
    }

    let batch = pending.len().min(max_jobs);
    summary.skipped = pending.len() - batch;

    for job in pending.into_iter().take(batch) {
      summary.processed += 1;

      match self.refresh(&auth, &job).await {
        Ok(()) => summary.succeeded += 1,
        Err(e) => {
          warn!(endpoint = %job.endpoint, key = %job.cache_key, error = %e, "Refresh failed");
          summary.failed += 1;
        }
      }

      // Retire the job either way so the same batch never sees it twice
      queue.dequeue(&job.cache_key).await;
    }

    info!(
      processed = summary.processed,
      succeeded = summary.succeeded,
      failed = summary.failed,
      skipped = summary.skipped,
      "Processed refresh queue"
    );
    summary
  }

  async fn refresh(&self, auth: &Auth<'_>, job: &RefreshJob) -> Result<()> {
    let response = auth
      .request(&self.http, Method::GET, &job.endpoint, &job.params)?
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", job.endpoint, e))?;
    let value: Value = read_json(response).await?;

    // Same endpoint and params, so the entry lands under the key a later
    // read derives
    let stored = self
      .cache
      .set_and_wait(&job.endpoint, &job.params, auth.org_id, value, None)
      .await;
    debug!(endpoint = %job.endpoint, key = %job.cache_key, stored, "Refreshed cache entry");

    Ok(())
  }
}
