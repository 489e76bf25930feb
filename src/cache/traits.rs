//! Core traits and types for the caching system.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Query parameters of a cached request, in canonical (sorted) order.
pub type QueryParams = BTreeMap<String, Value>;

/// A cached value together with its staleness.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedValue {
  pub value: Value,
  /// True once the entry's expiry has passed. Stale values are still served.
  pub is_stale: bool,
}

/// A pending "re-fetch this entry" job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshJob {
  pub cache_key: String,
  pub endpoint: String,
  pub params: QueryParams,
  pub queued_at: DateTime<Utc>,
}

/// Aggregate diagnostics for one organization's cache partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
  pub entries: u64,
  /// Sum of serialized value sizes, in bytes
  pub total_size: u64,
  pub oldest_age_seconds: u64,
}

/// Persistent key-value storage for one organization.
///
/// Implementations are shared between overlapping processes, so any
/// synchronization must come from the backing store itself.
pub trait CacheStorage: Send + Sync {
  /// Get a cached value, fresh or stale.
  fn get(&self, key: &str) -> Result<Option<Value>> {
    Ok(self.get_with_meta(key)?.map(|cached| cached.value))
  }

  /// Get a cached value along with whether it has expired.
  fn get_with_meta(&self, key: &str) -> Result<Option<CachedValue>>;

  /// Insert or replace an entry that expires after `ttl_millis`.
  fn set(
    &self,
    key: &str,
    value: &Value,
    endpoint: &str,
    ttl_millis: u64,
    params: &QueryParams,
  ) -> Result<()>;

  /// Delete entries whose endpoint starts with `endpoint_pattern`, or every
  /// entry when no pattern is given.
  fn invalidate(&self, endpoint_pattern: Option<&str>) -> Result<u64>;

  /// Hard-delete rows past the retention horizon.
  fn cleanup(&self) -> Result<u64>;

  fn stats(&self) -> Result<CacheStats>;

  /// Queue a refresh job. A key that is already queued is left untouched.
  fn enqueue_refresh(&self, key: &str, endpoint: &str, params: &QueryParams) -> Result<()>;

  fn dequeue_refresh(&self, key: &str) -> Result<()>;

  /// All pending jobs, oldest first.
  fn list_pending_refresh(&self) -> Result<Vec<RefreshJob>>;

  fn count_pending_refresh(&self) -> Result<u64>;

  fn clear_pending_refresh(&self) -> Result<u64>;
}

/// Resolves the storage partition for an organization.
pub trait StoreOpener: Send + Sync {
  fn open(&self, org_id: &str) -> Result<Arc<dyn CacheStorage>>;
}
