//! Durable queue of cache entries waiting to be re-fetched.

use super::layer::CacheStore;
use super::traits::{QueryParams, RefreshJob};

/// Refresh queue of the cache's bound organization.
///
/// Like the cache itself, every operation degrades to its empty result when
/// the store is disabled, unbound or failing.
#[derive(Clone)]
pub struct RefreshQueue {
  cache: CacheStore,
}

impl RefreshQueue {
  pub(super) fn new(cache: CacheStore) -> Self {
    Self { cache }
  }

  /// Queue a refresh. Queueing a key that is already pending is a no-op.
  pub async fn enqueue(&self, cache_key: &str, endpoint: &str, params: &QueryParams) {
    let cache_key = cache_key.to_string();
    let endpoint = endpoint.to_string();
    let params = params.clone();
    self
      .cache
      .run("enqueue_refresh", (), move |store| {
        store.enqueue_refresh(&cache_key, &endpoint, &params)
      })
      .await
  }

  /// Remove a job, whether or not its refresh succeeded.
  pub async fn dequeue(&self, cache_key: &str) {
    let cache_key = cache_key.to_string();
    self
      .cache
      .run("dequeue_refresh", (), move |store| {
        store.dequeue_refresh(&cache_key)
      })
      .await
  }

  pub async fn list_pending(&self) -> Vec<RefreshJob> {
    self
      .cache
      .run("list_pending_refresh", Vec::new(), |store| {
        store.list_pending_refresh()
      })
      .await
  }

  pub async fn count(&self) -> u64 {
    self
      .cache
      .run("count_pending_refresh", 0, |store| store.count_pending_refresh())
      .await
  }

  /// Drop every pending job. Returns how many were removed.
  pub async fn clear_all(&self) -> u64 {
    self
      .cache
      .run("clear_pending_refresh", 0, |store| store.clear_pending_refresh())
      .await
  }
}
