//! Cache orchestrator: organization binding, stale-while-revalidate reads,
//! and best-effort writes.
//!
//! Every store failure is logged and turned into the empty result for the
//! operation (`None`, `0`, `false`, empty stats). Caching can make a command
//! slower, never fail it.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use color_eyre::Result;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::key::derive_key;
use super::queue::RefreshQueue;
use super::traits::{CacheStats, CacheStorage, CachedValue, QueryParams, StoreOpener};
use super::ttl::TtlPolicy;

/// The organization currently bound and its lazily opened store.
#[derive(Default)]
struct Binding {
  org_id: Option<String>,
  store: Option<Arc<dyn CacheStorage>>,
}

struct Inner {
  opener: Option<Arc<dyn StoreOpener>>,
  ttl: TtlPolicy,
  binding: Mutex<Binding>,
  /// Background writes not yet known to have finished
  pending: Mutex<Vec<JoinHandle<()>>>,
}

impl Inner {
  /// The binding is only ever updated field by field, so a lock poisoned by
  /// a panicking store still guards a usable value.
  fn binding(&self) -> MutexGuard<'_, Binding> {
    self.binding.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn bound_org(&self) -> Option<String> {
    self.binding().org_id.clone()
  }

  /// Resolve the store for the bound organization, opening it on first use.
  fn resolve(&self) -> Option<Arc<dyn CacheStorage>> {
    let org_id = self.bound_org()?;
    self.resolve_for(&org_id)
  }

  /// Resolve the store for `org_id`. The handle is kept only while `org_id`
  /// is still the bound organization.
  fn resolve_for(&self, org_id: &str) -> Option<Arc<dyn CacheStorage>> {
    let opener = self.opener.as_ref()?;
    let mut binding = self.binding();

    let bound = binding.org_id.as_deref() == Some(org_id);
    if bound {
      if let Some(store) = &binding.store {
        return Some(Arc::clone(store));
      }
    }

    match opener.open(org_id) {
      Ok(store) => {
        match store.cleanup() {
          Ok(0) => {}
          Ok(removed) => debug!(org_id, removed, "Removed expired cache rows"),
          Err(e) => debug!(org_id, error = %e, "Cache cleanup failed"),
        }
        if bound {
          binding.store = Some(Arc::clone(&store));
        }
        Some(store)
      }
      Err(e) => {
        warn!(org_id = %org_id, error = %e, "Cache unavailable, continuing without it");
        None
      }
    }
  }

  fn with_store<T>(&self, f: impl FnOnce(&dyn CacheStorage) -> Result<T>) -> Option<Result<T>> {
    let store = self.resolve()?;
    Some(f(store.as_ref()))
  }

  fn with_store_for<T>(
    &self,
    org_id: &str,
    f: impl FnOnce(&dyn CacheStorage) -> Result<T>,
  ) -> Option<Result<T>> {
    let store = self.resolve_for(org_id)?;
    Some(f(store.as_ref()))
  }

  fn track(&self, handle: JoinHandle<()>) {
    match self.pending.lock() {
      Ok(mut pending) => {
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
      }
      // The write still runs, it just can't be flushed
      Err(e) => debug!(error = %e, "Pending write list poisoned"),
    }
  }
}

/// Organization-scoped response cache with stale-while-revalidate reads.
///
/// Cheap to clone; clones share the binding and the store.
#[derive(Clone)]
pub struct CacheStore {
  inner: Arc<Inner>,
  enabled: bool,
}

impl CacheStore {
  /// Create an enabled cache over the given store opener.
  pub fn new(opener: Arc<dyn StoreOpener>, ttl: TtlPolicy) -> Self {
    Self {
      inner: Arc::new(Inner {
        opener: Some(opener),
        ttl,
        binding: Mutex::new(Binding::default()),
        pending: Mutex::new(Vec::new()),
      }),
      enabled: true,
    }
  }

  /// A cache that never stores anything.
  pub fn disabled() -> Self {
    Self {
      inner: Arc::new(Inner {
        opener: None,
        ttl: TtlPolicy::default(),
        binding: Mutex::new(Binding::default()),
        pending: Mutex::new(Vec::new()),
      }),
      enabled: false,
    }
  }

  /// Turn caching on or off. A disabled cache never calls its opener.
  pub fn with_enabled(mut self, enabled: bool) -> Self {
    self.enabled = enabled;
    self
  }

  pub fn is_enabled(&self) -> bool {
    self.enabled
  }

  /// Switch the active organization.
  ///
  /// Drops the handle to the previous organization's store; the next
  /// operation opens the new one. Stored data is untouched.
  pub fn bind_organization(&self, org_id: &str) {
    if !self.enabled {
      return;
    }
    let mut binding = self.inner.binding();
    if binding.org_id.as_deref() != Some(org_id) {
      debug!(org_id, "Binding cache to organization");
      binding.org_id = Some(org_id.to_string());
      binding.store = None;
    }
  }

  /// The organization operations currently apply to.
  #[allow(dead_code)]
  pub fn bound_organization(&self) -> Option<String> {
    self.inner.bound_org()
  }

  /// Run a store operation on the blocking pool, mapping every failure to
  /// `fallback`.
  pub(super) async fn run<T, F>(&self, op: &'static str, fallback: T, f: F) -> T
  where
    T: Send + 'static,
    F: FnOnce(&dyn CacheStorage) -> Result<T> + Send + 'static,
  {
    if !self.enabled {
      return fallback;
    }

    let inner = Arc::clone(&self.inner);
    match tokio::task::spawn_blocking(move || inner.with_store(f)).await {
      Ok(Some(Ok(value))) => value,
      Ok(Some(Err(e))) => {
        warn!(op, error = %e, "Cache operation failed");
        fallback
      }
      Ok(None) => fallback,
      Err(e) => {
        warn!(op, error = %e, "Cache task failed");
        fallback
      }
    }
  }

  /// Submit a store operation without waiting for it.
  ///
  /// The operation targets the organization bound at submit time, even if
  /// the binding changes before it runs. Inside a Tokio runtime it runs on
  /// the blocking pool and is tracked for `flush`; without one it runs
  /// inline. A process that exits before the task finishes loses the write,
  /// which only costs a future cache miss.
  fn submit<F>(&self, op: &'static str, f: F)
  where
    F: FnOnce(&dyn CacheStorage) -> Result<()> + Send + 'static,
  {
    if !self.enabled {
      return;
    }
    let Some(org_id) = self.inner.bound_org() else {
      return;
    };

    let inner = Arc::clone(&self.inner);
    let task = move || {
      if let Some(Err(e)) = inner.with_store_for(&org_id, f) {
        warn!(op, error = %e, "Background cache operation failed");
      }
    };

    match tokio::runtime::Handle::try_current() {
      Ok(handle) => {
        let join = handle.spawn_blocking(task);
        self.inner.track(join);
      }
      Err(_) => {
        if std::panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
          warn!(op, "Background cache operation panicked");
        }
      }
    }
  }

  /// Get a cached value, fresh or stale.
  ///
  /// A stale hit queues a refresh job for the entry before returning the
  /// stale value.
  pub async fn get(&self, endpoint: &str, params: &QueryParams, org_id: &str) -> Option<Value> {
    let key = derive_key(endpoint, params, org_id);
    let cached = self.lookup(endpoint, &key).await?;

    if cached.is_stale {
      self.queue().enqueue(&key, endpoint, params).await;
      debug!(endpoint, key = %key, "Stale cache hit, refresh queued");
    }

    Some(cached.value)
  }

  /// Get a cached value and its staleness without queueing a refresh.
  pub async fn get_with_metadata(
    &self,
    endpoint: &str,
    params: &QueryParams,
    org_id: &str,
  ) -> Option<CachedValue> {
    let key = derive_key(endpoint, params, org_id);
    self.lookup(endpoint, &key).await
  }

  async fn lookup(&self, endpoint: &str, key: &str) -> Option<CachedValue> {
    let owned_key = key.to_string();
    let cached = self
      .run("get", None, move |store| store.get_with_meta(&owned_key))
      .await;

    match &cached {
      Some(c) => debug!(endpoint, key, stale = c.is_stale, "Cache hit"),
      None => debug!(endpoint, key, "Cache miss"),
    }
    cached
  }

  /// Store a value without waiting for the write.
  pub fn set(
    &self,
    endpoint: &str,
    params: &QueryParams,
    org_id: &str,
    value: Value,
    ttl_override: Option<Duration>,
  ) {
    let (key, ttl) = self.entry_key(endpoint, params, org_id, ttl_override);
    let endpoint = endpoint.to_string();
    let params = params.clone();

    self.submit("set", move |store| {
      store.set(&key, &value, &endpoint, ttl, &params)
    });
  }

  /// Store a value and wait for the write. Returns whether it landed.
  pub async fn set_and_wait(
    &self,
    endpoint: &str,
    params: &QueryParams,
    org_id: &str,
    value: Value,
    ttl_override: Option<Duration>,
  ) -> bool {
    let (key, ttl) = self.entry_key(endpoint, params, org_id, ttl_override);
    let endpoint = endpoint.to_string();
    let params = params.clone();

    self
      .run("set", false, move |store| {
        store.set(&key, &value, &endpoint, ttl, &params)?;
        Ok(true)
      })
      .await
  }

  fn entry_key(
    &self,
    endpoint: &str,
    params: &QueryParams,
    org_id: &str,
    ttl_override: Option<Duration>,
  ) -> (String, u64) {
    let ttl = self.inner.ttl.effective_ttl(endpoint, ttl_override);
    let ttl_millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
    (derive_key(endpoint, params, org_id), ttl_millis)
  }

  /// Delete entries whose endpoint starts with `endpoint_pattern`, or all
  /// entries. Returns how many were deleted.
  pub async fn invalidate(&self, endpoint_pattern: Option<&str>) -> u64 {
    let pattern = endpoint_pattern.map(String::from);
    let deleted = self
      .run("invalidate", 0, move |store| {
        store.invalidate(pattern.as_deref())
      })
      .await;
    debug!(pattern = ?endpoint_pattern, deleted, "Invalidated cache entries");
    deleted
  }

  /// `invalidate` without waiting for the result.
  pub fn invalidate_in_background(&self, endpoint_pattern: Option<&str>) {
    let pattern = endpoint_pattern.map(String::from);
    self.submit("invalidate", move |store| {
      store.invalidate(pattern.as_deref()).map(|_| ())
    });
  }

  /// Delete every entry for the bound organization.
  pub async fn clear(&self) -> u64 {
    self.invalidate(None).await
  }

  /// Hard-delete rows past the store's retention horizon.
  pub async fn cleanup(&self) -> u64 {
    self.run("cleanup", 0, |store| store.cleanup()).await
  }

  /// Always empty: real figures need a store round trip, which only
  /// `load_stats` makes.
  #[allow(dead_code)]
  pub fn stats(&self) -> CacheStats {
    CacheStats::default()
  }

  pub async fn load_stats(&self) -> CacheStats {
    self
      .run("stats", CacheStats::default(), |store| store.stats())
      .await
  }

  /// The refresh queue for the bound organization.
  pub fn queue(&self) -> RefreshQueue {
    RefreshQueue::new(self.clone())
  }

  /// Wait for background writes submitted so far.
  pub async fn flush(&self) {
    let handles = match self.inner.pending.lock() {
      Ok(mut pending) => std::mem::take(&mut *pending),
      Err(_) => return,
    };

    for handle in handles {
      if let Err(e) = handle.await {
        debug!(error = %e, "Background cache task failed");
      }
    }
  }
}
