//! In-memory stores for tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;

use super::traits::{CacheStats, CacheStorage, CachedValue, QueryParams, RefreshJob, StoreOpener};

#[derive(Debug, Clone)]
struct Entry {
  value: Value,
  endpoint: String,
  ttl_millis: u64,
  stale: bool,
}

/// Entries and queue held in maps. Staleness is controlled by the test
/// through `mark_stale` or a zero TTL.
#[derive(Default)]
pub struct MemoryStorage {
  entries: Mutex<BTreeMap<String, Entry>>,
  queue: Mutex<Vec<RefreshJob>>,
  calls: AtomicUsize,
}

impl MemoryStorage {
  pub fn mark_stale(&self, key: &str) {
    if let Some(entry) = self.entries.lock().unwrap().get_mut(key) {
      entry.stale = true;
    }
  }

  pub fn ttl_of(&self, key: &str) -> Option<u64> {
    self.entries.lock().unwrap().get(key).map(|e| e.ttl_millis)
  }

  pub fn endpoint_of(&self, key: &str) -> Option<String> {
    self.entries.lock().unwrap().get(key).map(|e| e.endpoint.clone())
  }

  /// Number of trait methods invoked so far.
  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }

  fn touch(&self) {
    self.calls.fetch_add(1, Ordering::SeqCst);
  }
}

impl CacheStorage for MemoryStorage {
  fn get_with_meta(&self, key: &str) -> Result<Option<CachedValue>> {
    self.touch();
    Ok(self.entries.lock().unwrap().get(key).map(|e| CachedValue {
      value: e.value.clone(),
      is_stale: e.stale,
    }))
  }

  fn set(
    &self,
    key: &str,
    value: &Value,
    endpoint: &str,
    ttl_millis: u64,
    _params: &QueryParams,
  ) -> Result<()> {
    self.touch();
    self.entries.lock().unwrap().insert(
      key.to_string(),
      Entry {
        value: value.clone(),
        endpoint: endpoint.to_string(),
        ttl_millis,
        stale: ttl_millis == 0,
      },
    );
    Ok(())
  }

  fn invalidate(&self, endpoint_pattern: Option<&str>) -> Result<u64> {
    self.touch();
    let mut entries = self.entries.lock().unwrap();
    let before = entries.len();
    entries.retain(|_, e| match endpoint_pattern {
      Some(pattern) => !e.endpoint.starts_with(pattern),
      None => false,
    });
    Ok((before - entries.len()) as u64)
  }

  fn cleanup(&self) -> Result<u64> {
    self.touch();
    Ok(0)
  }

  fn stats(&self) -> Result<CacheStats> {
    self.touch();
    let entries = self.entries.lock().unwrap();
    Ok(CacheStats {
      entries: entries.len() as u64,
      total_size: entries
        .values()
        .map(|e| e.value.to_string().len() as u64)
        .sum(),
      oldest_age_seconds: 0,
    })
  }

  fn enqueue_refresh(&self, key: &str, endpoint: &str, params: &QueryParams) -> Result<()> {
    self.touch();
    let mut queue = self.queue.lock().unwrap();
    if !queue.iter().any(|job| job.cache_key == key) {
      queue.push(RefreshJob {
        cache_key: key.to_string(),
        endpoint: endpoint.to_string(),
        params: params.clone(),
        queued_at: Utc::now(),
      });
    }
    Ok(())
  }

  fn dequeue_refresh(&self, key: &str) -> Result<()> {
    self.touch();
    self.queue.lock().unwrap().retain(|job| job.cache_key != key);
    Ok(())
  }

  fn list_pending_refresh(&self) -> Result<Vec<RefreshJob>> {
    self.touch();
    Ok(self.queue.lock().unwrap().clone())
  }

  fn count_pending_refresh(&self) -> Result<u64> {
    self.touch();
    Ok(self.queue.lock().unwrap().len() as u64)
  }

  fn clear_pending_refresh(&self) -> Result<u64> {
    self.touch();
    let mut queue = self.queue.lock().unwrap();
    let count = queue.len() as u64;
    queue.clear();
    Ok(count)
  }
}

/// A store whose every operation fails, standing in for a corrupt or
/// locked database.
pub struct FailingStorage;

impl CacheStorage for FailingStorage {
  fn get_with_meta(&self, _key: &str) -> Result<Option<CachedValue>> {
    Err(eyre!("database is locked"))
  }

  fn set(&self, _: &str, _: &Value, _: &str, _: u64, _: &QueryParams) -> Result<()> {
    Err(eyre!("database is locked"))
  }

  fn invalidate(&self, _endpoint_pattern: Option<&str>) -> Result<u64> {
    Err(eyre!("database is locked"))
  }

  fn cleanup(&self) -> Result<u64> {
    Err(eyre!("database is locked"))
  }

  fn stats(&self) -> Result<CacheStats> {
    Err(eyre!("database is locked"))
  }

  fn enqueue_refresh(&self, _: &str, _: &str, _: &QueryParams) -> Result<()> {
    Err(eyre!("database is locked"))
  }

  fn dequeue_refresh(&self, _key: &str) -> Result<()> {
    Err(eyre!("database is locked"))
  }

  fn list_pending_refresh(&self) -> Result<Vec<RefreshJob>> {
    Err(eyre!("database is locked"))
  }

  fn count_pending_refresh(&self) -> Result<u64> {
    Err(eyre!("database is locked"))
  }

  fn clear_pending_refresh(&self) -> Result<u64> {
    Err(eyre!("database is locked"))
  }
}

/// A store that panics in every operation.
pub struct PanickingStorage;

impl CacheStorage for PanickingStorage {
  fn get_with_meta(&self, _key: &str) -> Result<Option<CachedValue>> {
    panic!("store panicked in get")
  }

  fn set(&self, _: &str, _: &Value, _: &str, _: u64, _: &QueryParams) -> Result<()> {
    panic!("store panicked in set")
  }

  fn invalidate(&self, _endpoint_pattern: Option<&str>) -> Result<u64> {
    panic!("store panicked in invalidate")
  }

  fn cleanup(&self) -> Result<u64> {
    panic!("store panicked in cleanup")
  }

  fn stats(&self) -> Result<CacheStats> {
    panic!("store panicked in stats")
  }

  fn enqueue_refresh(&self, _: &str, _: &str, _: &QueryParams) -> Result<()> {
    panic!("store panicked in enqueue")
  }

  fn dequeue_refresh(&self, _key: &str) -> Result<()> {
    panic!("store panicked in dequeue")
  }

  fn list_pending_refresh(&self) -> Result<Vec<RefreshJob>> {
    panic!("store panicked in list")
  }

  fn count_pending_refresh(&self) -> Result<u64> {
    panic!("store panicked in count")
  }

  fn clear_pending_refresh(&self) -> Result<u64> {
    panic!("store panicked in clear")
  }
}

/// Hands out one shared store per organization and counts opens.
#[derive(Default)]
pub struct MemoryOpener {
  stores: Mutex<BTreeMap<String, Arc<MemoryStorage>>>,
  opens: AtomicUsize,
}

impl MemoryOpener {
  pub fn store(&self, org_id: &str) -> Arc<MemoryStorage> {
    self
      .stores
      .lock()
      .unwrap()
      .entry(org_id.to_string())
      .or_default()
      .clone()
  }

  pub fn opens(&self) -> usize {
    self.opens.load(Ordering::SeqCst)
  }
}

impl StoreOpener for MemoryOpener {
  fn open(&self, org_id: &str) -> Result<Arc<dyn CacheStorage>> {
    self.opens.fetch_add(1, Ordering::SeqCst);
    Ok(self.store(org_id))
  }
}

/// Opener for a fixed store, e.g. `FailingStorage`.
pub struct FixedOpener(pub Arc<dyn CacheStorage>);

impl StoreOpener for FixedOpener {
  fn open(&self, _org_id: &str) -> Result<Arc<dyn CacheStorage>> {
    Ok(self.0.clone())
  }
}

/// Opener that cannot reach its database.
pub struct BrokenOpener;

impl StoreOpener for BrokenOpener {
  fn open(&self, _org_id: &str) -> Result<Arc<dyn CacheStorage>> {
    Err(eyre!("Failed to open cache database: permission denied"))
  }
}
