//! SQLite-backed persistent store.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::warn;

use super::traits::{CacheStats, CacheStorage, CachedValue, QueryParams, RefreshJob, StoreOpener};

/// Rows inserted longer ago than this are deleted by `cleanup`, stale or not.
const RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// How long a connection waits on another process holding the write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Raw API responses, partitioned by organization
CREATE TABLE IF NOT EXISTS cache_entries (
    org_id TEXT NOT NULL,
    cache_key TEXT NOT NULL,
    endpoint TEXT NOT NULL,
    params TEXT NOT NULL,
    value BLOB NOT NULL,
    expires_at INTEGER NOT NULL,
    inserted_at INTEGER NOT NULL,
    PRIMARY KEY (org_id, cache_key)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_endpoint
    ON cache_entries(org_id, endpoint);

-- Entries waiting to be re-fetched
CREATE TABLE IF NOT EXISTS refresh_queue (
    org_id TEXT NOT NULL,
    cache_key TEXT NOT NULL,
    endpoint TEXT NOT NULL,
    params TEXT NOT NULL,
    queued_at INTEGER NOT NULL,
    PRIMARY KEY (org_id, cache_key)
);
"#;

/// Opens per-organization views onto one SQLite cache file.
pub struct SqliteOpener {
  path: PathBuf,
}

impl SqliteOpener {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("pmcli").join("cache.db"))
  }
}

impl StoreOpener for SqliteOpener {
  fn open(&self, org_id: &str) -> Result<Arc<dyn CacheStorage>> {
    Ok(Arc::new(SqliteStorage::open(&self.path, org_id)?))
  }
}

/// One organization's partition of the SQLite cache.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
  org_id: String,
}

impl SqliteStorage {
  /// Open (creating if needed) the cache database at `path`.
  pub fn open(path: &Path, org_id: &str) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;
    conn
      .busy_timeout(BUSY_TIMEOUT)
      .map_err(|e| eyre!("Failed to set busy timeout: {}", e))?;
    // WAL lets readers in other processes proceed while one process writes
    let _mode: String = conn
      .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to enable WAL journal: {}", e))?;

    let storage = Self {
      conn: Mutex::new(conn),
      org_id: org_id.to_string(),
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  fn run_migrations(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl CacheStorage for SqliteStorage {
  fn get_with_meta(&self, key: &str) -> Result<Option<CachedValue>> {
    let conn = self.lock()?;

    let row: Option<(Vec<u8>, i64)> = conn
      .query_row(
        "SELECT value, expires_at FROM cache_entries WHERE org_id = ? AND cache_key = ?",
        params![self.org_id, key],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry: {}", e))?;

    match row {
      Some((data, expires_at)) => {
        let value: Value = serde_json::from_slice(&data)
          .map_err(|e| eyre!("Failed to deserialize cache entry {}: {}", key, e))?;
        Ok(Some(CachedValue {
          value,
          is_stale: now_millis() >= expires_at,
        }))
      }
      None => Ok(None),
    }
  }

  fn set(
    &self,
    key: &str,
    value: &Value,
    endpoint: &str,
    ttl_millis: u64,
    params: &QueryParams,
  ) -> Result<()> {
    let data = serde_json::to_vec(value).map_err(|e| eyre!("Failed to serialize value: {}", e))?;
    let params_json =
      serde_json::to_string(params).map_err(|e| eyre!("Failed to serialize params: {}", e))?;
    let now = now_millis();
    let expires_at = now.saturating_add(i64::try_from(ttl_millis).unwrap_or(i64::MAX));

    self
      .lock()?
      .execute(
        "INSERT OR REPLACE INTO cache_entries
           (org_id, cache_key, endpoint, params, value, expires_at, inserted_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        params![self.org_id, key, endpoint, params_json, data, expires_at, now],
      )
      .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;

    Ok(())
  }

  fn invalidate(&self, endpoint_pattern: Option<&str>) -> Result<u64> {
    let conn = self.lock()?;

    let deleted = match endpoint_pattern {
      Some(pattern) => conn.execute(
        "DELETE FROM cache_entries
         WHERE org_id = ?1 AND substr(endpoint, 1, length(?2)) = ?2",
        params![self.org_id, pattern],
      ),
      None => conn.execute(
        "DELETE FROM cache_entries WHERE org_id = ?",
        params![self.org_id],
      ),
    }
    .map_err(|e| eyre!("Failed to invalidate cache entries: {}", e))?;

    Ok(deleted as u64)
  }

  fn cleanup(&self) -> Result<u64> {
    let conn = self.lock()?;
    let horizon = now_millis() - RETENTION.as_millis() as i64;

    // Scans stay within this org's primary-key range
    let entries = conn
      .execute(
        "DELETE FROM cache_entries WHERE org_id = ? AND inserted_at < ?",
        params![self.org_id, horizon],
      )
      .map_err(|e| eyre!("Failed to clean up cache entries: {}", e))?;
    let jobs = conn
      .execute(
        "DELETE FROM refresh_queue WHERE org_id = ? AND queued_at < ?",
        params![self.org_id, horizon],
      )
      .map_err(|e| eyre!("Failed to clean up refresh queue: {}", e))?;

    Ok((entries + jobs) as u64)
  }

  fn stats(&self) -> Result<CacheStats> {
    let conn = self.lock()?;

    let (entries, total_size, oldest): (i64, i64, Option<i64>) = conn
      .query_row(
        "SELECT COUNT(*), COALESCE(SUM(length(value)), 0), MIN(inserted_at)
         FROM cache_entries WHERE org_id = ?",
        params![self.org_id],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .map_err(|e| eyre!("Failed to read cache stats: {}", e))?;

    let oldest_age_seconds = oldest
      .map(|inserted_at| (now_millis() - inserted_at).max(0) / 1000)
      .unwrap_or(0);

    Ok(CacheStats {
      entries: entries as u64,
      total_size: total_size as u64,
      oldest_age_seconds: oldest_age_seconds as u64,
    })
  }

  fn enqueue_refresh(&self, key: &str, endpoint: &str, params: &QueryParams) -> Result<()> {
    let params_json =
      serde_json::to_string(params).map_err(|e| eyre!("Failed to serialize params: {}", e))?;

    self
      .lock()?
      .execute(
        "INSERT INTO refresh_queue (org_id, cache_key, endpoint, params, queued_at)
         VALUES (?, ?, ?, ?, ?)
         ON CONFLICT (org_id, cache_key) DO NOTHING",
        params![self.org_id, key, endpoint, params_json, now_millis()],
      )
      .map_err(|e| eyre!("Failed to enqueue refresh: {}", e))?;

    Ok(())
  }

  fn dequeue_refresh(&self, key: &str) -> Result<()> {
    self
      .lock()?
      .execute(
        "DELETE FROM refresh_queue WHERE org_id = ? AND cache_key = ?",
        params![self.org_id, key],
      )
      .map_err(|e| eyre!("Failed to dequeue refresh: {}", e))?;

    Ok(())
  }

  fn list_pending_refresh(&self) -> Result<Vec<RefreshJob>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare(
        "SELECT cache_key, endpoint, params, queued_at FROM refresh_queue
         WHERE org_id = ?
         ORDER BY queued_at, rowid",
      )
      .map_err(|e| eyre!("Failed to prepare queue query: {}", e))?;

    let rows: Vec<(String, String, String, i64)> = stmt
      .query_map(params![self.org_id], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
      })
      .map_err(|e| eyre!("Failed to query refresh queue: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read refresh queue: {}", e))?;

    let mut jobs = Vec::with_capacity(rows.len());
    for (cache_key, endpoint, params_json, queued_at) in rows {
      match serde_json::from_str(&params_json) {
        Ok(params) => jobs.push(RefreshJob {
          cache_key,
          endpoint,
          params,
          queued_at: DateTime::from_timestamp_millis(queued_at).unwrap_or_default(),
        }),
        Err(e) => {
          // Unreadable rows can never be replayed, so they leave the queue here
          warn!(key = %cache_key, endpoint = %endpoint, error = %e, "Dropping unreadable refresh job");
          conn
            .execute(
              "DELETE FROM refresh_queue WHERE org_id = ? AND cache_key = ?",
              params![self.org_id, cache_key],
            )
            .map_err(|e| eyre!("Failed to drop unreadable refresh job: {}", e))?;
        }
      }
    }

    Ok(jobs)
  }

  fn count_pending_refresh(&self) -> Result<u64> {
    let count: i64 = self
      .lock()?
      .query_row(
        "SELECT COUNT(*) FROM refresh_queue WHERE org_id = ?",
        params![self.org_id],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count refresh queue: {}", e))?;

    Ok(count as u64)
  }

  fn clear_pending_refresh(&self) -> Result<u64> {
    let deleted = self
      .lock()?
      .execute(
        "DELETE FROM refresh_queue WHERE org_id = ?",
        params![self.org_id],
      )
      .map_err(|e| eyre!("Failed to clear refresh queue: {}", e))?;

    Ok(deleted as u64)
  }
}

fn now_millis() -> i64 {
  Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn open(dir: &tempfile::TempDir, org: &str) -> SqliteStorage {
    SqliteStorage::open(&dir.path().join("cache.db"), org).unwrap()
  }

  fn page(n: i64) -> QueryParams {
    let mut params = QueryParams::new();
    params.insert("page".to_string(), json!(n));
    params
  }

  #[test]
  fn test_set_then_get_is_fresh() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir, "org-1");

    store
      .set("k1", &json!({"items": [1, 2, 3]}), "/projects", 60_000, &page(1))
      .unwrap();

    let cached = store.get_with_meta("k1").unwrap().unwrap();
    assert_eq!(cached.value, json!({"items": [1, 2, 3]}));
    assert!(!cached.is_stale);
    assert_eq!(store.get("k1").unwrap(), Some(json!({"items": [1, 2, 3]})));
  }

  #[test]
  fn test_zero_ttl_is_stale_but_served() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir, "org-1");

    store.set("k1", &json!(1), "/projects", 0, &page(1)).unwrap();

    let cached = store.get_with_meta("k1").unwrap().unwrap();
    assert_eq!(cached.value, json!(1));
    assert!(cached.is_stale);
  }

  #[test]
  fn test_missing_key() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir, "org-1");
    assert!(store.get_with_meta("nope").unwrap().is_none());
  }

  #[test]
  fn test_orgs_are_partitioned() {
    let dir = tempfile::tempdir().unwrap();
    let a = open(&dir, "org-a");
    let b = open(&dir, "org-b");

    a.set("k1", &json!("a"), "/projects", 60_000, &page(1)).unwrap();

    assert!(b.get("k1").unwrap().is_none());
    assert_eq!(b.invalidate(None).unwrap(), 0);
    assert_eq!(a.get("k1").unwrap(), Some(json!("a")));
  }

  #[test]
  fn test_invalidate_by_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir, "org-1");

    store.set("p1", &json!(1), "/projects", 60_000, &page(1)).unwrap();
    store.set("p2", &json!(2), "/projects/42", 60_000, &page(1)).unwrap();
    store.set("t1", &json!(3), "/tasks", 60_000, &page(1)).unwrap();

    assert_eq!(store.invalidate(Some("/projects")).unwrap(), 2);
    assert!(store.get("p1").unwrap().is_none());
    assert!(store.get("p2").unwrap().is_none());
    assert!(store.get("t1").unwrap().is_some());

    assert_eq!(store.invalidate(None).unwrap(), 1);
    assert!(store.get("t1").unwrap().is_none());
  }

  #[test]
  fn test_invalidate_pattern_is_literal() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir, "org-1");

    store.set("a", &json!(1), "/time_entries", 60_000, &page(1)).unwrap();
    store.set("b", &json!(2), "/timeXentries", 60_000, &page(1)).unwrap();

    assert_eq!(store.invalidate(Some("/time_")).unwrap(), 1);
    assert!(store.get("b").unwrap().is_some());
  }

  #[test]
  fn test_stats() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir, "org-1");

    assert_eq!(store.stats().unwrap(), CacheStats::default());

    store.set("k1", &json!("abc"), "/projects", 60_000, &page(1)).unwrap();
    store.set("k2", &json!(12), "/projects", 60_000, &page(2)).unwrap();

    let stats = store.stats().unwrap();
    assert_eq!(stats.entries, 2);
    // "\"abc\"" + "12"
    assert_eq!(stats.total_size, 7);
    assert!(stats.oldest_age_seconds < 5);
  }

  #[test]
  fn test_cleanup_removes_old_rows_only() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir, "org-1");

    store.set("old", &json!(1), "/projects", 60_000, &page(1)).unwrap();
    store.set("new", &json!(2), "/projects", 60_000, &page(2)).unwrap();
    store.enqueue_refresh("old", "/projects", &page(1)).unwrap();

    let long_ago = now_millis() - RETENTION.as_millis() as i64 - 1000;
    {
      let conn = store.lock().unwrap();
      conn
        .execute(
          "UPDATE cache_entries SET inserted_at = ? WHERE cache_key = 'old'",
          params![long_ago],
        )
        .unwrap();
      conn
        .execute("UPDATE refresh_queue SET queued_at = ?", params![long_ago])
        .unwrap();
    }

    assert_eq!(store.cleanup().unwrap(), 2);
    assert!(store.get("old").unwrap().is_none());
    assert!(store.get("new").unwrap().is_some());
    assert_eq!(store.cleanup().unwrap(), 0);
  }

  #[test]
  fn test_enqueue_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir, "org-1");

    store.enqueue_refresh("k1", "/projects", &page(1)).unwrap();
    store.enqueue_refresh("k1", "/projects", &page(1)).unwrap();

    assert_eq!(store.count_pending_refresh().unwrap(), 1);
  }

  #[test]
  fn test_queue_roundtrip_preserves_params() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir, "org-1");

    let mut params = page(3);
    params.insert("filter".to_string(), json!({"status": 1}));
    store.enqueue_refresh("k1", "/projects", &params).unwrap();
    store.enqueue_refresh("k2", "/people", &page(1)).unwrap();

    let jobs = store.list_pending_refresh().unwrap();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].cache_key, "k1");
    assert_eq!(jobs[0].endpoint, "/projects");
    assert_eq!(jobs[0].params, params);
    assert_eq!(jobs[1].cache_key, "k2");

    store.dequeue_refresh("k1").unwrap();
    assert_eq!(store.count_pending_refresh().unwrap(), 1);

    assert_eq!(store.clear_pending_refresh().unwrap(), 1);
    assert!(store.list_pending_refresh().unwrap().is_empty());
  }

  #[test]
  fn test_unreadable_job_leaves_queue_when_listed() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir, "org-1");

    store.enqueue_refresh("good", "/projects", &page(1)).unwrap();
    store
      .lock()
      .unwrap()
      .execute(
        "INSERT INTO refresh_queue (org_id, cache_key, endpoint, params, queued_at)
         VALUES ('org-1', 'bad', '/people', 'not json', ?)",
        params![now_millis()],
      )
      .unwrap();
    assert_eq!(store.count_pending_refresh().unwrap(), 2);

    let jobs = store.list_pending_refresh().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].cache_key, "good");
    assert_eq!(store.count_pending_refresh().unwrap(), 1);
  }

  #[test]
  fn test_opener_shares_file_between_orgs() {
    let dir = tempfile::tempdir().unwrap();
    let opener = SqliteOpener::new(dir.path().join("nested").join("cache.db"));

    let a = opener.open("org-a").unwrap();
    a.enqueue_refresh("k1", "/projects", &page(1)).unwrap();

    let a_again = opener.open("org-a").unwrap();
    let b = opener.open("org-b").unwrap();
    assert_eq!(a_again.count_pending_refresh().unwrap(), 1);
    assert_eq!(b.count_pending_refresh().unwrap(), 0);
  }
}
