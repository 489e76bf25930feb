use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::api::{Credentials, DEFAULT_BASE_URL};
use crate::cache::{SqliteOpener, DEFAULT_MAX_JOBS};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
  pub base_url: String,
  pub organization_id: Option<String>,
  /// Per-request timeout, also applied to refresh jobs
  pub timeout_secs: u64,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: DEFAULT_BASE_URL.to_string(),
      organization_id: None,
      timeout_secs: 30,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub enabled: bool,
  /// Database file (default: $XDG_DATA_HOME/pmcli/cache.db)
  pub path: Option<PathBuf>,
  /// Refresh jobs replayed per invocation
  pub refresh_batch: usize,
  /// Extra endpoint-prefix TTLs in seconds, checked before the built-in table
  pub ttl: BTreeMap<String, u64>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      path: None,
      refresh_batch: DEFAULT_MAX_JOBS,
      ttl: BTreeMap::new(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./pmcli.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/pmcli/config.yaml
  ///
  /// Without a file, defaults are used; credentials can come from the
  /// environment alone.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Config::default(),
    };

    Ok(config.apply_env())
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("pmcli.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("pmcli").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Apply PMCLI_ORG_ID and PMCLI_NO_CACHE.
  fn apply_env(mut self) -> Self {
    if let Ok(org_id) = std::env::var("PMCLI_ORG_ID") {
      if !org_id.is_empty() {
        self.api.organization_id = Some(org_id);
      }
    }
    if std::env::var("PMCLI_NO_CACHE").is_ok_and(|v| v == "1" || v == "true") {
      self.cache.enabled = false;
    }
    self
  }

  /// Get the API token from the environment.
  ///
  /// The token is never read from the config file.
  pub fn get_api_token() -> Option<String> {
    std::env::var("PMCLI_API_TOKEN")
      .ok()
      .filter(|t| !t.is_empty())
  }

  /// Credentials for the configured organization.
  pub fn credentials(&self, api_token: Option<String>) -> Credentials {
    Credentials {
      base_url: self.api.base_url.clone(),
      api_token,
      org_id: self.api.organization_id.clone(),
    }
  }

  /// Where the cache database lives.
  pub fn cache_path(&self) -> Result<PathBuf> {
    match &self.cache.path {
      Some(path) => Ok(path.clone()),
      None => SqliteOpener::default_path(),
    }
  }
}
