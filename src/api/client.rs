//! API client that reads through the response cache.

use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde_json::Value;
use tracing::debug;

use crate::cache::{CacheStore, QueryParams};

use super::request::{read_json, Credentials};

/// API client with transparent caching of reads.
///
/// GETs are served from the cache when possible (stale entries are served
/// too, and queued for refresh). Everything else goes straight to the API
/// and then invalidates the cached reads of the resource it touched.
#[derive(Clone)]
pub struct ApiClient {
  http: reqwest::Client,
  credentials: Credentials,
  org_id: String,
  cache: CacheStore,
}

impl ApiClient {
  /// Create a client and bind the cache to its organization.
  pub fn new(http: reqwest::Client, credentials: Credentials, cache: CacheStore) -> Result<Self> {
    let org_id = match credentials.auth() {
      Some(auth) => auth.org_id.to_string(),
      None => {
        return Err(eyre!(
          "API credentials incomplete. Set PMCLI_API_TOKEN and an organization id \
           (--org, PMCLI_ORG_ID or api.organization_id)."
        ))
      }
    };
    cache.bind_organization(&org_id);

    Ok(Self {
      http,
      credentials,
      org_id,
      cache,
    })
  }

  /// Read a resource, from the cache if present.
  pub async fn get(&self, endpoint: &str, params: &QueryParams) -> Result<Value> {
    if let Some(value) = self.cache.get(endpoint, params, &self.org_id).await {
      return Ok(value);
    }

    let value = self.fetch(endpoint, params).await?;
    self
      .cache
      .set(endpoint, params, &self.org_id, value.clone(), None);
    Ok(value)
  }

  /// Read a resource and report whether the returned data is stale.
  ///
  /// Unlike `get`, a stale hit is returned as-is without queueing a refresh.
  pub async fn get_with_staleness(
    &self,
    endpoint: &str,
    params: &QueryParams,
  ) -> Result<(Value, bool)> {
    if let Some(cached) = self
      .cache
      .get_with_metadata(endpoint, params, &self.org_id)
      .await
    {
      return Ok((cached.value, cached.is_stale));
    }

    let value = self.fetch(endpoint, params).await?;
    self
      .cache
      .set(endpoint, params, &self.org_id, value.clone(), None);
    Ok((value, false))
  }

  /// Send a mutating request, then drop cached reads of the same resource
  /// family.
  pub async fn send(&self, method: Method, endpoint: &str, body: Option<&Value>) -> Result<Value> {
    let auth = self
      .credentials
      .auth()
      .ok_or_else(|| eyre!("API credentials incomplete"))?;

    let mut request = auth.request(&self.http, method.clone(), endpoint, &QueryParams::new())?;
    if let Some(body) = body {
      request = request.json(body);
    }

    let response = request
      .send()
      .await
      .map_err(|e| eyre!("Failed to send {} {}: {}", method, endpoint, e))?;
    let value = read_json(response).await?;

    let family = resource_family(endpoint);
    debug!(%method, endpoint, family = %family, "Invalidating after mutation");
    self.cache.invalidate_in_background(Some(&family));

    Ok(value)
  }

  async fn fetch(&self, endpoint: &str, params: &QueryParams) -> Result<Value> {
    let auth = self
      .credentials
      .auth()
      .ok_or_else(|| eyre!("API credentials incomplete"))?;

    let response = auth
      .request(&self.http, Method::GET, endpoint, params)?
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", endpoint, e))?;

    read_json(response).await
  }
}

/// The collection an endpoint belongs to: `/projects/42/archive` → `/projects`.
pub fn resource_family(endpoint: &str) -> String {
  let trimmed = endpoint.trim_start_matches('/');
  let first = trimmed.split(['/', '?']).next().unwrap_or_default();
  format!("/{}", first)
}
