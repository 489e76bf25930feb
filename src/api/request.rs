//! Authenticated request construction shared by the API client and the
//! refresh processor.

use color_eyre::{eyre::eyre, Result};
use reqwest::{Method, RequestBuilder, Response};
use serde_json::Value;
use url::Url;

use crate::cache::QueryParams;

pub const DEFAULT_BASE_URL: &str = "https://api.productive.io/api/v2";

const JSON_API: &str = "application/vnd.api+json";

/// Where and as whom requests are made.
#[derive(Debug, Clone)]
pub struct Credentials {
  pub base_url: String,
  pub api_token: Option<String>,
  pub org_id: Option<String>,
}

impl Credentials {
  /// Token and organization, if both are present and non-empty.
  pub fn auth(&self) -> Option<Auth<'_>> {
    let token = self.api_token.as_deref().filter(|t| !t.is_empty())?;
    let org_id = self.org_id.as_deref().filter(|o| !o.is_empty())?;
    Some(Auth {
      base_url: &self.base_url,
      token,
      org_id,
    })
  }
}

/// Complete credentials, ready to sign requests.
#[derive(Debug, Clone, Copy)]
pub struct Auth<'a> {
  pub base_url: &'a str,
  pub token: &'a str,
  pub org_id: &'a str,
}

impl Auth<'_> {
  /// Build a request carrying the auth token and organization headers.
  pub fn request(
    &self,
    http: &reqwest::Client,
    method: Method,
    endpoint: &str,
    params: &QueryParams,
  ) -> Result<RequestBuilder> {
    let url = build_url(self.base_url, endpoint, params)?;
    Ok(
      http
        .request(method, url)
        .header("X-Auth-Token", self.token)
        .header("X-Organization-Id", self.org_id)
        .header("Content-Type", JSON_API)
        .header("Accept", JSON_API),
    )
  }
}

/// Join `endpoint` onto `base_url` and encode `params` as the query string.
///
/// Null values are skipped. Objects become bracketed keys
/// (`filter[status]=1`) and arrays are comma-joined, as JSON:API expects.
pub fn build_url(base_url: &str, endpoint: &str, params: &QueryParams) -> Result<Url> {
  let base = base_url.trim_end_matches('/');
  let raw = if endpoint.starts_with('/') {
    format!("{}{}", base, endpoint)
  } else {
    format!("{}/{}", base, endpoint)
  };
  let mut url = Url::parse(&raw).map_err(|e| eyre!("Invalid request URL {}: {}", raw, e))?;

  let mut pairs = Vec::new();
  for (key, value) in params {
    flatten_param(key, value, &mut pairs);
  }
  if !pairs.is_empty() {
    url.query_pairs_mut().extend_pairs(pairs);
  }

  Ok(url)
}

fn flatten_param(key: &str, value: &Value, out: &mut Vec<(String, String)>) {
  match value {
    Value::Null => {}
    Value::String(s) => out.push((key.to_string(), s.clone())),
    Value::Object(map) => {
      for (sub_key, sub_value) in map {
        flatten_param(&format!("{}[{}]", key, sub_key), sub_value, out);
      }
    }
    Value::Array(items) => {
      let joined: Vec<String> = items
        .iter()
        .filter(|item| !item.is_null())
        .map(|item| match item {
          Value::String(s) => s.clone(),
          other => other.to_string(),
        })
        .collect();
      out.push((key.to_string(), joined.join(",")));
    }
    other => out.push((key.to_string(), other.to_string())),
  }
}

/// Parse a JSON response body, turning non-2xx statuses into errors.
///
/// An empty body (e.g. `204 No Content`) reads as `null`.
pub async fn read_json(response: Response) -> Result<Value> {
  let status = response.status();
  let url = response.url().clone();
  let body = response
    .text()
    .await
    .map_err(|e| eyre!("Failed to read response from {}: {}", url, e))?;

  if !status.is_success() {
    return Err(eyre!("Request to {} failed with {}: {}", url, status, body));
  }
  if body.trim().is_empty() {
    return Ok(Value::Null);
  }

  serde_json::from_str(&body).map_err(|e| eyre!("Failed to parse response from {}: {}", url, e))
}
