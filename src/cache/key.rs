//! Cache key derivation.

use serde::Serialize;
use sha2::{Digest, Sha256};

use super::traits::QueryParams;

/// Number of hex characters kept from the SHA-256 digest.
///
/// 16 hex characters is 64 bits. For the few thousand entries a single
/// organization accumulates, the birthday bound puts the collision chance
/// far below one in a billion; a collision would serve one endpoint's
/// response for another until the entry is invalidated.
pub const KEY_LENGTH: usize = 16;

#[derive(Serialize)]
struct KeyMaterial<'a> {
  endpoint: &'a str,
  #[serde(rename = "orgId")]
  org_id: &'a str,
  params: &'a QueryParams,
}

/// Derive the cache key for a request.
///
/// `QueryParams` is ordered by parameter name, and nested JSON objects are
/// ordered by serde_json's map, so the serialized material does not depend
/// on the order parameters were inserted in.
pub fn derive_key(endpoint: &str, params: &QueryParams, org_id: &str) -> String {
  let material = KeyMaterial {
    endpoint,
    org_id,
    params,
  };

  // Serializing string keys and JSON values cannot fail
  let canonical = serde_json::to_vec(&material).unwrap_or_default();

  let mut hasher = Sha256::new();
  hasher.update(&canonical);
  let mut key = hex::encode(hasher.finalize());
  key.truncate(KEY_LENGTH);
  key
}
