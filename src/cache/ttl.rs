//! Freshness windows per endpoint.

use std::collections::BTreeMap;
use std::time::Duration;

/// Used when no prefix matches.
pub const DEFAULT_TTL: Duration = Duration::from_secs(15 * 60);

/// Built-in prefixes. Prefixes are non-overlapping, so order only matters
/// for prefixes added through configuration, which are checked first.
const BUILTIN_TTLS: &[(&str, u64)] = &[
  // Time tracking changes constantly
  ("/timers", 60),
  ("/time_entries", 5 * 60),
  // Work items
  ("/tasks", 10 * 60),
  ("/comments", 10 * 60),
  ("/bookings", 15 * 60),
  ("/deals", 30 * 60),
  ("/budgets", 30 * 60),
  // Reference data
  ("/projects", 60 * 60),
  ("/people", 60 * 60),
  ("/services", 60 * 60),
  ("/companies", 60 * 60),
  ("/workflow_statuses", 4 * 60 * 60),
];

/// Ordered prefix table mapping endpoints to TTLs. First match wins.
#[derive(Debug, Clone)]
pub struct TtlPolicy {
  rules: Vec<(String, Duration)>,
  fallback: Duration,
}

impl Default for TtlPolicy {
  fn default() -> Self {
    Self {
      rules: BUILTIN_TTLS
        .iter()
        .map(|(prefix, secs)| (prefix.to_string(), Duration::from_secs(*secs)))
        .collect(),
      fallback: DEFAULT_TTL,
    }
  }
}

impl TtlPolicy {
  /// Built-in table with configured prefixes checked first.
  ///
  /// Configured prefixes are ordered longest first so a more specific
  /// prefix is never shadowed by a shorter one.
  pub fn with_overrides(overrides: &BTreeMap<String, u64>) -> Self {
    let mut extra: Vec<(String, Duration)> = overrides
      .iter()
      .map(|(prefix, secs)| (prefix.clone(), Duration::from_secs(*secs)))
      .collect();
    extra.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

    let mut policy = Self::default();
    extra.append(&mut policy.rules);
    policy.rules = extra;
    policy
  }

  /// TTL from the prefix table, or the fallback.
  pub fn default_ttl(&self, endpoint: &str) -> Duration {
    self
      .rules
      .iter()
      .find(|(prefix, _)| endpoint.starts_with(prefix.as_str()))
      .map(|(_, ttl)| *ttl)
      .unwrap_or(self.fallback)
  }

  /// An explicit TTL always wins over the table.
  pub fn effective_ttl(&self, endpoint: &str, ttl_override: Option<Duration>) -> Duration {
    ttl_override.unwrap_or_else(|| self.default_ttl(endpoint))
  }
}
