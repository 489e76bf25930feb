//! Persistent response cache with stale-while-revalidate reads.
//!
//! This module provides:
//! - Deterministic cache keys over endpoint, organization and query params
//! - Per-endpoint freshness windows
//! - A SQLite store shared by every invocation of the CLI
//! - Stale reads that queue a refresh instead of blocking on the network
//! - A durable refresh queue, drained in small batches at startup

mod key;
mod layer;
mod queue;
mod refresh;
mod storage;
mod traits;
mod ttl;

#[cfg(test)]
pub(crate) mod memory;

pub use key::derive_key;
pub use layer::CacheStore;
pub use refresh::{RefreshProcessor, DEFAULT_MAX_JOBS};
pub use storage::SqliteOpener;
pub use traits::{CacheStats, QueryParams};
pub use ttl::TtlPolicy;
