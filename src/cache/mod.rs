//! Rate cache trait and backend factory
//!
//! This module provides:
//! - The `RateCache` contract shared by every backend
//! - A factory resolving the configured backend
//!
//! Two lookup paths are exposed:
//! - by instrument name ("latest resolved" view)
//! - by `(platform, instrument)` (per-source view)
//!
//! Both paths must stay consistent after every mutation; backends
//! guarantee this per key, never across keys.

pub mod local;
pub mod redis_store;

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use log::info;

use crate::config::{CacheBackend, CacheConfig};
use crate::errors::{CacheError, CacheResult};
use crate::schema::Quote;

pub use local::LocalRateCache;
pub use redis_store::RedisRateCache;

/// Concurrent store of the latest known quote per instrument.
///
/// THREADING:
/// - Called concurrently from every connector task
/// - All mutations are atomic at single-key granularity
///
/// FAILURES:
/// - Backend failures are returned as `CacheError`, never panics
#[async_trait]
pub trait RateCache: Send + Sync {
    /// Stores the quote as the resolved value for its instrument and,
    /// for raw quotes, as the value seen from its source platform.
    async fn put(&self, quote: &Quote) -> CacheResult<()>;

    async fn get(&self, instrument: &str) -> CacheResult<Option<Quote>>;

    async fn get_from(&self, platform: &str, instrument: &str) -> CacheResult<Option<Quote>>;

    /// Removes the instrument from both lookup paths.
    async fn remove(&self, instrument: &str) -> CacheResult<bool>;

    /// Removes the value seen from one platform.
    ///
    /// The resolved value is left as it is while any other platform still
    /// has data for the instrument. Only when the last reporting platform
    /// goes and the resolved value came from it is the instrument removed.
    async fn remove_from(&self, platform: &str, instrument: &str) -> CacheResult<bool>;

    /// Point-in-time copy of every cached instrument name.
    async fn instrument_names(&self) -> CacheResult<BTreeSet<String>>;

    async fn clear(&self) -> CacheResult<()>;
}

/// Builds the configured cache backend.
///
/// The redis backend connects eagerly so a wrong URL fails at startup.
pub async fn build_cache(cfg: &CacheConfig) -> Result<Arc<dyn RateCache>, CacheError> {
    match cfg.backend {
        CacheBackend::Local => {
            info!("Using local in-process rate cache");
            Ok(Arc::new(LocalRateCache::new()))
        }
        CacheBackend::Redis => {
            let url = cfg.redis_url.as_deref().unwrap_or("redis://127.0.0.1/");
            info!("Using redis rate cache at {}", url);
            Ok(Arc::new(RedisRateCache::connect(url).await?))
        }
    }
}
