//! Multi-tier caching for Gatehouse.
//!
//! - **Backend contract**: [`CacheBackend`] over raw bytes, shared by every tier
//! - **Memory tier (L1)**: bounded LRU with TTL and a background sweep
//! - **Redis tier (L2)**: same contract over the network
//! - **Orchestrator**: [`MultiTierCache`] composes tiers with promotion and
//!   write-through/write-back policy
//! - **Typed facade**: [`Cache`] serializes values with serde_json and namespaces keys
//!
//! # Architecture
//!
//! ```text
//!            ┌──────────────────────────────┐
//!            │   Cache (typed, namespaced)  │
//!            └──────────────┬───────────────┘
//!                           │ CacheBackend
//!            ┌──────────────▼───────────────┐
//!            │        MultiTierCache        │──► propagation queue ─► worker
//!            └───────┬──────────────┬───────┘
//!                    ▼              ▼
//!             ┌────────────┐  ┌────────────┐
//!             │ MemoryCache│  │ RedisCache │
//!             └────────────┘  └────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use gatehouse_core::cache::{build_cache, Cache, CacheSettings, CacheTtl};
//!
//! let tiers = build_cache(&CacheSettings::default()).await?;
//! let cache = Cache::new(tiers.clone(), "sessions");
//! cache.set("abc", &session, CacheTtl::After(Duration::from_secs(900))).await?;
//! let session: Option<Session> = cache.get("abc").await?;
//! ```

pub mod backend;
pub mod memory;
pub mod multi_tier;
pub mod redis;

pub use backend::{glob_match, CacheBackend, CacheStats, CacheTtl};
pub use memory::{MemoryCache, MemoryCacheConfig};
pub use multi_tier::{MultiTierCache, MultiTierConfig, WritePolicy};
pub use redis::{RedisCache, RedisCacheConfig};

use crate::error::{ErrorCode, GatehouseError, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

// ═══════════════════════════════════════════════════════════════════════════════
// Cache Configuration
// ═══════════════════════════════════════════════════════════════════════════════

/// The `cache` configuration section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheSettings {
    /// Memory tier (always built)
    #[serde(default)]
    pub memory: MemoryCacheConfig,

    /// Redis tier (built when `enabled`)
    #[serde(default)]
    pub redis: RedisCacheConfig,

    /// Orchestrator policy
    #[serde(default)]
    pub multi_tier: MultiTierConfig,
}

/// Build the tiers described by `settings` and compose them.
///
/// The memory tier is always tier 0; Redis follows when enabled.
pub async fn build_cache(settings: &CacheSettings) -> Result<Arc<MultiTierCache>> {
    let mut tiers: Vec<Arc<dyn CacheBackend>> =
        vec![Arc::new(MemoryCache::new(settings.memory.clone()))];

    if settings.redis.enabled {
        tiers.push(Arc::new(RedisCache::connect(settings.redis.clone()).await?));
    } else {
        info!("Redis tier disabled; running with the memory tier only");
    }

    Ok(Arc::new(MultiTierCache::new(tiers, settings.multi_tier.clone())?))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Typed Cache Facade
// ═══════════════════════════════════════════════════════════════════════════════

/// Typed, namespaced view over any [`CacheBackend`].
///
/// Values cross the boundary as JSON; the caller names the type on read.
#[derive(Clone)]
pub struct Cache {
    backend: Arc<dyn CacheBackend>,
    namespace: String,
}

impl Cache {
    /// Wrap `backend`, prefixing every key with `namespace:` (no prefix when empty).
    pub fn new(backend: Arc<dyn CacheBackend>, namespace: impl Into<String>) -> Self {
        Self {
            backend,
            namespace: namespace.into(),
        }
    }

    /// A memory-only cache without a background sweep, for tests and tools.
    pub fn in_memory(max_size: usize) -> Self {
        let backend = MemoryCache::new(
            MemoryCacheConfig::default()
                .with_max_size(max_size)
                .with_cleanup_interval(Duration::ZERO),
        );
        Self::new(Arc::new(backend), "")
    }

    /// The underlying backend.
    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Get a value. A missing key is `Ok(None)`.
    #[instrument(skip(self), level = "debug")]
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let full_key = self.build_key(key);
        match self.backend.get(&full_key).await {
            Ok(bytes) => {
                let value = serde_json::from_slice(&bytes).map_err(|e| {
                    GatehouseError::with_internal(
                        ErrorCode::DeserializationError,
                        "Failed to deserialize cached value",
                        e.to_string(),
                    )
                    .with_context("key", &full_key)
                })?;
                Ok(Some(value))
            }
            Err(e) if e.is_key_not_found() => {
                debug!(key = %full_key, "Cache miss");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Serialize and store a value.
    #[instrument(skip(self, value), level = "debug")]
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: CacheTtl) -> Result<()> {
        let data = serde_json::to_vec(value).map_err(|e| {
            GatehouseError::with_internal(
                ErrorCode::SerializationError,
                "Failed to serialize value for cache",
                e.to_string(),
            )
        })?;
        self.backend.set(&self.build_key(key), data, ttl).await
    }

    /// Return the cached value, or compute, store and return it.
    ///
    /// A failure to store the computed value is logged and does not fail the call.
    pub async fn get_or_set<T, F, Fut>(&self, key: &str, ttl: CacheTtl, factory: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        if let Some(value) = self.get(key).await? {
            return Ok(value);
        }

        let value = factory().await?;
        if let Err(e) = self.set(key, &value, ttl).await {
            tracing::warn!(key, error = %e, "Failed to store computed value");
        }
        Ok(value)
    }

    pub async fn get_raw(&self, key: &str) -> Result<Vec<u8>> {
        self.backend.get(&self.build_key(key)).await
    }

    pub async fn set_raw(&self, key: &str, value: Vec<u8>, ttl: CacheTtl) -> Result<()> {
        self.backend.set(&self.build_key(key), value, ttl).await
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.backend.delete(&self.build_key(key)).await
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        self.backend.exists(&self.build_key(key)).await
    }

    pub async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        self.backend.ttl(&self.build_key(key)).await
    }

    pub async fn expire(&self, key: &str, ttl: CacheTtl) -> Result<()> {
        self.backend.expire(&self.build_key(key), ttl).await
    }

    pub async fn increment(&self, key: &str, delta: i64) -> Result<i64> {
        self.backend.increment(&self.build_key(key), delta).await
    }

    pub async fn decrement(&self, key: &str, delta: i64) -> Result<i64> {
        self.backend.decrement(&self.build_key(key), delta).await
    }

    /// Keys in this namespace matching `pattern`, without the namespace prefix.
    pub async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let prefix = self.key_prefix();
        let keys = self.backend.keys(&self.build_key(pattern)).await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(prefix.as_str()).map(str::to_string))
            .collect())
    }

    /// Delete every key in this namespace matching `pattern`. Returns how many were found.
    #[instrument(skip(self))]
    pub async fn delete_pattern(&self, pattern: &str) -> Result<u64> {
        let keys = self.backend.keys(&self.build_key(pattern)).await?;
        let count = keys.len() as u64;
        if count > 0 {
            self.backend.delete_multi(&keys).await?;
        }
        debug!(pattern, count, "Deleted keys by pattern");
        Ok(count)
    }

    pub async fn stats(&self) -> Result<CacheStats> {
        self.backend.stats().await
    }

    fn key_prefix(&self) -> String {
        if self.namespace.is_empty() {
            String::new()
        } else {
            format!("{}:", self.namespace)
        }
    }

    /// Build the full cache key with namespace prefix.
    fn build_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix(), key)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Session {
        user_id: i64,
        scopes: Vec<String>,
    }

    #[tokio::test]
    async fn test_typed_round_trip() {
        let cache = Cache::in_memory(100);
        let session = Session {
            user_id: 7,
            scopes: vec!["read".to_string()],
        };

        cache.set("s1", &session, CacheTtl::Never).await.unwrap();
        let loaded: Option<Session> = cache.get("s1").await.unwrap();
        assert_eq!(loaded, Some(session));

        let missing: Option<Session> = cache.get("s2").await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_wrong_type_is_deserialization_error() {
        let cache = Cache::in_memory(100);
        cache.set("n", &"text", CacheTtl::Never).await.unwrap();
        let err = cache.get::<u32>("n").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::DeserializationError);
    }

    #[tokio::test]
    async fn test_get_or_set_calls_factory_once() {
        let cache = Cache::in_memory(100);
        let calls = std::sync::atomic::AtomicU32::new(0);

        for _ in 0..2 {
            let value: u32 = cache
                .get_or_set("answer", CacheTtl::Never, || async {
                    calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Ok(42)
                })
                .await
                .unwrap();
            assert_eq!(value, 42);
        }
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_namespace_isolation() {
        let backend: Arc<dyn CacheBackend> = Arc::new(MemoryCache::with_max_size(100));
        let users = Cache::new(backend.clone(), "users");
        let orders = Cache::new(backend.clone(), "orders");

        users.set("1", &"alice", CacheTtl::Never).await.unwrap();
        orders.set("1", &"order", CacheTtl::Never).await.unwrap();

        assert_eq!(users.keys("*").await.unwrap(), vec!["1"]);
        assert!(backend.exists("users:1").await.unwrap());

        assert_eq!(users.delete_pattern("*").await.unwrap(), 1);
        assert!(orders.exists("1").await.unwrap());
    }

    #[tokio::test]
    async fn test_counters_through_facade() {
        let cache = Cache::new(Arc::new(MemoryCache::with_max_size(10)), "rl");
        assert_eq!(cache.increment("client", 3).await.unwrap(), 3);
        assert_eq!(cache.decrement("client", 1).await.unwrap(), 2);
        assert_eq!(cache.get_raw("client").await.unwrap(), b"2");
    }

    #[tokio::test]
    async fn test_build_cache_memory_only() {
        let tiers = build_cache(&CacheSettings::default()).await.unwrap();
        assert_eq!(tiers.tier_count(), 1);
        tiers.close().await.unwrap();
    }
}
