//! Distributed cache tier (L2) backed by Redis.
//!
//! Connections are `ConnectionManager`s (multiplexed, reconnecting) opened
//! eagerly and used round-robin. Pool and retry settings are handed to the
//! client as-is; every command is bounded by the read or write timeout.

use super::backend::{closed_error, glob_match, CacheBackend, CacheStats, CacheTtl};
use crate::error::{ErrorCode, GatehouseError, Result};
use crate::telemetry::OperationTimer;
use async_trait::async_trait;
use metrics::counter;
use redis::aio::ConnectionManager;
use serde::Deserialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, info, instrument};

const BACKEND: &str = "redis";
const SCAN_COUNT: usize = 100;

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for the Redis tier.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisCacheConfig {
    /// Whether the tier is built at all
    #[serde(default)]
    pub enabled: bool,

    /// Redis connection URL
    #[serde(default = "default_url")]
    pub url: String,

    /// Prefix applied to every key this tier touches
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Number of multiplexed connections
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Connections the pool should keep idle (reported; multiplexed connections never idle out)
    #[serde(default)]
    pub min_idle: usize,

    /// Reconnect attempts per connection before an error is surfaced
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Bound on establishing each connection
    #[serde(default = "default_dial_timeout", with = "humantime_serde")]
    pub dial_timeout: Duration,

    /// Bound on read commands
    #[serde(default = "default_io_timeout", with = "humantime_serde")]
    pub read_timeout: Duration,

    /// Bound on write commands
    #[serde(default = "default_io_timeout", with = "humantime_serde")]
    pub write_timeout: Duration,

    /// TTL applied for `CacheTtl::Default`; zero means no expiry
    #[serde(default = "default_ttl", with = "humantime_serde")]
    pub default_ttl: Duration,
}

impl Default for RedisCacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_url(),
            key_prefix: default_key_prefix(),
            pool_size: default_pool_size(),
            min_idle: 0,
            max_retries: default_max_retries(),
            dial_timeout: default_dial_timeout(),
            read_timeout: default_io_timeout(),
            write_timeout: default_io_timeout(),
            default_ttl: default_ttl(),
        }
    }
}

fn default_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    "gatehouse:".to_string()
}

fn default_pool_size() -> usize {
    10
}

fn default_max_retries() -> usize {
    3
}

fn default_dial_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_io_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_ttl() -> Duration {
    Duration::from_secs(3600)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Redis Cache
// ═══════════════════════════════════════════════════════════════════════════════

/// Redis cache tier.
pub struct RedisCache {
    connections: Vec<ConnectionManager>,
    next: AtomicUsize,
    config: RedisCacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    closed: AtomicBool,
}

impl RedisCache {
    /// Open `pool_size` connections and verify the server answers PING.
    pub async fn connect(config: RedisCacheConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str()).map_err(|e| {
            GatehouseError::with_internal(
                ErrorCode::CacheConnectionFailed,
                "Failed to create Redis client",
                e.to_string(),
            )
        })?;

        let pool_size = config.pool_size.max(1);
        let mut connections = Vec::with_capacity(pool_size);
        for _ in 0..pool_size {
            let dial = ConnectionManager::new_with_backoff(
                client.clone(),
                2,
                100,
                config.max_retries,
            );
            let conn = match tokio::time::timeout(config.dial_timeout, dial).await {
                Ok(conn) => conn.map_err(|e| {
                    GatehouseError::with_internal(
                        ErrorCode::CacheConnectionFailed,
                        "Failed to connect to Redis",
                        e.to_string(),
                    )
                })?,
                Err(_) => {
                    return Err(GatehouseError::with_internal(
                        ErrorCode::CacheConnectionFailed,
                        "Failed to connect to Redis",
                        format!("dial timed out after {:?}", config.dial_timeout),
                    ))
                }
            };
            connections.push(conn);
        }

        let cache = Self {
            connections,
            next: AtomicUsize::new(0),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        };

        let pong: String = cache
            .read("ping", |mut conn| async move {
                redis::cmd("PING").query_async(&mut conn).await
            })
            .await?;
        debug!(reply = %pong, "Redis answered PING");

        info!(
            pool_size,
            min_idle = cache.config.min_idle,
            max_retries = cache.config.max_retries,
            "Redis cache tier connected"
        );

        Ok(cache)
    }

    pub fn config(&self) -> &RedisCacheConfig {
        &self.config
    }

    fn conn(&self) -> Result<ConnectionManager> {
        if self.closed.load(Ordering::Acquire) {
            return Err(closed_error(BACKEND));
        }
        let slot = self.next.fetch_add(1, Ordering::Relaxed) % self.connections.len();
        Ok(self.connections[slot].clone())
    }

    async fn run<T, F, Fut>(&self, operation: &'static str, timeout: Duration, command: F) -> Result<T>
    where
        F: FnOnce(ConnectionManager) -> Fut,
        Fut: Future<Output = redis::RedisResult<T>>,
    {
        let conn = self.conn()?;
        let _timer = OperationTimer::start("cache_operation_duration_seconds", BACKEND, operation);
        match tokio::time::timeout(timeout, command(conn)).await {
            Ok(result) => result.map_err(|e| map_command_error(operation, e)),
            Err(_) => Err(GatehouseError::timeout(format!("redis {}", operation))),
        }
    }

    async fn read<T, F, Fut>(&self, operation: &'static str, command: F) -> Result<T>
    where
        F: FnOnce(ConnectionManager) -> Fut,
        Fut: Future<Output = redis::RedisResult<T>>,
    {
        self.run(operation, self.config.read_timeout, command).await
    }

    async fn write<T, F, Fut>(&self, operation: &'static str, command: F) -> Result<T>
    where
        F: FnOnce(ConnectionManager) -> Fut,
        Fut: Future<Output = redis::RedisResult<T>>,
    {
        self.run(operation, self.config.write_timeout, command).await
    }

    /// Build the full key with prefix.
    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    /// Strip the prefix from a key returned by SCAN.
    fn strip_prefix<'a>(&self, full_key: &'a str) -> Option<&'a str> {
        full_key.strip_prefix(self.config.key_prefix.as_str())
    }

    /// All full keys matching `pattern` (already prefixed).
    async fn scan(&self, full_pattern: String) -> Result<Vec<String>> {
        let mut cursor: u64 = 0;
        let mut found = Vec::new();

        loop {
            let pattern = full_pattern.clone();
            let (next_cursor, keys): (u64, Vec<String>) = self
                .read("scan", |mut conn| async move {
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(SCAN_COUNT)
                        .query_async(&mut conn)
                        .await
                })
                .await?;

            found.extend(keys);
            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }

        // SCAN may return a key more than once
        found.sort();
        found.dedup();
        Ok(found)
    }

    fn set_command(&self, key: &str, value: Vec<u8>, ttl: CacheTtl) -> redis::Cmd {
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.full_key(key)).arg(value);
        if let Some(ttl) = ttl.resolve(self.config.default_ttl) {
            cmd.arg("PX").arg(px_millis(ttl));
        }
        cmd
    }
}

/// PX argument for a TTL; sub-millisecond TTLs round up so they still expire.
fn px_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

/// Interpret a PTTL reply: -2 missing, -1 no expiry.
fn decode_pttl(key: &str, millis: i64) -> Result<Option<Duration>> {
    match millis {
        -2 => Err(GatehouseError::key_not_found(key)),
        m if m < 0 => Ok(None),
        m => Ok(Some(Duration::from_millis(m as u64))),
    }
}

fn map_command_error(operation: &'static str, error: redis::RedisError) -> GatehouseError {
    let message = error.to_string();
    if error.kind() == redis::ErrorKind::ResponseError
        && (message.contains("not an integer") || message.contains("overflow"))
    {
        return GatehouseError::with_internal(
            ErrorCode::InvalidInput,
            "Value is not an integer",
            message,
        )
        .with_context("operation", operation);
    }
    GatehouseError::from(error).with_context("operation", operation)
}

#[async_trait]
impl CacheBackend for RedisCache {
    #[instrument(skip(self), level = "trace")]
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let full_key = self.full_key(key);
        let value: Option<Vec<u8>> = self
            .read("get", |mut conn| async move {
                redis::cmd("GET").arg(&full_key).query_async(&mut conn).await
            })
            .await?;

        match value {
            Some(bytes) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                counter!("cache_hits_total", "backend" => BACKEND).increment(1);
                Ok(bytes)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                counter!("cache_misses_total", "backend" => BACKEND).increment(1);
                Err(GatehouseError::key_not_found(key))
            }
        }
    }

    #[instrument(skip(self, value), fields(size = value.len()), level = "trace")]
    async fn set(&self, key: &str, value: Vec<u8>, ttl: CacheTtl) -> Result<()> {
        let cmd = self.set_command(key, value, ttl);
        self.write("set", |mut conn| async move {
            cmd.query_async::<_, ()>(&mut conn).await
        })
        .await?;
        counter!("cache_sets_total", "backend" => BACKEND).increment(1);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let full_key = self.full_key(key);
        let deleted: i64 = self
            .write("delete", |mut conn| async move {
                redis::cmd("DEL").arg(&full_key).query_async(&mut conn).await
            })
            .await?;
        if deleted > 0 {
            counter!("cache_deletes_total", "backend" => BACKEND).increment(1);
        }
        Ok(deleted > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let full_key = self.full_key(key);
        let count: i64 = self
            .read("exists", |mut conn| async move {
                redis::cmd("EXISTS").arg(&full_key).query_async(&mut conn).await
            })
            .await?;
        Ok(count > 0)
    }

    async fn clear(&self) -> Result<()> {
        let keys = self.scan(format!("{}*", self.config.key_prefix)).await?;
        let mut total_deleted = 0;

        for chunk in keys.chunks(SCAN_COUNT) {
            let chunk = chunk.to_vec();
            let deleted: i64 = self
                .write("clear", |mut conn| async move {
                    redis::cmd("DEL").arg(&chunk).query_async(&mut conn).await
                })
                .await?;
            total_deleted += deleted;
        }

        info!(deleted = total_deleted, "Cleared Redis cache entries");
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let full_keys = self.scan(self.full_key(pattern)).await?;
        Ok(full_keys
            .iter()
            .filter_map(|k| self.strip_prefix(k))
            // Redis globs also honour [..] classes; keep only what our glob accepts
            .filter(|k| glob_match(pattern, k))
            .map(str::to_string)
            .collect())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let full_key = self.full_key(key);
        let millis: i64 = self
            .read("ttl", |mut conn| async move {
                redis::cmd("PTTL").arg(&full_key).query_async(&mut conn).await
            })
            .await?;
        decode_pttl(key, millis)
    }

    async fn expire(&self, key: &str, ttl: CacheTtl) -> Result<()> {
        let full_key = self.full_key(key);
        match ttl.resolve(self.config.default_ttl) {
            Some(ttl) => {
                let ms = px_millis(ttl);
                let updated: i64 = self
                    .write("expire", |mut conn| async move {
                        redis::cmd("PEXPIRE").arg(&full_key).arg(ms).query_async(&mut conn).await
                    })
                    .await?;
                if updated == 0 {
                    return Err(GatehouseError::key_not_found(key));
                }
            }
            None => {
                // PERSIST answers 0 both for a missing key and a key without TTL
                if !self.exists(key).await? {
                    return Err(GatehouseError::key_not_found(key));
                }
                self.write("persist", |mut conn| async move {
                    redis::cmd("PERSIST").arg(&full_key).query_async::<_, i64>(&mut conn).await
                })
                .await?;
            }
        }
        Ok(())
    }

    async fn increment(&self, key: &str, delta: i64) -> Result<i64> {
        let full_key = self.full_key(key);
        self.write("increment", |mut conn| async move {
            redis::cmd("INCRBY").arg(&full_key).arg(delta).query_async(&mut conn).await
        })
        .await
    }

    async fn get_multi(&self, keys: &[String]) -> Result<HashMap<String, Vec<u8>>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }

        let full_keys: Vec<String> = keys.iter().map(|k| self.full_key(k)).collect();
        let values: Vec<Option<Vec<u8>>> = self
            .read("get_multi", |mut conn| async move {
                redis::cmd("MGET").arg(&full_keys).query_async(&mut conn).await
            })
            .await?;

        let mut found = HashMap::with_capacity(keys.len());
        for (key, value) in keys.iter().zip(values) {
            match value {
                Some(bytes) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    found.insert(key.clone(), bytes);
                }
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        Ok(found)
    }

    async fn set_multi(&self, items: HashMap<String, Vec<u8>>, ttl: CacheTtl) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }

        let count = items.len() as u64;
        let mut pipe = redis::pipe();
        for (key, value) in items {
            pipe.add_command(self.set_command(&key, value, ttl)).ignore();
        }
        self.write("set_multi", |mut conn| async move {
            pipe.query_async::<_, ()>(&mut conn).await
        })
        .await?;
        counter!("cache_sets_total", "backend" => BACKEND).increment(count);
        Ok(())
    }

    async fn delete_multi(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }

        let full_keys: Vec<String> = keys.iter().map(|k| self.full_key(k)).collect();
        self.write("delete_multi", |mut conn| async move {
            redis::cmd("DEL").arg(&full_keys).query_async::<_, i64>(&mut conn).await
        })
        .await?;
        Ok(())
    }

    async fn stats(&self) -> Result<CacheStats> {
        let db_size: u64 = self
            .read("stats", |mut conn| async move {
                redis::cmd("DBSIZE").query_async(&mut conn).await
            })
            .await?;

        let mut stats = tier_stats(
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
            db_size,
        );
        stats
            .backend_stats
            .insert("pool_size".to_string(), self.connections.len().to_string());
        stats
            .backend_stats
            .insert("min_idle".to_string(), self.config.min_idle.to_string());
        stats
            .backend_stats
            .insert("key_prefix".to_string(), self.config.key_prefix.clone());

        Ok(stats)
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("Redis cache tier closed");
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        BACKEND
    }
}

/// `DBSIZE` counts the whole database, not just keys under our prefix, so it
/// is reported under `db_size` and `entries` stays 0.
fn tier_stats(hits: u64, misses: u64, db_size: u64) -> CacheStats {
    let mut stats = CacheStats {
        hits,
        misses,
        ..Default::default()
    };
    stats.calculate_hit_rate();
    stats
        .backend_stats
        .insert("db_size".to_string(), db_size.to_string());
    stats
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
