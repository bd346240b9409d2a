//! The cache contract shared by every tier and by the multi-tier orchestrator.
//!
//! - [`CacheBackend`]: async key/value contract over raw bytes
//! - [`CacheTtl`]: the TTL argument (`Default`, `Never`, `After`)
//! - [`CacheStats`]: per-backend counters
//! - Glob matching and counter encoding shared by the tiers

use crate::error::{ErrorCode, GatehouseError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// TTL
// ═══════════════════════════════════════════════════════════════════════════════

/// Time-to-live argument accepted by `set` and `expire`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheTtl {
    /// Use the backend's configured default TTL.
    #[default]
    Default,
    /// Never expire.
    Never,
    /// Expire after the given duration.
    After(Duration),
}

impl CacheTtl {
    /// Map a signed millisecond count: zero is `Default`, negative is `Never`.
    pub fn from_millis(millis: i64) -> Self {
        match millis {
            0 => Self::Default,
            m if m < 0 => Self::Never,
            m => Self::After(Duration::from_millis(m as u64)),
        }
    }

    /// Resolve against a backend default. `None` means the entry never expires.
    ///
    /// A zero `default` is treated as "no default expiry".
    pub fn resolve(self, default: Duration) -> Option<Duration> {
        match self {
            Self::Default if default.is_zero() => None,
            Self::Default => Some(default),
            Self::Never => None,
            Self::After(d) => Some(d),
        }
    }
}

impl From<Duration> for CacheTtl {
    fn from(ttl: Duration) -> Self {
        if ttl.is_zero() {
            Self::Default
        } else {
            Self::After(ttl)
        }
    }
}

impl From<Option<Duration>> for CacheTtl {
    /// `None` (no remaining expiry) maps to `Never`.
    fn from(ttl: Option<Duration>) -> Self {
        match ttl {
            Some(d) => Self::from(d),
            None => Self::Never,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Cache Statistics
// ═══════════════════════════════════════════════════════════════════════════════

/// Cache statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    /// Total number of cache hits
    pub hits: u64,

    /// Total number of cache misses
    pub misses: u64,

    /// Entries currently held (0 when the backend cannot tell cheaply)
    pub entries: u64,

    /// Entries evicted by capacity pressure
    pub evictions: u64,

    /// Entries removed because their TTL elapsed
    pub expirations: u64,

    /// Hit rate (0.0 - 1.0)
    pub hit_rate: f64,

    /// Backend-specific stats
    pub backend_stats: HashMap<String, String>,
}

impl CacheStats {
    /// Calculate the hit rate.
    pub fn calculate_hit_rate(&mut self) {
        let total = self.hits + self.misses;
        self.hit_rate = if total > 0 {
            self.hits as f64 / total as f64
        } else {
            0.0
        };
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Cache Backend Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// The cache contract.
///
/// A missing or expired key is reported as an error with
/// [`ErrorCode::KeyNotFound`]; check it with
/// [`GatehouseError::is_key_not_found`]. All methods are safe to call
/// concurrently.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Get a value.
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Store a value, replacing any previous value and TTL.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: CacheTtl) -> Result<()>;

    /// Remove a key. Returns whether it existed; removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Whether a live (non-expired) value exists.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Remove every key owned by this backend.
    async fn clear(&self) -> Result<()>;

    /// Keys matching a glob pattern (`*` any sequence, `?` one character).
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Remaining TTL. `None` means the key never expires.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;

    /// Replace the TTL of an existing key.
    async fn expire(&self, key: &str, ttl: CacheTtl) -> Result<()>;

    /// Atomically add `delta` to a counter and return the new value.
    ///
    /// An absent key starts at 0 and never expires; an existing key keeps its TTL.
    async fn increment(&self, key: &str, delta: i64) -> Result<i64>;

    /// Atomically subtract `delta` from a counter.
    async fn decrement(&self, key: &str, delta: i64) -> Result<i64> {
        let negated = delta.checked_neg().ok_or_else(|| {
            GatehouseError::new(ErrorCode::InvalidInput, "Decrement delta out of range")
        })?;
        self.increment(key, negated).await
    }

    /// Fetch several keys. Missing keys are absent from the result.
    async fn get_multi(&self, keys: &[String]) -> Result<HashMap<String, Vec<u8>>> {
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            match self.get(key).await {
                Ok(value) => {
                    found.insert(key.clone(), value);
                }
                Err(e) if e.is_key_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(found)
    }

    /// Store several values with one TTL. Every key is attempted; the first error is returned.
    async fn set_multi(&self, items: HashMap<String, Vec<u8>>, ttl: CacheTtl) -> Result<()> {
        let mut first_error = None;
        for (key, value) in items {
            if let Err(e) = self.set(&key, value, ttl).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Remove several keys. Every key is attempted; the first error is returned.
    async fn delete_multi(&self, keys: &[String]) -> Result<()> {
        let mut first_error = None;
        for key in keys {
            if let Err(e) = self.delete(key).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Get cache statistics.
    async fn stats(&self) -> Result<CacheStats>;

    /// Release background resources. Later calls fail with [`ErrorCode::CacheClosed`].
    async fn close(&self) -> Result<()>;

    /// Get the backend name.
    fn name(&self) -> &'static str;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Shared Helpers
// ═══════════════════════════════════════════════════════════════════════════════

/// Glob match supporting `*` (any sequence, including empty) and `?` (one char).
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0, 0);
    let mut star: Option<usize> = None;
    let mut resume = 0;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some(p);
            resume = t;
            p += 1;
        } else if let Some(s) = star {
            p = s + 1;
            resume += 1;
            t = resume;
        } else {
            return false;
        }
    }

    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }

    p == pattern.len()
}

/// Counters are stored as decimal ASCII so every tier agrees on the encoding.
pub(crate) fn encode_counter(value: i64) -> Vec<u8> {
    value.to_string().into_bytes()
}

pub(crate) fn decode_counter(key: &str, raw: &[u8]) -> Result<i64> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| {
            GatehouseError::new(ErrorCode::InvalidInput, "Value is not an integer")
                .with_context("key", key)
        })
}

pub(crate) fn apply_delta(key: &str, current: i64, delta: i64) -> Result<i64> {
    current.checked_add(delta).ok_or_else(|| {
        GatehouseError::new(ErrorCode::InvalidInput, "Increment would overflow")
            .with_context("key", key)
    })
}

pub(crate) fn closed_error(backend: &'static str) -> GatehouseError {
    GatehouseError::new(ErrorCode::CacheClosed, "Cache has been closed").with_context("backend", backend)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_from_millis() {
        assert_eq!(CacheTtl::from_millis(0), CacheTtl::Default);
        assert_eq!(CacheTtl::from_millis(-1), CacheTtl::Never);
        assert_eq!(
            CacheTtl::from_millis(250),
            CacheTtl::After(Duration::from_millis(250))
        );
    }

    #[test]
    fn test_ttl_resolve() {
        let default = Duration::from_secs(60);
        assert_eq!(CacheTtl::Default.resolve(default), Some(default));
        assert_eq!(CacheTtl::Default.resolve(Duration::ZERO), None);
        assert_eq!(CacheTtl::Never.resolve(default), None);
        assert_eq!(
            CacheTtl::After(Duration::from_secs(1)).resolve(default),
            Some(Duration::from_secs(1))
        );
    }

    #[test]
    fn test_ttl_from_duration() {
        assert_eq!(CacheTtl::from(Duration::ZERO), CacheTtl::Default);
        assert_eq!(CacheTtl::from(None), CacheTtl::Never);
        assert_eq!(
            CacheTtl::from(Some(Duration::from_secs(3))),
            CacheTtl::After(Duration::from_secs(3))
        );
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*", ""));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("rbac:user:*", "rbac:user:42:permissions"));
        assert!(glob_match("rbac:user:*:permissions", "rbac:user:42:permissions"));
        assert!(!glob_match("rbac:user:*:roles", "rbac:user:42:permissions"));
        assert!(glob_match("session:?", "session:a"));
        assert!(!glob_match("session:?", "session:ab"));
        assert!(glob_match("a*b*c", "axxbyyc"));
        assert!(!glob_match("a*b*c", "axxbyy"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("exact", "exactly"));
    }

    #[test]
    fn test_counter_encoding() {
        assert_eq!(encode_counter(-12), b"-12".to_vec());
        assert_eq!(decode_counter("k", b"41").unwrap(), 41);
        let err = decode_counter("k", b"forty").unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidInput);
    }

    #[test]
    fn test_delta_overflow() {
        assert_eq!(apply_delta("k", 1, 2).unwrap(), 3);
        assert!(apply_delta("k", i64::MAX, 1).is_err());
    }

    #[test]
    fn test_hit_rate() {
        let mut stats = CacheStats {
            hits: 3,
            misses: 1,
            ..Default::default()
        };
        stats.calculate_hit_rate();
        assert!((stats.hit_rate - 0.75).abs() < f64::EPSILON);
    }
}
