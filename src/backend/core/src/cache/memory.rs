//! In-process cache tier (L1).
//!
//! Entries live in a slab-backed doubly-linked list ordered by last access,
//! indexed by a `HashMap` from key to slot. Lookup, touch, insert and LRU
//! eviction are all O(1). One mutex guards the index and the list together;
//! nothing inside the critical section awaits.
//!
//! `get`, `set`, `increment` and `expire` count as accesses. `exists`, `ttl`
//! and `keys` do not reorder the list.

use super::backend::{
    apply_delta, closed_error, decode_counter, encode_counter, glob_match, CacheBackend,
    CacheStats, CacheTtl,
};
use crate::error::{GatehouseError, Result};
use crate::lifecycle::PeriodicTask;
use async_trait::async_trait;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

const BACKEND: &str = "memory";

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for the memory tier.
#[derive(Debug, Clone, Deserialize)]
pub struct MemoryCacheConfig {
    /// Maximum number of entries; 0 disables LRU eviction
    #[serde(default = "default_max_size")]
    pub max_size: usize,

    /// TTL applied for `CacheTtl::Default`; zero means no expiry
    #[serde(default = "default_ttl", with = "humantime_serde")]
    pub default_ttl: Duration,

    /// Interval of the background TTL sweep; zero disables it
    #[serde(default = "default_cleanup_interval", with = "humantime_serde")]
    pub cleanup_interval: Duration,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            default_ttl: default_ttl(),
            cleanup_interval: default_cleanup_interval(),
        }
    }
}

impl MemoryCacheConfig {
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }
}

fn default_max_size() -> usize {
    10_000
}

fn default_ttl() -> Duration {
    Duration::from_secs(300)
}

fn default_cleanup_interval() -> Duration {
    Duration::from_secs(60)
}

// ═══════════════════════════════════════════════════════════════════════════════
// LRU Store
// ═══════════════════════════════════════════════════════════════════════════════

struct Node {
    key: String,
    value: Vec<u8>,
    expires_at: Option<Instant>,
    prev: Option<usize>,
    next: Option<usize>,
}

impl Node {
    fn vacant() -> Self {
        Self {
            key: String::new(),
            value: Vec::new(),
            expires_at: None,
            prev: None,
            next: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Index plus access-ordered list. `head` is most recently used.
///
/// Slots listed in `free` hold vacant nodes and are never reachable from
/// `index` or the list.
#[derive(Default)]
struct LruStore {
    index: HashMap<String, usize>,
    slots: Vec<Node>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    /// Lower bound on the earliest expiry held; exact after a sweep.
    earliest_expiry: Option<Instant>,
}

impl LruStore {
    fn len(&self) -> usize {
        self.index.len()
    }

    fn node(&self, idx: usize) -> &Node {
        &self.slots[idx]
    }

    fn node_mut(&mut self, idx: usize) -> &mut Node {
        &mut self.slots[idx]
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let node = self.node(idx);
            (node.prev, node.next)
        };
        match prev {
            Some(p) => self.node_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.node_mut(n).prev = prev,
            None => self.tail = prev,
        }
        let node = self.node_mut(idx);
        node.prev = None;
        node.next = None;
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let node = self.node_mut(idx);
            node.prev = None;
            node.next = old_head;
        }
        if let Some(h) = old_head {
            self.node_mut(h).prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn touch(&mut self, idx: usize) {
        if self.head != Some(idx) {
            self.unlink(idx);
            self.push_front(idx);
        }
    }

    fn remove_slot(&mut self, idx: usize) -> Node {
        self.unlink(idx);
        let node = std::mem::replace(&mut self.slots[idx], Node::vacant());
        self.index.remove(&node.key);
        self.free.push(idx);
        node
    }

    fn remove(&mut self, key: &str) -> Option<Node> {
        let idx = *self.index.get(key)?;
        Some(self.remove_slot(idx))
    }

    /// Slot of a live entry. An expired entry is removed and reported via `expired`.
    fn live(&mut self, key: &str, now: Instant, expired: &mut u64) -> Option<usize> {
        let idx = *self.index.get(key)?;
        if self.node(idx).is_expired(now) {
            self.remove_slot(idx);
            *expired += 1;
            return None;
        }
        Some(idx)
    }

    fn note_expiry(&mut self, expires_at: Option<Instant>) {
        if let Some(at) = expires_at {
            if self.earliest_expiry.map_or(true, |earliest| at < earliest) {
                self.earliest_expiry = Some(at);
            }
        }
    }

    /// Insert or replace. Returns `(evicted, expired)`: live entries evicted to
    /// make room and expired entries dropped before any live one was.
    fn insert(
        &mut self,
        key: &str,
        value: Vec<u8>,
        expires_at: Option<Instant>,
        max_size: usize,
        now: Instant,
    ) -> (u64, u64) {
        self.note_expiry(expires_at);
        if let Some(&idx) = self.index.get(key) {
            let node = self.node_mut(idx);
            node.value = value;
            node.expires_at = expires_at;
            self.touch(idx);
            return (0, 0);
        }

        let mut evicted = 0;
        let mut expired = 0;
        if max_size > 0 && self.len() >= max_size {
            if self.earliest_expiry.is_some_and(|at| at <= now) {
                expired = self.sweep_expired(now);
                self.note_expiry(expires_at);
            }
            while self.len() >= max_size {
                let Some(lru) = self.tail else { break };
                self.remove_slot(lru);
                evicted += 1;
            }
        }

        let node = Node {
            key: key.to_string(),
            value,
            expires_at,
            prev: None,
            next: None,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = node;
                idx
            }
            None => {
                self.slots.push(node);
                self.slots.len() - 1
            }
        };
        self.index.insert(key.to_string(), idx);
        self.push_front(idx);
        (evicted, expired)
    }

    fn sweep_expired(&mut self, now: Instant) -> u64 {
        let mut expired = Vec::new();
        let mut earliest: Option<Instant> = None;
        for &idx in self.index.values() {
            match self.node(idx).expires_at {
                Some(at) if at <= now => expired.push(idx),
                Some(at) => earliest = Some(earliest.map_or(at, |e| e.min(at))),
                None => {}
            }
        }
        for idx in &expired {
            self.remove_slot(*idx);
        }
        self.earliest_expiry = earliest;
        expired.len() as u64
    }

    fn clear(&mut self) {
        self.index.clear();
        self.slots.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
        self.earliest_expiry = None;
    }

    /// Keys from most to least recently used.
    #[cfg(test)]
    fn order(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.len());
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            let node = self.node(idx);
            out.push(node.key.clone());
            cursor = node.next;
        }
        out
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Memory Cache
// ═══════════════════════════════════════════════════════════════════════════════

struct MemoryInner {
    store: Mutex<LruStore>,
    config: MemoryCacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl MemoryInner {
    fn record_evictions(&self, evicted: u64) {
        if evicted > 0 {
            self.evictions.fetch_add(evicted, Ordering::Relaxed);
            counter!("cache_evictions_total", "backend" => BACKEND).increment(evicted);
        }
    }

    fn record_expirations(&self, expired: u64) {
        if expired > 0 {
            self.expirations.fetch_add(expired, Ordering::Relaxed);
            counter!("cache_expired_total", "backend" => BACKEND).increment(expired);
        }
    }

    fn sweep(&self) -> u64 {
        let (expired, remaining) = {
            let mut store = self.store.lock();
            let expired = store.sweep_expired(Instant::now());
            (expired, store.len())
        };
        self.record_expirations(expired);
        gauge!("cache_entries", "backend" => BACKEND).set(remaining as f64);
        if expired > 0 {
            debug!(expired, remaining, "Memory cache sweep removed expired entries");
        }
        expired
    }
}

/// Bounded in-process cache with LRU eviction, TTL and a background sweep.
pub struct MemoryCache {
    inner: Arc<MemoryInner>,
    cleanup: Option<PeriodicTask>,
    closed: AtomicBool,
}

impl MemoryCache {
    /// Create the tier and, inside a tokio runtime, start the TTL sweep.
    pub fn new(config: MemoryCacheConfig) -> Self {
        let inner = Arc::new(MemoryInner {
            store: Mutex::new(LruStore::default()),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        });

        let sweeper = Arc::downgrade(&inner);
        let cleanup = PeriodicTask::try_spawn(
            "memory-cache-cleanup",
            inner.config.cleanup_interval,
            move || {
                if let Some(inner) = sweeper.upgrade() {
                    inner.sweep();
                }
            },
        );

        Self {
            inner,
            cleanup,
            closed: AtomicBool::new(false),
        }
    }

    /// Create a tier holding at most `max_size` entries with default settings otherwise.
    pub fn with_max_size(max_size: usize) -> Self {
        Self::new(MemoryCacheConfig::default().with_max_size(max_size))
    }

    /// Run one TTL sweep now. Returns the number of entries removed.
    pub fn run_cleanup(&self) -> u64 {
        self.inner.sweep()
    }

    /// Number of entries held, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.inner.store.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the background sweep is running.
    pub fn cleanup_running(&self) -> bool {
        self.cleanup.as_ref().is_some_and(|task| task.is_running())
    }

    pub fn config(&self) -> &MemoryCacheConfig {
        &self.inner.config
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(closed_error(BACKEND));
        }
        Ok(())
    }

    fn expires_at(&self, ttl: CacheTtl) -> Option<Instant> {
        ttl.resolve(self.inner.config.default_ttl)
            .map(|d| Instant::now() + d)
    }

    fn miss(&self, key: &str) -> GatehouseError {
        self.inner.misses.fetch_add(1, Ordering::Relaxed);
        counter!("cache_misses_total", "backend" => BACKEND).increment(1);
        GatehouseError::key_not_found(key)
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    #[instrument(skip(self), level = "trace")]
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let mut expired = 0;
        let value = {
            let mut store = self.inner.store.lock();
            match store.live(key, Instant::now(), &mut expired) {
                Some(idx) => {
                    store.touch(idx);
                    Some(store.node(idx).value.clone())
                }
                None => None,
            }
        };
        self.inner.record_expirations(expired);

        match value {
            Some(value) => {
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                counter!("cache_hits_total", "backend" => BACKEND).increment(1);
                Ok(value)
            }
            None => Err(self.miss(key)),
        }
    }

    #[instrument(skip(self, value), fields(size = value.len()), level = "trace")]
    async fn set(&self, key: &str, value: Vec<u8>, ttl: CacheTtl) -> Result<()> {
        self.ensure_open()?;
        let expires_at = self.expires_at(ttl);
        let (evicted, expired) = self.inner.store.lock().insert(
            key,
            value,
            expires_at,
            self.inner.config.max_size,
            Instant::now(),
        );
        self.inner.record_evictions(evicted);
        self.inner.record_expirations(expired);
        counter!("cache_sets_total", "backend" => BACKEND).increment(1);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.ensure_open()?;
        let removed = self.inner.store.lock().remove(key);
        match removed {
            Some(node) => {
                counter!("cache_deletes_total", "backend" => BACKEND).increment(1);
                Ok(!node.is_expired(Instant::now()))
            }
            None => Ok(false),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.ensure_open()?;
        let store = self.inner.store.lock();
        Ok(store
            .index
            .get(key)
            .is_some_and(|&idx| !store.node(idx).is_expired(Instant::now())))
    }

    async fn clear(&self) -> Result<()> {
        self.ensure_open()?;
        self.inner.store.lock().clear();
        debug!("Memory cache cleared");
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        self.ensure_open()?;
        let now = Instant::now();
        let store = self.inner.store.lock();
        Ok(store
            .index
            .iter()
            .filter(|(key, &idx)| !store.node(idx).is_expired(now) && glob_match(pattern, key))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        self.ensure_open()?;
        let now = Instant::now();
        let mut expired = 0;
        let remaining = {
            let mut store = self.inner.store.lock();
            store
                .live(key, now, &mut expired)
                .map(|idx| store.node(idx).expires_at.map(|at| at.saturating_duration_since(now)))
        };
        self.inner.record_expirations(expired);
        remaining.ok_or_else(|| GatehouseError::key_not_found(key))
    }

    async fn expire(&self, key: &str, ttl: CacheTtl) -> Result<()> {
        self.ensure_open()?;
        let expires_at = self.expires_at(ttl);
        let mut expired = 0;
        let found = {
            let mut store = self.inner.store.lock();
            match store.live(key, Instant::now(), &mut expired) {
                Some(idx) => {
                    store.node_mut(idx).expires_at = expires_at;
                    store.note_expiry(expires_at);
                    store.touch(idx);
                    true
                }
                None => false,
            }
        };
        self.inner.record_expirations(expired);
        if found {
            Ok(())
        } else {
            Err(GatehouseError::key_not_found(key))
        }
    }

    async fn increment(&self, key: &str, delta: i64) -> Result<i64> {
        self.ensure_open()?;
        let mut expired = 0;
        let mut evicted = 0;
        let result = {
            let now = Instant::now();
            let mut store = self.inner.store.lock();
            match store.live(key, now, &mut expired) {
                Some(idx) => {
                    let current = decode_counter(key, &store.node(idx).value)?;
                    let next = apply_delta(key, current, delta)?;
                    store.node_mut(idx).value = encode_counter(next);
                    store.touch(idx);
                    next
                }
                None => {
                    let next = apply_delta(key, 0, delta)?;
                    let (ev, ex) =
                        store.insert(key, encode_counter(next), None, self.inner.config.max_size, now);
                    evicted = ev;
                    expired += ex;
                    next
                }
            }
        };
        self.inner.record_expirations(expired);
        self.inner.record_evictions(evicted);
        Ok(result)
    }

    async fn stats(&self) -> Result<CacheStats> {
        let entries = self.len() as u64;
        let mut stats = CacheStats {
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            entries,
            evictions: self.inner.evictions.load(Ordering::Relaxed),
            expirations: self.inner.expirations.load(Ordering::Relaxed),
            hit_rate: 0.0,
            backend_stats: HashMap::new(),
        };
        stats.calculate_hit_rate();
        stats
            .backend_stats
            .insert("max_size".to_string(), self.inner.config.max_size.to_string());

        gauge!("cache_entries", "backend" => BACKEND).set(entries as f64);

        Ok(stats)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(task) = &self.cleanup {
            task.shutdown().await;
        }
        debug!("Memory cache closed");
        Ok(())
    }

    fn name(&self) -> &'static str {
        BACKEND
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    fn small(max_size: usize) -> MemoryCache {
        MemoryCache::new(
            MemoryCacheConfig::default()
                .with_max_size(max_size)
                .with_cleanup_interval(Duration::ZERO),
        )
    }

    #[test]
    fn test_store_orders_by_access() {
        let mut store = LruStore::default();
        store.insert("a", vec![1], None, 0, Instant::now());
        store.insert("b", vec![2], None, 0, Instant::now());
        store.insert("c", vec![3], None, 0, Instant::now());
        assert_eq!(store.order(), vec!["c", "b", "a"]);

        let idx = store.index["a"];
        store.touch(idx);
        assert_eq!(store.order(), vec!["a", "c", "b"]);

        store.remove("c");
        assert_eq!(store.order(), vec!["a", "b"]);
    }

    #[test]
    fn test_store_reuses_free_slots() {
        let mut store = LruStore::default();
        store.insert("a", vec![], None, 0, Instant::now());
        store.insert("b", vec![], None, 0, Instant::now());
        store.remove("a");
        store.insert("c", vec![], None, 0, Instant::now());
        assert_eq!(store.slots.len(), 2);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_store_evicts_tail() {
        let mut store = LruStore::default();
        let now = Instant::now();
        store.insert("a", vec![], None, 2, now);
        store.insert("b", vec![], None, 2, now);
        let (evicted, expired) = store.insert("c", vec![], None, 2, now);
        assert_eq!((evicted, expired), (1, 0));
        assert_eq!(store.order(), vec!["c", "b"]);
    }

    #[test]
    fn test_store_drops_expired_before_evicting_live() {
        let mut store = LruStore::default();
        let now = Instant::now();
        store.insert("live-old", vec![], None, 2, now);
        store.insert("stale", vec![], Some(now + Duration::from_millis(5)), 2, now);

        let later = now + Duration::from_millis(10);
        let (evicted, expired) = store.insert("new", vec![], None, 2, later);
        assert_eq!((evicted, expired), (0, 1));
        assert_eq!(store.order(), vec!["new", "live-old"]);
        assert_eq!(store.earliest_expiry, None);
    }

    #[tokio::test]
    async fn test_lru_evicts_least_recently_accessed() {
        let cache = small(2);
        cache.set("a", b"1".to_vec(), CacheTtl::Never).await.unwrap();
        cache.set("b", b"2".to_vec(), CacheTtl::Never).await.unwrap();
        cache.get("a").await.unwrap();
        cache.set("c", b"3".to_vec(), CacheTtl::Never).await.unwrap();

        assert!(cache.exists("a").await.unwrap());
        assert!(!cache.exists("b").await.unwrap());
        assert!(cache.exists("c").await.unwrap());
        assert_eq!(cache.stats().await.unwrap().evictions, 1);
    }

    #[tokio::test]
    async fn test_full_cache_reclaims_expired_first() {
        let cache = small(2);
        cache.set("keep", b"1".to_vec(), CacheTtl::Never).await.unwrap();
        cache
            .set("short", b"2".to_vec(), CacheTtl::After(Duration::from_millis(1)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        cache.set("new", b"3".to_vec(), CacheTtl::Never).await.unwrap();
        assert!(cache.exists("keep").await.unwrap());
        assert!(cache.exists("new").await.unwrap());

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.evictions, 0);
        assert_eq!(stats.expirations, 1);
    }

    #[tokio::test]
    async fn test_overwrite_does_not_evict() {
        let cache = small(2);
        cache.set("a", b"1".to_vec(), CacheTtl::Never).await.unwrap();
        cache.set("b", b"2".to_vec(), CacheTtl::Never).await.unwrap();
        cache.set("a", b"3".to_vec(), CacheTtl::Never).await.unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a").await.unwrap(), b"3");
    }

    #[tokio::test]
    async fn test_expired_entry_is_missing() {
        let cache = small(10);
        cache
            .set("k", b"v".to_vec(), CacheTtl::After(Duration::from_millis(1)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let err = cache.get("k").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::KeyNotFound);
        assert!(cache.ttl("k").await.unwrap_err().is_key_not_found());
    }

    #[tokio::test]
    async fn test_run_cleanup_removes_expired() {
        let cache = small(10);
        cache
            .set("short", b"v".to_vec(), CacheTtl::After(Duration::from_millis(1)))
            .await
            .unwrap();
        cache.set("long", b"v".to_vec(), CacheTtl::Never).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.run_cleanup(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().await.unwrap().expirations, 1);
    }

    #[tokio::test]
    async fn test_background_cleanup_runs() {
        let cache = MemoryCache::new(
            MemoryCacheConfig::default().with_cleanup_interval(Duration::from_millis(5)),
        );
        assert!(cache.cleanup_running());
        cache
            .set("k", b"v".to_vec(), CacheTtl::After(Duration::from_millis(1)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.len(), 0);

        cache.close().await.unwrap();
        assert!(!cache.cleanup_running());
    }

    #[tokio::test]
    async fn test_default_and_never_ttl() {
        let cache = MemoryCache::new(
            MemoryCacheConfig::default()
                .with_default_ttl(Duration::from_secs(30))
                .with_cleanup_interval(Duration::ZERO),
        );
        cache.set("d", b"v".to_vec(), CacheTtl::Default).await.unwrap();
        cache.set("n", b"v".to_vec(), CacheTtl::Never).await.unwrap();

        let remaining = cache.ttl("d").await.unwrap().unwrap();
        assert!(remaining <= Duration::from_secs(30));
        assert!(remaining > Duration::from_secs(25));
        assert_eq!(cache.ttl("n").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expire_updates_ttl() {
        let cache = small(10);
        cache.set("k", b"v".to_vec(), CacheTtl::Never).await.unwrap();
        cache
            .expire("k", CacheTtl::After(Duration::from_secs(10)))
            .await
            .unwrap();
        assert!(cache.ttl("k").await.unwrap().is_some());
        assert!(cache
            .expire("missing", CacheTtl::Never)
            .await
            .unwrap_err()
            .is_key_not_found());
    }

    #[tokio::test]
    async fn test_increment_and_decrement() {
        let cache = small(10);
        assert_eq!(cache.increment("hits", 5).await.unwrap(), 5);
        assert_eq!(cache.decrement("hits", 2).await.unwrap(), 3);
        assert_eq!(cache.get("hits").await.unwrap(), b"3");
        assert_eq!(cache.ttl("hits").await.unwrap(), None);

        cache.set("text", b"abc".to_vec(), CacheTtl::Never).await.unwrap();
        let err = cache.increment("text", 1).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidInput);
    }

    #[tokio::test]
    async fn test_increment_keeps_ttl() {
        let cache = small(10);
        cache
            .set("n", b"10".to_vec(), CacheTtl::After(Duration::from_secs(60)))
            .await
            .unwrap();
        assert_eq!(cache.increment("n", 1).await.unwrap(), 11);
        assert!(cache.ttl("n").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_keys_glob() {
        let cache = small(10);
        for key in ["user:1", "user:2", "session:1"] {
            cache.set(key, vec![], CacheTtl::Never).await.unwrap();
        }
        let mut keys = cache.keys("user:*").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["user:1", "user:2"]);
        assert_eq!(cache.keys("*").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_batch_operations() {
        let cache = small(10);
        let mut items = HashMap::new();
        items.insert("a".to_string(), b"1".to_vec());
        items.insert("b".to_string(), b"2".to_vec());
        cache.set_multi(items, CacheTtl::Never).await.unwrap();

        let found = cache
            .get_multi(&["a".to_string(), "missing".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found["a"], b"1");

        cache
            .delete_multi(&["a".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert!(!cache.exists("a").await.unwrap());
        assert!(cache.exists("b").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let cache = small(10);
        cache.set("a", vec![1], CacheTtl::Never).await.unwrap();
        assert!(cache.delete("a").await.unwrap());
        assert!(!cache.delete("a").await.unwrap());

        cache.set("b", vec![1], CacheTtl::Never).await.unwrap();
        cache.clear().await.unwrap();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_closed_cache_rejects_operations() {
        let cache = small(10);
        cache.close().await.unwrap();
        cache.close().await.unwrap();
        let err = cache.get("k").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::CacheClosed);
    }

    #[tokio::test]
    async fn test_stats_hits_and_misses() {
        let cache = small(10);
        cache.set("k", vec![1], CacheTtl::Never).await.unwrap();
        cache.get("k").await.unwrap();
        let _ = cache.get("nope").await;

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
        assert!((stats.hit_rate - 0.5).abs() < 0.01);
    }
}
