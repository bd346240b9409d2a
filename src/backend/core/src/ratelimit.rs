//! Fixed-window token buckets keyed by client.
//!
//! Each key owns a bucket of `max_tokens`. Requests consume tokens; once a
//! full `window` has passed since the last refill, the next request finds the
//! bucket topped back up to `max_tokens`. A sweep owned by the limiter evicts
//! buckets that have sat idle longer than `idle_eviction`.

use dashmap::DashMap;
use metrics::{counter, gauge};
use parking_lot::RwLock;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::lifecycle::PeriodicTask;

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════════════════

/// The `rate_limit` configuration section.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Tokens available per key per window
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u64,

    /// Refill window
    #[serde(default = "default_window", with = "humantime_serde")]
    pub window: Duration,

    /// Buckets untouched for this long are dropped by the sweep
    #[serde(default = "default_idle_eviction", with = "humantime_serde")]
    pub idle_eviction: Duration,

    /// How often the sweep runs (zero disables it)
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,
}

fn default_max_tokens() -> u64 {
    100
}

fn default_window() -> Duration {
    Duration::from_secs(60)
}

fn default_idle_eviction() -> Duration {
    Duration::from_secs(600)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            window: default_window(),
            idle_eviction: default_idle_eviction(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

impl RateLimitConfig {
    pub fn new(max_tokens: u64, window: Duration) -> Self {
        Self {
            max_tokens,
            window,
            ..Default::default()
        }
    }

    pub fn with_idle_eviction(mut self, idle_eviction: Duration) -> Self {
        self.idle_eviction = idle_eviction;
        self
    }

    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Token Bucket
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug)]
struct TokenBucket {
    /// Tokens left in the current window
    tokens: u64,

    /// Start of the current window
    last_refill: Instant,

    /// Last time the bucket was consulted
    last_seen: Instant,
}

impl TokenBucket {
    fn full(max_tokens: u64, now: Instant) -> Self {
        Self {
            tokens: max_tokens,
            last_refill: now,
            last_seen: now,
        }
    }

    fn refill(&mut self, max_tokens: u64, window: Duration, now: Instant) {
        if now.duration_since(self.last_refill) >= window {
            self.tokens = max_tokens;
            self.last_refill = now;
        }
    }

    /// Try to take `n` tokens. Takes nothing on failure.
    fn try_acquire(&mut self, n: u64) -> bool {
        if self.tokens >= n {
            self.tokens -= n;
            true
        } else {
            false
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Rate Limiter
// ═══════════════════════════════════════════════════════════════════════════════

struct LimiterInner {
    config: RateLimitConfig,
    buckets: DashMap<String, RwLock<TokenBucket>>,
}

impl LimiterInner {
    fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now.duration_since(bucket.read().last_seen) < self.config.idle_eviction);
        let evicted = before.saturating_sub(self.buckets.len());
        gauge!("rate_limit_buckets").set(self.buckets.len() as f64);
        if evicted > 0 {
            debug!(evicted, "Evicted idle rate limit buckets");
        }
        evicted
    }
}

/// In-process token-bucket rate limiter, safe to share across tasks.
pub struct RateLimiter {
    inner: Arc<LimiterInner>,
    sweeper: Option<PeriodicTask>,
}

impl RateLimiter {
    /// Create a limiter and, inside a tokio runtime, start its idle sweep.
    pub fn new(config: RateLimitConfig) -> Self {
        let inner = Arc::new(LimiterInner {
            config,
            buckets: DashMap::new(),
        });

        let weak = Arc::downgrade(&inner);
        let sweeper = PeriodicTask::try_spawn(
            "rate-limit-sweep",
            inner.config.sweep_interval,
            move || {
                if let Some(inner) = weak.upgrade() {
                    inner.sweep();
                }
            },
        );

        Self { inner, sweeper }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.inner.config
    }

    /// Consume one token for `key`.
    pub fn allow(&self, key: &str) -> bool {
        self.allow_n(key, 1)
    }

    /// Consume `n` tokens for `key`. Returns false, consuming nothing, when too few remain.
    pub fn allow_n(&self, key: &str, n: u64) -> bool {
        let config = &self.inner.config;
        let now = Instant::now();

        let allowed = {
            let entry = self
                .inner
                .buckets
                .entry(key.to_string())
                .or_insert_with(|| RwLock::new(TokenBucket::full(config.max_tokens, now)));
            let mut bucket = entry.write();
            bucket.last_seen = now;
            bucket.refill(config.max_tokens, config.window, now);
            bucket.try_acquire(n)
        };

        let decision = if allowed { "allowed" } else { "limited" };
        counter!("rate_limit_decisions_total", "decision" => decision).increment(1);
        if !allowed {
            debug!(key, requested = n, "Rate limit exceeded");
        }
        allowed
    }

    /// Tokens `key` could consume right now.
    pub fn remaining(&self, key: &str) -> u64 {
        let config = &self.inner.config;
        match self.inner.buckets.get(key) {
            Some(bucket) => {
                let bucket = bucket.read();
                if Instant::now().duration_since(bucket.last_refill) >= config.window {
                    config.max_tokens
                } else {
                    bucket.tokens
                }
            }
            None => config.max_tokens,
        }
    }

    /// Forget `key`'s bucket; its next request starts full.
    pub fn reset(&self, key: &str) {
        self.inner.buckets.remove(key);
    }

    /// Number of tracked buckets.
    pub fn len(&self) -> usize {
        self.inner.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.buckets.is_empty()
    }

    /// Run one idle-eviction pass now. Returns the number of buckets evicted.
    pub fn sweep(&self) -> usize {
        self.inner.sweep()
    }

    /// Whether the background sweep is running.
    pub fn sweep_running(&self) -> bool {
        self.sweeper.as_ref().is_some_and(|task| task.is_running())
    }

    /// Stop the background sweep. Limiting keeps working.
    pub async fn close(&self) {
        if let Some(task) = &self.sweeper {
            task.shutdown().await;
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
