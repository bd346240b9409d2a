//! Multi-tier cache orchestrator.
//!
//! Tiers are ordered fastest first. Reads probe in order; a hit below tier 0
//! can be promoted into tier 0. Writes follow the configured policy:
//!
//! - **write-through**: every tier is written before returning; only a tier 0
//!   failure is surfaced
//! - **write-back**: tier 0 is written, slower tiers are updated later
//!
//! Deletes, clears and expiry changes reach every tier, concurrently, before
//! the call returns.
//!
//! Promotion and write-back share one bounded queue served by a single
//! worker task. When the queue is full the job is dropped and counted; the
//! request that produced it still succeeds.
//!
//! Every queued job holds a ticket for its key. A later synchronous write,
//! delete, expiry change or clear revokes the ticket, and the worker skips
//! jobs whose ticket was revoked, so a queued job never overwrites newer state.

use super::backend::{closed_error, CacheBackend, CacheStats, CacheTtl};
use crate::error::{ErrorCode, GatehouseError, Result};
use async_trait::async_trait;
use futures::future::join_all;
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

const BACKEND: &str = "multi_tier";
const KEY_STRIPES: usize = 64;

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════════════════

/// Promotion and write-propagation policy.
#[derive(Debug, Clone, Deserialize)]
pub struct MultiTierConfig {
    /// Copy values found below tier 0 into tier 0
    #[serde(default = "default_true")]
    pub promote_l1: bool,

    /// Write every tier synchronously
    #[serde(default = "default_true")]
    pub write_through: bool,

    /// Write tier 0 synchronously and the rest in the background
    #[serde(default)]
    pub write_back: bool,

    /// Capacity of the promotion/write-back queue
    #[serde(default = "default_queue_capacity")]
    pub propagation_queue_capacity: usize,
}

impl Default for MultiTierConfig {
    fn default() -> Self {
        Self {
            promote_l1: true,
            write_through: true,
            write_back: false,
            propagation_queue_capacity: default_queue_capacity(),
        }
    }
}

impl MultiTierConfig {
    /// Write-back policy with promotion enabled.
    pub fn write_back() -> Self {
        Self {
            write_through: false,
            write_back: true,
            ..Default::default()
        }
    }

    pub fn with_promotion(mut self, promote_l1: bool) -> Self {
        self.promote_l1 = promote_l1;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.propagation_queue_capacity = capacity;
        self
    }

    /// Effective policy. Write-through wins when both flags are set, and is
    /// also used when neither is.
    pub fn write_policy(&self) -> WritePolicy {
        if self.write_back && !self.write_through {
            WritePolicy::WriteBack
        } else {
            WritePolicy::WriteThrough
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_queue_capacity() -> usize {
    1024
}

/// Resolved write policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePolicy {
    WriteThrough,
    WriteBack,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Key Ordering
// ═══════════════════════════════════════════════════════════════════════════════

/// Orders synchronous writes against queued jobs, per key.
///
/// Keys hash onto a fixed set of stripes. Writers and the worker hold the
/// stripe's async lock while touching the tiers. `writes` advances after every
/// completed write on the stripe; `pending` holds the one live ticket per key.
struct KeyGuards {
    stripes: Vec<Stripe>,
    next_ticket: AtomicU64,
}

struct Stripe {
    apply: tokio::sync::Mutex<()>,
    state: Mutex<StripeState>,
}

#[derive(Default)]
struct StripeState {
    writes: u64,
    pending: HashMap<String, u64>,
}

impl KeyGuards {
    fn new() -> Self {
        Self {
            stripes: (0..KEY_STRIPES)
                .map(|_| Stripe {
                    apply: tokio::sync::Mutex::new(()),
                    state: Mutex::new(StripeState::default()),
                })
                .collect(),
            next_ticket: AtomicU64::new(1),
        }
    }

    fn index(key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % KEY_STRIPES as u64) as usize
    }

    fn state(&self, key: &str) -> parking_lot::MutexGuard<'_, StripeState> {
        self.stripes[Self::index(key)].state.lock()
    }

    async fn lock(&self, key: &str) -> MutexGuard<'_, ()> {
        self.stripes[Self::index(key)].apply.lock().await
    }

    /// Locks every stripe the keys map to, in stripe order.
    async fn lock_many<'k>(
        &self,
        keys: impl IntoIterator<Item = &'k str>,
    ) -> Vec<MutexGuard<'_, ()>> {
        let indices: BTreeSet<usize> = keys.into_iter().map(Self::index).collect();
        let mut guards = Vec::with_capacity(indices.len());
        for i in indices {
            guards.push(self.stripes[i].apply.lock().await);
        }
        guards
    }

    async fn lock_all(&self) -> Vec<MutexGuard<'_, ()>> {
        let mut guards = Vec::with_capacity(self.stripes.len());
        for stripe in &self.stripes {
            guards.push(stripe.apply.lock().await);
        }
        guards
    }

    fn ticket(&self) -> u64 {
        self.next_ticket.fetch_add(1, Ordering::Relaxed)
    }

    /// Write position to hand back to [`claim_promotion`](Self::claim_promotion).
    fn snapshot(&self, key: &str) -> u64 {
        self.state(key).writes
    }

    /// Ticket for a promotion of a value read after `seen`, or `None` when the
    /// key was written since or already has a job queued.
    fn claim_promotion(&self, key: &str, seen: u64) -> Option<u64> {
        let mut state = self.state(key);
        if state.writes != seen || state.pending.contains_key(key) {
            return None;
        }
        let ticket = self.ticket();
        state.pending.insert(key.to_string(), ticket);
        Some(ticket)
    }

    /// Record a completed write, revoking any queued job for the key.
    fn written(&self, key: &str) {
        let mut state = self.state(key);
        state.writes += 1;
        state.pending.remove(key);
    }

    /// Record a completed write whose remainder is queued under the returned ticket.
    fn written_with_job(&self, key: &str) -> u64 {
        let ticket = self.ticket();
        let mut state = self.state(key);
        state.writes += 1;
        state.pending.insert(key.to_string(), ticket);
        ticket
    }

    /// Consume `ticket` if it is still the live one for `key`.
    fn take(&self, key: &str, ticket: u64) -> bool {
        let mut state = self.state(key);
        if state.pending.get(key) == Some(&ticket) {
            state.pending.remove(key);
            true
        } else {
            false
        }
    }

    /// Revoke every ticket. Callers hold all stripe locks.
    fn reset(&self) {
        for stripe in &self.stripes {
            let mut state = stripe.state.lock();
            state.writes += 1;
            state.pending.clear();
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Propagation Queue
// ═══════════════════════════════════════════════════════════════════════════════

type Tiers = Arc<Vec<Arc<dyn CacheBackend>>>;

enum Job {
    /// Copy a value read from `source` into tier 0 with the source's remaining TTL.
    Promote {
        key: String,
        value: Vec<u8>,
        source: usize,
        ticket: u64,
    },
    /// Write a value to every tier below tier 0.
    Propagate {
        key: String,
        value: Vec<u8>,
        ttl: CacheTtl,
        ticket: u64,
    },
    /// Barrier: answered once every earlier job has been applied.
    Flush(oneshot::Sender<()>),
}

impl Job {
    fn kind(&self) -> &'static str {
        match self {
            Job::Promote { .. } => "promote",
            Job::Propagate { .. } => "write_back",
            Job::Flush(_) => "flush",
        }
    }

    fn ticket(&self) -> Option<(&str, u64)> {
        match self {
            Job::Promote { key, ticket, .. } | Job::Propagate { key, ticket, .. } => {
                Some((key.as_str(), *ticket))
            }
            Job::Flush(_) => None,
        }
    }
}

async fn run_worker(tiers: Tiers, guards: Arc<KeyGuards>, mut jobs: mpsc::Receiver<Job>) {
    while let Some(job) = jobs.recv().await {
        if let Job::Flush(done) = job {
            let _ = done.send(());
            continue;
        }
        let Some((key, ticket)) = job.ticket().map(|(k, t)| (k.to_string(), t)) else {
            continue;
        };

        let _lock = guards.lock(&key).await;
        if !guards.take(&key, ticket) {
            debug!(key = %key, job = job.kind(), "Superseded cache job skipped");
            continue;
        }
        match job {
            Job::Promote { value, source, .. } => promote(&tiers, &key, value, source).await,
            Job::Propagate { value, ttl, .. } => propagate(&tiers, &key, value, ttl).await,
            Job::Flush(_) => {}
        }
        guards.written(&key);
    }
    debug!("Cache propagation worker stopped");
}

async fn promote(tiers: &Tiers, key: &str, value: Vec<u8>, source: usize) {
    let remaining = match tiers[source].ttl(key).await {
        Ok(remaining) => remaining,
        Err(e) if e.is_key_not_found() => return,
        Err(e) => {
            warn!(key, source, error = %e, "Promotion skipped: could not read TTL");
            return;
        }
    };

    let ttl = match remaining {
        Some(d) if d.is_zero() => return,
        Some(d) => CacheTtl::After(d),
        None => CacheTtl::Never,
    };

    match tiers[0].set(key, value, ttl).await {
        Ok(()) => {
            counter!("cache_promotions_total", "source_tier" => source.to_string()).increment(1);
        }
        Err(e) => {
            counter!("cache_tier_errors_total", "tier" => "0", "operation" => "promote")
                .increment(1);
            warn!(key, error = %e, "Promotion into tier 0 failed");
        }
    }
}

async fn propagate(tiers: &Tiers, key: &str, value: Vec<u8>, ttl: CacheTtl) {
    for (i, tier) in tiers.iter().enumerate().skip(1) {
        match tier.set(key, value.clone(), ttl).await {
            Ok(()) => {
                counter!("cache_write_back_total", "tier" => i.to_string()).increment(1);
            }
            Err(e) => {
                counter!("cache_tier_errors_total", "tier" => i.to_string(), "operation" => "write_back")
                    .increment(1);
                warn!(key, tier = i, error = %e, "Write-back propagation failed");
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Multi-Tier Cache
// ═══════════════════════════════════════════════════════════════════════════════

/// Ordered composition of cache tiers behind the single cache contract.
pub struct MultiTierCache {
    tiers: Tiers,
    guards: Arc<KeyGuards>,
    config: MultiTierConfig,
    queue: RwLock<Option<mpsc::Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
    dropped: AtomicU64,
}

impl MultiTierCache {
    /// Compose `tiers` (fastest first) and start the propagation worker.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(tiers: Vec<Arc<dyn CacheBackend>>, config: MultiTierConfig) -> Result<Self> {
        if tiers.is_empty() {
            return Err(GatehouseError::validation("A multi-tier cache needs at least one tier"));
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            GatehouseError::with_internal(
                ErrorCode::InternalError,
                "Multi-tier cache requires a tokio runtime",
                e.to_string(),
            )
        })?;

        let tiers: Tiers = Arc::new(tiers);
        let guards = Arc::new(KeyGuards::new());
        let (tx, rx) = mpsc::channel(config.propagation_queue_capacity.max(1));
        let worker = runtime.spawn(run_worker(tiers.clone(), guards.clone(), rx));

        info!(
            tiers = ?tiers.iter().map(|t| t.name()).collect::<Vec<_>>(),
            policy = ?config.write_policy(),
            promote_l1 = config.promote_l1,
            "Multi-tier cache ready"
        );

        Ok(Self {
            tiers,
            guards,
            config,
            queue: RwLock::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            closed: AtomicBool::new(false),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    /// Number of tiers.
    pub fn tier_count(&self) -> usize {
        self.tiers.len()
    }

    /// Direct handle on one tier.
    pub fn tier(&self, index: usize) -> Option<Arc<dyn CacheBackend>> {
        self.tiers.get(index).cloned()
    }

    pub fn config(&self) -> &MultiTierConfig {
        &self.config
    }

    /// Jobs dropped because the queue was full.
    pub fn dropped_jobs(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Wait until every promotion and write-back queued before this call has
    /// been applied. Returns immediately once the cache is closed.
    pub async fn flush(&self) -> Result<()> {
        let sender = self.queue.read().clone();
        let Some(sender) = sender else {
            return Ok(());
        };

        let (done_tx, done_rx) = oneshot::channel();
        if sender.send(Job::Flush(done_tx)).await.is_err() {
            return Ok(());
        }
        done_rx
            .await
            .map_err(|_| GatehouseError::internal("Propagation worker exited during flush"))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(closed_error(BACKEND));
        }
        Ok(())
    }

    /// Queue a background job without waiting. A full queue drops the job
    /// and gives its ticket back.
    fn enqueue(&self, job: Job) {
        let queue = self.queue.read();
        let rejected = match queue.as_ref() {
            None => job,
            Some(sender) => match sender.try_send(job) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Full(job)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    let kind = job.kind();
                    counter!("cache_propagation_dropped_total", "job" => kind).increment(1);
                    GatehouseError::new(ErrorCode::BufferFull, "Cache propagation queue is full")
                        .with_context("job", kind)
                        .log();
                    job
                }
                Err(mpsc::error::TrySendError::Closed(job)) => {
                    debug!("Propagation worker gone; job discarded");
                    job
                }
            },
        };

        if let Some((key, ticket)) = rejected.ticket() {
            self.guards.take(key, ticket);
        }
    }

    fn schedule_promotion(&self, key: &str, value: &[u8], source: usize, seen: u64) {
        if !self.config.promote_l1 {
            return;
        }
        if let Some(ticket) = self.guards.claim_promotion(key, seen) {
            self.enqueue(Job::Promote {
                key: key.to_string(),
                value: value.to_vec(),
                source,
                ticket,
            });
        }
    }

    /// Caller holds the key's stripe lock.
    fn schedule_write_back(&self, key: String, value: Vec<u8>, ttl: CacheTtl) {
        let ticket = self.guards.written_with_job(&key);
        self.enqueue(Job::Propagate { key, value, ttl, ticket });
    }

    /// Copy the value of the first tier holding `key` into the slowest tier,
    /// keeping its remaining TTL. Caller holds the key's stripe lock.
    async fn seed_last_tier(&self, key: &str) -> Result<()> {
        let last = self.tiers.len() - 1;
        for (i, tier) in self.tiers.iter().enumerate() {
            let remaining = match tier.ttl(key).await {
                Ok(remaining) => remaining,
                Err(e) if e.is_key_not_found() => continue,
                Err(e) => {
                    self.tier_error(i, "increment_seed", key, &e);
                    continue;
                }
            };
            if i == last {
                return Ok(());
            }
            let ttl = match remaining {
                Some(d) if d.is_zero() => continue,
                Some(d) => CacheTtl::After(d),
                None => CacheTtl::Never,
            };
            let value = match tier.get(key).await {
                Ok(value) => value,
                Err(e) if e.is_key_not_found() => continue,
                Err(e) => {
                    self.tier_error(i, "increment_seed", key, &e);
                    continue;
                }
            };
            debug!(key, source = i, "Seeding counter in slowest tier");
            return self.tiers[last].set(key, value, ttl).await;
        }
        Ok(())
    }

    fn tier_error(&self, tier: usize, operation: &'static str, key: &str, error: &GatehouseError) {
        counter!("cache_tier_errors_total", "tier" => tier.to_string(), "operation" => operation)
            .increment(1);
        warn!(tier, backend = self.tiers[tier].name(), operation, key, error = %error, "Cache tier error");
    }

    /// Run `op` on every tier concurrently, returning every result in tier order.
    async fn on_all_tiers<'a, T, F, Fut>(&'a self, op: F) -> Vec<Result<T>>
    where
        F: Fn(&'a Arc<dyn CacheBackend>) -> Fut,
        Fut: std::future::Future<Output = Result<T>> + 'a,
    {
        join_all(self.tiers.iter().map(op)).await
    }
}

/// First error among `results`, after every tier was attempted.
fn first_error<T>(results: Vec<Result<T>>) -> Result<Vec<T>> {
    let mut values = Vec::with_capacity(results.len());
    let mut error = None;
    for result in results {
        match result {
            Ok(value) => values.push(value),
            Err(e) => {
                error.get_or_insert(e);
            }
        }
    }
    error.map_or(Ok(values), Err)
}

#[async_trait]
impl CacheBackend for MultiTierCache {
    #[instrument(skip(self), level = "trace")]
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let seen = self.guards.snapshot(key);
        let mut failure = None;

        for (i, tier) in self.tiers.iter().enumerate() {
            match tier.get(key).await {
                Ok(value) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    counter!("cache_hits_total", "backend" => BACKEND, "tier" => i.to_string())
                        .increment(1);
                    if i > 0 {
                        self.schedule_promotion(key, &value, i, seen);
                    }
                    return Ok(value);
                }
                Err(e) if e.is_key_not_found() => {}
                Err(e) => {
                    self.tier_error(i, "get", key, &e);
                    failure.get_or_insert(e);
                }
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        counter!("cache_misses_total", "backend" => BACKEND).increment(1);
        Err(failure.unwrap_or_else(|| GatehouseError::key_not_found(key)))
    }

    #[instrument(skip(self, value), fields(size = value.len()), level = "trace")]
    async fn set(&self, key: &str, value: Vec<u8>, ttl: CacheTtl) -> Result<()> {
        self.ensure_open()?;
        let _lock = self.guards.lock(key).await;

        match self.config.write_policy() {
            WritePolicy::WriteThrough => {
                self.tiers[0].set(key, value.clone(), ttl).await?;
                for (i, tier) in self.tiers.iter().enumerate().skip(1) {
                    if let Err(e) = tier.set(key, value.clone(), ttl).await {
                        self.tier_error(i, "set", key, &e);
                    }
                }
                self.guards.written(key);
            }
            WritePolicy::WriteBack => {
                self.tiers[0].set(key, value.clone(), ttl).await?;
                if self.tiers.len() > 1 {
                    self.schedule_write_back(key.to_string(), value, ttl);
                } else {
                    self.guards.written(key);
                }
            }
        }

        counter!("cache_sets_total", "backend" => BACKEND).increment(1);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.ensure_open()?;
        let _lock = self.guards.lock(key).await;
        let results = self.on_all_tiers(|tier| tier.delete(key)).await;
        self.guards.written(key);
        let existed = first_error(results)?;
        Ok(existed.into_iter().any(|e| e))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.ensure_open()?;
        let mut failure = None;
        for (i, tier) in self.tiers.iter().enumerate() {
            match tier.exists(key).await {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(e) => {
                    self.tier_error(i, "exists", key, &e);
                    failure.get_or_insert(e);
                }
            }
        }
        failure.map_or(Ok(false), Err)
    }

    async fn clear(&self) -> Result<()> {
        self.ensure_open()?;
        let _locks = self.guards.lock_all().await;
        let results = self.on_all_tiers(|tier| tier.clear()).await;
        self.guards.reset();
        first_error(results)?;
        info!("Cleared all cache tiers");
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        self.ensure_open()?;
        let results = self.on_all_tiers(|tier| tier.keys(pattern)).await;
        let union: BTreeSet<String> = first_error(results)?.into_iter().flatten().collect();
        Ok(union.into_iter().collect())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        self.ensure_open()?;
        let mut failure = None;
        for (i, tier) in self.tiers.iter().enumerate() {
            match tier.ttl(key).await {
                Ok(remaining) => return Ok(remaining),
                Err(e) if e.is_key_not_found() => {}
                Err(e) => {
                    self.tier_error(i, "ttl", key, &e);
                    failure.get_or_insert(e);
                }
            }
        }
        Err(failure.unwrap_or_else(|| GatehouseError::key_not_found(key)))
    }

    /// A write-back still queued for `key` is revoked, so the slower tiers
    /// never receive the value under its old TTL.
    async fn expire(&self, key: &str, ttl: CacheTtl) -> Result<()> {
        self.ensure_open()?;
        let _lock = self.guards.lock(key).await;
        let results = self.on_all_tiers(|tier| tier.expire(key, ttl)).await;
        self.guards.written(key);

        let mut found = false;
        let mut failure = None;
        for result in results {
            match result {
                Ok(()) => found = true,
                Err(e) if e.is_key_not_found() => {}
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }

        match (failure, found) {
            (Some(e), _) => Err(e),
            (None, true) => Ok(()),
            (None, false) => Err(GatehouseError::key_not_found(key)),
        }
    }

    /// Counters live in the slowest tier, which performs the atomic update.
    /// A value only a faster tier holds is copied down first, so counting
    /// starts from what `get` returns. Faster tiers then drop their copy.
    async fn increment(&self, key: &str, delta: i64) -> Result<i64> {
        self.ensure_open()?;
        let _lock = self.guards.lock(key).await;
        let last = self.tiers.len() - 1;

        let result = match self.seed_last_tier(key).await {
            Ok(()) => self.tiers[last].increment(key, delta).await,
            Err(e) => Err(e),
        };
        if result.is_ok() {
            for (i, tier) in self.tiers.iter().enumerate().take(last) {
                if let Err(e) = tier.delete(key).await {
                    self.tier_error(i, "increment_invalidate", key, &e);
                }
            }
        }
        self.guards.written(key);
        result
    }

    async fn get_multi(&self, keys: &[String]) -> Result<HashMap<String, Vec<u8>>> {
        self.ensure_open()?;
        let mut found = HashMap::with_capacity(keys.len());
        let mut remaining: Vec<String> = keys.to_vec();
        let seen: HashMap<&str, u64> = keys
            .iter()
            .map(|k| (k.as_str(), self.guards.snapshot(k)))
            .collect();
        let mut failure = None;

        for (i, tier) in self.tiers.iter().enumerate() {
            if remaining.is_empty() {
                break;
            }
            match tier.get_multi(&remaining).await {
                Ok(hits) => {
                    remaining.retain(|k| !hits.contains_key(k));
                    for (key, value) in hits {
                        if i > 0 {
                            if let Some(&seen) = seen.get(key.as_str()) {
                                self.schedule_promotion(&key, &value, i, seen);
                            }
                        }
                        found.insert(key, value);
                    }
                }
                Err(e) => {
                    self.tier_error(i, "get_multi", "*", &e);
                    failure.get_or_insert(e);
                }
            }
        }

        self.hits.fetch_add(found.len() as u64, Ordering::Relaxed);
        self.misses.fetch_add(remaining.len() as u64, Ordering::Relaxed);

        match failure {
            Some(e) if !remaining.is_empty() => Err(e),
            _ => Ok(found),
        }
    }

    async fn set_multi(&self, items: HashMap<String, Vec<u8>>, ttl: CacheTtl) -> Result<()> {
        self.ensure_open()?;
        let _locks = self.guards.lock_many(items.keys().map(String::as_str)).await;

        match self.config.write_policy() {
            WritePolicy::WriteThrough => {
                self.tiers[0].set_multi(items.clone(), ttl).await?;
                for (i, tier) in self.tiers.iter().enumerate().skip(1) {
                    if let Err(e) = tier.set_multi(items.clone(), ttl).await {
                        self.tier_error(i, "set_multi", "*", &e);
                    }
                }
                for key in items.keys() {
                    self.guards.written(key);
                }
            }
            WritePolicy::WriteBack => {
                self.tiers[0].set_multi(items.clone(), ttl).await?;
                for (key, value) in items {
                    if self.tiers.len() > 1 {
                        self.schedule_write_back(key, value, ttl);
                    } else {
                        self.guards.written(&key);
                    }
                }
            }
        }
        Ok(())
    }

    async fn delete_multi(&self, keys: &[String]) -> Result<()> {
        self.ensure_open()?;
        let _locks = self.guards.lock_many(keys.iter().map(String::as_str)).await;
        let results = self.on_all_tiers(|tier| tier.delete_multi(keys)).await;
        for key in keys {
            self.guards.written(key);
        }
        first_error(results)?;
        Ok(())
    }

    async fn stats(&self) -> Result<CacheStats> {
        let mut stats = CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            ..Default::default()
        };

        for (i, tier) in self.tiers.iter().enumerate() {
            let prefix = format!("tier{}.{}", i, tier.name());
            match tier.stats().await {
                Ok(tier_stats) => {
                    if i == 0 {
                        stats.entries = tier_stats.entries;
                    }
                    stats.evictions += tier_stats.evictions;
                    stats.expirations += tier_stats.expirations;
                    stats
                        .backend_stats
                        .insert(format!("{}.hits", prefix), tier_stats.hits.to_string());
                    stats
                        .backend_stats
                        .insert(format!("{}.misses", prefix), tier_stats.misses.to_string());
                    stats
                        .backend_stats
                        .insert(format!("{}.entries", prefix), tier_stats.entries.to_string());
                }
                Err(e) => {
                    stats
                        .backend_stats
                        .insert(format!("{}.error", prefix), e.user_message().to_string());
                }
            }
        }

        stats
            .backend_stats
            .insert("dropped_jobs".to_string(), self.dropped_jobs().to_string());
        stats.calculate_hit_rate();
        Ok(stats)
    }

    /// Drain queued jobs, stop the worker, then close every tier.
    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        // Dropping the last sender lets the worker finish what is queued and exit.
        drop(self.queue.write().take());
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(error = %e, "Cache propagation worker failed");
            }
        }

        let results = self.on_all_tiers(|tier| tier.close()).await;
        first_error(results)?;
        info!("Multi-tier cache closed");
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
    use crate::cache::memory::{MemoryCache, MemoryCacheConfig};

    fn memory() -> Arc<dyn CacheBackend> {
        Arc::new(MemoryCache::new(
            MemoryCacheConfig::default().with_cleanup_interval(Duration::ZERO),
        ))
    }

    fn two_tier(config: MultiTierConfig) -> (MultiTierCache, Arc<dyn CacheBackend>, Arc<dyn CacheBackend>) {
        let l1 = memory();
        let l2 = memory();
        let cache = MultiTierCache::new(vec![l1.clone(), l2.clone()], config).unwrap();
        (cache, l1, l2)
    }

    #[test]
    fn test_write_policy_resolution() {
        assert_eq!(MultiTierConfig::default().write_policy(), WritePolicy::WriteThrough);
        assert_eq!(MultiTierConfig::write_back().write_policy(), WritePolicy::WriteBack);

        let both = MultiTierConfig {
            write_back: true,
            write_through: true,
            ..Default::default()
        };
        assert_eq!(both.write_policy(), WritePolicy::WriteThrough);

        let neither = MultiTierConfig {
            write_back: false,
            write_through: false,
            ..Default::default()
        };
        assert_eq!(neither.write_policy(), WritePolicy::WriteThrough);
    }

    #[tokio::test]
    async fn test_requires_a_tier() {
        let err = MultiTierCache::new(Vec::new(), MultiTierConfig::default()).err().unwrap();
        assert_eq!(err.code(), ErrorCode::ValidationError);
    }

    #[tokio::test]
    async fn test_promotion_keeps_remaining_ttl() {
        let (cache, l1, l2) = two_tier(MultiTierConfig::default());
        l2.set("k", b"v".to_vec(), CacheTtl::After(Duration::from_secs(30)))
            .await
            .unwrap();

        assert_eq!(cache.get("k").await.unwrap(), b"v");
        cache.flush().await.unwrap();

        assert_eq!(l1.get("k").await.unwrap(), b"v");
        let ttl = l1.ttl("k").await.unwrap().unwrap();
        assert!(ttl <= Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_no_promotion_when_disabled() {
        let (cache, l1, l2) = two_tier(MultiTierConfig::default().with_promotion(false));
        l2.set("k", b"v".to_vec(), CacheTtl::Never).await.unwrap();

        cache.get("k").await.unwrap();
        cache.flush().await.unwrap();
        assert!(l1.get("k").await.unwrap_err().is_key_not_found());
    }

    #[tokio::test]
    async fn test_write_through_reaches_every_tier() {
        let (cache, l1, l2) = two_tier(MultiTierConfig::default());
        cache.set("k", b"v".to_vec(), CacheTtl::Never).await.unwrap();
        assert_eq!(l1.get("k").await.unwrap(), b"v");
        assert_eq!(l2.get("k").await.unwrap(), b"v");
    }

    #[tokio::test]
    async fn test_write_back_propagates_after_flush() {
        let (cache, l1, l2) = two_tier(MultiTierConfig::write_back());
        cache.set("k", b"v".to_vec(), CacheTtl::Never).await.unwrap();
        assert_eq!(l1.get("k").await.unwrap(), b"v");

        cache.flush().await.unwrap();
        assert_eq!(l2.get("k").await.unwrap(), b"v");
    }

    #[tokio::test]
    async fn test_delete_reaches_every_tier() {
        let (cache, l1, l2) = two_tier(MultiTierConfig::default());
        l1.set("k", vec![1], CacheTtl::Never).await.unwrap();
        l2.set("k", vec![1], CacheTtl::Never).await.unwrap();

        assert!(cache.delete("k").await.unwrap());
        assert!(!l1.exists("k").await.unwrap());
        assert!(!l2.exists("k").await.unwrap());
        assert!(!cache.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_miss_everywhere_is_key_not_found() {
        let (cache, _, _) = two_tier(MultiTierConfig::default());
        assert!(cache.get("absent").await.unwrap_err().is_key_not_found());
        assert!(cache.ttl("absent").await.unwrap_err().is_key_not_found());
        assert!(cache
            .expire("absent", CacheTtl::Never)
            .await
            .unwrap_err()
            .is_key_not_found());
    }

    #[tokio::test]
    async fn test_increment_seeds_last_tier_and_invalidates_faster() {
        let (cache, l1, l2) = two_tier(MultiTierConfig::default());
        l1.set("n", b"99".to_vec(), CacheTtl::After(Duration::from_secs(60)))
            .await
            .unwrap();

        assert_eq!(cache.increment("n", 2).await.unwrap(), 101);
        assert!(!l1.exists("n").await.unwrap());
        assert_eq!(l2.get("n").await.unwrap(), b"101");
        assert!(l2.ttl("n").await.unwrap().is_some());
        assert_eq!(cache.decrement("n", 1).await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_increment_prefers_fastest_copy() {
        let (cache, l1, l2) = two_tier(MultiTierConfig::default());
        l1.set("n", b"7".to_vec(), CacheTtl::Never).await.unwrap();
        l2.set("n", b"3".to_vec(), CacheTtl::Never).await.unwrap();

        assert_eq!(cache.increment("n", 1).await.unwrap(), 8);
        assert_eq!(cache.get("n").await.unwrap(), b"8");
    }

    #[tokio::test]
    async fn test_increment_starts_at_zero_when_absent() {
        let (cache, _, l2) = two_tier(MultiTierConfig::default());
        assert_eq!(cache.increment("fresh", 5).await.unwrap(), 5);
        assert_eq!(l2.get("fresh").await.unwrap(), b"5");
    }

    #[tokio::test]
    async fn test_stale_promotion_does_not_overwrite_set() {
        let (cache, l1, l2) = two_tier(MultiTierConfig::default());
        l2.set("k", b"old".to_vec(), CacheTtl::Never).await.unwrap();

        assert_eq!(cache.get("k").await.unwrap(), b"old");
        cache.set("k", b"new".to_vec(), CacheTtl::Never).await.unwrap();
        cache.flush().await.unwrap();

        assert_eq!(cache.get("k").await.unwrap(), b"new");
        assert_eq!(l1.get("k").await.unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_delete_revokes_queued_write_back() {
        let (cache, _, l2) = two_tier(MultiTierConfig::write_back());
        cache.set("k", b"v".to_vec(), CacheTtl::Never).await.unwrap();
        cache.delete("k").await.unwrap();
        cache.flush().await.unwrap();

        assert!(cache.get("k").await.unwrap_err().is_key_not_found());
        assert!(!l2.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_multi_revokes_queued_write_back() {
        let (cache, _, l2) = two_tier(MultiTierConfig::write_back());
        let items: HashMap<String, Vec<u8>> =
            [("a".to_string(), vec![1]), ("b".to_string(), vec![2])].into();
        cache.set_multi(items, CacheTtl::Never).await.unwrap();
        cache.delete_multi(&["a".to_string()]).await.unwrap();
        cache.flush().await.unwrap();

        assert!(!l2.exists("a").await.unwrap());
        assert_eq!(l2.get("b").await.unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn test_latest_write_back_wins() {
        let (cache, _, l2) = two_tier(MultiTierConfig::write_back());
        cache.set("k", b"1".to_vec(), CacheTtl::Never).await.unwrap();
        cache.set("k", b"2".to_vec(), CacheTtl::Never).await.unwrap();
        cache.flush().await.unwrap();
        assert_eq!(l2.get("k").await.unwrap(), b"2");
    }

    #[test]
    fn test_key_guard_tickets() {
        let guards = KeyGuards::new();
        let seen = guards.snapshot("k");

        let ticket = guards.claim_promotion("k", seen).unwrap();
        assert!(guards.claim_promotion("k", seen).is_none());
        assert!(guards.take("k", ticket));
        assert!(!guards.take("k", ticket));

        guards.written("k");
        assert!(guards.claim_promotion("k", seen).is_none());

        let queued = guards.written_with_job("k");
        guards.reset();
        assert!(!guards.take("k", queued));
    }

    #[tokio::test]
    async fn test_keys_union() {
        let (cache, l1, l2) = two_tier(MultiTierConfig::default());
        l1.set("a:1", vec![], CacheTtl::Never).await.unwrap();
        l2.set("a:1", vec![], CacheTtl::Never).await.unwrap();
        l2.set("a:2", vec![], CacheTtl::Never).await.unwrap();
        assert_eq!(cache.keys("a:*").await.unwrap(), vec!["a:1", "a:2"]);
    }

    #[tokio::test]
    async fn test_get_multi_across_tiers() {
        let (cache, l1, l2) = two_tier(MultiTierConfig::default());
        l1.set("a", b"1".to_vec(), CacheTtl::Never).await.unwrap();
        l2.set("b", b"2".to_vec(), CacheTtl::Never).await.unwrap();

        let keys = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let found = cache.get_multi(&keys).await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found["b"], b"2");

        cache.flush().await.unwrap();
        assert_eq!(l1.get("b").await.unwrap(), b"2");
    }

    #[tokio::test]
    async fn test_full_queue_drops_jobs() {
        let (cache, _, l2) = two_tier(MultiTierConfig::write_back().with_queue_capacity(1));
        for i in 0..64 {
            cache
                .set(&format!("k{}", i), vec![1], CacheTtl::Never)
                .await
                .unwrap();
        }
        cache.flush().await.unwrap();

        let propagated = l2.keys("k*").await.unwrap().len() as u64;
        assert_eq!(propagated + cache.dropped_jobs(), 64);
    }

    #[tokio::test]
    async fn test_close_drains_and_rejects() {
        let (cache, _, l2) = two_tier(MultiTierConfig::write_back());
        cache.set("k", b"v".to_vec(), CacheTtl::Never).await.unwrap();
        cache.close().await.unwrap();

        let err = cache.get("k").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::CacheClosed);
        let err = l2.get("k").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::CacheClosed);
        cache.flush().await.unwrap();
    }
}
