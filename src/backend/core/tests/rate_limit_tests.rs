//! Integration tests for the token-bucket rate limiter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gatehouse_core::ratelimit::{RateLimitConfig, RateLimiter};

fn limiter(max_tokens: u64, window: Duration) -> Arc<RateLimiter> {
    Arc::new(RateLimiter::new(
        RateLimitConfig::new(max_tokens, window).with_sweep_interval(Duration::ZERO),
    ))
}

#[tokio::test]
async fn test_concurrent_callers_never_exceed_budget() {
    let limiter = limiter(50, Duration::from_secs(60));
    let allowed = Arc::new(AtomicU64::new(0));

    let mut handles = Vec::new();
    for _ in 0..200 {
        let limiter = limiter.clone();
        let allowed = allowed.clone();
        handles.push(tokio::spawn(async move {
            if limiter.allow("shared") {
                allowed.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(allowed.load(Ordering::SeqCst), 50);
    assert_eq!(limiter.remaining("shared"), 0);
}

#[tokio::test]
async fn test_keys_are_independent() {
    let limiter = limiter(2, Duration::from_secs(60));
    assert!(limiter.allow_n("a", 2));
    assert!(!limiter.allow("a"));
    assert!(limiter.allow_n("b", 2));
    assert_eq!(limiter.len(), 2);
}

#[tokio::test]
async fn test_window_rollover_refills_to_max() {
    let limiter = limiter(3, Duration::from_millis(30));
    assert!(limiter.allow_n("k", 3));
    assert!(!limiter.allow("k"));

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(limiter.remaining("k"), 3);
    assert!(limiter.allow_n("k", 3));
}

#[tokio::test]
async fn test_owned_sweep_stops_on_close() {
    let limiter = RateLimiter::new(
        RateLimitConfig::new(10, Duration::from_secs(60))
            .with_idle_eviction(Duration::from_millis(5))
            .with_sweep_interval(Duration::from_millis(10)),
    );
    assert!(limiter.sweep_running());

    limiter.close().await;
    assert!(!limiter.sweep_running());

    limiter.allow("k");
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(limiter.len(), 1);
    assert_eq!(limiter.sweep(), 1);
}
