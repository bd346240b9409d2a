//! Caller-supplied deadlines and cancellation for store and network calls.
//!
//! Every async operation in this crate can be bounded by wrapping it in one
//! of these helpers. Expiry or cancellation drops the inner future, which is
//! how partial state is avoided: sqlx transactions roll back on drop and the
//! in-process stores apply mutations inside a single critical section.

use crate::error::{GatehouseError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Run `fut` until `deadline`. `None` means no deadline.
pub async fn with_deadline<T, F>(operation: &str, deadline: Option<Instant>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match deadline {
        Some(deadline) => match tokio::time::timeout_at(deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(GatehouseError::timeout(operation)),
        },
        None => fut.await,
    }
}

/// Run `fut` for at most `timeout`. `None` means unbounded.
pub async fn with_timeout<T, F>(operation: &str, timeout: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let deadline = timeout.map(|t| Instant::now() + t);
    with_deadline(operation, deadline, fut).await
}

/// Run `fut` until it completes or `token` is cancelled.
///
/// A token that is already cancelled short-circuits without polling `fut`.
pub async fn with_cancellation<T, F>(
    operation: &str,
    token: &CancellationToken,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if token.is_cancelled() {
        return Err(GatehouseError::cancelled(operation));
    }

    tokio::select! {
        biased;
        _ = token.cancelled() => Err(GatehouseError::cancelled(operation)),
        result = fut => result,
    }
}
