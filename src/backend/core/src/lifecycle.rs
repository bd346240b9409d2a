//! Periodic background tasks owned by a component's lifecycle.
//!
//! A [`PeriodicTask`] is started by its owner's constructor and stopped by the
//! owner's `close()`. Dropping the task cancels it as well, so a forgotten
//! `close()` never leaves a timer running against a dead component.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A closure run on a fixed interval until cancelled.
pub struct PeriodicTask {
    name: &'static str,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicTask {
    /// Spawn `tick` every `period` on the current tokio runtime.
    ///
    /// Returns `None` when `period` is zero or when called outside a runtime;
    /// the owner then relies on explicit sweeps.
    pub fn try_spawn<F>(name: &'static str, period: Duration, tick: F) -> Option<Self>
    where
        F: FnMut() + Send + 'static,
    {
        if period.is_zero() {
            debug!(task = name, "Periodic task disabled (zero interval)");
            return None;
        }

        let Ok(runtime) = Handle::try_current() else {
            warn!(task = name, "No tokio runtime; periodic task not started");
            return None;
        };

        Some(Self::spawn_on(&runtime, name, period, tick))
    }

    /// Spawn `tick` every `period` on the given runtime.
    ///
    /// The first tick fires one full period after spawning.
    pub fn spawn_on<F>(runtime: &Handle, name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = runtime.spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => tick(),
                }
            }

            debug!(task = name, "Periodic task stopped");
        });

        debug!(task = name, period_ms = period.as_millis() as u64, "Periodic task started");

        Self {
            name,
            cancel,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Name given at spawn time.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the task is still scheduled.
    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Signal the task to stop without waiting for it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancel the task and wait for it to exit. Idempotent.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    warn!(task = self.name, error = %e, "Periodic task panicked");
                }
            }
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for PeriodicTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicTask")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_ticks_until_shutdown() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let task = PeriodicTask::try_spawn("test", Duration::from_millis(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        task.shutdown().await;
        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 1);
        assert!(!task.is_running());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn test_zero_period_is_disabled() {
        assert!(PeriodicTask::try_spawn("noop", Duration::ZERO, || {}).is_none());
    }

    #[test]
    fn test_outside_runtime_is_disabled() {
        assert!(PeriodicTask::try_spawn("noop", Duration::from_secs(1), || {}).is_none());
    }

    #[tokio::test]
    async fn test_shutdown_twice() {
        let task = PeriodicTask::try_spawn("twice", Duration::from_secs(60), || {}).unwrap();
        task.shutdown().await;
        task.shutdown().await;
        assert_eq!(task.name(), "twice");
    }
}
