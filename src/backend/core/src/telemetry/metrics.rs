//! Prometheus metrics for cache tiers, the RBAC engine and the rate limiter.
//!
//! Instrumented code calls the `metrics` facade directly
//! (`counter!("cache_hits_total", "backend" => "memory")`). This module only
//! installs the recorder and registers descriptions.
//!
//! # Example
//!
//! ```rust,no_run
//! use gatehouse_core::telemetry::metrics::{init_metrics, MetricsConfig};
//!
//! let registry = init_metrics(&MetricsConfig::default(), "gatehouse").unwrap();
//! println!("{}", registry.render());
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// When set, serve `/metrics` over HTTP on this address (e.g. "0.0.0.0:9090").
    /// When unset the recorder is installed and callers render on demand.
    #[serde(default)]
    pub listen: Option<String>,

    /// Histogram buckets for operation durations (in seconds)
    #[serde(default = "default_duration_buckets")]
    pub duration_buckets: Vec<f64>,

    /// Global labels to add to all metrics
    #[serde(default)]
    pub global_labels: HashMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: None,
            duration_buckets: default_duration_buckets(),
            global_labels: HashMap::new(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_duration_buckets() -> Vec<f64> {
    vec![
        0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
    ]
}

/// Handle on the installed Prometheus recorder.
pub struct MetricsRegistry {
    prometheus_handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("prometheus_handle", &self.prometheus_handle.is_some())
            .finish()
    }
}

impl MetricsRegistry {
    /// A registry with no recorder attached.
    pub fn disabled() -> Self {
        Self {
            prometheus_handle: None,
        }
    }

    /// Whether a recorder is installed.
    pub fn is_enabled(&self) -> bool {
        self.prometheus_handle.is_some()
    }

    /// Render all metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.prometheus_handle
            .as_ref()
            .map(|h| h.render())
            .unwrap_or_default()
    }
}

/// Install the Prometheus recorder.
///
/// # Errors
///
/// Returns an error if the buckets are invalid, the listen address does not
/// parse, or a global recorder is already installed.
pub fn init_metrics(config: &MetricsConfig, service_name: &str) -> anyhow::Result<MetricsRegistry> {
    if !config.enabled {
        return Ok(MetricsRegistry::disabled());
    }

    let mut builder = PrometheusBuilder::new().add_global_label("service", service_name);

    for (key, value) in &config.global_labels {
        builder = builder.add_global_label(key, value);
    }

    builder = builder.set_buckets(&config.duration_buckets)?;

    let handle = match &config.listen {
        Some(listen) => {
            let addr: SocketAddr = listen.parse()?;
            let runtime = tokio::runtime::Handle::try_current()?;
            let (recorder, exporter) = builder.with_http_listener(addr).build()?;
            let handle = recorder.handle();
            metrics::set_global_recorder(recorder)
                .map_err(|_| anyhow::anyhow!("a metrics recorder is already installed"))?;
            runtime.spawn(exporter);
            handle
        }
        None => builder.install_recorder()?,
    };

    register_metric_descriptions();

    tracing::info!(
        service_name = %service_name,
        listen = ?config.listen,
        "Metrics initialized"
    );

    Ok(MetricsRegistry {
        prometheus_handle: Some(handle),
    })
}

/// Register all metric descriptions.
fn register_metric_descriptions() {
    // Cache
    describe_counter!("cache_hits_total", "Cache hits by backend");
    describe_counter!("cache_misses_total", "Cache misses by backend");
    describe_counter!("cache_sets_total", "Cache writes by backend");
    describe_counter!("cache_deletes_total", "Cache deletes by backend");
    describe_counter!("cache_evictions_total", "Entries evicted by LRU pressure");
    describe_counter!("cache_expired_total", "Entries removed by TTL expiry");
    describe_gauge!("cache_entries", "Entries currently held by the memory tier");
    describe_counter!("cache_promotions_total", "Values promoted into tier 0");
    describe_counter!(
        "cache_write_back_total",
        "Values propagated to slower tiers after a write-back set"
    );
    describe_counter!(
        "cache_propagation_dropped_total",
        "Promotion or write-back jobs dropped because the queue was full"
    );
    describe_counter!(
        "cache_tier_errors_total",
        "Errors from non-critical tiers that were logged, not surfaced"
    );
    describe_histogram!(
        "cache_operation_duration_seconds",
        "Cache operation latency in seconds"
    );

    // RBAC
    describe_counter!("rbac_checks_total", "Permission and role checks by result");
    describe_counter!(
        "rbac_permission_cache_total",
        "Read-through permission cache lookups by outcome"
    );
    describe_histogram!(
        "rbac_store_duration_seconds",
        "Permission store call latency in seconds"
    );

    // Rate limiting
    describe_counter!("rate_limit_decisions_total", "Rate limiter decisions by result");
    describe_gauge!("rate_limit_buckets", "Token buckets currently tracked");

    // Errors
    describe_counter!("gatehouse_errors_total", "Errors constructed, by code and category");
}

/// Records the elapsed time into a histogram when dropped.
#[must_use = "the timer records on drop"]
pub struct OperationTimer {
    metric: &'static str,
    backend: &'static str,
    operation: &'static str,
    start: Instant,
}

impl OperationTimer {
    /// Time one operation against a histogram labelled by backend and operation.
    pub fn start(metric: &'static str, backend: &'static str, operation: &'static str) -> Self {
        Self {
            metric,
            backend,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for OperationTimer {
    fn drop(&mut self) {
        histogram!(
            self.metric,
            "backend" => self.backend,
            "operation" => self.operation
        )
        .record(self.start.elapsed().as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_config_defaults() {
        let config = MetricsConfig::default();
        assert!(config.enabled);
        assert!(config.listen.is_none());
        assert!(!config.duration_buckets.is_empty());
    }

    #[test]
    fn test_disabled_registry_renders_empty() {
        let registry = init_metrics(
            &MetricsConfig {
                enabled: false,
                ..Default::default()
            },
            "test",
        )
        .unwrap();
        assert!(!registry.is_enabled());
        assert_eq!(registry.render(), "");
    }

    #[test]
    fn test_timer_without_recorder_is_noop() {
        let timer = OperationTimer::start("cache_operation_duration_seconds", "memory", "get");
        drop(timer);
    }
}
