//! Telemetry: structured logging and Prometheus metrics.
//!
//! - **Logging**: `tracing` subscriber with JSON/pretty/compact output
//! - **Metrics**: Prometheus recorder for cache, RBAC and rate limiter metrics
//!
//! # Example
//!
//! ```rust,no_run
//! use gatehouse_core::telemetry::{init_telemetry, TelemetryConfig};
//!
//! let config = TelemetryConfig::default();
//! let handle = init_telemetry(&config).expect("Failed to initialize telemetry");
//! handle.shutdown();
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat, LoggingConfig};
pub use metrics::{init_metrics, MetricsConfig, MetricsRegistry, OperationTimer};

use serde::Deserialize;

/// Unified telemetry configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    /// Service name used as a global metrics label
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Environment (development, staging, production)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            environment: default_environment(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

fn default_service_name() -> String {
    "gatehouse".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

/// Initialize logging and metrics. Call once at process start.
///
/// # Errors
///
/// Returns an error if either component fails to initialize.
pub fn init_telemetry(config: &TelemetryConfig) -> anyhow::Result<TelemetryHandle> {
    init_logging(&config.logging, &config.environment)?;
    let metrics = init_metrics(&config.metrics, &config.service_name)?;

    Ok(TelemetryHandle { metrics })
}

/// Handle for managing telemetry lifecycle.
#[derive(Debug)]
pub struct TelemetryHandle {
    /// Metrics handle for rendering the registry
    pub metrics: MetricsRegistry,
}

impl TelemetryHandle {
    pub fn shutdown(self) {
        ::tracing::info!("Telemetry shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_config_defaults() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "gatehouse");
        assert_eq!(config.environment, "development");
    }

    #[test]
    fn test_telemetry_config_partial_json() {
        let config: TelemetryConfig =
            serde_json::from_str(r#"{"environment":"production","logging":{"level":"warn"}}"#)
                .unwrap();
        assert_eq!(config.environment, "production");
        assert_eq!(config.logging.level, "warn");
        assert!(config.metrics.enabled);
    }
}
