//! Health check command.
//!
//! Pings the database and reports pool and cache state.

use anyhow::Result;
use clap::Args;
use serde::Serialize;

use gatehouse_core::app::App;
use gatehouse_core::cache::{CacheBackend, CacheStats};
use gatehouse_core::db::PoolStats;

use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct HealthArgs {
    /// Include pool and cache statistics
    #[arg(short, long)]
    detailed: bool,
}

#[derive(Serialize)]
struct HealthReport {
    status: &'static str,
    database_latency_ms: Option<f64>,
    database_error: Option<String>,
    pool: Option<PoolStats>,
    cache_tiers: usize,
    cache: Option<CacheStats>,
}

pub async fn execute(args: HealthArgs, app: &App, format: OutputFormat) -> Result<()> {
    let mut report = HealthReport {
        status: "healthy",
        database_latency_ms: None,
        database_error: None,
        pool: None,
        cache_tiers: app.cache().tier_count(),
        cache: None,
    };

    if let Some(database) = app.database() {
        match database.ping().await {
            Ok(latency) => report.database_latency_ms = Some(latency.as_secs_f64() * 1000.0),
            Err(e) => {
                report.status = "unhealthy";
                report.database_error = Some(e.to_string());
            }
        }
        if args.detailed {
            report.pool = Some(database.pool_stats());
        }
    }
    if args.detailed {
        report.cache = Some(app.cache().stats().await?);
    }

    match format {
        OutputFormat::Table => {
            output::print_header("Gatehouse Health");
            output::print_detail("Status", report.status);
            match (&report.database_latency_ms, &report.database_error) {
                (Some(ms), _) => output::print_detail("Database", &format!("ok ({:.2}ms)", ms)),
                (None, Some(err)) => output::print_detail("Database", err),
                (None, None) => output::print_detail("Database", "not configured"),
            }
            output::print_detail("Cache Tiers", &report.cache_tiers.to_string());

            if let Some(pool) = &report.pool {
                output::print_detail(
                    "Pool",
                    &format!(
                        "{} open, {} idle, {} active (max {})",
                        pool.size, pool.idle, pool.active, pool.max_connections
                    ),
                );
            }
            if let Some(stats) = &report.cache {
                output::print_detail(
                    "Cache",
                    &format!(
                        "{} hits, {} misses ({:.1}% hit rate)",
                        stats.hits,
                        stats.misses,
                        stats.hit_rate * 100.0
                    ),
                );
            }

            if report.status == "healthy" {
                output::print_success("All systems operational");
            } else {
                output::print_error(&format!("System status: {}", report.status));
            }
        }
        _ => output::print_item(&report, format)?,
    }

    Ok(())
}
