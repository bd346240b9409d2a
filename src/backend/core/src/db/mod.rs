//! Database layer for Gatehouse.
//!
//! Uses PostgreSQL for the permission store with sqlx. Schema changes live in
//! `migrations/` and are embedded at compile time.

use serde::Serialize;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::config::DatabaseConfig;
use crate::error::Result;

/// Snapshot of the connection pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    /// Open connections.
    pub size: u32,
    /// Connections waiting in the pool.
    pub idle: u32,
    /// Connections checked out.
    pub active: u32,
    pub max_connections: u32,
}

/// Database connection pool.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    max_connections: u32,
}

impl Database {
    /// Create a new database connection pool.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.url)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to connect to database");
                e
            })?;

        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Database pool ready"
        );
        Ok(Self {
            pool,
            max_connections: config.max_connections,
        })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        let max_connections = pool.options().get_max_connections();
        Self {
            pool,
            max_connections,
        }
    }

    /// Run pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        let start = Instant::now();
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!(error = %e, "Database migration failed");
                e
            })?;
        info!(
            duration_ms = start.elapsed().as_millis() as u64,
            "Database migrations completed"
        );
        Ok(())
    }

    /// Round-trip a trivial query. Returns the observed latency.
    pub async fn ping(&self) -> Result<Duration> {
        let start = Instant::now();
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                error!(error = %e, "Database connectivity check failed");
                e
            })?;
        let latency = start.elapsed();
        if latency > Duration::from_millis(100) {
            warn!(
                latency_ms = latency.as_millis() as u64,
                "Database connectivity check latency is high"
            );
        }
        Ok(latency)
    }

    pub fn pool_stats(&self) -> PoolStats {
        let size = self.pool.size();
        let idle = self.pool.num_idle() as u32;
        PoolStats {
            size,
            idle,
            active: size.saturating_sub(idle),
            max_connections: self.max_connections,
        }
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Close every connection. Later queries fail with `DatabaseConnectionFailed`.
    pub async fn close(&self) {
        self.pool.close().await;
        info!("Database pool closed");
    }
}
