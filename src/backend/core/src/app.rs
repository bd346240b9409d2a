//! Composition root.
//!
//! Every long-lived object is built here, once, and handed out by reference.
//! Nothing in the crate reaches for a global cache, pool or limiter.

use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::cache::{build_cache, Cache, CacheBackend, MultiTierCache};
use crate::config::Config;
use crate::db::Database;
use crate::error::Result;
use crate::ratelimit::RateLimiter;
use crate::rbac::{MemoryPermissionStore, PermissionStore, PgPermissionStore, RbacService};

/// The assembled application services.
pub struct App {
    config: Config,
    database: Option<Database>,
    cache: Arc<MultiTierCache>,
    rbac: RbacService,
    rate_limiter: Arc<RateLimiter>,
}

impl App {
    /// Connect to Postgres, migrate, build the cache tiers and the RBAC engine,
    /// then seed the system roles.
    #[instrument(skip(config))]
    pub async fn bootstrap(config: Config) -> Result<Self> {
        let database = Database::connect(&config.database).await?;
        if config.database.run_migrations {
            database.migrate().await?;
        }
        let store: Arc<dyn PermissionStore> = Arc::new(PgPermissionStore::new(database.pool().clone()));
        Self::assemble(config, Some(database), store).await
    }

    /// Same wiring over a process-local permission store; no database is touched.
    pub async fn in_memory(config: Config) -> Result<Self> {
        let store: Arc<dyn PermissionStore> = Arc::new(MemoryPermissionStore::new());
        Self::assemble(config, None, store).await
    }

    async fn assemble(
        config: Config,
        database: Option<Database>,
        store: Arc<dyn PermissionStore>,
    ) -> Result<Self> {
        let cache = build_cache(&config.cache).await?;
        let shared: Arc<dyn CacheBackend> = cache.clone();

        let rbac = RbacService::new(store, config.rbac.clone()).with_cache(Cache::new(shared, ""));
        if config.rbac.seed_default_roles {
            rbac.seed_default_roles().await?;
        }

        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));

        info!(
            store = rbac.store().name(),
            cache_tiers = cache.tier_count(),
            permission_cache = rbac.is_caching(),
            "Gatehouse services ready"
        );

        Ok(Self {
            config,
            database,
            cache,
            rbac,
            rate_limiter,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The Postgres pool, absent for in-memory apps.
    pub fn database(&self) -> Option<&Database> {
        self.database.as_ref()
    }

    pub fn cache(&self) -> &Arc<MultiTierCache> {
        &self.cache
    }

    /// A typed view of the shared cache under `namespace`.
    pub fn cache_namespace(&self, namespace: &str) -> Cache {
        let backend: Arc<dyn CacheBackend> = self.cache.clone();
        Cache::new(backend, namespace)
    }

    pub fn rbac(&self) -> &RbacService {
        &self.rbac
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// Drain and close the cache, stop the limiter sweep, then close the pool.
    ///
    /// Keeps going past a failing step and returns the first error.
    pub async fn shutdown(self) -> Result<()> {
        info!("Shutting down Gatehouse services");
        let mut first_error = None;

        if let Err(e) = self.cache.close().await {
            warn!(error = %e, "Cache close failed");
            first_error.get_or_insert(e);
        }

        self.rate_limiter.close().await;

        if let Some(database) = &self.database {
            database.close().await;
        }

        first_error.map_or(Ok(()), Err)
    }
}
