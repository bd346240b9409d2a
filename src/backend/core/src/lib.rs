#![allow(clippy::result_large_err)]
//! # Gatehouse Core
//!
//! Permission resolution and multi-tier caching for backend services.
//!
//! ## Architecture
//!
//! - **RBAC**: role/permission graph resolution, membership checks and transactional role edits
//! - **Cache**: memory LRU tier, Redis tier and an orchestrator with promotion and write policies
//! - **Rate Limiting**: per-key token buckets with an owned idle sweep
//! - **Persistence**: Postgres permission store with embedded migrations
//! - **Telemetry**: structured logging and Prometheus metrics
//! - **Lifecycle**: periodic tasks, deadlines and cancellation for every async operation

pub mod app;
pub mod cache;
pub mod config;
pub mod db;
pub mod deadline;
pub mod error;
pub mod lifecycle;
pub mod ratelimit;
pub mod rbac;
pub mod telemetry;

pub use error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, GatehouseError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::app::App;
    pub use crate::cache::{
        build_cache, Cache, CacheBackend, CacheSettings, CacheStats, CacheTtl, MemoryCache,
        MemoryCacheConfig, MultiTierCache, MultiTierConfig, RedisCache, RedisCacheConfig,
        WritePolicy,
    };
    pub use crate::config::{Config, DatabaseConfig};
    pub use crate::db::Database;
    pub use crate::deadline::{with_cancellation, with_deadline, with_timeout};
    pub use crate::error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, GatehouseError, Result};
    pub use crate::lifecycle::PeriodicTask;
    pub use crate::ratelimit::{RateLimitConfig, RateLimiter};
    pub use crate::rbac::{
        MemoryPermissionStore, NewPermission, NewRole, Permission, PermissionId, PermissionStore,
        PgPermissionStore, PredefinedRole, RbacConfig, RbacService, Role, RoleId, UserId,
    };
    pub use crate::telemetry::{init_telemetry, TelemetryConfig, TelemetryHandle};
}
