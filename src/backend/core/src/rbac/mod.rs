//! Role-Based Access Control (RBAC).
//!
//! This module provides:
//! - **Models**: typed ids, Role, Permission and assignment records
//! - **Permission Store**: the [`PermissionStore`] seam with Postgres and in-memory implementations
//! - **Resolution Engine**: [`RbacService`] answers role/permission checks and mutates the graph
//! - **Predefined Roles**: super-admin, admin and user, seeded at startup
//!
//! A user's effective permissions are the union of everything granted by
//! their roles and their direct grants, deduplicated by permission id.
//!
//! # Usage
//!
//! ```rust,ignore
//! use gatehouse_core::rbac::{PgPermissionStore, RbacConfig, RbacService, UserId};
//!
//! let store = Arc::new(PgPermissionStore::new(db.pool().clone()));
//! let rbac = RbacService::new(store, RbacConfig::default()).with_cache(cache);
//!
//! if !rbac.has_permission(UserId(42), "posts.write").await? {
//!     // respond 403
//! }
//! ```

pub mod memory;
pub mod models;
pub mod postgres;
pub mod roles;
pub mod service;
pub mod store;

pub use memory::MemoryPermissionStore;
pub use models::{
    validate_slug, NewPermission, NewRole, Permission, PermissionId, Role, RoleId, UserId,
    UserPermission, UserRole, MAX_SLUG_LEN,
};
pub use postgres::PgPermissionStore;
pub use roles::PredefinedRole;
pub use service::{RbacConfig, RbacService};
pub use store::PermissionStore;
