//! The seam between the RBAC engine and durable storage.

use async_trait::async_trait;

use super::models::{
    NewPermission, NewRole, Permission, PermissionId, Role, RoleId, UserId,
};
use crate::error::Result;

/// Durable records of roles, permissions and the three link relations.
///
/// Soft-deleted roles are invisible to every read and grant nothing.
/// Implementations must make [`replace_role_permissions`](Self::replace_role_permissions)
/// all-or-nothing.
#[async_trait]
pub trait PermissionStore: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Assignments
    // ─────────────────────────────────────────────────────────────────────────

    /// Link a user to a role. Linking twice leaves one row.
    /// Fails with `RecordNotFound` when the role does not exist.
    async fn insert_user_role(&self, user_id: UserId, role_id: RoleId) -> Result<()>;

    /// Unlink a user from a role. Returns whether a row was removed.
    async fn delete_user_role(&self, user_id: UserId, role_id: RoleId) -> Result<bool>;

    /// Grant a permission directly. Granting twice leaves one row.
    /// Fails with `RecordNotFound` when the permission does not exist.
    async fn insert_user_permission(&self, user_id: UserId, permission_id: PermissionId) -> Result<()>;

    /// Revoke a direct grant. Returns whether a row was removed.
    async fn delete_user_permission(&self, user_id: UserId, permission_id: PermissionId) -> Result<bool>;

    // ─────────────────────────────────────────────────────────────────────────
    // Resolution
    // ─────────────────────────────────────────────────────────────────────────

    async fn user_roles(&self, user_id: UserId) -> Result<Vec<Role>>;

    /// Permissions reachable through the user's roles. May contain duplicates.
    async fn role_derived_permissions(&self, user_id: UserId) -> Result<Vec<Permission>>;

    /// Permissions granted directly to the user.
    async fn direct_permissions(&self, user_id: UserId) -> Result<Vec<Permission>>;

    async fn user_has_role(&self, user_id: UserId, role_slug: &str) -> Result<bool>;

    /// Whether any of the user's roles grants `permission_slug`.
    async fn role_grants_permission(&self, user_id: UserId, permission_slug: &str) -> Result<bool>;

    /// Whether the user holds a direct grant of `permission_slug`.
    async fn direct_grant_exists(&self, user_id: UserId, permission_slug: &str) -> Result<bool>;

    // ─────────────────────────────────────────────────────────────────────────
    // Role / permission catalogue
    // ─────────────────────────────────────────────────────────────────────────

    /// Atomically replace the role's permission set.
    async fn replace_role_permissions(&self, role_id: RoleId, permission_ids: &[PermissionId]) -> Result<()>;

    /// Fails with `DuplicateRecord` when the slug is taken.
    async fn insert_role(&self, role: NewRole) -> Result<Role>;

    /// Fails with `DuplicateRecord` when the slug is taken.
    async fn insert_permission(&self, permission: NewPermission) -> Result<Permission>;

    async fn role_by_id(&self, role_id: RoleId) -> Result<Option<Role>>;

    async fn role_by_slug(&self, slug: &str) -> Result<Option<Role>>;

    async fn permission_by_slug(&self, slug: &str) -> Result<Option<Permission>>;

    async fn list_roles(&self) -> Result<Vec<Role>>;

    async fn list_permissions(&self) -> Result<Vec<Permission>>;

    async fn role_permissions(&self, role_id: RoleId) -> Result<Vec<Permission>>;

    /// Mark a role deleted. Returns whether a live role was found.
    async fn soft_delete_role(&self, role_id: RoleId) -> Result<bool>;

    /// Store name for logs and metrics.
    fn name(&self) -> &'static str;
}
