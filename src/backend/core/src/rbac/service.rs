//! The RBAC resolution engine.
//!
//! [`RbacService`] answers "does user U have permission P" and mutates the
//! role/permission graph. It holds no mutable state of its own: every answer
//! comes from the [`PermissionStore`], optionally through a read-through
//! permission cache.

use metrics::counter;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::models::{
    validate_slug, NewPermission, NewRole, Permission, PermissionId, Role, RoleId, UserId,
};
use super::roles::PredefinedRole;
use super::store::PermissionStore;
use crate::cache::{Cache, CacheTtl};
use crate::deadline;
use crate::error::{ErrorCode, GatehouseError, Result};
use crate::telemetry::metrics::OperationTimer;

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════════════════

/// The `rbac` configuration section.
#[derive(Debug, Clone, Deserialize)]
pub struct RbacConfig {
    /// How long a user's resolved permission set stays cached
    #[serde(default = "default_permission_cache_ttl", with = "humantime_serde")]
    pub permission_cache_ttl: Duration,

    /// Cache resolved permission sets when a cache is available
    #[serde(default = "default_true")]
    pub enable_permission_cache: bool,

    /// Upper bound on every store call (unbounded when absent)
    #[serde(default = "default_query_timeout", with = "humantime_serde")]
    pub query_timeout: Option<Duration>,

    /// Seed the predefined system roles on startup
    #[serde(default = "default_true")]
    pub seed_default_roles: bool,
}

fn default_permission_cache_ttl() -> Duration {
    Duration::from_secs(300)
}

fn default_true() -> bool {
    true
}

fn default_query_timeout() -> Option<Duration> {
    Some(Duration::from_secs(5))
}

impl Default for RbacConfig {
    fn default() -> Self {
        Self {
            permission_cache_ttl: default_permission_cache_ttl(),
            enable_permission_cache: true,
            query_timeout: default_query_timeout(),
            seed_default_roles: true,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Service
// ═══════════════════════════════════════════════════════════════════════════════

/// Cache namespace for resolved permission sets.
const CACHE_NAMESPACE: &str = "rbac";

const EPOCH_SLOTS: usize = 64;

/// Invalidation counters for the permission cache.
///
/// A fill stamps the counters before reading the store and publishes only if
/// no invalidation for that user landed in between. Users share slots, so a
/// collision can only skip a fill.
#[derive(Debug)]
struct CacheEpochs {
    all: AtomicU64,
    users: Box<[AtomicU64]>,
}

impl CacheEpochs {
    fn new() -> Self {
        Self {
            all: AtomicU64::new(0),
            users: (0..EPOCH_SLOTS).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    fn slot(&self, user_id: UserId) -> &AtomicU64 {
        &self.users[user_id.get().rem_euclid(EPOCH_SLOTS as i64) as usize]
    }

    fn stamp(&self, user_id: UserId) -> (u64, u64) {
        (
            self.all.load(Ordering::Acquire),
            self.slot(user_id).load(Ordering::Acquire),
        )
    }

    fn bump_user(&self, user_id: UserId) {
        self.slot(user_id).fetch_add(1, Ordering::AcqRel);
    }

    fn bump_all(&self) {
        self.all.fetch_add(1, Ordering::AcqRel);
    }
}

/// Role/permission resolution and mutation over a [`PermissionStore`].
#[derive(Clone)]
pub struct RbacService {
    store: Arc<dyn PermissionStore>,
    cache: Option<Cache>,
    epochs: Arc<CacheEpochs>,
    config: RbacConfig,
}

impl RbacService {
    /// Create a service without a permission cache.
    pub fn new(store: Arc<dyn PermissionStore>, config: RbacConfig) -> Self {
        Self {
            store,
            cache: None,
            epochs: Arc::new(CacheEpochs::new()),
            config,
        }
    }

    /// Cache resolved permission sets in `cache` (namespaced under `rbac:`).
    ///
    /// Ignored when `enable_permission_cache` is off.
    pub fn with_cache(mut self, cache: Cache) -> Self {
        if self.config.enable_permission_cache {
            self.cache = Some(Cache::new(cache.backend().clone(), CACHE_NAMESPACE));
        }
        self
    }

    pub fn store(&self) -> &Arc<dyn PermissionStore> {
        &self.store
    }

    pub fn config(&self) -> &RbacConfig {
        &self.config
    }

    pub fn is_caching(&self) -> bool {
        self.cache.is_some()
    }

    /// Run one store call under the configured query timeout.
    async fn query<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let _timer = OperationTimer::start("rbac_store_duration_seconds", self.store.name(), operation);
        deadline::with_timeout(operation, self.config.query_timeout, fut).await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Assignments
    // ─────────────────────────────────────────────────────────────────────────

    /// Give `user_id` the role. Assigning twice is a no-op.
    #[instrument(skip(self), fields(user_id = %user_id, role_id = %role_id))]
    pub async fn assign_role(&self, user_id: UserId, role_id: RoleId) -> Result<()> {
        user_id.validate()?;
        role_id.validate()?;
        self.query("insert_user_role", self.store.insert_user_role(user_id, role_id))
            .await?;
        self.invalidate_user(user_id).await;
        info!("Role assigned");
        Ok(())
    }

    /// Take the role away. Removing a missing assignment is not an error.
    #[instrument(skip(self), fields(user_id = %user_id, role_id = %role_id))]
    pub async fn remove_role(&self, user_id: UserId, role_id: RoleId) -> Result<()> {
        user_id.validate()?;
        role_id.validate()?;
        let removed = self
            .query("delete_user_role", self.store.delete_user_role(user_id, role_id))
            .await?;
        self.invalidate_user(user_id).await;
        debug!(removed, "Role removed");
        Ok(())
    }

    /// Grant a permission directly, bypassing roles. Granting twice is a no-op.
    #[instrument(skip(self), fields(user_id = %user_id, permission_id = %permission_id))]
    pub async fn assign_permission(&self, user_id: UserId, permission_id: PermissionId) -> Result<()> {
        user_id.validate()?;
        permission_id.validate()?;
        self.query(
            "insert_user_permission",
            self.store.insert_user_permission(user_id, permission_id),
        )
        .await?;
        self.invalidate_user(user_id).await;
        info!("Permission granted directly");
        Ok(())
    }

    /// Revoke a direct grant. Revoking a missing grant is not an error.
    #[instrument(skip(self), fields(user_id = %user_id, permission_id = %permission_id))]
    pub async fn remove_permission(&self, user_id: UserId, permission_id: PermissionId) -> Result<()> {
        user_id.validate()?;
        permission_id.validate()?;
        let removed = self
            .query(
                "delete_user_permission",
                self.store.delete_user_permission(user_id, permission_id),
            )
            .await?;
        self.invalidate_user(user_id).await;
        debug!(removed, "Direct permission revoked");
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Resolution
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn get_user_roles(&self, user_id: UserId) -> Result<Vec<Role>> {
        user_id.validate()?;
        self.query("user_roles", self.store.user_roles(user_id)).await
    }

    /// Effective permissions: role-derived grants plus direct grants, one entry per permission id.
    ///
    /// Returned in ascending id order.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn get_user_permissions(&self, user_id: UserId) -> Result<Vec<Permission>> {
        user_id.validate()?;

        if let Some(cached) = self.cached_permissions(user_id).await {
            return Ok(cached);
        }
        let stamp = self.epochs.stamp(user_id);

        let from_roles = self
            .query("role_derived_permissions", self.store.role_derived_permissions(user_id))
            .await?;
        let direct = self
            .query("direct_permissions", self.store.direct_permissions(user_id))
            .await?;

        let mut merged: HashMap<PermissionId, Permission> =
            HashMap::with_capacity(from_roles.len() + direct.len());
        for permission in from_roles.into_iter().chain(direct) {
            merged.insert(permission.id, permission);
        }
        let mut permissions: Vec<Permission> = merged.into_values().collect();
        permissions.sort_by_key(|p| p.id);

        self.store_cached_permissions(user_id, &permissions, stamp).await;
        debug!(count = permissions.len(), "Resolved user permissions");
        Ok(permissions)
    }

    /// Whether the user holds a live role with this slug.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn has_role(&self, user_id: UserId, role_slug: &str) -> Result<bool> {
        user_id.validate()?;
        validate_slug(role_slug)?;
        let found = self
            .query("user_has_role", self.store.user_has_role(user_id, role_slug))
            .await?;
        record_check("role", found);
        Ok(found)
    }

    /// Whether the user has the permission through a role or a direct grant.
    ///
    /// A store failure is returned as an error, never as `false`, so callers
    /// can fail closed on their own terms.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn has_permission(&self, user_id: UserId, permission_slug: &str) -> Result<bool> {
        user_id.validate()?;
        validate_slug(permission_slug)?;

        // Most grants come through roles; check those first.
        let granted = self
            .query(
                "role_grants_permission",
                self.store.role_grants_permission(user_id, permission_slug),
            )
            .await?
            || self
                .query(
                    "direct_grant_exists",
                    self.store.direct_grant_exists(user_id, permission_slug),
                )
                .await?;

        record_check("permission", granted);
        debug!(permission = permission_slug, granted, "Permission check");
        Ok(granted)
    }

    /// True when at least one slug is granted. Stops at the first grant.
    pub async fn has_any_permission<S: AsRef<str>>(&self, user_id: UserId, slugs: &[S]) -> Result<bool> {
        for slug in slugs {
            if self.has_permission(user_id, slug.as_ref()).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// True when every slug is granted. Stops at the first denial.
    pub async fn has_all_permissions<S: AsRef<str>>(&self, user_id: UserId, slugs: &[S]) -> Result<bool> {
        for slug in slugs {
            if !self.has_permission(user_id, slug.as_ref()).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// `Ok(())` when granted, a `Forbidden` error otherwise.
    pub async fn enforce_permission(&self, user_id: UserId, permission_slug: &str) -> Result<()> {
        if self.has_permission(user_id, permission_slug).await? {
            Ok(())
        } else {
            Err(GatehouseError::forbidden("Permission denied")
                .with_context("user_id", user_id.get())
                .with_context("permission", permission_slug))
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Role graph mutation
    // ─────────────────────────────────────────────────────────────────────────

    /// Replace the role's permission set atomically. On failure the previous set stays.
    ///
    /// Duplicate ids in `permission_ids` are collapsed.
    #[instrument(skip(self, permission_ids), fields(role_id = %role_id, count = permission_ids.len()))]
    pub async fn sync_role_permissions(&self, role_id: RoleId, permission_ids: &[PermissionId]) -> Result<()> {
        role_id.validate()?;
        let mut unique = BTreeSet::new();
        for id in permission_ids {
            unique.insert(id.validate()?);
        }
        let unique: Vec<PermissionId> = unique.into_iter().collect();

        self.query(
            "replace_role_permissions",
            self.store.replace_role_permissions(role_id, &unique),
        )
        .await?;
        self.invalidate_all_users().await;
        info!(permissions = unique.len(), "Role permissions synced");
        Ok(())
    }

    /// Create any missing predefined system role. Existing roles are never touched.
    ///
    /// Returns the roles that were created.
    #[instrument(skip(self))]
    pub async fn seed_default_roles(&self) -> Result<Vec<Role>> {
        let mut created = Vec::new();
        for predefined in PredefinedRole::all() {
            let existing = self
                .query("role_by_slug", self.store.role_by_slug(predefined.slug()))
                .await?;
            if existing.is_some() {
                debug!(slug = predefined.slug(), "System role already present");
                continue;
            }

            match self
                .query("insert_role", self.store.insert_role(predefined.to_new_role()))
                .await
            {
                Ok(role) => created.push(role),
                // Slug held by a soft-deleted role, or a concurrent seed won the race.
                Err(e) if e.code() == ErrorCode::DuplicateRecord => {
                    warn!(slug = predefined.slug(), "System role slug already taken; skipping");
                }
                Err(e) => return Err(e),
            }
        }

        info!(created = created.len(), "Default roles seeded");
        Ok(created)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Catalogue administration
    // ─────────────────────────────────────────────────────────────────────────

    #[instrument(skip(self, role), fields(slug = %role.slug))]
    pub async fn create_role(&self, role: NewRole) -> Result<Role> {
        role.validate()?;
        let role = self.query("insert_role", self.store.insert_role(role)).await?;
        info!(role_id = %role.id, "Role created");
        Ok(role)
    }

    #[instrument(skip(self, permission), fields(slug = %permission.slug))]
    pub async fn create_permission(&self, permission: NewPermission) -> Result<Permission> {
        permission.validate()?;
        let permission = self
            .query("insert_permission", self.store.insert_permission(permission))
            .await?;
        info!(permission_id = %permission.id, "Permission created");
        Ok(permission)
    }

    pub async fn get_role_by_slug(&self, slug: &str) -> Result<Option<Role>> {
        validate_slug(slug)?;
        self.query("role_by_slug", self.store.role_by_slug(slug)).await
    }

    pub async fn get_permission_by_slug(&self, slug: &str) -> Result<Option<Permission>> {
        validate_slug(slug)?;
        self.query("permission_by_slug", self.store.permission_by_slug(slug))
            .await
    }

    pub async fn list_roles(&self) -> Result<Vec<Role>> {
        self.query("list_roles", self.store.list_roles()).await
    }

    pub async fn list_permissions(&self) -> Result<Vec<Permission>> {
        self.query("list_permissions", self.store.list_permissions()).await
    }

    pub async fn get_role_permissions(&self, role_id: RoleId) -> Result<Vec<Permission>> {
        role_id.validate()?;
        self.query("role_permissions", self.store.role_permissions(role_id))
            .await
    }

    /// Soft-delete a role. System roles are refused with `Forbidden`.
    #[instrument(skip(self), fields(role_id = %role_id))]
    pub async fn delete_role(&self, role_id: RoleId) -> Result<()> {
        role_id.validate()?;
        let role = self
            .query("role_by_id", self.store.role_by_id(role_id))
            .await?
            .ok_or_else(|| GatehouseError::not_found("role", role_id.to_string()))?;

        if role.is_system {
            return Err(GatehouseError::forbidden("System roles cannot be deleted")
                .with_context("slug", &role.slug));
        }

        if !self
            .query("soft_delete_role", self.store.soft_delete_role(role_id))
            .await?
        {
            return Err(GatehouseError::not_found("role", role_id.to_string()));
        }
        self.invalidate_all_users().await;
        info!(slug = %role.slug, "Role deleted");
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Permission cache
    // ─────────────────────────────────────────────────────────────────────────

    fn permissions_key(user_id: UserId) -> String {
        format!("user:{}:permissions", user_id)
    }

    async fn cached_permissions(&self, user_id: UserId) -> Option<Vec<Permission>> {
        let cache = self.cache.as_ref()?;
        match cache.get::<Vec<Permission>>(&Self::permissions_key(user_id)).await {
            Ok(Some(permissions)) => {
                counter!("rbac_permission_cache_total", "result" => "hit").increment(1);
                Some(permissions)
            }
            Ok(None) => {
                counter!("rbac_permission_cache_total", "result" => "miss").increment(1);
                None
            }
            Err(e) => {
                counter!("rbac_permission_cache_total", "result" => "error").increment(1);
                warn!(user_id = %user_id, error = %e, "Permission cache read failed; using store");
                None
            }
        }
    }

    /// Publish a resolved set read under `stamp`. An invalidation that lands
    /// before the write skips it; one that races the write removes it again.
    async fn store_cached_permissions(
        &self,
        user_id: UserId,
        permissions: &[Permission],
        stamp: (u64, u64),
    ) {
        let Some(cache) = &self.cache else { return };
        if self.epochs.stamp(user_id) != stamp {
            debug!(user_id = %user_id, "Permissions changed during resolution; not caching");
            return;
        }

        let key = Self::permissions_key(user_id);
        let ttl = CacheTtl::from(self.config.permission_cache_ttl);
        if let Err(e) = cache.set(&key, permissions, ttl).await {
            warn!(user_id = %user_id, error = %e, "Failed to cache resolved permissions");
            return;
        }

        if self.epochs.stamp(user_id) != stamp {
            if let Err(e) = cache.delete(&key).await {
                warn!(user_id = %user_id, error = %e, "Failed to withdraw stale cached permissions");
            }
        }
    }

    async fn invalidate_user(&self, user_id: UserId) {
        let Some(cache) = &self.cache else { return };
        self.epochs.bump_user(user_id);
        if let Err(e) = cache.delete(&Self::permissions_key(user_id)).await {
            warn!(user_id = %user_id, error = %e, "Failed to invalidate cached permissions");
        }
    }

    async fn invalidate_all_users(&self) {
        let Some(cache) = &self.cache else { return };
        self.epochs.bump_all();
        match cache.delete_pattern("user:*").await {
            Ok(count) => debug!(count, "Invalidated cached permission sets"),
            Err(e) => warn!(error = %e, "Failed to invalidate cached permission sets"),
        }
    }
}

fn record_check(kind: &'static str, granted: bool) {
    let result = if granted { "granted" } else { "denied" };
    counter!("rbac_checks_total", "check" => kind, "result" => result).increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rbac::memory::MemoryPermissionStore;

    async fn service() -> (RbacService, Arc<MemoryPermissionStore>) {
        let store = Arc::new(MemoryPermissionStore::new());
        (RbacService::new(store.clone(), RbacConfig::default()), store)
    }

    #[tokio::test]
    async fn test_validation_precedes_store() {
        let (rbac, _) = service().await;
        let err = rbac.has_permission(UserId(1), "").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
        let err = rbac.assign_role(UserId(0), RoleId(1)).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
        let err = rbac
            .sync_role_permissions(RoleId(1), &[PermissionId(-1)])
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
    }

    #[tokio::test]
    async fn test_seed_is_idempotent() {
        let (rbac, _) = service().await;
        assert_eq!(rbac.seed_default_roles().await.unwrap().len(), 3);
        assert!(rbac.seed_default_roles().await.unwrap().is_empty());
        assert_eq!(rbac.list_roles().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_system_role_cannot_be_deleted() {
        let (rbac, _) = service().await;
        rbac.seed_default_roles().await.unwrap();
        let admin = rbac.get_role_by_slug("admin").await.unwrap().unwrap();
        let err = rbac.delete_role(admin.id).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Forbidden);

        let custom = rbac.create_role(NewRole::new("Editor", "editor")).await.unwrap();
        rbac.delete_role(custom.id).await.unwrap();
        assert!(rbac.get_role_by_slug("editor").await.unwrap().is_none());
        let err = rbac.delete_role(custom.id).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::RecordNotFound);
    }

    #[tokio::test]
    async fn test_enforce_permission() {
        let (rbac, _) = service().await;
        let perm = rbac
            .create_permission(NewPermission::new("Read posts", "posts.read"))
            .await
            .unwrap();
        rbac.assign_permission(UserId(3), perm.id).await.unwrap();

        rbac.enforce_permission(UserId(3), "posts.read").await.unwrap();
        let err = rbac.enforce_permission(UserId(4), "posts.read").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Forbidden);
    }

    #[tokio::test]
    async fn test_cache_disabled_by_config() {
        let store = Arc::new(MemoryPermissionStore::new());
        let config = RbacConfig {
            enable_permission_cache: false,
            ..Default::default()
        };
        let rbac = RbacService::new(store, config).with_cache(Cache::in_memory(10));
        assert!(!rbac.is_caching());
    }
}
