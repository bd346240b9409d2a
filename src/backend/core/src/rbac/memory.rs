//! Process-local [`PermissionStore`] for tests, demos and the CLI's dry runs.
//!
//! All relations live behind one `RwLock`; every mutation runs inside a single
//! write critical section, so a cancelled caller never observes half-applied state.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::oneshot;

use super::models::{
    NewPermission, NewRole, Permission, PermissionId, Role, RoleId, UserId, UserPermission, UserRole,
};
use super::store::PermissionStore;
use crate::error::{ErrorCode, GatehouseError, Result};

#[derive(Debug, Clone)]
struct StoredRole {
    role: Role,
    deleted: bool,
}

#[derive(Debug, Default)]
struct State {
    roles: BTreeMap<RoleId, StoredRole>,
    permissions: BTreeMap<PermissionId, Permission>,
    role_permissions: BTreeMap<RoleId, BTreeSet<PermissionId>>,
    user_roles: BTreeMap<(UserId, RoleId), UserRole>,
    user_permissions: BTreeMap<(UserId, PermissionId), UserPermission>,
    next_role_id: i64,
    next_permission_id: i64,
    next_link_id: i64,
    /// Fail the Nth (1-based) insert of the next sync.
    fail_sync_insert_at: Option<usize>,
}

impl State {
    fn live_role(&self, role_id: RoleId) -> Option<&Role> {
        self.roles
            .get(&role_id)
            .filter(|stored| !stored.deleted)
            .map(|stored| &stored.role)
    }

    fn live_roles_of(&self, user_id: UserId) -> impl Iterator<Item = &Role> + '_ {
        self.user_roles
            .range((user_id, RoleId(i64::MIN))..=(user_id, RoleId(i64::MAX)))
            .filter_map(|((_, role_id), _)| self.live_role(*role_id))
    }

    fn permissions_of_role(&self, role_id: RoleId) -> impl Iterator<Item = &Permission> + '_ {
        self.role_permissions
            .get(&role_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.permissions.get(id))
    }

    fn direct_of(&self, user_id: UserId) -> impl Iterator<Item = &Permission> + '_ {
        self.user_permissions
            .range((user_id, PermissionId(i64::MIN))..=(user_id, PermissionId(i64::MAX)))
            .filter_map(|((_, permission_id), _)| self.permissions.get(permission_id))
    }

    fn next_link(&mut self) -> i64 {
        self.next_link_id += 1;
        self.next_link_id
    }
}

/// Signals that a resolution read finished, then waits to be released.
type ResolutionGate = (oneshot::Sender<()>, oneshot::Receiver<()>);

/// In-memory permission store.
#[derive(Debug, Default)]
pub struct MemoryPermissionStore {
    state: RwLock<State>,
    resolution_gate: Mutex<Option<ResolutionGate>>,
}

impl MemoryPermissionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `replace_role_permissions` fail on its `n`th insert (1-based).
    ///
    /// The failure is one-shot and leaves the role's previous set in place.
    pub fn fail_next_sync_at(&self, n: usize) {
        self.state.write().fail_sync_insert_at = Some(n);
    }

    /// Hold the next `role_derived_permissions` call after it has read.
    ///
    /// Returns `(read_done, release)`: `read_done` resolves once the read is
    /// taken, and the call returns only after `release` is sent or dropped.
    pub fn pause_next_resolution(&self) -> (oneshot::Receiver<()>, oneshot::Sender<()>) {
        let (read_tx, read_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel();
        *self.resolution_gate.lock() = Some((read_tx, release_rx));
        (read_rx, release_tx)
    }

    /// Number of user-role rows, including those pointing at deleted roles.
    pub fn user_role_count(&self, user_id: UserId) -> usize {
        self.state
            .read()
            .user_roles
            .keys()
            .filter(|(user, _)| *user == user_id)
            .count()
    }
}

fn duplicate(entity: &str, slug: &str) -> GatehouseError {
    GatehouseError::new(ErrorCode::DuplicateRecord, format!("{} slug already exists", entity))
        .with_context("slug", slug)
}

#[async_trait]
impl PermissionStore for MemoryPermissionStore {
    async fn insert_user_role(&self, user_id: UserId, role_id: RoleId) -> Result<()> {
        let mut state = self.state.write();
        if state.live_role(role_id).is_none() {
            return Err(GatehouseError::not_found("role", role_id.to_string()));
        }
        if !state.user_roles.contains_key(&(user_id, role_id)) {
            let id = state.next_link();
            state.user_roles.insert(
                (user_id, role_id),
                UserRole {
                    id,
                    user_id,
                    role_id,
                    created_at: Utc::now(),
                },
            );
        }
        Ok(())
    }

    async fn delete_user_role(&self, user_id: UserId, role_id: RoleId) -> Result<bool> {
        Ok(self.state.write().user_roles.remove(&(user_id, role_id)).is_some())
    }

    async fn insert_user_permission(&self, user_id: UserId, permission_id: PermissionId) -> Result<()> {
        let mut state = self.state.write();
        if !state.permissions.contains_key(&permission_id) {
            return Err(GatehouseError::not_found("permission", permission_id.to_string()));
        }
        if !state.user_permissions.contains_key(&(user_id, permission_id)) {
            let id = state.next_link();
            state.user_permissions.insert(
                (user_id, permission_id),
                UserPermission {
                    id,
                    user_id,
                    permission_id,
                    created_at: Utc::now(),
                },
            );
        }
        Ok(())
    }

    async fn delete_user_permission(&self, user_id: UserId, permission_id: PermissionId) -> Result<bool> {
        Ok(self
            .state
            .write()
            .user_permissions
            .remove(&(user_id, permission_id))
            .is_some())
    }

    async fn user_roles(&self, user_id: UserId) -> Result<Vec<Role>> {
        Ok(self.state.read().live_roles_of(user_id).cloned().collect())
    }

    async fn role_derived_permissions(&self, user_id: UserId) -> Result<Vec<Permission>> {
        let permissions: Vec<Permission> = {
            let state = self.state.read();
            state
                .live_roles_of(user_id)
                .flat_map(|role| state.permissions_of_role(role.id))
                .cloned()
                .collect()
        };

        let gate = self.resolution_gate.lock().take();
        if let Some((read_done, release)) = gate {
            let _ = read_done.send(());
            let _ = release.await;
        }
        Ok(permissions)
    }

    async fn direct_permissions(&self, user_id: UserId) -> Result<Vec<Permission>> {
        Ok(self.state.read().direct_of(user_id).cloned().collect())
    }

    async fn user_has_role(&self, user_id: UserId, role_slug: &str) -> Result<bool> {
        Ok(self
            .state
            .read()
            .live_roles_of(user_id)
            .any(|role| role.slug == role_slug))
    }

    async fn role_grants_permission(&self, user_id: UserId, permission_slug: &str) -> Result<bool> {
        let state = self.state.read();
        let granted = state
            .live_roles_of(user_id)
            .flat_map(|role| state.permissions_of_role(role.id))
            .any(|permission| permission.slug == permission_slug);
        Ok(granted)
    }

    async fn direct_grant_exists(&self, user_id: UserId, permission_slug: &str) -> Result<bool> {
        Ok(self
            .state
            .read()
            .direct_of(user_id)
            .any(|permission| permission.slug == permission_slug))
    }

    async fn replace_role_permissions(&self, role_id: RoleId, permission_ids: &[PermissionId]) -> Result<()> {
        let mut state = self.state.write();
        if state.live_role(role_id).is_none() {
            return Err(GatehouseError::not_found("role", role_id.to_string()));
        }

        let fail_at = state.fail_sync_insert_at.take();
        let mut staged = BTreeSet::new();
        for (index, permission_id) in permission_ids.iter().enumerate() {
            if fail_at == Some(index + 1) {
                return Err(GatehouseError::with_internal(
                    ErrorCode::DatabaseTransactionFailed,
                    "Failed to sync role permissions",
                    format!("injected failure on insert {}", index + 1),
                ));
            }
            if !state.permissions.contains_key(permission_id) {
                return Err(GatehouseError::not_found("permission", permission_id.to_string()));
            }
            staged.insert(*permission_id);
        }

        state.role_permissions.insert(role_id, staged);
        Ok(())
    }

    async fn insert_role(&self, role: NewRole) -> Result<Role> {
        let mut state = self.state.write();
        if state.roles.values().any(|stored| stored.role.slug == role.slug) {
            return Err(duplicate("Role", &role.slug));
        }
        state.next_role_id += 1;
        let role = Role {
            id: RoleId(state.next_role_id),
            name: role.name,
            slug: role.slug,
            description: role.description,
            is_system: role.is_system,
        };
        state.roles.insert(
            role.id,
            StoredRole {
                role: role.clone(),
                deleted: false,
            },
        );
        Ok(role)
    }

    async fn insert_permission(&self, permission: NewPermission) -> Result<Permission> {
        let mut state = self.state.write();
        if state.permissions.values().any(|p| p.slug == permission.slug) {
            return Err(duplicate("Permission", &permission.slug));
        }
        state.next_permission_id += 1;
        let permission = Permission {
            id: PermissionId(state.next_permission_id),
            name: permission.name,
            slug: permission.slug,
            description: permission.description,
            module: permission.module,
            category: permission.category,
        };
        state.permissions.insert(permission.id, permission.clone());
        Ok(permission)
    }

    async fn role_by_id(&self, role_id: RoleId) -> Result<Option<Role>> {
        Ok(self.state.read().live_role(role_id).cloned())
    }

    async fn role_by_slug(&self, slug: &str) -> Result<Option<Role>> {
        Ok(self
            .state
            .read()
            .roles
            .values()
            .find(|stored| !stored.deleted && stored.role.slug == slug)
            .map(|stored| stored.role.clone()))
    }

    async fn permission_by_slug(&self, slug: &str) -> Result<Option<Permission>> {
        Ok(self
            .state
            .read()
            .permissions
            .values()
            .find(|p| p.slug == slug)
            .cloned())
    }

    async fn list_roles(&self) -> Result<Vec<Role>> {
        Ok(self
            .state
            .read()
            .roles
            .values()
            .filter(|stored| !stored.deleted)
            .map(|stored| stored.role.clone())
            .collect())
    }

    async fn list_permissions(&self) -> Result<Vec<Permission>> {
        Ok(self.state.read().permissions.values().cloned().collect())
    }

    async fn role_permissions(&self, role_id: RoleId) -> Result<Vec<Permission>> {
        let state = self.state.read();
        if state.live_role(role_id).is_none() {
            return Ok(Vec::new());
        }
        Ok(state.permissions_of_role(role_id).cloned().collect())
    }

    async fn soft_delete_role(&self, role_id: RoleId) -> Result<bool> {
        let mut state = self.state.write();
        match state.roles.get_mut(&role_id) {
            Some(stored) if !stored.deleted => {
                stored.deleted = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    async fn fixture() -> (MemoryPermissionStore, Role, Vec<Permission>) {
        let store = MemoryPermissionStore::new();
        let role = store.insert_role(NewRole::new("Editor", "editor")).await.unwrap();
        let mut permissions = Vec::new();
        for slug in ["posts.read", "posts.write", "posts.delete"] {
            permissions.push(store.insert_permission(NewPermission::new(slug, slug)).await.unwrap());
        }
        (store, role, permissions)
    }

    #[tokio::test]
    async fn test_assignment_is_idempotent() {
        let (store, role, _) = fixture().await;
        store.insert_user_role(UserId(1), role.id).await.unwrap();
        store.insert_user_role(UserId(1), role.id).await.unwrap();
        assert_eq!(store.user_role_count(UserId(1)), 1);

        assert!(store.delete_user_role(UserId(1), role.id).await.unwrap());
        assert!(!store.delete_user_role(UserId(1), role.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_role_is_not_found() {
        let (store, _, _) = fixture().await;
        let err = store.insert_user_role(UserId(1), RoleId(99)).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::RecordNotFound);
    }

    #[tokio::test]
    async fn test_duplicate_slug_rejected() {
        let (store, _, _) = fixture().await;
        let err = store.insert_role(NewRole::new("Editor 2", "editor")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::DuplicateRecord);
    }

    #[tokio::test]
    async fn test_injected_failure_keeps_previous_set() {
        let (store, role, perms) = fixture().await;
        store.replace_role_permissions(role.id, &[perms[0].id]).await.unwrap();

        store.fail_next_sync_at(2);
        let ids: Vec<_> = perms.iter().map(|p| p.id).collect();
        let err = store.replace_role_permissions(role.id, &ids).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::DatabaseTransactionFailed);

        let current = store.role_permissions(role.id).await.unwrap();
        assert_eq!(current, vec![perms[0].clone()]);

        // One-shot: the retry goes through.
        store.replace_role_permissions(role.id, &ids).await.unwrap();
        assert_eq!(store.role_permissions(role.id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_deleted_role_grants_nothing() {
        let (store, role, perms) = fixture().await;
        store.replace_role_permissions(role.id, &[perms[1].id]).await.unwrap();
        store.insert_user_role(UserId(5), role.id).await.unwrap();
        assert!(store.role_grants_permission(UserId(5), "posts.write").await.unwrap());

        assert!(store.soft_delete_role(role.id).await.unwrap());
        assert!(!store.soft_delete_role(role.id).await.unwrap());
        assert!(!store.role_grants_permission(UserId(5), "posts.write").await.unwrap());
        assert!(store.user_roles(UserId(5)).await.unwrap().is_empty());
        assert!(store.role_by_slug("editor").await.unwrap().is_none());
    }
}
