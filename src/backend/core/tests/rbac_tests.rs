//! Integration tests for permission resolution.
//!
//! Runs the engine against the in-memory store; the Postgres store shares the
//! same trait and is exercised by the CLI against a live database.

use std::collections::HashSet;
use std::sync::Arc;

use gatehouse_core::cache::{Cache, CacheTtl};
use gatehouse_core::error::ErrorCode;
use gatehouse_core::rbac::{
    MemoryPermissionStore, NewPermission, NewRole, Permission, PermissionId, RbacConfig,
    RbacService, Role, UserId,
};

// ============================================================================
// Test Utilities
// ============================================================================

struct Fixture {
    rbac: RbacService,
    store: Arc<MemoryPermissionStore>,
}

impl Fixture {
    fn new() -> Self {
        let store = Arc::new(MemoryPermissionStore::new());
        let rbac = RbacService::new(store.clone(), RbacConfig::default());
        Self { rbac, store }
    }

    fn cached(cache: Cache) -> Self {
        let store = Arc::new(MemoryPermissionStore::new());
        let rbac = RbacService::new(store.clone(), RbacConfig::default()).with_cache(cache);
        Self { rbac, store }
    }

    async fn role(&self, slug: &str) -> Role {
        self.rbac.create_role(NewRole::new(slug, slug)).await.unwrap()
    }

    async fn permission(&self, slug: &str) -> Permission {
        self.rbac
            .create_permission(NewPermission::new(slug, slug).with_module("posts"))
            .await
            .unwrap()
    }
}

fn slugs(permissions: &[Permission]) -> HashSet<String> {
    permissions.iter().map(|p| p.slug.clone()).collect()
}

// ============================================================================
// Resolution
// ============================================================================

#[tokio::test]
async fn test_editor_with_direct_grant() {
    let fx = Fixture::new();
    let editor = fx.role("editor").await;
    let write = fx.permission("posts.write").await;
    let delete = fx.permission("posts.delete").await;
    fx.permission("posts.publish").await;

    fx.rbac.sync_role_permissions(editor.id, &[write.id]).await.unwrap();
    fx.rbac.assign_role(UserId(42), editor.id).await.unwrap();
    fx.rbac.assign_permission(UserId(42), delete.id).await.unwrap();

    assert!(fx.rbac.has_permission(UserId(42), "posts.write").await.unwrap());
    assert!(fx.rbac.has_permission(UserId(42), "posts.delete").await.unwrap());
    assert!(!fx.rbac.has_permission(UserId(42), "posts.publish").await.unwrap());

    let permissions = fx.rbac.get_user_permissions(UserId(42)).await.unwrap();
    assert_eq!(
        slugs(&permissions),
        HashSet::from(["posts.write".to_string(), "posts.delete".to_string()])
    );

    assert!(fx.rbac.has_role(UserId(42), "editor").await.unwrap());
    assert!(!fx.rbac.has_role(UserId(42), "admin").await.unwrap());
    let roles = fx.rbac.get_user_roles(UserId(42)).await.unwrap();
    assert_eq!(roles, vec![editor]);
}

#[tokio::test]
async fn test_union_has_no_duplicate_ids() {
    let fx = Fixture::new();
    let a = fx.role("role-a").await;
    let b = fx.role("role-b").await;
    let shared = fx.permission("posts.read").await;
    let only_b = fx.permission("posts.write").await;

    fx.rbac.sync_role_permissions(a.id, &[shared.id]).await.unwrap();
    fx.rbac
        .sync_role_permissions(b.id, &[shared.id, only_b.id])
        .await
        .unwrap();
    fx.rbac.assign_role(UserId(7), a.id).await.unwrap();
    fx.rbac.assign_role(UserId(7), b.id).await.unwrap();
    fx.rbac.assign_permission(UserId(7), shared.id).await.unwrap();

    let permissions = fx.rbac.get_user_permissions(UserId(7)).await.unwrap();
    let ids: Vec<PermissionId> = permissions.iter().map(|p| p.id).collect();
    assert_eq!(ids, vec![shared.id, only_b.id]);
}

#[tokio::test]
async fn test_user_without_grants() {
    let fx = Fixture::new();
    fx.permission("posts.read").await;
    assert!(fx.rbac.get_user_permissions(UserId(9)).await.unwrap().is_empty());
    assert!(fx.rbac.get_user_roles(UserId(9)).await.unwrap().is_empty());
    assert!(!fx.rbac.has_permission(UserId(9), "posts.read").await.unwrap());
}

#[tokio::test]
async fn test_any_and_all() {
    let fx = Fixture::new();
    let read = fx.permission("posts.read").await;
    fx.permission("posts.write").await;
    fx.rbac.assign_permission(UserId(1), read.id).await.unwrap();

    assert!(fx
        .rbac
        .has_any_permission(UserId(1), &["posts.write", "posts.read"])
        .await
        .unwrap());
    assert!(!fx
        .rbac
        .has_all_permissions(UserId(1), &["posts.read", "posts.write"])
        .await
        .unwrap());
    assert!(fx
        .rbac
        .has_all_permissions(UserId(1), &["posts.read"])
        .await
        .unwrap());

    let empty: [&str; 0] = [];
    assert!(!fx.rbac.has_any_permission(UserId(1), &empty).await.unwrap());
    assert!(fx.rbac.has_all_permissions(UserId(1), &empty).await.unwrap());
}

#[tokio::test]
async fn test_concurrent_checks() {
    let fx = Fixture::new();
    let role = fx.role("reader").await;
    let read = fx.permission("posts.read").await;
    fx.rbac.sync_role_permissions(role.id, &[read.id]).await.unwrap();

    for user in 1..=20 {
        fx.rbac.assign_role(UserId(user), role.id).await.unwrap();
    }

    let mut handles = Vec::new();
    for user in 1..=40 {
        let rbac = fx.rbac.clone();
        handles.push(tokio::spawn(async move {
            rbac.has_permission(UserId(user), "posts.read").await.unwrap()
        }));
    }

    let mut granted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            granted += 1;
        }
    }
    assert_eq!(granted, 20);
}

// ============================================================================
// Mutation
// ============================================================================

#[tokio::test]
async fn test_assignment_is_idempotent() {
    let fx = Fixture::new();
    let role = fx.role("editor").await;
    let perm = fx.permission("posts.write").await;

    fx.rbac.assign_role(UserId(3), role.id).await.unwrap();
    fx.rbac.assign_role(UserId(3), role.id).await.unwrap();
    assert_eq!(fx.store.user_role_count(UserId(3)), 1);

    fx.rbac.remove_role(UserId(3), role.id).await.unwrap();
    fx.rbac.remove_role(UserId(3), role.id).await.unwrap();
    assert_eq!(fx.store.user_role_count(UserId(3)), 0);

    fx.rbac.assign_permission(UserId(3), perm.id).await.unwrap();
    fx.rbac.assign_permission(UserId(3), perm.id).await.unwrap();
    fx.rbac.remove_permission(UserId(3), perm.id).await.unwrap();
    fx.rbac.remove_permission(UserId(3), perm.id).await.unwrap();
    assert!(!fx.rbac.has_permission(UserId(3), "posts.write").await.unwrap());
}

#[tokio::test]
async fn test_sync_failure_keeps_previous_set() {
    let fx = Fixture::new();
    let role = fx.role("editor").await;
    let read = fx.permission("posts.read").await;
    let write = fx.permission("posts.write").await;
    let delete = fx.permission("posts.delete").await;
    let publish = fx.permission("posts.publish").await;

    fx.rbac
        .sync_role_permissions(role.id, &[read.id, write.id])
        .await
        .unwrap();

    fx.store.fail_next_sync_at(2);
    let err = fx
        .rbac
        .sync_role_permissions(role.id, &[delete.id, publish.id, read.id])
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::DatabaseTransactionFailed);

    let current = fx.rbac.get_role_permissions(role.id).await.unwrap();
    assert_eq!(
        slugs(&current),
        HashSet::from(["posts.read".to_string(), "posts.write".to_string()])
    );
}

#[tokio::test]
async fn test_sync_replaces_and_collapses_duplicates() {
    let fx = Fixture::new();
    let role = fx.role("editor").await;
    let read = fx.permission("posts.read").await;
    let write = fx.permission("posts.write").await;

    fx.rbac.sync_role_permissions(role.id, &[read.id]).await.unwrap();
    fx.rbac
        .sync_role_permissions(role.id, &[write.id, write.id])
        .await
        .unwrap();
    assert_eq!(fx.rbac.get_role_permissions(role.id).await.unwrap(), vec![write]);

    fx.rbac.sync_role_permissions(role.id, &[]).await.unwrap();
    assert!(fx.rbac.get_role_permissions(role.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_references_are_not_found() {
    let fx = Fixture::new();
    let role = fx.role("editor").await;

    let err = fx
        .rbac
        .sync_role_permissions(role.id, &[PermissionId(999)])
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::RecordNotFound);

    let err = fx.rbac.assign_permission(UserId(1), PermissionId(999)).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::RecordNotFound);
}

#[tokio::test]
async fn test_duplicate_slug_is_rejected() {
    let fx = Fixture::new();
    fx.permission("posts.read").await;
    let err = fx
        .rbac
        .create_permission(NewPermission::new("Read again", "posts.read"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::DuplicateRecord);
}

#[tokio::test]
async fn test_invalid_input_is_rejected() {
    let fx = Fixture::new();
    for slug in ["", "Posts.Read", "posts read"] {
        let err = fx.rbac.has_permission(UserId(1), slug).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
    }
    let err = fx.rbac.get_user_permissions(UserId(-1)).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ValidationError);
    let err = fx
        .rbac
        .create_role(NewRole::new("Editor", "editor role"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ValidationError);
}

#[tokio::test]
async fn test_deleted_role_stops_granting() {
    let fx = Fixture::new();
    let role = fx.role("editor").await;
    let write = fx.permission("posts.write").await;
    fx.rbac.sync_role_permissions(role.id, &[write.id]).await.unwrap();
    fx.rbac.assign_role(UserId(5), role.id).await.unwrap();

    fx.rbac.delete_role(role.id).await.unwrap();
    assert!(!fx.rbac.has_permission(UserId(5), "posts.write").await.unwrap());
    assert!(fx.rbac.list_roles().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_seeded_roles() {
    let fx = Fixture::new();
    let created = fx.rbac.seed_default_roles().await.unwrap();
    let slugs: Vec<&str> = created.iter().map(|r| r.slug.as_str()).collect();
    assert_eq!(slugs, vec!["super-admin", "admin", "user"]);
    assert!(created.iter().all(|r| r.is_system));

    let user = fx.rbac.get_role_by_slug("user").await.unwrap().unwrap();
    fx.rbac.assign_role(UserId(11), user.id).await.unwrap();
    assert!(fx.rbac.has_role(UserId(11), "user").await.unwrap());
}

// ============================================================================
// Permission Cache
// ============================================================================

#[tokio::test]
async fn test_permissions_are_cached_under_user_key() {
    let cache = Cache::in_memory(100);
    let fx = Fixture::cached(cache.clone());
    let read = fx.permission("posts.read").await;
    fx.rbac.assign_permission(UserId(42), read.id).await.unwrap();

    fx.rbac.get_user_permissions(UserId(42)).await.unwrap();
    let cached: Option<Vec<Permission>> = cache.get("rbac:user:42:permissions").await.unwrap();
    assert_eq!(cached, Some(vec![read]));
}

#[tokio::test]
async fn test_assignment_invalidates_user_entry() {
    let cache = Cache::in_memory(100);
    let fx = Fixture::cached(cache.clone());
    let read = fx.permission("posts.read").await;
    let write = fx.permission("posts.write").await;

    fx.rbac.assign_permission(UserId(1), read.id).await.unwrap();
    assert_eq!(fx.rbac.get_user_permissions(UserId(1)).await.unwrap().len(), 1);

    fx.rbac.assign_permission(UserId(1), write.id).await.unwrap();
    assert_eq!(fx.rbac.get_user_permissions(UserId(1)).await.unwrap().len(), 2);

    fx.rbac.remove_permission(UserId(1), read.id).await.unwrap();
    assert_eq!(
        fx.rbac.get_user_permissions(UserId(1)).await.unwrap(),
        vec![write]
    );
}

#[tokio::test]
async fn test_sync_invalidates_every_user() {
    let cache = Cache::in_memory(100);
    let fx = Fixture::cached(cache.clone());
    let role = fx.role("editor").await;
    let read = fx.permission("posts.read").await;
    let write = fx.permission("posts.write").await;
    fx.rbac.sync_role_permissions(role.id, &[read.id]).await.unwrap();

    for user in [1, 2] {
        fx.rbac.assign_role(UserId(user), role.id).await.unwrap();
        assert_eq!(fx.rbac.get_user_permissions(UserId(user)).await.unwrap().len(), 1);
    }
    cache
        .set("sessions:abc", &"untouched", CacheTtl::Never)
        .await
        .unwrap();

    fx.rbac
        .sync_role_permissions(role.id, &[read.id, write.id])
        .await
        .unwrap();

    assert!(cache.keys("rbac:user:*").await.unwrap().is_empty());
    assert!(cache.exists("sessions:abc").await.unwrap());
    for user in [1, 2] {
        assert_eq!(fx.rbac.get_user_permissions(UserId(user)).await.unwrap().len(), 2);
    }
}

#[tokio::test]
async fn test_invalidation_during_resolution_is_not_overwritten() {
    let cache = Cache::in_memory(100);
    let fx = Fixture::cached(cache.clone());
    let role = fx.role("editor").await;
    let write = fx.permission("posts.write").await;
    fx.rbac.sync_role_permissions(role.id, &[write.id]).await.unwrap();
    fx.rbac.assign_role(UserId(4), role.id).await.unwrap();

    let (read_done, release) = fx.store.pause_next_resolution();
    let rbac = fx.rbac.clone();
    let resolving = tokio::spawn(async move { rbac.get_user_permissions(UserId(4)).await });

    read_done.await.unwrap();
    fx.rbac.remove_role(UserId(4), role.id).await.unwrap();
    release.send(()).unwrap();

    let seen = resolving.await.unwrap().unwrap();
    assert_eq!(seen, vec![write]);
    assert!(!cache.exists("rbac:user:4:permissions").await.unwrap());
    assert!(fx.rbac.get_user_permissions(UserId(4)).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_corrupt_cache_entry_falls_back_to_store() {
    let cache = Cache::in_memory(100);
    let fx = Fixture::cached(cache.clone());
    let read = fx.permission("posts.read").await;
    fx.rbac.assign_permission(UserId(8), read.id).await.unwrap();

    cache
        .set_raw("rbac:user:8:permissions", b"not json".to_vec(), CacheTtl::Never)
        .await
        .unwrap();

    let permissions = fx.rbac.get_user_permissions(UserId(8)).await.unwrap();
    assert_eq!(permissions, vec![read]);
}
