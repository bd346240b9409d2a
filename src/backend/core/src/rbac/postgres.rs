//! PostgreSQL [`PermissionStore`] over the tables created by `0001_rbac.sql`.

use async_trait::async_trait;
use sqlx::PgPool;

use super::models::{NewPermission, NewRole, Permission, PermissionId, Role, RoleId, UserId};
use super::store::PermissionStore;
use crate::error::{GatehouseError, Result};

const ROLE_COLUMNS: &str = "r.id, r.name, r.slug, r.description, r.is_system";
const PERMISSION_COLUMNS: &str = "p.id, p.name, p.slug, p.description, p.module, p.category";

/// Permission store backed by a sqlx Postgres pool.
#[derive(Clone)]
pub struct PgPermissionStore {
    pool: PgPool,
}

impl PgPermissionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn role_exists(&self, role_id: RoleId) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM roles WHERE id = $1 AND deleted_at IS NULL)",
        )
        .bind(role_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn permission_exists(&self, permission_id: PermissionId) -> Result<bool> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM permissions WHERE id = $1)")
            .bind(permission_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }
}

#[async_trait]
impl PermissionStore for PgPermissionStore {
    // ═══════════════════════════════════════════════════════════════════════════
    // Assignments
    // ═══════════════════════════════════════════════════════════════════════════

    async fn insert_user_role(&self, user_id: UserId, role_id: RoleId) -> Result<()> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO user_roles (user_id, role_id)
            SELECT $1, r.id FROM roles r WHERE r.id = $2 AND r.deleted_at IS NULL
            ON CONFLICT (user_id, role_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(role_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        // Zero rows means either an existing link or a missing role.
        if inserted == 0 && !self.role_exists(role_id).await? {
            return Err(GatehouseError::not_found("role", role_id.to_string()));
        }
        Ok(())
    }

    async fn delete_user_role(&self, user_id: UserId, role_id: RoleId) -> Result<bool> {
        let deleted = sqlx::query("DELETE FROM user_roles WHERE user_id = $1 AND role_id = $2")
            .bind(user_id)
            .bind(role_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted > 0)
    }

    async fn insert_user_permission(&self, user_id: UserId, permission_id: PermissionId) -> Result<()> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO user_permissions (user_id, permission_id)
            SELECT $1, p.id FROM permissions p WHERE p.id = $2
            ON CONFLICT (user_id, permission_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(permission_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 0 && !self.permission_exists(permission_id).await? {
            return Err(GatehouseError::not_found("permission", permission_id.to_string()));
        }
        Ok(())
    }

    async fn delete_user_permission(&self, user_id: UserId, permission_id: PermissionId) -> Result<bool> {
        let deleted =
            sqlx::query("DELETE FROM user_permissions WHERE user_id = $1 AND permission_id = $2")
                .bind(user_id)
                .bind(permission_id)
                .execute(&self.pool)
                .await?
                .rows_affected();
        Ok(deleted > 0)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Resolution
    // ═══════════════════════════════════════════════════════════════════════════

    async fn user_roles(&self, user_id: UserId) -> Result<Vec<Role>> {
        let roles = sqlx::query_as::<_, Role>(&format!(
            r#"
            SELECT {ROLE_COLUMNS}
            FROM roles r
            JOIN user_roles ur ON ur.role_id = r.id
            WHERE ur.user_id = $1 AND r.deleted_at IS NULL
            ORDER BY r.id
            "#
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(roles)
    }

    async fn role_derived_permissions(&self, user_id: UserId) -> Result<Vec<Permission>> {
        let permissions = sqlx::query_as::<_, Permission>(&format!(
            r#"
            SELECT {PERMISSION_COLUMNS}
            FROM permissions p
            JOIN role_permissions rp ON rp.permission_id = p.id
            JOIN roles r ON r.id = rp.role_id AND r.deleted_at IS NULL
            JOIN user_roles ur ON ur.role_id = r.id
            WHERE ur.user_id = $1
            "#
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(permissions)
    }

    async fn direct_permissions(&self, user_id: UserId) -> Result<Vec<Permission>> {
        let permissions = sqlx::query_as::<_, Permission>(&format!(
            r#"
            SELECT {PERMISSION_COLUMNS}
            FROM permissions p
            JOIN user_permissions up ON up.permission_id = p.id
            WHERE up.user_id = $1
            "#
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(permissions)
    }

    async fn user_has_role(&self, user_id: UserId, role_slug: &str) -> Result<bool> {
        let found: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM user_roles ur
                JOIN roles r ON r.id = ur.role_id
                WHERE ur.user_id = $1 AND r.slug = $2 AND r.deleted_at IS NULL
            )
            "#,
        )
        .bind(user_id)
        .bind(role_slug)
        .fetch_one(&self.pool)
        .await?;
        Ok(found)
    }

    async fn role_grants_permission(&self, user_id: UserId, permission_slug: &str) -> Result<bool> {
        let found: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM user_roles ur
                JOIN roles r ON r.id = ur.role_id AND r.deleted_at IS NULL
                JOIN role_permissions rp ON rp.role_id = r.id
                JOIN permissions p ON p.id = rp.permission_id
                WHERE ur.user_id = $1 AND p.slug = $2
            )
            "#,
        )
        .bind(user_id)
        .bind(permission_slug)
        .fetch_one(&self.pool)
        .await?;
        Ok(found)
    }

    async fn direct_grant_exists(&self, user_id: UserId, permission_slug: &str) -> Result<bool> {
        let found: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM user_permissions up
                JOIN permissions p ON p.id = up.permission_id
                WHERE up.user_id = $1 AND p.slug = $2
            )
            "#,
        )
        .bind(user_id)
        .bind(permission_slug)
        .fetch_one(&self.pool)
        .await?;
        Ok(found)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Catalogue
    // ═══════════════════════════════════════════════════════════════════════════

    async fn replace_role_permissions(&self, role_id: RoleId, permission_ids: &[PermissionId]) -> Result<()> {
        let ids: Vec<i64> = permission_ids.iter().map(|id| id.get()).collect();

        // Dropping `tx` before commit rolls the whole replacement back.
        let mut tx = self.pool.begin().await?;

        let locked: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM roles WHERE id = $1 AND deleted_at IS NULL FOR UPDATE",
        )
        .bind(role_id)
        .fetch_optional(&mut *tx)
        .await?;
        if locked.is_none() {
            return Err(GatehouseError::not_found("role", role_id.to_string()));
        }

        sqlx::query("DELETE FROM role_permissions WHERE role_id = $1")
            .bind(role_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO role_permissions (role_id, permission_id)
            SELECT $1, UNNEST($2::BIGINT[])
            "#,
        )
        .bind(role_id)
        .bind(ids)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn insert_role(&self, role: NewRole) -> Result<Role> {
        let role = sqlx::query_as::<_, Role>(
            r#"
            INSERT INTO roles (name, slug, description, is_system)
            VALUES ($1, $2, $3, $4)
            RETURNING id, name, slug, description, is_system
            "#,
        )
        .bind(&role.name)
        .bind(&role.slug)
        .bind(&role.description)
        .bind(role.is_system)
        .fetch_one(&self.pool)
        .await?;
        Ok(role)
    }

    async fn insert_permission(&self, permission: NewPermission) -> Result<Permission> {
        let permission = sqlx::query_as::<_, Permission>(
            r#"
            INSERT INTO permissions (name, slug, description, module, category)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, name, slug, description, module, category
            "#,
        )
        .bind(&permission.name)
        .bind(&permission.slug)
        .bind(&permission.description)
        .bind(&permission.module)
        .bind(&permission.category)
        .fetch_one(&self.pool)
        .await?;
        Ok(permission)
    }

    async fn role_by_id(&self, role_id: RoleId) -> Result<Option<Role>> {
        let role = sqlx::query_as::<_, Role>(&format!(
            "SELECT {ROLE_COLUMNS} FROM roles r WHERE r.id = $1 AND r.deleted_at IS NULL"
        ))
        .bind(role_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(role)
    }

    async fn role_by_slug(&self, slug: &str) -> Result<Option<Role>> {
        let role = sqlx::query_as::<_, Role>(&format!(
            "SELECT {ROLE_COLUMNS} FROM roles r WHERE r.slug = $1 AND r.deleted_at IS NULL"
        ))
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?;
        Ok(role)
    }

    async fn permission_by_slug(&self, slug: &str) -> Result<Option<Permission>> {
        let permission = sqlx::query_as::<_, Permission>(&format!(
            "SELECT {PERMISSION_COLUMNS} FROM permissions p WHERE p.slug = $1"
        ))
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?;
        Ok(permission)
    }

    async fn list_roles(&self) -> Result<Vec<Role>> {
        let roles = sqlx::query_as::<_, Role>(&format!(
            "SELECT {ROLE_COLUMNS} FROM roles r WHERE r.deleted_at IS NULL ORDER BY r.id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(roles)
    }

    async fn list_permissions(&self) -> Result<Vec<Permission>> {
        let permissions = sqlx::query_as::<_, Permission>(&format!(
            "SELECT {PERMISSION_COLUMNS} FROM permissions p ORDER BY p.id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(permissions)
    }

    async fn role_permissions(&self, role_id: RoleId) -> Result<Vec<Permission>> {
        let permissions = sqlx::query_as::<_, Permission>(&format!(
            r#"
            SELECT {PERMISSION_COLUMNS}
            FROM permissions p
            JOIN role_permissions rp ON rp.permission_id = p.id
            JOIN roles r ON r.id = rp.role_id AND r.deleted_at IS NULL
            WHERE rp.role_id = $1
            ORDER BY p.id
            "#
        ))
        .bind(role_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(permissions)
    }

    async fn soft_delete_role(&self, role_id: RoleId) -> Result<bool> {
        let updated =
            sqlx::query("UPDATE roles SET deleted_at = NOW() WHERE id = $1 AND deleted_at IS NULL")
                .bind(role_id)
                .execute(&self.pool)
                .await?
                .rows_affected();
        Ok(updated > 0)
    }

    fn name(&self) -> &'static str {
        "postgres"
    }
}
