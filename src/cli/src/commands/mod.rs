//! Subcommands and the row types they share.

pub mod cache;
pub mod health;
pub mod permission;
pub mod role;
pub mod user;

use anyhow::{anyhow, Result};
use serde::Serialize;
use tabled::Tabled;

use gatehouse_core::rbac::{Permission, RbacService, Role};

#[derive(Debug, Serialize, Tabled)]
pub struct RoleRow {
    #[tabled(rename = "ID")]
    pub id: i64,
    #[tabled(rename = "Slug")]
    pub slug: String,
    #[tabled(rename = "Name")]
    pub name: String,
    #[tabled(rename = "System")]
    pub system: bool,
    #[tabled(rename = "Description")]
    pub description: String,
}

impl From<Role> for RoleRow {
    fn from(role: Role) -> Self {
        Self {
            id: role.id.get(),
            slug: role.slug,
            name: role.name,
            system: role.is_system,
            description: role.description,
        }
    }
}

#[derive(Debug, Serialize, Tabled)]
pub struct PermissionRow {
    #[tabled(rename = "ID")]
    pub id: i64,
    #[tabled(rename = "Slug")]
    pub slug: String,
    #[tabled(rename = "Name")]
    pub name: String,
    #[tabled(rename = "Module")]
    pub module: String,
    #[tabled(rename = "Category")]
    pub category: String,
}

impl From<Permission> for PermissionRow {
    fn from(permission: Permission) -> Self {
        Self {
            id: permission.id.get(),
            slug: permission.slug,
            name: permission.name,
            module: permission.module,
            category: permission.category,
        }
    }
}

/// Look a role up by slug, failing with a readable message when it is absent.
pub async fn resolve_role(rbac: &RbacService, slug: &str) -> Result<Role> {
    rbac.get_role_by_slug(slug)
        .await?
        .ok_or_else(|| anyhow!("Role '{}' not found", slug))
}

pub async fn resolve_permission(rbac: &RbacService, slug: &str) -> Result<Permission> {
    rbac.get_permission_by_slug(slug)
        .await?
        .ok_or_else(|| anyhow!("Permission '{}' not found", slug))
}
