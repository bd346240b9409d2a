//! RBAC data models: identifiers, roles, permissions, and assignments.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{GatehouseError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Identifiers
// ═══════════════════════════════════════════════════════════════════════════════

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
            Serialize, Deserialize, sqlx::Type,
        )]
        #[serde(transparent)]
        #[sqlx(transparent)]
        pub struct $name(pub i64);

        impl $name {
            pub fn new(id: i64) -> Self {
                Self(id)
            }

            pub fn get(self) -> i64 {
                self.0
            }

            /// Reject ids that can never name a stored row.
            pub fn validate(self) -> Result<Self> {
                if self.0 > 0 {
                    Ok(self)
                } else {
                    Err(GatehouseError::validation(concat!($label, " must be positive"))
                        .with_context("id", self.0))
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }
    };
}

id_type!(
    /// Strongly-typed user identifier. Users live outside this crate.
    UserId,
    "user id"
);
id_type!(
    /// Strongly-typed role identifier.
    RoleId,
    "role id"
);
id_type!(
    /// Strongly-typed permission identifier.
    PermissionId,
    "permission id"
);

// ═══════════════════════════════════════════════════════════════════════════════
// Slugs
// ═══════════════════════════════════════════════════════════════════════════════

/// Longest slug accepted for roles and permissions.
pub const MAX_SLUG_LEN: usize = 128;

/// Validate a role or permission slug: 1-128 chars from `[a-z0-9._:-]`.
pub fn validate_slug(slug: &str) -> Result<&str> {
    if slug.is_empty() {
        return Err(GatehouseError::validation("Slug must not be empty"));
    }
    if slug.len() > MAX_SLUG_LEN {
        return Err(GatehouseError::validation("Slug is too long")
            .with_context("max_len", MAX_SLUG_LEN)
            .with_context("len", slug.len()));
    }
    if let Some(bad) = slug
        .chars()
        .find(|c| !matches!(c, 'a'..='z' | '0'..='9' | '.' | '_' | ':' | '-'))
    {
        return Err(GatehouseError::validation("Slug contains an invalid character")
            .with_context("slug", slug)
            .with_context("character", bad.to_string()));
    }
    Ok(slug)
}

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(GatehouseError::validation("Name must not be empty"));
    }
    if name.len() > 255 {
        return Err(GatehouseError::validation("Name is too long").with_context("max_len", 255));
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Role
// ═══════════════════════════════════════════════════════════════════════════════

/// A named bundle of permissions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Role {
    pub id: RoleId,
    pub name: String,
    /// Unique, URL-safe identifier.
    pub slug: String,
    pub description: String,
    /// Seeded roles are system roles and cannot be deleted.
    pub is_system: bool,
}

/// Input for creating a role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRole {
    pub name: String,
    pub slug: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_system: bool,
}

impl NewRole {
    pub fn new(name: impl Into<String>, slug: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slug: slug.into(),
            description: String::new(),
            is_system: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Mark this as a system role.
    pub fn system(mut self) -> Self {
        self.is_system = true;
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;
        validate_slug(&self.slug)?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Permission
// ═══════════════════════════════════════════════════════════════════════════════

/// A single grantable capability, e.g. `posts.write`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Permission {
    pub id: PermissionId,
    pub name: String,
    /// Unique identifier used in checks.
    pub slug: String,
    pub description: String,
    /// Owning application module, e.g. `posts`.
    pub module: String,
    /// Free-form grouping for admin UIs.
    pub category: String,
}

/// Input for creating a permission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPermission {
    pub name: String,
    pub slug: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub module: String,
    #[serde(default)]
    pub category: String,
}

impl NewPermission {
    pub fn new(name: impl Into<String>, slug: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slug: slug.into(),
            description: String::new(),
            module: String::new(),
            category: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.module = module.into();
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;
        validate_slug(&self.slug)?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Assignments
// ═══════════════════════════════════════════════════════════════════════════════

/// A user holding a role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserRole {
    pub id: i64,
    pub user_id: UserId,
    pub role_id: RoleId,
    pub created_at: DateTime<Utc>,
}

/// A permission granted directly to a user, bypassing roles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserPermission {
    pub id: i64,
    pub user_id: UserId,
    pub permission_id: PermissionId,
    pub created_at: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_valid_slugs() {
        for slug in ["posts.write", "admin", "super-admin", "billing:refund", "a_b.c-1"] {
            assert!(validate_slug(slug).is_ok(), "{slug} should be valid");
        }
    }

    #[test]
    fn test_invalid_slugs() {
        let too_long = "a".repeat(MAX_SLUG_LEN + 1);
        for slug in ["", "Posts.Write", "posts write", "posts/write", too_long.as_str()] {
            let err = validate_slug(slug).unwrap_err();
            assert_eq!(err.code(), ErrorCode::ValidationError, "{slug:?}");
        }
        assert!(validate_slug(&"a".repeat(MAX_SLUG_LEN)).is_ok());
    }

    #[test]
    fn test_id_validation() {
        assert_eq!(UserId(42).validate().unwrap(), UserId(42));
        assert_eq!(
            RoleId(0).validate().unwrap_err().code(),
            ErrorCode::ValidationError
        );
        assert!(PermissionId(-3).validate().is_err());
    }

    #[test]
    fn test_new_role_validation() {
        assert!(NewRole::new("Editor", "editor").validate().is_ok());
        assert!(NewRole::new("  ", "editor").validate().is_err());
        assert!(NewRole::new("Editor", "Editor").validate().is_err());
    }

    #[test]
    fn test_ids_serialize_as_numbers() {
        let json = serde_json::to_string(&PermissionId(7)).unwrap();
        assert_eq!(json, "7");
        let id: UserId = serde_json::from_str("42").unwrap();
        assert_eq!(id, UserId(42));
    }
}
