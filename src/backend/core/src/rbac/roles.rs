//! Predefined system roles seeded at startup.
//!
//! | Role        | Description                                  |
//! |-------------|----------------------------------------------|
//! | super-admin | Unrestricted access, including role changes  |
//! | admin       | Manages users and content                    |
//! | user        | Default role for signed-in users             |
//!
//! Seeding only creates the roles; their permission sets are managed with
//! `sync_role_permissions`.

use super::models::NewRole;

/// Well-known system roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredefinedRole {
    SuperAdmin,
    Admin,
    User,
}

impl PredefinedRole {
    /// Get the role slug.
    pub fn slug(&self) -> &'static str {
        match self {
            Self::SuperAdmin => "super-admin",
            Self::Admin => "admin",
            Self::User => "user",
        }
    }

    /// Get the human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SuperAdmin => "Super Admin",
            Self::Admin => "Admin",
            Self::User => "User",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::SuperAdmin => "Unrestricted access, including role and permission management",
            Self::Admin => "Manages users and content",
            Self::User => "Default role for signed-in users",
        }
    }

    /// The insert payload for this role, flagged as a system role.
    pub fn to_new_role(&self) -> NewRole {
        NewRole::new(self.name(), self.slug())
            .with_description(self.description())
            .system()
    }

    /// Return all predefined roles.
    pub fn all() -> [PredefinedRole; 3] {
        [Self::SuperAdmin, Self::Admin, Self::User]
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        Self::all().into_iter().find(|role| role.slug() == slug)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugs_are_valid() {
        for role in PredefinedRole::all() {
            assert!(role.to_new_role().validate().is_ok(), "{:?}", role);
        }
    }

    #[test]
    fn test_all_are_system_roles() {
        assert!(PredefinedRole::all().iter().all(|r| r.to_new_role().is_system));
    }

    #[test]
    fn test_from_slug() {
        assert_eq!(PredefinedRole::from_slug("super-admin"), Some(PredefinedRole::SuperAdmin));
        assert_eq!(PredefinedRole::from_slug("user"), Some(PredefinedRole::User));
        assert_eq!(PredefinedRole::from_slug("editor"), None);
    }
}
