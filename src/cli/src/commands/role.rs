//! Role management commands.
//!
//! Create, list, inspect and delete roles, assign them to users and replace
//! a role's permission set.

use anyhow::Result;
use clap::Subcommand;

use gatehouse_core::rbac::{NewRole, RbacService, UserId};

use super::{resolve_permission, resolve_role, PermissionRow, RoleRow};
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum RoleCommands {
    /// Create a role
    Create {
        /// Unique slug, e.g. `editor`
        slug: String,

        /// Display name
        #[arg(short, long)]
        name: String,

        #[arg(short, long, default_value = "")]
        description: String,
    },

    /// List every role
    List,

    /// Show a role and the permissions it grants
    Show {
        slug: String,
    },

    /// Soft-delete a role
    Delete {
        slug: String,

        /// Skip confirmation
        #[arg(short, long)]
        force: bool,
    },

    /// Assign a role to a user
    Assign {
        user_id: i64,
        slug: String,
    },

    /// Remove a role from a user
    Remove {
        user_id: i64,
        slug: String,
    },

    /// Replace the permission set of a role
    Sync {
        slug: String,

        /// Permission slugs; an empty list clears the role
        permissions: Vec<String>,
    },

    /// Create the built-in system roles if they are missing
    Seed,
}

pub async fn execute(cmd: RoleCommands, rbac: &RbacService, format: OutputFormat) -> Result<()> {
    match cmd {
        RoleCommands::Create {
            slug,
            name,
            description,
        } => {
            let role = rbac
                .create_role(NewRole::new(name, slug).with_description(description))
                .await?;
            match format {
                OutputFormat::Table => {
                    output::print_success(&format!("Role '{}' created (id {})", role.slug, role.id))
                }
                _ => output::print_item(&role, format)?,
            }
        }

        RoleCommands::List => {
            let rows: Vec<RoleRow> = rbac.list_roles().await?.into_iter().map(Into::into).collect();
            output::print_list(&rows, format)?;
        }

        RoleCommands::Show { slug } => {
            let role = resolve_role(rbac, &slug).await?;
            let permissions = rbac.get_role_permissions(role.id).await?;

            match format {
                OutputFormat::Table => {
                    output::print_header(&format!("Role: {}", role.name));
                    output::print_detail("ID", &role.id.to_string());
                    output::print_detail("Slug", &role.slug);
                    output::print_detail("System", &role.is_system.to_string());
                    if !role.description.is_empty() {
                        output::print_detail("Description", &role.description);
                    }
                    println!();
                    let rows: Vec<PermissionRow> =
                        permissions.into_iter().map(Into::into).collect();
                    output::print_list(&rows, format)?;
                }
                _ => output::print_item(
                    &serde_json::json!({ "role": role, "permissions": permissions }),
                    format,
                )?,
            }
        }

        RoleCommands::Delete { slug, force } => {
            if !force {
                output::print_info(
                    "Users holding this role lose its permissions. Use --force to confirm.",
                );
                return Ok(());
            }
            let role = resolve_role(rbac, &slug).await?;
            rbac.delete_role(role.id).await?;
            output::print_success(&format!("Role '{}' deleted", slug));
        }

        RoleCommands::Assign { user_id, slug } => {
            let user = UserId::new(user_id).validate()?;
            let role = resolve_role(rbac, &slug).await?;
            rbac.assign_role(user, role.id).await?;
            output::print_success(&format!("User {} now has role '{}'", user, role.slug));
        }

        RoleCommands::Remove { user_id, slug } => {
            let user = UserId::new(user_id).validate()?;
            let role = resolve_role(rbac, &slug).await?;
            rbac.remove_role(user, role.id).await?;
            output::print_success(&format!("Role '{}' removed from user {}", role.slug, user));
        }

        RoleCommands::Sync { slug, permissions } => {
            let role = resolve_role(rbac, &slug).await?;
            let mut ids = Vec::with_capacity(permissions.len());
            for permission in &permissions {
                ids.push(resolve_permission(rbac, permission).await?.id);
            }
            rbac.sync_role_permissions(role.id, &ids).await?;
            output::print_success(&format!(
                "Role '{}' now grants {} permission(s)",
                role.slug,
                rbac.get_role_permissions(role.id).await?.len()
            ));
        }

        RoleCommands::Seed => {
            let seeded = rbac.seed_default_roles().await?;
            if seeded.is_empty() {
                output::print_info("System roles already present");
            } else {
                let rows: Vec<RoleRow> = seeded.into_iter().map(Into::into).collect();
                output::print_list(&rows, format)?;
            }
        }
    }

    Ok(())
}
