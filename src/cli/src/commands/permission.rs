//! Permission catalogue and direct grant commands.

use anyhow::Result;
use clap::Subcommand;

use gatehouse_core::rbac::{NewPermission, RbacService, UserId};

use super::{resolve_permission, PermissionRow};
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum PermissionCommands {
    /// Create a permission
    Create {
        /// Unique slug, e.g. `posts.write`
        slug: String,

        #[arg(short, long)]
        name: String,

        #[arg(short, long, default_value = "")]
        description: String,

        /// Owning module, e.g. `posts`
        #[arg(short, long, default_value = "")]
        module: String,

        #[arg(short, long, default_value = "")]
        category: String,
    },

    /// List every permission
    List {
        /// Only show permissions of this module
        #[arg(short, long)]
        module: Option<String>,
    },

    /// Grant a permission directly to a user
    Grant {
        user_id: i64,
        slug: String,
    },

    /// Revoke a direct grant
    Revoke {
        user_id: i64,
        slug: String,
    },
}

pub async fn execute(
    cmd: PermissionCommands,
    rbac: &RbacService,
    format: OutputFormat,
) -> Result<()> {
    match cmd {
        PermissionCommands::Create {
            slug,
            name,
            description,
            module,
            category,
        } => {
            let permission = rbac
                .create_permission(
                    NewPermission::new(name, slug)
                        .with_description(description)
                        .with_module(module)
                        .with_category(category),
                )
                .await?;
            match format {
                OutputFormat::Table => output::print_success(&format!(
                    "Permission '{}' created (id {})",
                    permission.slug, permission.id
                )),
                _ => output::print_item(&permission, format)?,
            }
        }

        PermissionCommands::List { module } => {
            let rows: Vec<PermissionRow> = rbac
                .list_permissions()
                .await?
                .into_iter()
                .filter(|p| module.as_ref().map_or(true, |m| &p.module == m))
                .map(Into::into)
                .collect();
            output::print_list(&rows, format)?;
        }

        PermissionCommands::Grant { user_id, slug } => {
            let user = UserId::new(user_id).validate()?;
            let permission = resolve_permission(rbac, &slug).await?;
            rbac.assign_permission(user, permission.id).await?;
            output::print_success(&format!("Granted '{}' to user {}", permission.slug, user));
        }

        PermissionCommands::Revoke { user_id, slug } => {
            let user = UserId::new(user_id).validate()?;
            let permission = resolve_permission(rbac, &slug).await?;
            rbac.remove_permission(user, permission.id).await?;
            output::print_success(&format!(
                "Revoked direct grant '{}' from user {}",
                permission.slug, user
            ));
        }
    }

    Ok(())
}
