//! Per-user queries: effective roles, effective permissions and checks.

use anyhow::Result;
use clap::{Args, Subcommand};
use serde::Serialize;
use tabled::Tabled;

use gatehouse_core::rbac::{RbacService, UserId};

use super::{PermissionRow, RoleRow};
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum UserCommands {
    /// Roles held by a user
    Roles {
        user_id: i64,
    },

    /// Effective permissions of a user (role-derived and direct)
    Permissions {
        user_id: i64,
    },

    /// Check one or more permission slugs for a user
    Check(CheckArgs),
}

#[derive(Args)]
pub struct CheckArgs {
    user_id: i64,

    /// Permission slugs to check
    #[arg(required = true)]
    permissions: Vec<String>,

    /// Exit non-zero unless every permission is held
    #[arg(long, conflicts_with = "any")]
    all: bool,

    /// Exit non-zero unless at least one permission is held
    #[arg(long)]
    any: bool,
}

#[derive(Debug, Serialize, Tabled)]
struct CheckRow {
    #[tabled(rename = "Permission")]
    permission: String,
    #[tabled(rename = "Granted")]
    granted: bool,
}

pub async fn execute(cmd: UserCommands, rbac: &RbacService, format: OutputFormat) -> Result<()> {
    match cmd {
        UserCommands::Roles { user_id } => {
            let user = UserId::new(user_id).validate()?;
            let rows: Vec<RoleRow> = rbac
                .get_user_roles(user)
                .await?
                .into_iter()
                .map(Into::into)
                .collect();
            output::print_list(&rows, format)?;
        }

        UserCommands::Permissions { user_id } => {
            let user = UserId::new(user_id).validate()?;
            let rows: Vec<PermissionRow> = rbac
                .get_user_permissions(user)
                .await?
                .into_iter()
                .map(Into::into)
                .collect();
            output::print_list(&rows, format)?;
        }

        UserCommands::Check(args) => check(args, rbac, format).await?,
    }

    Ok(())
}

async fn check(args: CheckArgs, rbac: &RbacService, format: OutputFormat) -> Result<()> {
    let user = UserId::new(args.user_id).validate()?;

    let mut rows = Vec::with_capacity(args.permissions.len());
    for slug in args.permissions {
        let granted = rbac.has_permission(user, &slug).await?;
        rows.push(CheckRow {
            permission: slug,
            granted,
        });
    }

    match format {
        OutputFormat::Table => {
            output::print_header(&format!("Permission checks for user {}", user));
            for row in &rows {
                output::print_detail(&row.permission, &output::verdict(row.granted).to_string());
            }
        }
        _ => output::print_list(&rows, format)?,
    }

    let passed = if args.any {
        rows.iter().any(|r| r.granted)
    } else if args.all {
        rows.iter().all(|r| r.granted)
    } else {
        true
    };
    if !passed {
        anyhow::bail!("User {} does not satisfy the permission check", user);
    }

    Ok(())
}
