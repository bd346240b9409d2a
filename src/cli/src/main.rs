//! Gatehouse CLI - administer roles, permissions and caches.
//!
//! Talks to the permission store and cache tiers directly using the same
//! configuration as the services (`gatehouse.toml` plus `GATEHOUSE__*`).

mod commands;
mod output;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use gatehouse_core::app::App;
use gatehouse_core::config::Config;
use gatehouse_core::telemetry::init_logging;

use commands::{cache, health, permission, role, user};
use output::OutputFormat;

#[derive(Parser)]
#[command(
    name = "gatehouse",
    version,
    about = "Gatehouse - RBAC and cache administration",
    long_about = "Manage roles, permissions and user grants, and inspect the cache tiers.",
    propagate_version = true
)]
pub struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// Configuration file (defaults to ./gatehouse.{toml,yaml,json} when present)
    #[arg(long, global = true, env = "GATEHOUSE_CONFIG")]
    config: Option<PathBuf>,

    /// Use a throwaway in-process store instead of Postgres
    #[arg(long, global = true)]
    in_memory: bool,

    /// Emit service logs
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Role management
    #[command(subcommand)]
    Role(role::RoleCommands),

    /// Permission catalogue and direct grants
    #[command(subcommand)]
    Permission(permission::PermissionCommands),

    /// Effective roles and permissions of a user
    #[command(subcommand)]
    User(user::UserCommands),

    /// Cache inspection
    #[command(subcommand)]
    Cache(cache::CacheCommands),

    /// Check database and cache health
    Health(health::HealthArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli).await {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => Config::load().context("Failed to load configuration")?,
    };
    // Seeding is an explicit `role seed`.
    config.rbac.seed_default_roles = false;

    if cli.verbose {
        init_logging(&config.telemetry.logging, &config.telemetry.environment)?;
    }

    let app = if cli.in_memory {
        App::in_memory(config).await?
    } else {
        App::bootstrap(config)
            .await
            .context("Failed to connect to the permission store")?
    };

    let format = cli.output;
    let result = match cli.command {
        Commands::Role(cmd) => role::execute(cmd, app.rbac(), format).await,
        Commands::Permission(cmd) => permission::execute(cmd, app.rbac(), format).await,
        Commands::User(cmd) => user::execute(cmd, app.rbac(), format).await,
        Commands::Cache(cmd) => cache::execute(cmd, app.cache(), format).await,
        Commands::Health(args) => health::execute(args, &app, format).await,
    };

    app.shutdown().await?;
    result
}
