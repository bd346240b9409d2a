//! Cache inspection commands.
//!
//! Operate on the configured tier stack through the multi-tier orchestrator.

use anyhow::Result;
use clap::Subcommand;
use serde::Serialize;
use tabled::Tabled;

use gatehouse_core::cache::{CacheBackend, CacheStats, MultiTierCache};

use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum CacheCommands {
    /// Hit/miss statistics for the orchestrator and each tier
    Stats,

    /// Print the value stored under a key
    Get {
        key: String,
    },

    /// List keys matching a glob pattern (`*` and `?`)
    Keys {
        #[arg(default_value = "*")]
        pattern: String,
    },

    /// Delete a key from every tier
    Delete {
        key: String,
    },

    /// Remove every entry from every tier
    Clear {
        /// Skip confirmation
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Debug, Serialize, Tabled)]
struct StatsRow {
    #[tabled(rename = "Tier")]
    tier: String,
    #[tabled(rename = "Hits")]
    hits: u64,
    #[tabled(rename = "Misses")]
    misses: u64,
    #[tabled(rename = "Entries")]
    entries: u64,
    #[tabled(rename = "Evictions")]
    evictions: u64,
    #[tabled(rename = "Hit Rate")]
    hit_rate: String,
}

impl StatsRow {
    fn new(tier: impl Into<String>, stats: &CacheStats) -> Self {
        Self {
            tier: tier.into(),
            hits: stats.hits,
            misses: stats.misses,
            entries: stats.entries,
            evictions: stats.evictions,
            hit_rate: format!("{:.1}%", stats.hit_rate * 100.0),
        }
    }
}

pub async fn execute(cmd: CacheCommands, cache: &MultiTierCache, format: OutputFormat) -> Result<()> {
    match cmd {
        CacheCommands::Stats => {
            let mut rows = vec![StatsRow::new("all", &cache.stats().await?)];
            for index in 0..cache.tier_count() {
                if let Some(tier) = cache.tier(index) {
                    let stats = tier.stats().await?;
                    rows.push(StatsRow::new(format!("L{} ({})", index + 1, tier.name()), &stats));
                }
            }
            output::print_list(&rows, format)?;
        }

        CacheCommands::Get { key } => match cache.get(&key).await {
            Ok(bytes) => {
                let value = String::from_utf8_lossy(&bytes);
                match format {
                    OutputFormat::Table => println!("{}", value),
                    _ => output::print_item(
                        &serde_json::json!({
                            "key": key,
                            "value": value,
                            "ttl_secs": cache.ttl(&key).await?.map(|d| d.as_secs()),
                        }),
                        format,
                    )?,
                }
            }
            Err(e) if e.is_key_not_found() => output::print_error(&format!("Key '{}' not found", key)),
            Err(e) => return Err(e.into()),
        },

        CacheCommands::Keys { pattern } => {
            let mut keys = cache.keys(&pattern).await?;
            keys.sort();
            match format {
                OutputFormat::Table => {
                    if keys.is_empty() {
                        output::print_info("No keys match");
                    }
                    for key in &keys {
                        println!("{}", key);
                    }
                }
                _ => output::print_item(&keys, format)?,
            }
        }

        CacheCommands::Delete { key } => {
            if cache.delete(&key).await? {
                output::print_success(&format!("Deleted '{}'", key));
            } else {
                output::print_info(&format!("Key '{}' was not present", key));
            }
        }

        CacheCommands::Clear { force } => {
            if !force {
                output::print_info("This empties every cache tier. Use --force to confirm.");
                return Ok(());
            }
            cache.clear().await?;
            output::print_success("Cache cleared");
        }
    }

    Ok(())
}
