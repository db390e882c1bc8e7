//! Command-line interface for opguard.
//!
//! Operator commands for the persistent idempotency table and for
//! inspecting the resolved configuration.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::config;
use crate::core::{IdempotencyManager, SqliteIdempotencyStore};

/// opguard - idempotent, hookable, observable operation pipeline
#[derive(Parser, Debug)]
#[command(name = "opguard")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Idempotency database (overrides config)
    #[arg(long, global = true, env = "OPGUARD_DB")]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Inspect and maintain idempotency keys
    Keys {
        #[command(subcommand)]
        command: KeysCommands,
    },

    /// Show resolved configuration (debug)
    Config,
}

#[derive(Subcommand, Debug)]
pub enum KeysCommands {
    /// Record counts and average retries per status
    Stats,

    /// Delete expired records
    Cleanup,

    /// Show one record
    Show {
        /// Idempotency key (<operation>:<hash>)
        key: String,
    },

    /// Release a key regardless of its state
    Clear {
        /// Idempotency key (<operation>:<hash>)
        key: String,
    },
}

impl Cli {
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Keys { command } => {
                let manager = open_manager(self.db)?;
                execute_keys(&manager, command).await
            }
            Commands::Config => show_config(),
        }
    }
}

fn open_manager(db: Option<PathBuf>) -> Result<IdempotencyManager> {
    let cfg = config::config()?;
    let path = match db {
        Some(path) => path,
        None => cfg.database.clone(),
    };

    let store = SqliteIdempotencyStore::open(&path)
        .with_context(|| format!("Failed to open idempotency database: {}", path.display()))?;
    Ok(IdempotencyManager::new(Arc::new(store), cfg.idempotency.clone()))
}

async fn execute_keys(manager: &IdempotencyManager, command: KeysCommands) -> Result<()> {
    match command {
        KeysCommands::Stats => {
            let stats = manager.get_stats().await?;
            if stats.is_empty() {
                println!("No idempotency records");
                return Ok(());
            }

            println!("{:<14} {:>10} {:>12}", "STATUS", "COUNT", "AVG RETRIES");
            println!("{}", "-".repeat(38));
            for row in stats {
                println!(
                    "{:<14} {:>10} {:>12.2}",
                    row.status.to_string(),
                    row.count,
                    row.avg_retry_count
                );
            }
        }

        KeysCommands::Cleanup => {
            let deleted = manager.cleanup_expired_keys().await?;
            println!("Deleted {} expired record(s)", deleted);
        }

        KeysCommands::Show { key } => match manager.get(&key).await? {
            Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
            None => anyhow::bail!("No live record for key: {}", key),
        },

        KeysCommands::Clear { key } => {
            if manager.clear(&key).await? {
                println!("Cleared {}", key);
            } else {
                anyhow::bail!("No record for key: {}", key);
            }
        }
    }

    Ok(())
}

fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:     {}", cfg.home.display());
    println!("  Database: {}", cfg.database.display());
    println!(
        "  Spans:    {}",
        cfg.spans_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(export disabled)".to_string())
    );
    println!();
    println!("Settings:");
    println!("{}", serde_yaml::to_string(&SettingsView::from(cfg))?);

    Ok(())
}

/// The settings sections of the config, without paths
#[derive(serde::Serialize)]
struct SettingsView<'a> {
    validation: &'a crate::core::ValidationSettings,
    idempotency: &'a crate::core::IdempotencySettings,
    hooks: &'a crate::core::HookSettings,
    observability: &'a crate::core::ObservabilitySettings,
    orchestrator: &'a crate::core::OrchestratorSettings,
}

impl<'a> From<&'a config::Config> for SettingsView<'a> {
    fn from(cfg: &'a config::Config) -> Self {
        Self {
            validation: &cfg.validation,
            idempotency: &cfg.idempotency,
            hooks: &cfg.hooks,
            observability: &cfg.observability,
            orchestrator: &cfg.orchestrator,
        }
    }
}
