// CLI module - command-line argument parsing and handlers
//
// Provides subcommands besides the default `serve`:
// - config --show | --path: inspect the effective configuration
// - mappings ...: offline maintenance of the session mapping store

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::config::{Config, VERSION};
use crate::storage::MappingStore;

/// chatbridge - OpenAI-compatible gateway for conversation-oriented chat backends
#[derive(Parser)]
#[command(name = "chatbridge")]
#[command(version = VERSION)]
#[command(about = "OpenAI-compatible chat gateway with persistent conversation mapping", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the gateway (default)
    Serve,

    /// Inspect configuration
    Config {
        /// Show effective configuration (credentials redacted)
        #[arg(long)]
        show: bool,

        /// Show config file path
        #[arg(long)]
        path: bool,
    },

    /// Maintain the session mapping store
    Mappings {
        #[command(subcommand)]
        command: MappingsCommand,
    },
}

#[derive(Subcommand)]
pub enum MappingsCommand {
    /// Row count and timestamp aggregates
    Stats,

    /// Most recently used mappings
    Recent {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Delete mappings not used for the given number of days
    Purge {
        #[arg(long, default_value_t = 30)]
        max_age_days: u64,
    },

    /// Delete one mapping
    Delete {
        /// Session key to remove
        session_key: String,
    },

    /// Refresh planner statistics and truncate the WAL
    Optimize,

    /// Database file details
    Info,

    /// Import a legacy JSON mapping file (existing rows are kept)
    Import {
        /// Path to the JSON file
        file: PathBuf,
    },
}

/// Handle offline CLI commands. Returns true if a command was handled (exit after).
///
/// `serve` and no command at all fall through to the gateway.
pub fn handle_cli(cli: Cli) -> Result<bool> {
    match cli.command {
        None | Some(Commands::Serve) => Ok(false),
        Some(Commands::Config { show, path }) => {
            if path {
                handle_config_path()?;
            } else if show {
                handle_config_show()?;
            } else {
                // No flag provided, show help
                println!("Usage: chatbridge config [--show|--path]");
                println!();
                println!("Options:");
                println!("  --show    Display effective configuration (credentials redacted)");
                println!("  --path    Show config file path");
            }
            Ok(true)
        }
        Some(Commands::Mappings { command }) => {
            handle_mappings(command)?;
            Ok(true)
        }
    }
}

fn handle_config_path() -> Result<()> {
    let path = Config::config_path().context("Could not determine config path")?;
    println!("{}", path.display());
    Ok(())
}

fn handle_config_show() -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;

    println!("# Effective configuration (env > file > defaults)");
    println!();
    print!("{}", config.to_toml());

    println!();
    if let Some(path) = Config::config_path() {
        if path.exists() {
            println!("# Source: {}", path.display());
        } else {
            println!("# Source: defaults (no config file)");
        }
    }

    if let Err(e) = config.validate() {
        println!("# Warning: {e}");
    }
    Ok(())
}

fn open_store(config: &Config) -> Result<MappingStore> {
    MappingStore::open(config.store.store_options()).with_context(|| {
        format!(
            "Failed to open mapping store at {}",
            config.store.db_path.display()
        )
    })
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("Failed to render output")?;
    println!("{text}");
    Ok(())
}

fn handle_mappings(command: MappingsCommand) -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;
    let store = open_store(&config)?;

    match command {
        MappingsCommand::Stats => {
            let stats = store.stats().context("Failed to read mapping stats")?;
            print_json(&stats)?;
        }
        MappingsCommand::Recent { limit } => {
            let rows = store.recent(limit).context("Failed to read mappings")?;
            print_json(&rows)?;
        }
        MappingsCommand::Purge { max_age_days } => {
            let age = Duration::from_secs(max_age_days.saturating_mul(86_400));
            let removed = store.purge(age).context("Failed to purge mappings")?;
            println!("Removed {removed} mapping(s) unused for {max_age_days} day(s)");
        }
        MappingsCommand::Delete { session_key } => {
            if store.delete(&session_key).context("Failed to delete mapping")? {
                println!("Deleted mapping for {session_key}");
            } else {
                println!("No mapping for {session_key}");
            }
        }
        MappingsCommand::Optimize => {
            store.optimize().context("Failed to optimize mapping store")?;
            println!("Optimized {}", store.path().display());
        }
        MappingsCommand::Info => {
            let info = store.database_info().context("Failed to read database info")?;
            print_json(&info)?;
        }
        MappingsCommand::Import { file } => {
            let report = store
                .import_json(&file)
                .with_context(|| format!("Failed to import {}", file.display()))?;
            println!(
                "Imported {} mapping(s), skipped {} from {}",
                report.imported,
                report.skipped,
                file.display()
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_command_means_serve() {
        let cli = Cli::try_parse_from(["chatbridge"]).unwrap();
        assert!(cli.command.is_none());
        assert!(!handle_cli(cli).unwrap());

        let cli = Cli::try_parse_from(["chatbridge", "serve"]).unwrap();
        assert!(!handle_cli(cli).unwrap());
    }

    #[test]
    fn test_mappings_arguments() {
        let cli = Cli::try_parse_from(["chatbridge", "mappings", "purge", "--max-age-days", "7"])
            .unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::Mappings {
                command: MappingsCommand::Purge { max_age_days: 7 }
            })
        ));

        let cli = Cli::try_parse_from(["chatbridge", "mappings", "recent"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::Mappings {
                command: MappingsCommand::Recent { limit: 10 }
            })
        ));

        assert!(Cli::try_parse_from(["chatbridge", "mappings", "delete"]).is_err());
    }
}
