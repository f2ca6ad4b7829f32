//! Configuration file management

use crate::cli::WatchArgs;
use crate::cli::commands::watch::effective_config;
use anyhow::{Context, Result, bail};
use blink_core::BlinkConfig;
use clap::{Args, Subcommand};
use std::path::{Path, PathBuf};

/// Show, locate or initialize the configuration file
#[derive(Debug, Args)]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub subcommand: ConfigSubcommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigSubcommand {
    /// Print the effective configuration as TOML
    Show,

    /// Print the location of the configuration file
    Path,

    /// Write a configuration file with default values
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print one value by dotted key, e.g. webhook.url
    Get {
        key: String,
    },
}

pub fn handle_config_command(
    command: ConfigCommand,
    overrides: &WatchArgs,
    config_path: Option<&Path>,
) -> Result<()> {
    match command.subcommand {
        ConfigSubcommand::Show => {
            let config = effective_config(overrides, config_path)?;
            print!("{}", config.to_toml()?);
        }
        ConfigSubcommand::Path => {
            println!("{}", resolve_path(config_path)?.display());
        }
        ConfigSubcommand::Init { force } => {
            let path = resolve_path(config_path)?;
            init(&path, force)?;
            println!("Wrote default configuration to {}", path.display());
        }
        ConfigSubcommand::Get { key } => {
            let config = effective_config(overrides, config_path)?;
            println!("{}", get(&config, &key)?);
        }
    }
    Ok(())
}

fn resolve_path(explicit: Option<&Path>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path.to_path_buf()),
        None => BlinkConfig::default_path().context("Cannot locate home directory for the config file"),
    }
}

fn init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists, use --force to overwrite it", path.display());
    }
    BlinkConfig::default().to_file(path)
}

fn get(config: &BlinkConfig, key: &str) -> Result<String> {
    match config.get(key)? {
        Some(toml::Value::String(s)) => Ok(s),
        Some(toml::Value::Table(table)) => toml::to_string_pretty(&table).context("Failed to format value"),
        Some(value) => Ok(value.to_string()),
        None => bail!("Unknown config key: {}", key),
    }
}
