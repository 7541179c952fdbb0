//! Configuration view and validation commands: `gitplan config`.

use std::path::Path;

use anyhow::{Context, Result};
use gitplan::config::GitplanToml;

use super::super::{Cli, ConfigCommands};
use super::{config_path, load_config};

pub fn cmd_config(cli: &Cli, project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let path = config_path(cli, project_dir);

    match command {
        None | Some(ConfigCommands::Show) => {
            if path.exists() {
                println!("# Config file: {}", path.display());
            } else {
                println!("# No config file at {}; showing defaults", path.display());
            }
            let mut config = load_config(cli, project_dir)?;
            if config.github.token.is_some() {
                config.github.token = Some("<redacted>".to_string());
            }
            let rendered = toml::to_string_pretty(&config).context("Failed to render configuration")?;
            println!("{}", rendered);
        }
        Some(ConfigCommands::Validate) => {
            if !path.exists() {
                println!("No gitplan.toml found. Using defaults (valid).");
                return Ok(());
            }

            let config = GitplanToml::load(&path)?;
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
        }
        Some(ConfigCommands::Init) => {
            if path.exists() {
                anyhow::bail!("{} already exists", path.display());
            }
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            let rendered =
                toml::to_string_pretty(&GitplanToml::default()).context("Failed to render configuration")?;
            std::fs::write(&path, rendered).with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Created {}", path.display());
        }
    }
    Ok(())
}
