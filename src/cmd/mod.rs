//! CLI command implementations.
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `serve`  | `Serve`          |
//! | `locks`  | `Locks`          |
//! | `config` | `Config`         |

pub mod config;
pub mod locks;
pub mod serve;

use std::path::{Path, PathBuf};

use anyhow::Result;
use gitplan::config::GitplanToml;

use super::Cli;

pub use config::cmd_config;
pub use locks::cmd_locks;
pub use serve::cmd_serve;

/// `--config`, or `.gitplan/gitplan.toml` under the project directory.
pub fn config_path(cli: &Cli, project_dir: &Path) -> PathBuf {
    cli.config
        .clone()
        .unwrap_or_else(|| project_dir.join(".gitplan").join("gitplan.toml"))
}

/// File settings, then environment overrides, then `--db`.
pub fn load_config(cli: &Cli, project_dir: &Path) -> Result<GitplanToml> {
    let path = config_path(cli, project_dir);
    let mut config = match &cli.config {
        Some(_) => GitplanToml::load(&path)?,
        None if path.exists() => GitplanToml::load(&path)?,
        None => GitplanToml::default(),
    };
    config.apply_env()?;
    if let Some(db) = &cli.db {
        config.database.path = db.clone();
    }
    Ok(config)
}
