use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "gitplan")]
#[command(version, about = "GitOps server core for Terraform: project locks, job output streaming and ordered deploys")]
pub struct Cli {
    /// Path to gitplan.toml. Defaults to .gitplan/gitplan.toml in the project directory.
    #[arg(long, global = true, env = "GITPLAN_CONFIG")]
    pub config: Option<PathBuf>,

    /// SQLite database path, or ":memory:". Overrides [database] path.
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP server
    Serve {
        /// Port to serve on. Overrides [server] port.
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind. Overrides [server] host.
        #[arg(long)]
        host: Option<String>,
    },
    /// Inspect or release project locks
    Locks {
        #[command(subcommand)]
        command: LocksCommands,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum LocksCommands {
    /// List every held lock
    List,
    /// Release the lock at a key (`owner/repo/path/workspace`)
    Unlock { key: String },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default gitplan.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Serve { port, host } => {
            let mut config = cmd::load_config(&cli, &project_dir)?;
            if let Some(port) = port {
                config.server.port = *port;
            }
            if let Some(host) = host {
                config.server.host = host.clone();
            }
            let _guard = gitplan::logging::init_tracing(&config.logging)?;
            cmd::cmd_serve(config).await?;
        }
        Commands::Locks { command } => {
            let config = cmd::load_config(&cli, &project_dir)?;
            cmd::cmd_locks(&config, command.clone()).await?;
        }
        Commands::Config { command } => {
            cmd::cmd_config(&cli, &project_dir, command.clone())?;
        }
    }

    Ok(())
}
