//! Configuration for the gitplan server.
//!
//! Read from `.gitplan/gitplan.toml` (or an explicit `--config` path), every
//! section optional, then overridden by environment variables.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 4141
//!
//! [database]
//! path = ".gitplan/gitplan.db"
//!
//! [locking]
//! disabled = false
//! stale_after_hours = 168
//! sweep_interval_secs = 3600
//!
//! [jobs]
//! storage = "filesystem"
//! storage_dir = ".gitplan/jobs"
//! subscriber_buffer = 1000
//!
//! [terraform]
//! bin_dir = "/usr/local/bin"
//! default_version = "1.7.5"
//! repos_dir = ".gitplan/repos"
//!
//! [github]
//! api_url = "https://api.github.com"
//!
//! [rebase]
//! max_attempts = 0
//! initial_interval_secs = 5
//! backoff_coefficient = 2.0
//! max_interval_secs = 18000
//!
//! [[roots]]
//! name = "network"
//! path = "infra/network"
//! when_modified = ["**/*.tf", "!**/README.md"]
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::models::Root;
use crate::retry::RetryPolicy;

/// Where completed job output is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// Keep output in memory only.
    #[default]
    Noop,
    /// JSON-lines files under `jobs.storage_dir`.
    Filesystem,
}

impl std::fmt::Display for StorageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageKind::Noop => write!(f, "noop"),
            StorageKind::Filesystem => write!(f, "filesystem"),
        }
    }
}

impl std::str::FromStr for StorageKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "noop" => Ok(StorageKind::Noop),
            "filesystem" => Ok(StorageKind::Filesystem),
            _ => anyhow::bail!(
                "Invalid job storage '{}'. Valid values: noop, filesystem",
                s
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    4141
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSection {
    /// SQLite file, or `:memory:`.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".gitplan/gitplan.db")
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockingSection {
    /// Grant every lock request without recording it.
    #[serde(default)]
    pub disabled: bool,
    /// Locks older than this are removed by the sweeper. 0 disables sweeping.
    #[serde(default = "default_stale_after_hours")]
    pub stale_after_hours: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_stale_after_hours() -> u64 {
    24 * 7
}

fn default_sweep_interval_secs() -> u64 {
    3600
}

impl Default for LockingSection {
    fn default() -> Self {
        Self {
            disabled: false,
            stale_after_hours: default_stale_after_hours(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl LockingSection {
    pub fn stale_after(&self) -> Option<chrono::Duration> {
        if self.stale_after_hours == 0 {
            None
        } else {
            Some(chrono::Duration::hours(self.stale_after_hours as i64))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsSection {
    #[serde(default)]
    pub storage: StorageKind,
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,
    /// Lines a live subscriber may fall behind before it is dropped.
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from(".gitplan/jobs")
}

fn default_subscriber_buffer() -> usize {
    1000
}

impl Default for JobsSection {
    fn default() -> Self {
        Self {
            storage: StorageKind::default(),
            storage_dir: default_storage_dir(),
            subscriber_buffer: default_subscriber_buffer(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerraformSection {
    /// Directory holding `terraform` / `terraform<version>` binaries.
    /// Unset means resolve `terraform` from `PATH`.
    #[serde(default)]
    pub bin_dir: Option<PathBuf>,
    #[serde(default)]
    pub default_version: Option<String>,
    #[serde(default)]
    pub plugin_cache_dir: Option<PathBuf>,
    /// Checkouts deploys run in, laid out as `<owner>/<repo>`.
    #[serde(default = "default_repos_dir")]
    pub repos_dir: PathBuf,
}

fn default_repos_dir() -> PathBuf {
    PathBuf::from(".gitplan/repos")
}

impl Default for TerraformSection {
    fn default() -> Self {
        Self {
            bin_dir: None,
            default_version: None,
            plugin_cache_dir: None,
            repos_dir: default_repos_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GithubSection {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Prefer the `GITHUB_TOKEN` environment variable over this.
    #[serde(default)]
    pub token: Option<String>,
}

fn default_api_url() -> String {
    "https://api.github.com".to_string()
}

impl Default for GithubSection {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            token: None,
        }
    }
}

/// Retry settings for the rebase-candidate scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebaseSection {
    /// 0 retries forever.
    #[serde(default)]
    pub max_attempts: u32,
    #[serde(default = "default_initial_interval_secs")]
    pub initial_interval_secs: u64,
    #[serde(default = "default_backoff_coefficient")]
    pub backoff_coefficient: f64,
    #[serde(default = "default_max_interval_secs")]
    pub max_interval_secs: u64,
}

fn default_initial_interval_secs() -> u64 {
    5
}

fn default_backoff_coefficient() -> f64 {
    2.0
}

fn default_max_interval_secs() -> u64 {
    5 * 60 * 60
}

impl Default for RebaseSection {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_interval_secs: default_initial_interval_secs(),
            backoff_coefficient: default_backoff_coefficient(),
            max_interval_secs: default_max_interval_secs(),
        }
    }
}

impl RebaseSection {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_interval: Duration::from_secs(self.initial_interval_secs),
            backoff_coefficient: self.backoff_coefficient,
            max_interval: Duration::from_secs(self.max_interval_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Default filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    /// Also write daily-rolling log files here.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootConfig {
    pub name: String,
    #[serde(default = "default_root_path")]
    pub path: String,
    #[serde(default = "default_when_modified")]
    pub when_modified: Vec<String>,
}

fn default_root_path() -> String {
    ".".to_string()
}

fn default_when_modified() -> Vec<String> {
    vec!["**/*.tf".to_string(), "**/*.tfvars".to_string()]
}

impl RootConfig {
    pub fn to_root(&self) -> Root {
        Root::new(&self.name, &self.path, self.when_modified.clone())
    }
}

/// The complete gitplan.toml configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GitplanToml {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub locking: LockingSection,
    #[serde(default)]
    pub jobs: JobsSection,
    #[serde(default)]
    pub terraform: TerraformSection,
    #[serde(default)]
    pub github: GithubSection,
    #[serde(default)]
    pub rebase: RebaseSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub roots: Vec<RootConfig>,
}

impl GitplanToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse gitplan.toml")
    }

    /// Load from `<dir>/gitplan.toml`, or defaults if the file does not exist.
    pub fn load_or_default(gitplan_dir: &Path) -> Result<Self> {
        let config_path = gitplan_dir.join("gitplan.toml");
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply environment variable overrides on top of file settings.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    fn apply_env_from(&mut self, get: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(port) = get("GITPLAN_PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("Invalid GITPLAN_PORT '{}'", port))?;
        }
        if let Some(path) = get("GITPLAN_DB_PATH") {
            self.database.path = PathBuf::from(path);
        }
        if let Some(level) = get("GITPLAN_LOG") {
            self.logging.level = level;
        }
        if let Some(storage) = get("GITPLAN_JOB_STORAGE") {
            self.jobs.storage = storage.parse()?;
        }
        if let Some(token) = get("GITHUB_TOKEN") {
            self.github.token = Some(token);
        }
        Ok(())
    }

    pub fn roots(&self) -> Vec<Root> {
        self.roots.iter().map(RootConfig::to_root).collect()
    }

    pub fn root(&self, name: &str) -> Option<Root> {
        self.roots
            .iter()
            .find(|r| r.name == name)
            .map(RootConfig::to_root)
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.jobs.subscriber_buffer == 0 {
            warnings.push("jobs.subscriber_buffer is 0: every live viewer will be dropped".to_string());
        }
        if self.rebase.backoff_coefficient < 1.0 {
            warnings.push(format!(
                "rebase.backoff_coefficient {} is below 1.0; backoff will shrink",
                self.rebase.backoff_coefficient
            ));
        }
        if self.rebase.max_interval_secs < self.rebase.initial_interval_secs {
            warnings.push("rebase.max_interval_secs is smaller than initial_interval_secs".to_string());
        }
        if let Some(token) = &self.github.token
            && !crate::vcs::github::is_valid_github_token(token)
        {
            warnings.push("github.token does not look like a GitHub token".to_string());
        }

        let mut seen = std::collections::HashSet::new();
        for root in &self.roots {
            if !seen.insert(root.name.as_str()) {
                warnings.push(format!("Duplicate root name '{}'", root.name));
            }
            if root.when_modified.is_empty() {
                warnings.push(format!(
                    "Root '{}' has no when_modified patterns and will never match",
                    root.name
                ));
            }
            for pattern in &root.when_modified {
                let body = pattern.strip_prefix('!').unwrap_or(pattern);
                if let Err(e) = glob::Pattern::new(body) {
                    warnings.push(format!(
                        "Invalid pattern '{}' in root '{}': {}",
                        pattern, root.name, e
                    ));
                }
            }
        }

        warnings
    }
}
