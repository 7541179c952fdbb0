use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Terraform workspace used when a project does not name one.
pub const DEFAULT_WORKSPACE: &str = "default";

/// A directory inside a repository that Terraform runs against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Project {
    pub repo_full_name: String,
    pub path: String,
}

impl Project {
    /// Build a project, normalizing the path so `./modules/`, `modules` and
    /// `modules/` all address the same lock slot. The repo root is `.`.
    pub fn new(repo_full_name: impl Into<String>, path: impl AsRef<str>) -> Self {
        Self {
            repo_full_name: repo_full_name.into(),
            path: normalize_path(path.as_ref()),
        }
    }
}

impl fmt::Display for Project {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.repo_full_name, self.path)
    }
}

/// Normalize a repo-relative path: strip leading `./` and trailing `/`,
/// collapse empty to `.`.
pub fn normalize_path(path: &str) -> String {
    let mut p = path.trim();
    while let Some(rest) = p.strip_prefix("./") {
        p = rest;
    }
    let p = p.trim_end_matches('/');
    if p.is_empty() || p == "." {
        ".".to_string()
    } else {
        p.to_string()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub username: String,
}

impl User {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
        }
    }
}

/// The subset of pull request metadata the core needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub num: u64,
    pub repo_full_name: String,
    #[serde(default)]
    pub head_commit: String,
    #[serde(default)]
    pub head_branch: String,
    #[serde(default)]
    pub base_branch: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub url: String,
    /// When the pull request was opened, if the VCS reported it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Exclusive claim on a (project, workspace) slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectLock {
    pub project: Project,
    pub workspace: String,
    pub pull: PullRequest,
    pub user: User,
    pub time: DateTime<Utc>,
}

impl ProjectLock {
    /// Age reference for stale sweeps: when the holding pull request was
    /// opened, or when the lock was taken if that is unknown.
    pub fn pull_opened_at(&self) -> DateTime<Utc> {
        self.pull.created_at.unwrap_or(self.time)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandName {
    Plan,
    Apply,
}

impl CommandName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Apply => "apply",
        }
    }
}

impl fmt::Display for CommandName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plan" => Ok(Self::Plan),
            "apply" => Ok(Self::Apply),
            _ => Err(format!("Invalid command: {}", s)),
        }
    }
}

/// Global lock disabling a whole command class, e.g. all applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandLock {
    pub command: CommandName,
    pub time: DateTime<Utc>,
}

/// Identifies the pull request a job belongs to. Jobs are cleaned up per pull.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PullInfo {
    pub repo_full_name: String,
    pub pull_num: u64,
}

/// What a job's output is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    pub pull: PullInfo,
    pub project_path: String,
    pub workspace: String,
    #[serde(default)]
    pub head_commit: String,
}

/// Fresh opaque job identifier.
pub fn new_job_id() -> String {
    Uuid::new_v4().to_string()
}

/// One deployable Terraform configuration and the paths that affect it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Root {
    pub name: String,
    pub path: String,
    /// Glob patterns relative to `path`; `!` prefix excludes.
    pub when_modified: Vec<String>,
}

impl Root {
    pub fn new(name: impl Into<String>, path: impl AsRef<str>, when_modified: Vec<String>) -> Self {
        Self {
            name: name.into(),
            path: normalize_path(path.as_ref()),
            when_modified,
        }
    }
}

/// Ordering of a requested revision relative to the latest deployed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Ahead,
    Behind,
    Identical,
    Diverged,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ahead => "ahead",
            Self::Behind => "behind",
            Self::Identical => "identical",
            Self::Diverged => "diverged",
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ahead" => Ok(Self::Ahead),
            "behind" => Ok(Self::Behind),
            "identical" => Ok(Self::Identical),
            "diverged" => Ok(Self::Diverged),
            _ => Err(format!("Invalid commit direction: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    #[default]
    Merge,
    Manual,
}

/// Latest deployed revision of a root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentInfo {
    pub id: Uuid,
    pub revision: String,
    pub repo_full_name: String,
    pub root_name: String,
    pub time: DateTime<Utc>,
}

/// A request to deploy `revision` of `root`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRequest {
    pub id: Uuid,
    pub revision: String,
    pub repo_full_name: String,
    pub root: Root,
    pub trigger: Trigger,
    /// Explicit re-run of the most recently attempted revision.
    pub rerun: bool,
    pub check_run_id: i64,
    pub job_id: String,
}

impl DeploymentRequest {
    pub fn new(repo_full_name: impl Into<String>, root: Root, revision: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            revision: revision.into(),
            repo_full_name: repo_full_name.into(),
            root,
            trigger: Trigger::Merge,
            rerun: false,
            check_run_id: 0,
            job_id: new_job_id(),
        }
    }

    /// Record that is stored as the root's latest deployment once this
    /// request has been attempted.
    pub fn build_persistable_info(&self) -> DeploymentInfo {
        DeploymentInfo {
            id: self.id,
            revision: self.revision.clone(),
            repo_full_name: self.repo_full_name.clone(),
            root_name: self.root.name.clone(),
            time: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path_variants() {
        assert_eq!(normalize_path("./modules/"), "modules");
        assert_eq!(normalize_path("modules"), "modules");
        assert_eq!(normalize_path("././a/b"), "a/b");
        assert_eq!(normalize_path(""), ".");
        assert_eq!(normalize_path("./"), ".");
        assert_eq!(normalize_path("."), ".");
    }

    #[test]
    fn test_project_new_normalizes() {
        let a = Project::new("owner/repo", "./infra/");
        let b = Project::new("owner/repo", "infra");
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "owner/repo/infra");
    }

    #[test]
    fn test_command_name_round_trip() {
        assert_eq!("apply".parse::<CommandName>().unwrap(), CommandName::Apply);
        assert_eq!(CommandName::Plan.as_str(), "plan");
        assert!("destroy".parse::<CommandName>().is_err());
    }

    #[test]
    fn test_direction_parses_github_status() {
        assert_eq!("behind".parse::<Direction>().unwrap(), Direction::Behind);
        assert_eq!("diverged".parse::<Direction>().unwrap(), Direction::Diverged);
        assert!("sideways".parse::<Direction>().is_err());
    }

    #[test]
    fn test_persistable_info_uses_requested_revision() {
        let root = Root::new("network", "./network", vec!["**/*.tf".into()]);
        let req = DeploymentRequest::new("owner/repo", root, "abc123");
        let info = req.build_persistable_info();
        assert_eq!(info.id, req.id);
        assert_eq!(info.revision, "abc123");
        assert_eq!(info.root_name, "network");
        assert_eq!(info.repo_full_name, "owner/repo");
    }
}
