//! VCS collaborator interface.
//!
//! The core only needs a handful of calls from the VCS host; they are
//! expressed as the [`VcsClient`] trait so the deployer, locker and
//! pull-closed handling can be driven by a fake in tests. `github` holds
//! the production implementation.

pub mod github;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::{Direction, PullRequest};

pub use github::GithubClient;

/// State a check run is moved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckRunState {
    Queued,
    InProgress,
    Success,
    Failure,
}

/// Button offered on a check run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRunAction {
    pub label: String,
    pub description: String,
    pub identifier: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckRunUpdate {
    pub state: CheckRunState,
    pub title: String,
    pub summary: String,
    pub actions: Vec<CheckRunAction>,
}

impl CheckRunUpdate {
    pub fn new(state: CheckRunState, title: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            state,
            title: title.into(),
            summary: summary.into(),
            actions: Vec::new(),
        }
    }
}

#[async_trait]
pub trait VcsClient: Send + Sync {
    /// Direction of `head` relative to `base`.
    async fn compare_commits(&self, repo: &str, base: &str, head: &str) -> anyhow::Result<Direction>;

    async fn list_open_pull_requests(&self, repo: &str) -> anyhow::Result<Vec<PullRequest>>;

    /// Repo-relative paths touched by a pull request, including the old
    /// side of renames.
    async fn list_modified_files(&self, repo: &str, pull_num: u64) -> anyhow::Result<Vec<String>>;

    async fn update_check_run(
        &self,
        repo: &str,
        check_run_id: i64,
        update: CheckRunUpdate,
    ) -> anyhow::Result<()>;

    async fn create_comment(&self, repo: &str, pull_num: u64, body: &str) -> anyhow::Result<()>;
}
