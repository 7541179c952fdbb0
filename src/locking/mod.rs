//! Project and command locking.
//!
//! A [`Backend`] stores at most one [`ProjectLock`] per `(project,
//! workspace)` slot and at most one [`CommandLock`] per command name. The
//! layers above it:
//!
//! - [`Client`] / [`NoOpLocker`] implement [`Locker`], the key-addressed
//!   view used by the HTTP API and the workflow runner.
//! - [`ProjectLocker`] adds the pull request side effects (conflict
//!   comments, same-pull re-locks).
//! - [`sweeper`] removes locks older than the configured age.

pub mod client;
pub mod key;
pub mod memory;
pub mod project_locker;
pub mod sqlite;
pub mod sweeper;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::LockError;
use crate::models::{CommandLock, CommandName, Project, ProjectLock};

pub use client::{Client, CommandLocker, Locker, NoOpLocker, TryLockResponse};
pub use key::{lock_key, parse_key};
pub use memory::InMemoryBackend;
pub use project_locker::{ProjectLockResponse, ProjectLocker, UnlockHandle};
pub use sqlite::SqliteBackend;
pub use sweeper::{spawn_lock_sweeper, sweep_stale_locks};

/// Storage for lock state. Every method is atomic with respect to every
/// other call on the same backend.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Install `lock` unless its slot is taken. Returns whether it was
    /// installed and the lock now holding the slot.
    async fn try_lock(&self, lock: ProjectLock) -> Result<(bool, ProjectLock), LockError>;

    /// Remove and return the lock on the slot, if any.
    async fn unlock(&self, project: &Project, workspace: &str) -> Result<Option<ProjectLock>, LockError>;

    async fn list(&self) -> Result<Vec<ProjectLock>, LockError>;

    async fn get_lock(&self, project: &Project, workspace: &str) -> Result<Option<ProjectLock>, LockError>;

    /// Remove every lock held by the pull request.
    async fn unlock_by_pull(&self, repo_full_name: &str, pull_num: u64) -> Result<Vec<ProjectLock>, LockError>;

    /// Remove every lock whose pull request was opened before `cutoff`
    /// (see [`ProjectLock::pull_opened_at`]).
    async fn unlock_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<ProjectLock>, LockError>;

    async fn lock_command(&self, command: CommandName, time: DateTime<Utc>) -> Result<(bool, CommandLock), LockError>;

    async fn unlock_command(&self, command: CommandName) -> Result<Option<CommandLock>, LockError>;

    async fn check_command_lock(&self, command: CommandName) -> Result<Option<CommandLock>, LockError>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::models::{PullRequest, User};

    pub fn lock_for(repo: &str, path: &str, workspace: &str, pull_num: u64) -> ProjectLock {
        ProjectLock {
            project: Project::new(repo, path),
            workspace: workspace.to_string(),
            pull: PullRequest {
                num: pull_num,
                repo_full_name: repo.to_string(),
                ..Default::default()
            },
            user: User::new("alice"),
            time: Utc::now(),
        }
    }

    /// Behaviour every backend must share.
    pub async fn exercise_backend(backend: std::sync::Arc<dyn Backend>) {
        // Mutual exclusion under racing callers.
        let mut handles = Vec::new();
        for pull in 1..=16u64 {
            let backend = backend.clone();
            handles.push(tokio::spawn(async move {
                backend.try_lock(lock_for("owner/repo", "net", "default", pull)).await
            }));
        }
        let mut winners = Vec::new();
        let mut holders = Vec::new();
        for handle in handles {
            let (acquired, holder) = handle.await.unwrap().unwrap();
            if acquired {
                winners.push(holder.pull.num);
            }
            holders.push(holder.pull.num);
        }
        assert_eq!(winners.len(), 1, "exactly one caller must win");
        assert!(holders.iter().all(|n| *n == winners[0]));

        // Unlock-by-pull leaves nothing behind for that pull.
        backend.try_lock(lock_for("owner/repo", "app", "default", 99)).await.unwrap();
        backend.try_lock(lock_for("owner/repo", "app", "staging", 99)).await.unwrap();
        backend.try_lock(lock_for("owner/other", "app", "default", 99)).await.unwrap();
        let removed = backend.unlock_by_pull("owner/repo", 99).await.unwrap();
        assert_eq!(removed.len(), 2);
        let remaining = backend.list().await.unwrap();
        assert!(
            !remaining
                .iter()
                .any(|l| l.pull.num == 99 && l.project.repo_full_name == "owner/repo")
        );
        assert!(remaining.iter().any(|l| l.project.repo_full_name == "owner/other"));

        // Unlocking an absent slot is a no-op.
        let project = Project::new("owner/repo", "missing");
        assert!(backend.unlock(&project, "default").await.unwrap().is_none());

        // Stale sweep only removes locks older than the cutoff.
        let mut old = lock_for("owner/repo", "old", "default", 5);
        old.time = Utc::now() - chrono::Duration::days(30);
        backend.try_lock(old).await.unwrap();
        let swept = backend
            .unlock_stale(Utc::now() - chrono::Duration::days(7))
            .await
            .unwrap();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].project.path, "old");
        assert!(
            backend
                .get_lock(&Project::new("owner/repo", "net"), "default")
                .await
                .unwrap()
                .is_some()
        );

        // Command locks.
        assert!(backend.check_command_lock(CommandName::Apply).await.unwrap().is_none());
        let (acquired, _) = backend.lock_command(CommandName::Apply, Utc::now()).await.unwrap();
        assert!(acquired);
        let (acquired, _) = backend.lock_command(CommandName::Apply, Utc::now()).await.unwrap();
        assert!(!acquired);
        assert!(backend.unlock_command(CommandName::Apply).await.unwrap().is_some());
        assert!(backend.check_command_lock(CommandName::Apply).await.unwrap().is_none());
    }
}
