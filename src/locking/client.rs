use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use super::{Backend, lock_key, parse_key};
use crate::errors::LockError;
use crate::models::{CommandLock, CommandName, Project, ProjectLock, PullRequest, User};

/// Outcome of a lock attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TryLockResponse {
    /// Whether this call installed the lock.
    pub lock_acquired: bool,
    /// The lock holding the slot after the call.
    pub current_lock: ProjectLock,
    pub lock_key: String,
}

/// Key-addressed locking operations.
#[async_trait]
pub trait Locker: Send + Sync {
    async fn try_lock(
        &self,
        project: Project,
        workspace: &str,
        pull: PullRequest,
        user: User,
    ) -> Result<TryLockResponse, LockError>;

    async fn unlock(&self, key: &str) -> Result<Option<ProjectLock>, LockError>;

    /// All locks keyed by lock key.
    async fn list(&self) -> Result<BTreeMap<String, ProjectLock>, LockError>;

    async fn unlock_by_pull(&self, repo_full_name: &str, pull_num: u64) -> Result<Vec<ProjectLock>, LockError>;

    async fn get_lock(&self, key: &str) -> Result<Option<ProjectLock>, LockError>;
}

/// [`Locker`] over a storage backend.
#[derive(Clone)]
pub struct Client {
    backend: Arc<dyn Backend>,
}

impl Client {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Locker for Client {
    async fn try_lock(
        &self,
        project: Project,
        workspace: &str,
        pull: PullRequest,
        user: User,
    ) -> Result<TryLockResponse, LockError> {
        let lock = ProjectLock {
            project,
            workspace: workspace.to_string(),
            pull,
            user,
            time: Utc::now(),
        };
        let key = lock_key(&lock.project, &lock.workspace);
        let (lock_acquired, current_lock) = self.backend.try_lock(lock).await?;
        tracing::debug!(lock_key = %key, acquired = lock_acquired, holder = current_lock.pull.num, "try lock");
        Ok(TryLockResponse {
            lock_acquired,
            current_lock,
            lock_key: key,
        })
    }

    async fn unlock(&self, key: &str) -> Result<Option<ProjectLock>, LockError> {
        let (project, workspace) = parse_key(key)?;
        let removed = self.backend.unlock(&project, &workspace).await?;
        if removed.is_some() {
            tracing::info!(lock_key = %key, "unlocked");
        }
        Ok(removed)
    }

    async fn list(&self) -> Result<BTreeMap<String, ProjectLock>, LockError> {
        Ok(self
            .backend
            .list()
            .await?
            .into_iter()
            .map(|l| (lock_key(&l.project, &l.workspace), l))
            .collect())
    }

    async fn unlock_by_pull(&self, repo_full_name: &str, pull_num: u64) -> Result<Vec<ProjectLock>, LockError> {
        self.backend.unlock_by_pull(repo_full_name, pull_num).await
    }

    async fn get_lock(&self, key: &str) -> Result<Option<ProjectLock>, LockError> {
        let (project, workspace) = parse_key(key)?;
        self.backend.get_lock(&project, &workspace).await
    }
}

/// [`Locker`] used when locking is disabled: every attempt succeeds and
/// nothing is stored.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpLocker;

#[async_trait]
impl Locker for NoOpLocker {
    async fn try_lock(
        &self,
        project: Project,
        workspace: &str,
        pull: PullRequest,
        user: User,
    ) -> Result<TryLockResponse, LockError> {
        let lock_key = lock_key(&project, workspace);
        Ok(TryLockResponse {
            lock_acquired: true,
            current_lock: ProjectLock {
                project,
                workspace: workspace.to_string(),
                pull,
                user,
                time: Utc::now(),
            },
            lock_key,
        })
    }

    async fn unlock(&self, key: &str) -> Result<Option<ProjectLock>, LockError> {
        parse_key(key)?;
        Ok(None)
    }

    async fn list(&self) -> Result<BTreeMap<String, ProjectLock>, LockError> {
        Ok(BTreeMap::new())
    }

    async fn unlock_by_pull(&self, _repo_full_name: &str, _pull_num: u64) -> Result<Vec<ProjectLock>, LockError> {
        Ok(Vec::new())
    }

    async fn get_lock(&self, key: &str) -> Result<Option<ProjectLock>, LockError> {
        parse_key(key)?;
        Ok(None)
    }
}

/// Global per-command locks, e.g. "applies are disabled".
#[derive(Clone)]
pub struct CommandLocker {
    backend: Arc<dyn Backend>,
}

impl CommandLocker {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// Returns whether this call took the lock, and the current lock.
    pub async fn lock(&self, command: CommandName) -> Result<(bool, CommandLock), LockError> {
        let (acquired, lock) = self.backend.lock_command(command, Utc::now()).await?;
        if acquired {
            tracing::info!(command = %command, "command locked");
        }
        Ok((acquired, lock))
    }

    pub async fn unlock(&self, command: CommandName) -> Result<Option<CommandLock>, LockError> {
        let removed = self.backend.unlock_command(command).await?;
        if removed.is_some() {
            tracing::info!(command = %command, "command unlocked");
        }
        Ok(removed)
    }

    pub async fn check(&self, command: CommandName) -> Result<Option<CommandLock>, LockError> {
        self.backend.check_command_lock(command).await
    }
}
