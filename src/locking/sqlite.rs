use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{Backend, lock_key};
use crate::db::DbHandle;
use crate::errors::LockError;
use crate::models::{CommandLock, CommandName, Project, ProjectLock};

/// Lock backend persisted in the gitplan SQLite database. Atomicity comes
/// from the database mutex plus a transaction per call.
#[derive(Clone)]
pub struct SqliteBackend {
    db: DbHandle,
}

impl SqliteBackend {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Backend for SqliteBackend {
    async fn try_lock(&self, lock: ProjectLock) -> Result<(bool, ProjectLock), LockError> {
        let key = lock_key(&lock.project, &lock.workspace);
        self.db
            .call(move |db| db.try_lock(&key, &lock))
            .await
            .map_err(LockError::Backend)
    }

    async fn unlock(&self, project: &Project, workspace: &str) -> Result<Option<ProjectLock>, LockError> {
        let key = lock_key(project, workspace);
        self.db
            .call(move |db| db.unlock(&key))
            .await
            .map_err(LockError::Backend)
    }

    async fn list(&self) -> Result<Vec<ProjectLock>, LockError> {
        self.db
            .call(|db| db.list_locks())
            .await
            .map_err(LockError::Backend)
    }

    async fn get_lock(&self, project: &Project, workspace: &str) -> Result<Option<ProjectLock>, LockError> {
        let key = lock_key(project, workspace);
        self.db
            .call(move |db| db.get_lock(&key))
            .await
            .map_err(LockError::Backend)
    }

    async fn unlock_by_pull(&self, repo_full_name: &str, pull_num: u64) -> Result<Vec<ProjectLock>, LockError> {
        let repo = repo_full_name.to_string();
        self.db
            .call(move |db| db.unlock_by_pull(&repo, pull_num))
            .await
            .map_err(LockError::Backend)
    }

    async fn unlock_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<ProjectLock>, LockError> {
        self.db
            .call(move |db| db.unlock_older_than(cutoff))
            .await
            .map_err(LockError::Backend)
    }

    async fn lock_command(&self, command: CommandName, time: DateTime<Utc>) -> Result<(bool, CommandLock), LockError> {
        self.db
            .call(move |db| db.lock_command(command, time))
            .await
            .map_err(LockError::Backend)
    }

    async fn unlock_command(&self, command: CommandName) -> Result<Option<CommandLock>, LockError> {
        self.db
            .call(move |db| db.unlock_command(command))
            .await
            .map_err(LockError::Backend)
    }

    async fn check_command_lock(&self, command: CommandName) -> Result<Option<CommandLock>, LockError> {
        self.db
            .call(move |db| db.check_command_lock(command))
            .await
            .map_err(LockError::Backend)
    }
}
