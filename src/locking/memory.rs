use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{Backend, lock_key};
use crate::errors::LockError;
use crate::models::{CommandLock, CommandName, Project, ProjectLock};

#[derive(Default)]
struct LockTable {
    locks: HashMap<String, ProjectLock>,
    commands: HashMap<CommandName, CommandLock>,
}

/// Process-local backend; locks do not survive a restart.
#[derive(Default)]
pub struct InMemoryBackend {
    table: Mutex<LockTable>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> Result<MutexGuard<'_, LockTable>, LockError> {
        self.table
            .lock()
            .map_err(|e| LockError::Backend(anyhow::anyhow!("lock table poisoned: {}", e)))
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn try_lock(&self, lock: ProjectLock) -> Result<(bool, ProjectLock), LockError> {
        let key = lock_key(&lock.project, &lock.workspace);
        let mut table = self.table()?;
        if let Some(existing) = table.locks.get(&key) {
            return Ok((false, existing.clone()));
        }
        table.locks.insert(key, lock.clone());
        Ok((true, lock))
    }

    async fn unlock(&self, project: &Project, workspace: &str) -> Result<Option<ProjectLock>, LockError> {
        Ok(self.table()?.locks.remove(&lock_key(project, workspace)))
    }

    async fn list(&self) -> Result<Vec<ProjectLock>, LockError> {
        let table = self.table()?;
        let mut locks: Vec<(&String, &ProjectLock)> = table.locks.iter().collect();
        locks.sort_by(|a, b| a.0.cmp(b.0));
        Ok(locks.into_iter().map(|(_, l)| l.clone()).collect())
    }

    async fn get_lock(&self, project: &Project, workspace: &str) -> Result<Option<ProjectLock>, LockError> {
        Ok(self.table()?.locks.get(&lock_key(project, workspace)).cloned())
    }

    async fn unlock_by_pull(&self, repo_full_name: &str, pull_num: u64) -> Result<Vec<ProjectLock>, LockError> {
        let mut table = self.table()?;
        Ok(remove_where(&mut table.locks, |l| {
            l.project.repo_full_name == repo_full_name && l.pull.num == pull_num
        }))
    }

    async fn unlock_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<ProjectLock>, LockError> {
        let mut table = self.table()?;
        Ok(remove_where(&mut table.locks, |l| l.pull_opened_at() < cutoff))
    }

    async fn lock_command(&self, command: CommandName, time: DateTime<Utc>) -> Result<(bool, CommandLock), LockError> {
        let mut table = self.table()?;
        if let Some(existing) = table.commands.get(&command) {
            return Ok((false, existing.clone()));
        }
        let lock = CommandLock { command, time };
        table.commands.insert(command, lock.clone());
        Ok((true, lock))
    }

    async fn unlock_command(&self, command: CommandName) -> Result<Option<CommandLock>, LockError> {
        Ok(self.table()?.commands.remove(&command))
    }

    async fn check_command_lock(&self, command: CommandName) -> Result<Option<CommandLock>, LockError> {
        Ok(self.table()?.commands.get(&command).cloned())
    }
}

fn remove_where(
    locks: &mut HashMap<String, ProjectLock>,
    pred: impl Fn(&ProjectLock) -> bool,
) -> Vec<ProjectLock> {
    let mut keys: Vec<String> = locks
        .iter()
        .filter(|(_, l)| pred(l))
        .map(|(k, _)| k.clone())
        .collect();
    keys.sort();
    keys.into_iter().filter_map(|k| locks.remove(&k)).collect()
}
