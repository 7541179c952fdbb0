use std::sync::Arc;

use super::Locker;
use crate::errors::LockError;
use crate::models::{Project, ProjectLock, PullRequest, User};
use crate::vcs::VcsClient;

/// Releases a lock taken through [`ProjectLocker::try_lock`].
pub struct UnlockHandle {
    locker: Arc<dyn Locker>,
    key: String,
}

impl UnlockHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn unlock(self) -> Result<Option<ProjectLock>, LockError> {
        self.locker.unlock(&self.key).await
    }
}

impl std::fmt::Debug for UnlockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnlockHandle").field("key", &self.key).finish()
    }
}

/// Result of [`ProjectLocker::try_lock`].
#[derive(Debug)]
pub struct ProjectLockResponse {
    pub lock_acquired: bool,
    /// Set when the slot is held by another pull request.
    pub lock_failure_reason: Option<String>,
    pub lock_key: String,
    /// Present only when acquired.
    pub unlock: Option<UnlockHandle>,
}

/// Lock acquisition for commands run on behalf of a pull request.
///
/// A slot already held by the same pull request counts as acquired, so a
/// re-plan never blocks on its own lock. A slot held by another pull
/// request is reported as a failure reason and posted on the requesting
/// pull request instead of being raised as an error.
pub struct ProjectLocker {
    locker: Arc<dyn Locker>,
    vcs: Arc<dyn VcsClient>,
}

impl ProjectLocker {
    pub fn new(locker: Arc<dyn Locker>, vcs: Arc<dyn VcsClient>) -> Self {
        Self { locker, vcs }
    }

    pub async fn try_lock(
        &self,
        project: Project,
        workspace: &str,
        pull: &PullRequest,
        user: User,
    ) -> Result<ProjectLockResponse, LockError> {
        let resp = self
            .locker
            .try_lock(project, workspace, pull.clone(), user)
            .await?;

        let holder = &resp.current_lock.pull;
        let held_by_us = holder.num == pull.num && holder.repo_full_name == pull.repo_full_name;
        if !resp.lock_acquired && !held_by_us {
            let reason = locked_by_message(holder.num);
            tracing::info!(
                lock_key = %resp.lock_key,
                pull = pull.num,
                holder = holder.num,
                "project is locked by another pull request"
            );
            if let Err(e) = self
                .vcs
                .create_comment(&pull.repo_full_name, pull.num, &reason)
                .await
            {
                tracing::warn!(pull = pull.num, error = %e, "failed to post lock conflict comment");
            }
            return Ok(ProjectLockResponse {
                lock_acquired: false,
                lock_failure_reason: Some(reason),
                lock_key: resp.lock_key,
                unlock: None,
            });
        }

        Ok(ProjectLockResponse {
            lock_acquired: true,
            lock_failure_reason: None,
            unlock: Some(UnlockHandle {
                locker: self.locker.clone(),
                key: resp.lock_key.clone(),
            }),
            lock_key: resp.lock_key,
        })
    }

    /// Release every lock the pull request holds.
    pub async fn unlock_pull(&self, pull: &PullRequest) -> Result<Vec<ProjectLock>, LockError> {
        self.locker
            .unlock_by_pull(&pull.repo_full_name, pull.num)
            .await
    }
}

fn locked_by_message(holder: u64) -> String {
    format!(
        "This project is currently locked by an unapplied plan from pull #{holder}. \
         To continue, delete the lock from #{holder} or apply that plan and merge the pull request."
    )
}
