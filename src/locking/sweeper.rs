use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::Backend;
use crate::errors::LockError;
use crate::models::ProjectLock;

/// Remove every lock whose pull request was opened more than `max_age`
/// before `now`. Locks without a known pull creation time age from when
/// they were taken.
pub async fn sweep_stale_locks(
    backend: &dyn Backend,
    max_age: chrono::Duration,
    now: DateTime<Utc>,
) -> Result<Vec<ProjectLock>, LockError> {
    let removed = backend.unlock_stale(now - max_age).await?;
    for lock in &removed {
        tracing::warn!(
            repo = %lock.project.repo_full_name,
            path = %lock.project.path,
            workspace = %lock.workspace,
            pull = lock.pull.num,
            locked_at = %lock.time,
            pull_opened_at = %lock.pull_opened_at(),
            "released stale lock"
        );
    }
    Ok(removed)
}

/// Run [`sweep_stale_locks`] every `interval` until `cancel` fires.
pub fn spawn_lock_sweeper(
    backend: Arc<dyn Backend>,
    max_age: chrono::Duration,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match sweep_stale_locks(backend.as_ref(), max_age, Utc::now()).await {
                        Ok(removed) if !removed.is_empty() => {
                            tracing::info!(count = removed.len(), "stale lock sweep finished");
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "stale lock sweep failed"),
                    }
                }
            }
        }
        tracing::debug!("lock sweeper stopped");
    })
}
