use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::errors::LockError;
use crate::jobs::OutputHandler;
use crate::locking::Locker;
use crate::models::{ProjectLock, PullInfo};
use crate::vcs::VcsClient;

/// What closing a pull request released.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PullClosedSummary {
    pub released_locks: Vec<ProjectLock>,
    pub cleaned_jobs: Vec<String>,
    /// Whether the summary comment was posted. `false` when there was
    /// nothing to report.
    pub commented: bool,
}

/// Releases everything a pull request held once it is closed or merged.
pub struct PullClosedExecutor {
    locker: Arc<dyn Locker>,
    output: OutputHandler,
    vcs: Arc<dyn VcsClient>,
}

impl PullClosedExecutor {
    pub fn new(locker: Arc<dyn Locker>, output: OutputHandler, vcs: Arc<dyn VcsClient>) -> Self {
        Self {
            locker,
            output,
            vcs,
        }
    }

    pub async fn clean_up_pull(&self, pull: &PullInfo) -> Result<PullClosedSummary, LockError> {
        let released_locks = self
            .locker
            .unlock_by_pull(&pull.repo_full_name, pull.pull_num)
            .await?;
        let cleaned_jobs = self.output.clean_up(pull);

        let mut summary = PullClosedSummary {
            released_locks,
            cleaned_jobs,
            commented: false,
        };
        if summary.released_locks.is_empty() {
            return Ok(summary);
        }

        let body = summary_comment(&summary.released_locks);
        match self
            .vcs
            .create_comment(&pull.repo_full_name, pull.pull_num, &body)
            .await
        {
            Ok(()) => summary.commented = true,
            Err(e) => {
                tracing::warn!(
                    repo = %pull.repo_full_name,
                    pull = pull.pull_num,
                    error = %e,
                    "failed to post pull closed comment"
                );
            }
        }
        Ok(summary)
    }
}

/// One bullet per directory, listing the workspaces unlocked in it.
fn summary_comment(locks: &[ProjectLock]) -> String {
    let mut by_dir: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for lock in locks {
        by_dir
            .entry(lock.project.path.as_str())
            .or_default()
            .push(lock.workspace.as_str());
    }

    let mut body =
        String::from("Locks and plans deleted for the projects and workspaces modified in this pull request:\n");
    for (dir, mut workspaces) in by_dir {
        workspaces.sort_unstable();
        workspaces.dedup();
        let workspaces: Vec<String> = workspaces.iter().map(|w| format!("`{}`", w)).collect();
        body.push_str(&format!("\n- dir: `{}` workspaces: {}", dir, workspaces.join(", ")));
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::NoopStorageBackend;
    use crate::locking::testing::lock_for;
    use crate::locking::{Client, InMemoryBackend};
    use crate::models::{JobInfo, Project, User};
    use crate::vcs::fake::FakeVcs;
    use tokio_util::sync::CancellationToken;

    fn pull_info(num: u64) -> PullInfo {
        PullInfo {
            repo_full_name: "owner/repo".into(),
            pull_num: num,
        }
    }

    fn job_info(num: u64, path: &str) -> JobInfo {
        JobInfo {
            pull: pull_info(num),
            project_path: path.into(),
            workspace: "default".into(),
            head_commit: "abc123".into(),
        }
    }

    async fn lock(locker: &Client, num: u64, path: &str, ws: &str) {
        let l = lock_for("owner/repo", path, ws, num);
        let resp = locker
            .try_lock(Project::new("owner/repo", path), ws, l.pull, User::new("alice"))
            .await
            .unwrap();
        assert!(resp.lock_acquired);
    }

    struct Fixture {
        locker: Arc<Client>,
        output: OutputHandler,
        vcs: Arc<FakeVcs>,
        executor: PullClosedExecutor,
        _cancel: CancellationToken,
    }

    fn fixture() -> Fixture {
        let locker = Arc::new(Client::new(Arc::new(InMemoryBackend::new())));
        let output = OutputHandler::new(Arc::new(NoopStorageBackend), 16);
        let cancel = CancellationToken::new();
        let (h, c) = (output.clone(), cancel.clone());
        tokio::spawn(async move { h.handle(c).await });
        let vcs = Arc::new(FakeVcs::default());
        let executor = PullClosedExecutor::new(locker.clone(), output.clone(), vcs.clone());
        Fixture {
            locker,
            output,
            vcs,
            executor,
            _cancel: cancel,
        }
    }

    #[tokio::test]
    async fn test_releases_locks_and_jobs_of_closed_pull_only() {
        let fx = fixture();
        lock(&fx.locker, 1, "net", "default").await;
        lock(&fx.locker, 1, "net", "staging").await;
        lock(&fx.locker, 1, "app", "default").await;
        lock(&fx.locker, 2, "db", "default").await;
        fx.output.send("job-1", &job_info(1, "net"), "planning");
        fx.output.send("job-2", &job_info(2, "db"), "planning");
        fx.output.flush().await;

        let summary = fx.executor.clean_up_pull(&pull_info(1)).await.unwrap();
        assert_eq!(summary.released_locks.len(), 3);
        assert_eq!(summary.cleaned_jobs, vec!["job-1".to_string()]);
        assert!(summary.commented);

        let remaining = fx.locker.list().await.unwrap();
        assert_eq!(remaining.keys().collect::<Vec<_>>(), vec!["owner/repo/db/default"]);
        assert!(fx.output.job_output("job-1").await.is_err());
        assert!(fx.output.job_output("job-2").await.is_ok());
    }

    #[tokio::test]
    async fn test_comment_lists_each_dir_once() {
        let fx = fixture();
        lock(&fx.locker, 1, "net", "staging").await;
        lock(&fx.locker, 1, "net", "default").await;
        lock(&fx.locker, 1, "app", "default").await;

        fx.executor.clean_up_pull(&pull_info(1)).await.unwrap();
        let comments = fx.vcs.comments();
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].0, 1);
        assert_eq!(
            comments[0].1,
            "Locks and plans deleted for the projects and workspaces modified in this pull request:\n\
             \n- dir: `app` workspaces: `default`\
             \n- dir: `net` workspaces: `default`, `staging`"
        );
    }

    #[tokio::test]
    async fn test_no_comment_without_locks() {
        let fx = fixture();
        let summary = fx.executor.clean_up_pull(&pull_info(9)).await.unwrap();
        assert!(summary.released_locks.is_empty());
        assert!(!summary.commented);
        assert!(fx.vcs.comments().is_empty());
    }
}
