use std::sync::Arc;

use futures::future::join_all;

use crate::errors::BestEffort;
use crate::matcher::PathMatcher;
use crate::models::{PullRequest, Root};
use crate::retry::RetryPolicy;
use crate::vcs::VcsClient;

/// Finds open pull requests whose plans may be stale after a deploy of
/// `root`: those touching a path the root watches.
pub struct RebaseScanner {
    vcs: Arc<dyn VcsClient>,
    policy: RetryPolicy,
}

impl RebaseScanner {
    pub fn new(vcs: Arc<dyn VcsClient>, policy: RetryPolicy) -> Self {
        Self { vcs, policy }
    }

    /// Pull requests that need a rebase. Listing open pull requests is
    /// retried per the policy; a pull request whose files cannot be listed
    /// is included.
    pub async fn find_candidates(&self, repo: &str, root: &Root) -> BestEffort<Vec<PullRequest>> {
        let matcher = match PathMatcher::for_root(root) {
            Ok(m) => m,
            Err(e) => {
                tracing::error!(root = %root.name, error = %e, "invalid when_modified pattern");
                return BestEffort::Failed(e.to_string());
            }
        };

        let open = match self
            .policy
            .retry("list open pull requests", || {
                self.vcs.list_open_pull_requests(repo)
            })
            .await
        {
            Ok(prs) => prs,
            Err(e) => {
                tracing::error!(repo, error = %e, "giving up listing open pull requests");
                return BestEffort::Failed(format!("{:#}", e));
            }
        };

        let checks = open.into_iter().map(|pr| {
            let matcher = &matcher;
            async move {
                match self.vcs.list_modified_files(repo, pr.num).await {
                    Ok(files) => matcher.matches_any(&files).then_some(pr),
                    Err(e) => {
                        tracing::warn!(repo, pull = pr.num, error = %e, "could not list modified files; assuming rebase needed");
                        Some(pr)
                    }
                }
            }
        });
        let selected: Vec<PullRequest> = join_all(checks).await.into_iter().flatten().collect();

        BestEffort::Done(selected)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::vcs::fake::FakeVcs;

    fn pr(num: u64) -> PullRequest {
        PullRequest {
            num,
            repo_full_name: "owner/repo".into(),
            ..Default::default()
        }
    }

    fn fast_unbounded() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 0,
            initial_interval: Duration::from_millis(1),
            backoff_coefficient: 2.0,
            max_interval: Duration::from_millis(5),
        }
    }

    fn vcs_with(files: Vec<(u64, Result<Vec<String>, String>)>) -> Arc<FakeVcs> {
        let vcs = FakeVcs::default();
        for (num, f) in files {
            vcs.open_prs.lock().unwrap().push(pr(num));
            vcs.files.lock().unwrap().insert(num, f);
        }
        Arc::new(vcs)
    }

    fn root() -> Root {
        Root::new("root", ".", vec!["root/**".into()])
    }

    #[tokio::test]
    async fn test_selects_only_matching_pull_requests() {
        let vcs = vcs_with(vec![
            (1, Ok(vec!["root/a.tf".into()])),
            (2, Ok(vec!["other/b.tf".into()])),
        ]);
        let scanner = RebaseScanner::new(vcs, fast_unbounded());
        let selected = scanner.find_candidates("owner/repo", &root()).await.done().unwrap();
        assert_eq!(selected.iter().map(|p| p.num).collect::<Vec<_>>(), vec![1]);
    }

    #[tokio::test]
    async fn test_listing_error_selects_pull_request() {
        let vcs = vcs_with(vec![
            (1, Ok(vec!["root/a.tf".into()])),
            (2, Err("502 bad gateway".into())),
        ]);
        let scanner = RebaseScanner::new(vcs, fast_unbounded());
        let selected = scanner.find_candidates("owner/repo", &root()).await.done().unwrap();
        assert_eq!(selected.iter().map(|p| p.num).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_open_pull_listing_is_retried() {
        let vcs = vcs_with(vec![(1, Ok(vec!["root/a.tf".into()]))]);
        *vcs.fail_open_pr_listing.lock().unwrap() = 3;
        let scanner = RebaseScanner::new(vcs.clone(), fast_unbounded());
        let selected = scanner.find_candidates("owner/repo", &root()).await.done().unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(*vcs.list_open_calls.lock().unwrap(), 4);
    }

    #[tokio::test]
    async fn test_bounded_policy_gives_up() {
        let vcs = vcs_with(vec![]);
        *vcs.fail_open_pr_listing.lock().unwrap() = 10;
        let policy = RetryPolicy {
            max_attempts: 2,
            ..fast_unbounded()
        };
        let scanner = RebaseScanner::new(vcs, policy);
        let result = scanner.find_candidates("owner/repo", &root()).await;
        assert!(matches!(result, BestEffort::Failed(_)));
    }

    #[tokio::test]
    async fn test_root_relative_patterns() {
        let vcs = vcs_with(vec![
            (1, Ok(vec!["infra/net/main.tf".into()])),
            (2, Ok(vec!["infra/net/README.md".into()])),
            (3, Ok(vec!["infra/modules/vpc/main.tf".into()])),
        ]);
        let root = Root::new(
            "net",
            "infra/net",
            vec!["**/*.tf".into(), "../modules/**".into(), "!README.md".into()],
        );
        let scanner = RebaseScanner::new(vcs, fast_unbounded());
        let selected = scanner.find_candidates("owner/repo", &root).await.done().unwrap();
        assert_eq!(selected.iter().map(|p| p.num).collect::<Vec<_>>(), vec![1, 3]);
    }
}
