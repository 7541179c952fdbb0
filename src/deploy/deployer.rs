use std::sync::Arc;

use tokio::task::JoinHandle;

use super::direction::{check_policy, resolve_direction};
use super::rebase::RebaseScanner;
use super::store::DeploymentStore;
use super::workflow::WorkflowRunner;
use crate::errors::{BestEffort, DeployError, ValidationError, WorkflowError};
use crate::models::{DeploymentInfo, DeploymentRequest, PullRequest};
use crate::vcs::{CheckRunState, CheckRunUpdate, VcsClient};

/// A deploy that ran to completion.
#[derive(Debug)]
pub struct Deployed {
    /// Record describing the requested revision, now the root's latest.
    pub latest: DeploymentInfo,
    /// Whether `latest` reached the deployment store.
    pub persisted: BestEffort<()>,
    /// Background scan for open pull requests needing a rebase.
    pub rebase: JoinHandle<BestEffort<Vec<PullRequest>>>,
}

/// Runs deploy requests in revision order.
///
/// 1. The requested revision is compared with the latest deployed one and
///    rejected if it is behind, or if it is a rerun of anything but the
///    latest revision. Rejections fail the request's check run first.
/// 2. The workflow runs. A rejected plan is returned as is and nothing is
///    recorded.
/// 3. Any other outcome records the requested revision as the latest, so an
///    older request can never deploy over a partially applied newer one.
///    Failing to record it is logged and reported in [`Deployed::persisted`].
/// 4. After a successful run, open pull requests touching the root are
///    scanned in the background.
pub struct Deployer {
    vcs: Arc<dyn VcsClient>,
    store: Arc<dyn DeploymentStore>,
    workflow: Arc<dyn WorkflowRunner>,
    rebase: Arc<RebaseScanner>,
}

impl Deployer {
    pub fn new(
        vcs: Arc<dyn VcsClient>,
        store: Arc<dyn DeploymentStore>,
        workflow: Arc<dyn WorkflowRunner>,
        rebase: RebaseScanner,
    ) -> Self {
        Self {
            vcs,
            store,
            workflow,
            rebase: Arc::new(rebase),
        }
    }

    /// Fetch the root's latest deployment and deploy against it.
    pub async fn deploy_latest(&self, requested: &DeploymentRequest) -> Result<Deployed, DeployError> {
        let latest = self
            .store
            .fetch_latest_deployment(&requested.repo_full_name, &requested.root.name)
            .await?;
        self.deploy(requested, latest).await
    }

    pub async fn deploy(
        &self,
        requested: &DeploymentRequest,
        latest: Option<DeploymentInfo>,
    ) -> Result<Deployed, DeployError> {
        let direction = resolve_direction(self.vcs.as_ref(), requested, latest.as_ref()).await?;

        if let Err(validation) = check_policy(direction, requested) {
            tracing::info!(
                root = %requested.root.name,
                revision = %requested.revision,
                direction = direction.as_str(),
                reason = %validation,
                "skipping deploy"
            );
            self.fail_check_run(requested, &validation).await;
            return Err(DeployError::Validation(validation));
        }

        let execution_error = match self.workflow.run(requested, direction).await {
            Ok(()) => None,
            Err(WorkflowError::PlanRejected(rejection)) => {
                tracing::info!(root = %requested.root.name, revision = %requested.revision, reason = %rejection.reason, "plan rejected");
                return Err(DeployError::PlanRejected(rejection));
            }
            Err(WorkflowError::Execution(e)) => Some(e),
        };

        let latest = requested.build_persistable_info();
        let persisted = self.persist(&latest).await;

        if let Some(source) = execution_error {
            return Err(DeployError::Execution { latest, source });
        }

        let rebase = self.spawn_rebase_scan(requested);
        Ok(Deployed {
            latest,
            persisted,
            rebase,
        })
    }

    async fn persist(&self, latest: &DeploymentInfo) -> BestEffort<()> {
        match self.store.store_latest_deployment(latest).await {
            Ok(()) => BestEffort::Done(()),
            Err(e) => {
                tracing::error!(
                    root = %latest.root_name,
                    revision = %latest.revision,
                    error = %e,
                    "failed to persist latest deployment"
                );
                BestEffort::Failed(format!("{:#}", e))
            }
        }
    }

    async fn fail_check_run(&self, requested: &DeploymentRequest, validation: &ValidationError) {
        let update = CheckRunUpdate::new(
            CheckRunState::Failure,
            format!("deploy {}", requested.root.name),
            validation.summary.clone(),
        );
        if let Err(e) = self
            .vcs
            .update_check_run(&requested.repo_full_name, requested.check_run_id, update)
            .await
        {
            tracing::warn!(check_run_id = requested.check_run_id, error = %e, "failed to update check run");
        }
    }

    fn spawn_rebase_scan(&self, requested: &DeploymentRequest) -> JoinHandle<BestEffort<Vec<PullRequest>>> {
        let scanner = self.rebase.clone();
        let repo = requested.repo_full_name.clone();
        let root = requested.root.clone();
        tokio::spawn(async move {
            let result = scanner.find_candidates(&repo, &root).await;
            match &result {
                BestEffort::Done(prs) if !prs.is_empty() => {
                    let nums: Vec<u64> = prs.iter().map(|p| p.num).collect();
                    tracing::info!(repo = %repo, root = %root.name, pulls = ?nums, "pull requests need rebase");
                }
                BestEffort::Done(_) => {}
                BestEffort::Failed(e) => {
                    tracing::warn!(repo = %repo, root = %root.name, error = %e, "rebase scan failed");
                }
            }
            result
        })
    }
}
