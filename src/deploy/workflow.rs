use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::errors::{PlanRejectionError, WorkflowError};
use crate::locking::Locker;
use crate::models::{DEFAULT_WORKSPACE, DeploymentRequest, Direction, JobInfo, Project, PullInfo, PullRequest, User};
use crate::terraform::{AsyncClient, CommandRequest};

/// Holder recorded on locks taken by deploys.
pub const DEPLOY_USER: &str = "gitplan-deploy";

const PLAN_FILE: &str = "gitplan.tfplan";

/// Executes the Terraform workflow for a deployment.
#[async_trait]
pub trait WorkflowRunner: Send + Sync {
    async fn run(&self, request: &DeploymentRequest, direction: Direction) -> Result<(), WorkflowError>;
}

/// Decides whether a plan may be applied.
#[async_trait]
pub trait PlanReviewer: Send + Sync {
    async fn review(
        &self,
        request: &DeploymentRequest,
        direction: Direction,
        plan_output: &str,
    ) -> Result<(), PlanRejectionError>;
}

/// Approves every plan.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

#[async_trait]
impl PlanReviewer for AutoApprove {
    async fn review(
        &self,
        _request: &DeploymentRequest,
        _direction: Direction,
        _plan_output: &str,
    ) -> Result<(), PlanRejectionError> {
        Ok(())
    }
}

/// `init`, `plan`, review, `apply` against a checked-out root, holding the
/// root's project lock for the whole run. All output goes to the request's
/// job, which is closed when the run ends.
pub struct TerraformWorkflow {
    terraform: AsyncClient,
    locker: Arc<dyn Locker>,
    reviewer: Arc<dyn PlanReviewer>,
    /// Directory containing `<owner>/<repo>` checkouts.
    repos_dir: PathBuf,
    workspace: String,
    cancel: CancellationToken,
}

impl TerraformWorkflow {
    pub fn new(
        terraform: AsyncClient,
        locker: Arc<dyn Locker>,
        reviewer: Arc<dyn PlanReviewer>,
        repos_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            terraform,
            locker,
            reviewer,
            repos_dir: repos_dir.into(),
            workspace: DEFAULT_WORKSPACE.to_string(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_workspace(mut self, workspace: impl Into<String>) -> Self {
        self.workspace = workspace.into();
        self
    }

    /// Terraform runs are killed when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn job_info(&self, request: &DeploymentRequest) -> JobInfo {
        JobInfo {
            pull: PullInfo {
                repo_full_name: request.repo_full_name.clone(),
                pull_num: 0,
            },
            project_path: request.root.path.clone(),
            workspace: self.workspace.clone(),
            head_commit: request.revision.clone(),
        }
    }

    async fn step(
        &self,
        request: &DeploymentRequest,
        job_info: &JobInfo,
        args: &[&str],
    ) -> Result<String, WorkflowError> {
        let mut env = HashMap::new();
        if self.workspace != DEFAULT_WORKSPACE {
            env.insert("TF_WORKSPACE".to_string(), self.workspace.clone());
        }
        let req = CommandRequest {
            job_id: request.job_id.clone(),
            job_info: job_info.clone(),
            path: self
                .repos_dir
                .join(&request.repo_full_name)
                .join(&request.root.path),
            args: args.iter().map(|a| a.to_string()).collect(),
            env,
            version: None,
        };
        self.terraform
            .run_to_completion(self.cancel.child_token(), req)
            .await
            .map_err(|e| {
                WorkflowError::Execution(anyhow::Error::new(e).context(format!("terraform {} failed", args[0])))
            })
    }

    async fn run_steps(
        &self,
        request: &DeploymentRequest,
        direction: Direction,
        job_info: &JobInfo,
    ) -> Result<(), WorkflowError> {
        self.step(request, job_info, &["init", "-input=false", "-no-color"])
            .await?;
        let plan = self
            .step(
                request,
                job_info,
                &["plan", "-input=false", "-no-color", "-out", PLAN_FILE],
            )
            .await?;
        self.reviewer
            .review(request, direction, &plan)
            .await
            .map_err(WorkflowError::PlanRejected)?;
        self.step(
            request,
            job_info,
            &["apply", "-input=false", "-no-color", PLAN_FILE],
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl WorkflowRunner for TerraformWorkflow {
    async fn run(&self, request: &DeploymentRequest, direction: Direction) -> Result<(), WorkflowError> {
        let holder = PullRequest {
            num: 0,
            repo_full_name: request.repo_full_name.clone(),
            head_commit: request.revision.clone(),
            author: DEPLOY_USER.to_string(),
            ..Default::default()
        };
        let lock = self
            .locker
            .try_lock(
                Project::new(&request.repo_full_name, &request.root.path),
                &self.workspace,
                holder,
                User::new(DEPLOY_USER),
            )
            .await
            .map_err(|e| WorkflowError::Execution(e.into()))?;
        if !lock.lock_acquired {
            return Err(WorkflowError::Execution(anyhow::anyhow!(
                "root {} is locked by pull #{}",
                request.root.name,
                lock.current_lock.pull.num
            )));
        }

        let job_info = self.job_info(request);
        tracing::info!(
            root = %request.root.name,
            revision = %request.revision,
            direction = direction.as_str(),
            job_id = %request.job_id,
            "running deploy workflow"
        );
        let result = self.run_steps(request, direction, &job_info).await;

        self.terraform.output().close_job(&request.job_id);
        if let Err(e) = self.locker.unlock(&lock.lock_key).await {
            tracing::error!(lock_key = %lock.lock_key, error = %e, "failed to release deploy lock");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;
    use crate::config::TerraformSection;
    use crate::jobs::{JobStatus, NoopStorageBackend, OutputHandler};
    use crate::locking::{Client, InMemoryBackend};
    use crate::models::Root;

    struct Reject;

    #[async_trait]
    impl PlanReviewer for Reject {
        async fn review(
            &self,
            _request: &DeploymentRequest,
            _direction: Direction,
            plan_output: &str,
        ) -> Result<(), PlanRejectionError> {
            Err(PlanRejectionError::new(format!("refused: {}", plan_output.lines().count())))
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        repos: PathBuf,
        terraform: AsyncClient,
        locker: Arc<dyn Locker>,
        _cancel: CancellationToken,
    }

    /// A fake `terraform` that echoes its arguments, failing on `fail_on`.
    fn fixture(fail_on: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("bin");
        let repos = dir.path().join("repos");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::create_dir_all(repos.join("owner/repo/net")).unwrap();
        let script = bin.join("terraform");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\necho \"ran $1 in $(basename \"$PWD\")\"\n[ \"$1\" = \"{}\" ] && exit 1\nexit 0\n",
                fail_on
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let output = OutputHandler::new(Arc::new(NoopStorageBackend), 100);
        let cancel = CancellationToken::new();
        let h = output.clone();
        let c = cancel.clone();
        tokio::spawn(async move { h.handle(c).await });
        let config = TerraformSection {
            bin_dir: Some(bin),
            ..Default::default()
        };
        Fixture {
            _dir: dir,
            repos,
            terraform: AsyncClient::new(&config, output),
            locker: Arc::new(Client::new(Arc::new(InMemoryBackend::new()))),
            _cancel: cancel,
        }
    }

    fn request() -> DeploymentRequest {
        DeploymentRequest::new("owner/repo", Root::new("net", "net", vec![]), "abc123")
    }

    #[tokio::test]
    async fn test_successful_run_streams_every_step_and_closes_job() {
        let fx = fixture("none");
        let workflow = TerraformWorkflow::new(
            fx.terraform.clone(),
            fx.locker.clone(),
            Arc::new(AutoApprove),
            &fx.repos,
        );
        let req = request();
        workflow.run(&req, Direction::Ahead).await.unwrap();

        fx.terraform.output().flush().await;
        let (output, status) = fx.terraform.output().job_output(&req.job_id).await.unwrap();
        assert_eq!(output, vec!["ran init in net", "ran plan in net", "ran apply in net"]);
        assert_eq!(status, JobStatus::Complete);
        assert!(fx.locker.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_plan_never_applies() {
        let fx = fixture("none");
        let workflow = TerraformWorkflow::new(fx.terraform.clone(), fx.locker.clone(), Arc::new(Reject), &fx.repos);
        let req = request();
        let err = workflow.run(&req, Direction::Diverged).await.unwrap_err();
        assert!(matches!(err, WorkflowError::PlanRejected(_)));

        fx.terraform.output().flush().await;
        let (output, _) = fx.terraform.output().job_output(&req.job_id).await.unwrap();
        assert!(!output.iter().any(|l| l.contains("apply")));
        assert!(fx.locker.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_step_is_execution_error() {
        let fx = fixture("plan");
        let workflow = TerraformWorkflow::new(fx.terraform.clone(), fx.locker.clone(), Arc::new(AutoApprove), &fx.repos);
        let err = workflow.run(&request(), Direction::Ahead).await.unwrap_err();
        match err {
            WorkflowError::Execution(e) => assert!(format!("{:#}", e).contains("terraform plan failed")),
            other => panic!("Expected Execution, got {:?}", other),
        }
        assert!(fx.locker.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_locked_root_is_execution_error() {
        let fx = fixture("none");
        fx.locker
            .try_lock(
                Project::new("owner/repo", "net"),
                DEFAULT_WORKSPACE,
                PullRequest {
                    num: 12,
                    repo_full_name: "owner/repo".into(),
                    ..Default::default()
                },
                User::new("bob"),
            )
            .await
            .unwrap();
        let workflow = TerraformWorkflow::new(fx.terraform.clone(), fx.locker.clone(), Arc::new(AutoApprove), &fx.repos);
        let err = workflow.run(&request(), Direction::Ahead).await.unwrap_err();
        assert!(err.to_string().contains("#12"));
        // The pull request's lock is untouched.
        assert_eq!(fx.locker.list().await.unwrap().len(), 1);
    }
}
