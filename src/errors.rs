//! Typed error hierarchy for gitplan.
//!
//! One enum per subsystem:
//! - `LockError`: project and command lock failures
//! - `JobError`: job output store failures
//! - `TerraformError`: subprocess execution failures
//! - `WorkflowError` / `DeployError`: deploy orchestration outcomes
//!
//! Advisory paths (best-effort persistence, rebase scanning) do not use
//! these at all; they report through [`BestEffort`] so they cannot be
//! propagated with `?` by accident.

use std::path::PathBuf;

use thiserror::Error;

use crate::models::DeploymentInfo;

/// Errors from the locking subsystem.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("invalid lock key format: {key}")]
    InvalidKey { key: String },

    #[error("Lock backend error: {0}")]
    Backend(#[source] anyhow::Error),
}

/// Errors from the job output store.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Job {job_id} not found")]
    NotFound { job_id: String },

    #[error("Job {job_id} is already complete")]
    AlreadyComplete { job_id: String },

    #[error("Job storage error: {0}")]
    Storage(#[source] anyhow::Error),
}

/// Errors from running a Terraform subprocess.
#[derive(Debug, Error)]
pub enum TerraformError {
    #[error("Failed to build terraform command: {0}")]
    Build(String),

    #[error("Failed to spawn {binary}: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read terraform output: {0}")]
    Io(#[source] std::io::Error),

    #[error("exit status {code:?}: running {command:?} in {path:?}")]
    NonZeroExit {
        command: String,
        path: PathBuf,
        code: Option<i32>,
    },

    #[error("terraform command cancelled: {command:?}")]
    Cancelled { command: String },
}

/// A deploy request that must be skipped rather than retried.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ValidationError {
    pub message: String,
    /// Human-readable text posted on the failed check run.
    pub summary: String,
}

/// The plan for a deploy was rejected; nothing was applied.
#[derive(Debug, Clone, Error)]
#[error("plan rejected: {reason}")]
pub struct PlanRejectionError {
    pub reason: String,
}

impl PlanRejectionError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Outcome of a failed Terraform workflow run.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    PlanRejected(PlanRejectionError),

    #[error("terraform workflow failed: {0:#}")]
    Execution(#[source] anyhow::Error),
}

/// Errors returned by `Deployer::deploy`.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error(transparent)]
    Validation(ValidationError),

    #[error(transparent)]
    PlanRejected(PlanRejectionError),

    /// The workflow failed after being attempted. `latest` is the deployment
    /// record that was recorded for the attempt.
    #[error("deployment {} failed: {:#}", .latest.revision, .source)]
    Execution {
        latest: DeploymentInfo,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result of an advisory side effect that is recorded but never fatal.
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BestEffort<T> {
    Done(T),
    Failed(String),
}

impl<T> BestEffort<T> {
    pub fn is_done(&self) -> bool {
        matches!(self, BestEffort::Done(_))
    }

    pub fn done(self) -> Option<T> {
        match self {
            BestEffort::Done(v) => Some(v),
            BestEffort::Failed(_) => None,
        }
    }
}
