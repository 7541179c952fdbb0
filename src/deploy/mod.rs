//! Revision-ordered deploys of Terraform roots.
//!
//! `Deployer` decides whether a requested revision may deploy, drives the
//! `WorkflowRunner`, records the latest deployed revision and kicks off the
//! post-deploy rebase scan.

pub mod deployer;
pub mod direction;
pub mod rebase;
pub mod store;
pub mod workflow;

pub use deployer::{Deployed, Deployer};
pub use direction::{check_policy, resolve_direction};
pub use rebase::RebaseScanner;
pub use store::{DeploymentStore, InMemoryDeploymentStore, SqliteDeploymentStore};
pub use workflow::{AutoApprove, PlanReviewer, TerraformWorkflow, WorkflowRunner};
