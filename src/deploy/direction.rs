use crate::errors::ValidationError;
use crate::models::{DeploymentInfo, DeploymentRequest, Direction};
use crate::vcs::VcsClient;

pub const BEHIND_SUMMARY: &str = "This revision is behind the current revision and will not be deployed. \
     If this is intentional, revert the default branch to this revision to trigger a new deployment.";

pub const RERUN_NOT_IDENTICAL_SUMMARY: &str = "This revision is not the most recently deployed revision \
     and cannot be rerun. Only the latest deployed revision may be rerun.";

/// Direction of the requested revision relative to the latest deployed
/// one. The first deploy of a root is always ahead.
pub async fn resolve_direction(
    vcs: &dyn VcsClient,
    requested: &DeploymentRequest,
    latest: Option<&DeploymentInfo>,
) -> anyhow::Result<Direction> {
    let Some(latest) = latest else {
        return Ok(Direction::Ahead);
    };
    vcs.compare_commits(&requested.repo_full_name, &latest.revision, &requested.revision)
        .await
}

/// Deploy ordering rules. Behind revisions never deploy; a rerun must
/// target exactly the latest deployed revision.
pub fn check_policy(direction: Direction, requested: &DeploymentRequest) -> Result<(), ValidationError> {
    if direction == Direction::Behind {
        return Err(ValidationError {
            message: format!(
                "requested revision {} is behind the latest deployed revision",
                requested.revision
            ),
            summary: BEHIND_SUMMARY.to_string(),
        });
    }
    if requested.rerun && direction != Direction::Identical {
        return Err(ValidationError {
            message: format!(
                "rerun of {} does not match the latest deployed revision ({})",
                requested.revision,
                direction.as_str()
            ),
            summary: RERUN_NOT_IDENTICAL_SUMMARY.to_string(),
        });
    }
    Ok(())
}
