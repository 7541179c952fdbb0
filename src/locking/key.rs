use std::sync::LazyLock;

use regex::Regex;

use crate::errors::LockError;
use crate::models::Project;

// Repo full names always contain exactly one slash; the path may contain
// any number; the workspace none.
static KEY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.*?/.*?)/(.*)/(.*)$").expect("lock key regex is valid"));

/// String id of the lock slot for `(project, workspace)`:
/// `"<repoFullName>/<path>/<workspace>"`.
pub fn lock_key(project: &Project, workspace: &str) -> String {
    format!("{}/{}/{}", project.repo_full_name, project.path, workspace)
}

/// Inverse of [`lock_key`].
pub fn parse_key(key: &str) -> Result<(Project, String), LockError> {
    let caps = KEY_REGEX.captures(key).ok_or_else(|| LockError::InvalidKey {
        key: key.to_string(),
    })?;
    let (repo, path, workspace) = (&caps[1], &caps[2], &caps[3]);
    if repo.starts_with('/') || repo.ends_with('/') || workspace.is_empty() {
        return Err(LockError::InvalidKey {
            key: key.to_string(),
        });
    }
    Ok((Project::new(repo, path), workspace.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_key_format() {
        let project = Project::new("owner/repo", "./infra/network/");
        assert_eq!(lock_key(&project, "prod"), "owner/repo/infra/network/prod");
        let root = Project::new("owner/repo", "");
        assert_eq!(lock_key(&root, "default"), "owner/repo/./default");
    }

    #[test]
    fn test_parse_key_nested_path() {
        let (project, workspace) = parse_key("owner/repo/infra/network/prod").unwrap();
        assert_eq!(project.repo_full_name, "owner/repo");
        assert_eq!(project.path, "infra/network");
        assert_eq!(workspace, "prod");
    }

    #[test]
    fn test_parse_key_repo_root() {
        let (project, workspace) = parse_key("owner/repo/./default").unwrap();
        assert_eq!(project.path, ".");
        assert_eq!(workspace, "default");
    }

    #[test]
    fn test_parse_key_inverts_lock_key() {
        let project = Project::new("org/monorepo", "services/api/terraform");
        let key = lock_key(&project, "staging");
        let (parsed, workspace) = parse_key(&key).unwrap();
        assert_eq!(parsed, project);
        assert_eq!(workspace, "staging");
    }

    #[test]
    fn test_parse_key_rejects_ill_formed_keys() {
        for bad in ["", "no-slashes", "owner/repo", "owner/repo/path", "owner/repo/path/"] {
            match parse_key(bad) {
                Err(LockError::InvalidKey { key }) => assert_eq!(key, bad),
                other => panic!("Expected InvalidKey for {:?}, got {:?}", bad, other),
            }
        }
    }
}
