use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{CheckRunState, CheckRunUpdate, VcsClient};
use crate::models::{Direction, PullRequest};

const USER_AGENT: &str = "gitplan";
const PER_PAGE: usize = 100;

/// Known GitHub token prefixes.
/// See: https://github.blog/2021-04-05-behind-githubs-new-authentication-token-formats/
const GITHUB_TOKEN_PREFIXES: &[&str] = &[
    "ghp_",        // Personal access tokens (classic)
    "github_pat_", // Fine-grained personal access tokens
    "gho_",        // OAuth access tokens
    "ghu_",        // GitHub App user-to-server tokens
    "ghs_",        // GitHub App server-to-server tokens
    "ghr_",        // GitHub App refresh tokens
];

/// Validate that a string looks like a valid GitHub token based on its prefix.
///
/// Format check only; it does not verify the token is active or scoped.
pub fn is_valid_github_token(token: &str) -> bool {
    if token.is_empty() {
        return false;
    }
    GITHUB_TOKEN_PREFIXES
        .iter()
        .any(|prefix| token.starts_with(prefix))
}

// ── Wire types (subset of fields we care about) ──────────────────────

#[derive(Debug, Deserialize)]
struct CompareResponse {
    status: String,
}

#[derive(Debug, Deserialize)]
struct GitRef {
    #[serde(rename = "ref")]
    ref_name: String,
    sha: String,
}

#[derive(Debug, Deserialize)]
struct GitHubUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct GitHubPull {
    number: u64,
    html_url: String,
    head: GitRef,
    base: GitRef,
    user: Option<GitHubUser>,
    #[serde(default)]
    created_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Deserialize)]
struct GitHubPullFile {
    filename: String,
    previous_filename: Option<String>,
}

#[derive(Debug, Serialize)]
struct CheckRunOutput<'a> {
    title: &'a str,
    summary: &'a str,
}

#[derive(Debug, Serialize)]
struct CheckRunPatch<'a> {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    conclusion: Option<&'static str>,
    output: CheckRunOutput<'a>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    actions: Vec<&'a super::CheckRunAction>,
}

fn status_and_conclusion(state: CheckRunState) -> (&'static str, Option<&'static str>) {
    match state {
        CheckRunState::Queued => ("queued", None),
        CheckRunState::InProgress => ("in_progress", None),
        CheckRunState::Success => ("completed", Some("success")),
        CheckRunState::Failure => ("completed", Some("failure")),
    }
}

fn into_pull_request(repo: &str, pull: GitHubPull) -> PullRequest {
    PullRequest {
        num: pull.number,
        repo_full_name: repo.to_string(),
        head_commit: pull.head.sha,
        head_branch: pull.head.ref_name,
        base_branch: pull.base.ref_name,
        author: pull.user.map(|u| u.login).unwrap_or_default(),
        url: pull.html_url,
        created_at: pull.created_at,
    }
}

fn modified_paths(files: Vec<GitHubPullFile>) -> Vec<String> {
    let mut paths = Vec::with_capacity(files.len());
    for file in files {
        paths.push(file.filename);
        if let Some(previous) = file.previous_filename {
            paths.push(previous);
        }
    }
    paths
}

/// `VcsClient` backed by the GitHub REST API.
#[derive(Clone)]
pub struct GithubClient {
    http: reqwest::Client,
    api_url: String,
    token: String,
}

impl GithubClient {
    pub fn new(api_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    /// Request against `path` under the API root. No `Authorization` header
    /// is sent when the token is empty.
    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let req = self
            .http
            .request(method, format!("{}{}", self.api_url, path))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT);
        if self.token.is_empty() {
            req
        } else {
            req.bearer_auth(&self.token)
        }
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.request(reqwest::Method::GET, path)
    }

    /// Fetch every page of a list endpoint.
    async fn get_all_pages<T: serde::de::DeserializeOwned>(&self, path: &str) -> anyhow::Result<Vec<T>> {
        let mut all = Vec::new();
        let mut page = 1u32;

        loop {
            let resp: Vec<T> = self
                .get(path)
                .query(&[("per_page", PER_PAGE.to_string()), ("page", page.to_string())])
                .send()
                .await
                .with_context(|| format!("Failed to send request to GitHub: {}", path))?
                .error_for_status()
                .with_context(|| format!("GitHub API returned error status: {}", path))?
                .json()
                .await
                .with_context(|| format!("Failed to parse GitHub response: {}", path))?;

            let count = resp.len();
            all.extend(resp);
            if count < PER_PAGE {
                break; // Last page
            }
            page += 1;
        }

        Ok(all)
    }
}

#[async_trait]
impl VcsClient for GithubClient {
    async fn compare_commits(&self, repo: &str, base: &str, head: &str) -> anyhow::Result<Direction> {
        let resp: CompareResponse = self
            .get(&format!("/repos/{}/compare/{}...{}", repo, base, head))
            .send()
            .await
            .context("Failed to send compare request to GitHub")?
            .error_for_status()
            .context("GitHub compare API returned error status")?
            .json()
            .await
            .context("Failed to parse compare response from GitHub")?;
        resp.status.parse().map_err(|e: String| anyhow::anyhow!(e))
    }

    async fn list_open_pull_requests(&self, repo: &str) -> anyhow::Result<Vec<PullRequest>> {
        let pulls: Vec<GitHubPull> = self
            .get_all_pages(&format!("/repos/{}/pulls?state=open", repo))
            .await?;
        Ok(pulls
            .into_iter()
            .map(|p| into_pull_request(repo, p))
            .collect())
    }

    async fn list_modified_files(&self, repo: &str, pull_num: u64) -> anyhow::Result<Vec<String>> {
        let files: Vec<GitHubPullFile> = self
            .get_all_pages(&format!("/repos/{}/pulls/{}/files", repo, pull_num))
            .await?;
        Ok(modified_paths(files))
    }

    async fn update_check_run(
        &self,
        repo: &str,
        check_run_id: i64,
        update: CheckRunUpdate,
    ) -> anyhow::Result<()> {
        let (status, conclusion) = status_and_conclusion(update.state);
        let body = CheckRunPatch {
            status,
            conclusion,
            output: CheckRunOutput {
                title: &update.title,
                summary: &update.summary,
            },
            actions: update.actions.iter().collect(),
        };
        self.request(
            reqwest::Method::PATCH,
            &format!("/repos/{}/check-runs/{}", repo, check_run_id),
        )
        .json(&body)
        .send()
        .await
        .context("Failed to send check run update to GitHub")?
        .error_for_status()
        .context("GitHub check run API returned error status")?;
        Ok(())
    }

    async fn create_comment(&self, repo: &str, pull_num: u64, body: &str) -> anyhow::Result<()> {
        self.request(
            reqwest::Method::POST,
            &format!("/repos/{}/issues/{}/comments", repo, pull_num),
        )
        .json(&serde_json::json!({ "body": body }))
        .send()
        .await
        .context("Failed to send comment to GitHub")?
        .error_for_status()
        .context("GitHub comments API returned error status")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── is_valid_github_token ────────────────────────────────────────

    #[test]
    fn test_valid_personal_access_token_classic() {
        assert!(is_valid_github_token("ghp_abc123def456"));
    }

    #[test]
    fn test_valid_fine_grained_pat() {
        assert!(is_valid_github_token("github_pat_abc123def456"));
    }

    #[test]
    fn test_valid_server_to_server_token() {
        assert!(is_valid_github_token("ghs_xyz789"));
    }

    #[test]
    fn test_empty_token_is_invalid() {
        assert!(!is_valid_github_token(""));
    }

    #[test]
    fn test_wrong_prefix_is_invalid() {
        assert!(!is_valid_github_token("ghx_abc123"));
    }

    #[test]
    fn test_token_with_leading_space_is_invalid() {
        assert!(!is_valid_github_token(" ghp_abc123"));
    }

    // ── Wire types ───────────────────────────────────────────────────

    #[test]
    fn test_pull_deserialize_and_convert() {
        let json = r#"{
            "number": 42,
            "html_url": "https://github.com/owner/repo/pull/42",
            "head": {"ref": "feature", "sha": "abc123"},
            "base": {"ref": "main", "sha": "def456"},
            "user": {"login": "octocat"},
            "created_at": "2024-03-01T12:00:00Z"
        }"#;
        let pull: GitHubPull = serde_json::from_str(json).unwrap();
        let pr = into_pull_request("owner/repo", pull);
        assert_eq!(pr.num, 42);
        assert_eq!(pr.head_commit, "abc123");
        assert_eq!(pr.head_branch, "feature");
        assert_eq!(pr.base_branch, "main");
        assert_eq!(pr.author, "octocat");
        assert_eq!(pr.repo_full_name, "owner/repo");
        assert_eq!(pr.created_at.unwrap().to_rfc3339(), "2024-03-01T12:00:00+00:00");
    }

    #[test]
    fn test_pull_without_user() {
        let json = r#"{
            "number": 1,
            "html_url": "u",
            "head": {"ref": "h", "sha": "s"},
            "base": {"ref": "b", "sha": "t"},
            "user": null
        }"#;
        let pull: GitHubPull = serde_json::from_str(json).unwrap();
        assert_eq!(into_pull_request("o/r", pull).author, "");
    }

    #[test]
    fn test_modified_paths_include_renames() {
        let files: Vec<GitHubPullFile> = serde_json::from_str(
            r#"[
                {"filename": "root/a.tf"},
                {"filename": "new/b.tf", "previous_filename": "old/b.tf"}
            ]"#,
        )
        .unwrap();
        assert_eq!(modified_paths(files), vec!["root/a.tf", "new/b.tf", "old/b.tf"]);
    }

    #[test]
    fn test_compare_status_parses_to_direction() {
        let resp: CompareResponse = serde_json::from_str(r#"{"status": "behind", "ahead_by": 0}"#).unwrap();
        assert_eq!(resp.status.parse::<Direction>().unwrap(), Direction::Behind);
    }

    #[test]
    fn test_check_run_state_mapping() {
        assert_eq!(status_and_conclusion(CheckRunState::Queued), ("queued", None));
        assert_eq!(
            status_and_conclusion(CheckRunState::Failure),
            ("completed", Some("failure"))
        );
        assert_eq!(
            status_and_conclusion(CheckRunState::Success),
            ("completed", Some("success"))
        );
    }

    #[test]
    fn test_check_run_patch_serialization() {
        let update = CheckRunUpdate::new(CheckRunState::Failure, "Deploy", "behind");
        let (status, conclusion) = status_and_conclusion(update.state);
        let patch = CheckRunPatch {
            status,
            conclusion,
            output: CheckRunOutput {
                title: &update.title,
                summary: &update.summary,
            },
            actions: update.actions.iter().collect(),
        };
        let json = serde_json::to_value(&patch).unwrap();
        assert_eq!(json["status"], "completed");
        assert_eq!(json["conclusion"], "failure");
        assert_eq!(json["output"]["summary"], "behind");
        assert!(json.get("actions").is_none());
    }

    #[test]
    fn test_client_trims_trailing_slash() {
        let client = GithubClient::new("https://ghe.example.com/api/v3/", "ghp_x");
        assert_eq!(client.api_url, "https://ghe.example.com/api/v3");
    }
}
