use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::config::{JobsSection, StorageKind};

/// Durable storage for completed job output.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Store `lines` under `key`. `Ok(false)` means the backend is not
    /// configured to persist anything; it is not a failure.
    async fn write(&self, key: &str, lines: &[String]) -> Result<bool>;

    async fn read(&self, key: &str) -> Result<Vec<String>>;

    async fn is_key_exists(&self, key: &str) -> Result<bool>;
}

/// Build the backend selected by `[jobs] storage`.
pub fn from_config(jobs: &JobsSection) -> Box<dyn StorageBackend> {
    match jobs.storage {
        StorageKind::Noop => Box::new(NoopStorageBackend),
        StorageKind::Filesystem => Box::new(FilesystemStorageBackend::new(&jobs.storage_dir)),
    }
}

/// Persists nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStorageBackend;

#[async_trait]
impl StorageBackend for NoopStorageBackend {
    async fn write(&self, _key: &str, _lines: &[String]) -> Result<bool> {
        Ok(false)
    }

    async fn read(&self, _key: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn is_key_exists(&self, _key: &str) -> Result<bool> {
        Ok(false)
    }
}

/// One JSON-lines file per key under a directory.
#[derive(Debug, Clone)]
pub struct FilesystemStorageBackend {
    dir: PathBuf,
}

impl FilesystemStorageBackend {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", sanitize_key(key)))
    }
}

#[async_trait]
impl StorageBackend for FilesystemStorageBackend {
    async fn write(&self, key: &str, lines: &[String]) -> Result<bool> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create job storage dir {}", self.dir.display()))?;

        let mut body = String::new();
        for line in lines {
            body.push_str(&serde_json::to_string(line)?);
            body.push('\n');
        }

        // Write-then-rename so readers never see a partial file.
        let path = self.path_for(key);
        let tmp = path.with_extension("jsonl.tmp");
        tokio::fs::write(&tmp, body)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to move job output into {}", path.display()))?;
        Ok(true)
    }

    async fn read(&self, key: &str) -> Result<Vec<String>> {
        let path = self.path_for(key);
        let body = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        body.lines()
            .filter(|l| !l.is_empty())
            .map(|l| serde_json::from_str::<String>(l).context("Corrupt job output line"))
            .collect()
    }

    async fn is_key_exists(&self, key: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.path_for(key)).await?)
    }
}

/// Map an arbitrary key onto a single safe file name.
fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_start_matches('.')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_backend_reports_not_persisted() {
        let backend = NoopStorageBackend;
        assert!(!backend.write("job", &["a".into()]).await.unwrap());
        assert!(!backend.is_key_exists("job").await.unwrap());
    }

    #[tokio::test]
    async fn test_filesystem_backend_write_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemStorageBackend::new(dir.path().join("jobs"));
        let lines = vec![
            "Initializing...".to_string(),
            "  + resource \"aws_vpc\" \"main\" {".to_string(),
            String::new(),
            "Plan: 1 to add".to_string(),
        ];
        assert!(!backend.is_key_exists("job-1").await.unwrap());
        assert!(backend.write("job-1", &lines).await.unwrap());
        assert!(backend.is_key_exists("job-1").await.unwrap());
        // Empty output lines are encoded as "" and survive.
        assert_eq!(backend.read("job-1").await.unwrap(), lines);
    }

    #[tokio::test]
    async fn test_filesystem_backend_read_missing_key_errors() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemStorageBackend::new(dir.path());
        assert!(backend.read("nope").await.is_err());
    }

    #[test]
    fn test_sanitize_key_stays_inside_dir() {
        assert_eq!(sanitize_key("../../etc/passwd"), "_.._etc_passwd");
        assert_eq!(sanitize_key("owner/repo/1"), "owner_repo_1");
        assert_eq!(sanitize_key("abc-123_x.y"), "abc-123_x.y");
    }

    #[tokio::test]
    async fn test_from_config_selects_backend() {
        let dir = tempfile::tempdir().unwrap();
        let noop = from_config(&JobsSection::default());
        assert!(!noop.write("job", &["x".into()]).await.unwrap());

        let jobs = JobsSection {
            storage: StorageKind::Filesystem,
            storage_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let fs = from_config(&jobs);
        assert!(fs.write("job", &["x".into()]).await.unwrap());
        assert!(dir.path().join("job.jsonl").exists());
    }
}
