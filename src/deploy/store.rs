use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;

use crate::db::DbHandle;
use crate::models::DeploymentInfo;

/// Latest deployed revision per (repo, root).
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    async fn fetch_latest_deployment(&self, repo_full_name: &str, root_name: &str) -> Result<Option<DeploymentInfo>>;

    async fn store_latest_deployment(&self, info: &DeploymentInfo) -> Result<()>;
}

pub struct SqliteDeploymentStore {
    db: DbHandle,
}

impl SqliteDeploymentStore {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }
}

#[async_trait]
impl DeploymentStore for SqliteDeploymentStore {
    async fn fetch_latest_deployment(&self, repo_full_name: &str, root_name: &str) -> Result<Option<DeploymentInfo>> {
        let repo = repo_full_name.to_string();
        let root = root_name.to_string();
        self.db
            .call(move |db| db.fetch_latest_deployment(&repo, &root))
            .await
    }

    async fn store_latest_deployment(&self, info: &DeploymentInfo) -> Result<()> {
        let info = info.clone();
        self.db
            .call(move |db| db.store_latest_deployment(&info))
            .await
    }
}

#[derive(Default)]
pub struct InMemoryDeploymentStore {
    latest: Mutex<HashMap<(String, String), DeploymentInfo>>,
}

impl InMemoryDeploymentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeploymentStore for InMemoryDeploymentStore {
    async fn fetch_latest_deployment(&self, repo_full_name: &str, root_name: &str) -> Result<Option<DeploymentInfo>> {
        let latest = self
            .latest
            .lock()
            .map_err(|e| anyhow::anyhow!("deployment table poisoned: {}", e))?;
        Ok(latest
            .get(&(repo_full_name.to_string(), root_name.to_string()))
            .cloned())
    }

    async fn store_latest_deployment(&self, info: &DeploymentInfo) -> Result<()> {
        self.latest
            .lock()
            .map_err(|e| anyhow::anyhow!("deployment table poisoned: {}", e))?
            .insert(
                (info.repo_full_name.clone(), info.root_name.clone()),
                info.clone(),
            );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::GitplanDb;

    fn info(revision: &str) -> DeploymentInfo {
        DeploymentInfo {
            id: uuid::Uuid::new_v4(),
            revision: revision.into(),
            repo_full_name: "owner/repo".into(),
            root_name: "net".into(),
            time: chrono::Utc::now(),
        }
    }

    async fn exercise(store: &dyn DeploymentStore) {
        assert!(store.fetch_latest_deployment("owner/repo", "net").await.unwrap().is_none());
        store.store_latest_deployment(&info("abc123")).await.unwrap();
        store.store_latest_deployment(&info("def456")).await.unwrap();
        let latest = store.fetch_latest_deployment("owner/repo", "net").await.unwrap().unwrap();
        assert_eq!(latest.revision, "def456");
        assert!(store.fetch_latest_deployment("owner/repo", "app").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        exercise(&InMemoryDeploymentStore::new()).await;
    }

    #[tokio::test]
    async fn test_sqlite_store() {
        let db = DbHandle::new(GitplanDb::new_in_memory().unwrap());
        exercise(&SqliteDeploymentStore::new(db)).await;
    }
}
