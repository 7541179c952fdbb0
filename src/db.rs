use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::models::{CommandLock, CommandName, DeploymentInfo, Project, ProjectLock, PullRequest, User};

/// Async-safe handle to the gitplan database.
///
/// Wraps `GitplanDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads. The mutex also makes every
/// closure passed to [`DbHandle::call`] atomic with respect to the others.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<GitplanDb>>,
}

impl DbHandle {
    pub fn new(db: GitplanDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&GitplanDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct GitplanDb {
    conn: Connection,
}

impl GitplanDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    /// `:memory:` opens an in-memory database.
    pub fn new(path: &Path) -> Result<Self> {
        if path == Path::new(":memory:") {
            return Self::new_in_memory();
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .busy_timeout(std::time::Duration::from_secs(5))
            .context("Failed to configure SQLite busy timeout")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS project_locks (
                    lock_key TEXT PRIMARY KEY,
                    repo_full_name TEXT NOT NULL,
                    path TEXT NOT NULL,
                    workspace TEXT NOT NULL,
                    pull_num INTEGER NOT NULL,
                    pull_json TEXT NOT NULL,
                    username TEXT NOT NULL DEFAULT '',
                    locked_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS command_locks (
                    command TEXT PRIMARY KEY,
                    locked_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS deployments (
                    repo_full_name TEXT NOT NULL,
                    root_name TEXT NOT NULL,
                    id TEXT NOT NULL,
                    revision TEXT NOT NULL,
                    deployed_at TEXT NOT NULL,
                    PRIMARY KEY (repo_full_name, root_name)
                );

                CREATE INDEX IF NOT EXISTS idx_project_locks_pull
                    ON project_locks(repo_full_name, pull_num);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Project locks ────────────────────────────────────────────────

    /// Insert `lock` under `key` unless a lock already exists. Returns
    /// whether it was inserted and the lock now stored under `key`.
    pub fn try_lock(&self, key: &str, lock: &ProjectLock) -> Result<(bool, ProjectLock)> {
        let tx = self.conn.unchecked_transaction()?;
        let pull_json = serde_json::to_string(&lock.pull).context("Failed to encode pull")?;
        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO project_locks
                    (lock_key, repo_full_name, path, workspace, pull_num, pull_json, username, locked_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    key,
                    lock.project.repo_full_name,
                    lock.project.path,
                    lock.workspace,
                    lock.pull.num as i64,
                    pull_json,
                    lock.user.username,
                    lock.time.to_rfc3339(),
                ],
            )
            .context("Failed to insert project lock")?;
        let current = Self::select_lock(&tx, key)?
            .with_context(|| format!("Lock {} vanished inside its own transaction", key))?;
        tx.commit()?;
        Ok((inserted == 1, current))
    }

    pub fn unlock(&self, key: &str) -> Result<Option<ProjectLock>> {
        let tx = self.conn.unchecked_transaction()?;
        let existing = Self::select_lock(&tx, key)?;
        if existing.is_some() {
            tx.execute("DELETE FROM project_locks WHERE lock_key = ?1", params![key])
                .context("Failed to delete project lock")?;
        }
        tx.commit()?;
        Ok(existing)
    }

    pub fn get_lock(&self, key: &str) -> Result<Option<ProjectLock>> {
        Self::select_lock(&self.conn, key)
    }

    pub fn list_locks(&self) -> Result<Vec<ProjectLock>> {
        let mut stmt = self.conn.prepare(
            "SELECT repo_full_name, path, workspace, pull_json, username, locked_at
             FROM project_locks ORDER BY lock_key",
        )?;
        let rows = stmt.query_map([], row_to_lock_parts)?;
        let locks = rows
            .map(|r| r.map_err(anyhow::Error::from).and_then(LockRow::into_lock))
            .collect::<Result<Vec<_>>>()?;
        Ok(locks)
    }

    pub fn unlock_by_pull(&self, repo_full_name: &str, pull_num: u64) -> Result<Vec<ProjectLock>> {
        let tx = self.conn.unchecked_transaction()?;
        let removed = {
            let mut stmt = tx.prepare(
                "SELECT repo_full_name, path, workspace, pull_json, username, locked_at
                 FROM project_locks WHERE repo_full_name = ?1 AND pull_num = ?2
                 ORDER BY lock_key",
            )?;
            let rows = stmt.query_map(params![repo_full_name, pull_num as i64], row_to_lock_parts)?;
            rows.map(|r| r.map_err(anyhow::Error::from).and_then(LockRow::into_lock))
                .collect::<Result<Vec<_>>>()?
        };
        tx.execute(
            "DELETE FROM project_locks WHERE repo_full_name = ?1 AND pull_num = ?2",
            params![repo_full_name, pull_num as i64],
        )
        .context("Failed to delete locks for pull")?;
        tx.commit()?;
        Ok(removed)
    }

    /// Remove every lock acquired before `cutoff`.
    pub fn unlock_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<ProjectLock>> {
        let tx = self.conn.unchecked_transaction()?;
        let all: Vec<(String, ProjectLock)> = {
            let mut stmt = tx.prepare(
                "SELECT lock_key, repo_full_name, path, workspace, pull_json, username, locked_at
                 FROM project_locks ORDER BY lock_key",
            )?;
            let rows = stmt.query_map([], |row| {
                let key: String = row.get(0)?;
                Ok((
                    key,
                    LockRow {
                        repo_full_name: row.get(1)?,
                        path: row.get(2)?,
                        workspace: row.get(3)?,
                        pull_json: row.get(4)?,
                        username: row.get(5)?,
                        locked_at: row.get(6)?,
                    },
                ))
            })?;
            rows.map(|r| -> Result<(String, ProjectLock)> {
                let (key, row) = r?;
                Ok((key, row.into_lock()?))
            })
            .collect::<Result<Vec<_>>>()?
        };
        let mut removed = Vec::new();
        for (key, lock) in all {
            if lock.pull_opened_at() < cutoff {
                tx.execute("DELETE FROM project_locks WHERE lock_key = ?1", params![key])
                    .context("Failed to delete stale lock")?;
                removed.push(lock);
            }
        }
        tx.commit()?;
        Ok(removed)
    }

    fn select_lock(conn: &Connection, key: &str) -> Result<Option<ProjectLock>> {
        conn.query_row(
            "SELECT repo_full_name, path, workspace, pull_json, username, locked_at
             FROM project_locks WHERE lock_key = ?1",
            params![key],
            row_to_lock_parts,
        )
        .optional()
        .context("Failed to query project lock")?
        .map(LockRow::into_lock)
        .transpose()
    }

    // ── Command locks ────────────────────────────────────────────────

    pub fn lock_command(&self, command: CommandName, time: DateTime<Utc>) -> Result<(bool, CommandLock)> {
        let tx = self.conn.unchecked_transaction()?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO command_locks (command, locked_at) VALUES (?1, ?2)",
            params![command.as_str(), time.to_rfc3339()],
        )?;
        let current = Self::select_command_lock(&tx, command)?
            .with_context(|| format!("Command lock {} vanished inside its own transaction", command))?;
        tx.commit()?;
        Ok((inserted == 1, current))
    }

    pub fn unlock_command(&self, command: CommandName) -> Result<Option<CommandLock>> {
        let tx = self.conn.unchecked_transaction()?;
        let existing = Self::select_command_lock(&tx, command)?;
        tx.execute(
            "DELETE FROM command_locks WHERE command = ?1",
            params![command.as_str()],
        )?;
        tx.commit()?;
        Ok(existing)
    }

    pub fn check_command_lock(&self, command: CommandName) -> Result<Option<CommandLock>> {
        Self::select_command_lock(&self.conn, command)
    }

    fn select_command_lock(conn: &Connection, command: CommandName) -> Result<Option<CommandLock>> {
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT command, locked_at FROM command_locks WHERE command = ?1",
                params![command.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("Failed to query command lock")?;
        row.map(|(name, locked_at)| {
            Ok(CommandLock {
                command: CommandName::from_str(&name).map_err(|e| anyhow::anyhow!(e))?,
                time: parse_time(&locked_at)?,
            })
        })
        .transpose()
    }

    // ── Deployments ──────────────────────────────────────────────────

    pub fn fetch_latest_deployment(
        &self,
        repo_full_name: &str,
        root_name: &str,
    ) -> Result<Option<DeploymentInfo>> {
        let row: Option<(String, String, String)> = self
            .conn
            .query_row(
                "SELECT id, revision, deployed_at FROM deployments
                 WHERE repo_full_name = ?1 AND root_name = ?2",
                params![repo_full_name, root_name],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .context("Failed to query latest deployment")?;
        row.map(|(id, revision, deployed_at)| {
            Ok(DeploymentInfo {
                id: id.parse().context("Invalid deployment id")?,
                revision,
                repo_full_name: repo_full_name.to_string(),
                root_name: root_name.to_string(),
                time: parse_time(&deployed_at)?,
            })
        })
        .transpose()
    }

    pub fn store_latest_deployment(&self, info: &DeploymentInfo) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO deployments (repo_full_name, root_name, id, revision, deployed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(repo_full_name, root_name) DO UPDATE SET
                    id = excluded.id,
                    revision = excluded.revision,
                    deployed_at = excluded.deployed_at",
                params![
                    info.repo_full_name,
                    info.root_name,
                    info.id.to_string(),
                    info.revision,
                    info.time.to_rfc3339(),
                ],
            )
            .context("Failed to store latest deployment")?;
        Ok(())
    }
}

struct LockRow {
    repo_full_name: String,
    path: String,
    workspace: String,
    pull_json: String,
    username: String,
    locked_at: String,
}

impl LockRow {
    fn into_lock(self) -> Result<ProjectLock> {
        let pull: PullRequest =
            serde_json::from_str(&self.pull_json).context("Failed to decode stored pull")?;
        Ok(ProjectLock {
            project: Project::new(self.repo_full_name, &self.path),
            workspace: self.workspace,
            pull,
            user: User::new(self.username),
            time: parse_time(&self.locked_at)?,
        })
    }
}

fn row_to_lock_parts(row: &Row<'_>) -> rusqlite::Result<LockRow> {
    Ok(LockRow {
        repo_full_name: row.get(0)?,
        path: row.get(1)?,
        workspace: row.get(2)?,
        pull_json: row.get(3)?,
        username: row.get(4)?,
        locked_at: row.get(5)?,
    })
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid timestamp '{}'", s))?
        .with_timezone(&Utc))
}
