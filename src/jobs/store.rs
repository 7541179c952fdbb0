use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;

use super::storage::StorageBackend;
use crate::errors::JobError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Processing,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub output: Vec<String>,
    pub status: JobStatus,
}

enum JobState {
    Open(Vec<String>),
    Complete(Vec<String>),
    /// Output was flushed to storage and freed. Kept so a late line can
    /// never reopen the job.
    Persisted,
}

/// What the in-memory layer knows about a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    InMemory(Job),
    Persisted,
    Missing,
}

/// In-memory job buffers in front of a [`StorageBackend`].
///
/// Jobs are created by the first append and become complete exactly once.
/// A completed job's output is written to storage; if storage accepted it
/// the buffer is freed and later reads go to storage, otherwise the buffer
/// stays in memory.
pub struct JobStore {
    jobs: Mutex<HashMap<String, JobState>>,
    storage: Arc<dyn StorageBackend>,
}

impl JobStore {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            storage,
        }
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<String, JobState>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn append(&self, job_id: &str, line: String) -> Result<(), JobError> {
        let mut jobs = self.jobs();
        match jobs
            .entry(job_id.to_string())
            .or_insert_with(|| JobState::Open(Vec::new()))
        {
            JobState::Open(output) => {
                output.push(line);
                Ok(())
            }
            JobState::Complete(_) | JobState::Persisted => Err(JobError::AlreadyComplete {
                job_id: job_id.to_string(),
            }),
        }
    }

    pub fn lookup(&self, job_id: &str) -> Lookup {
        match self.jobs().get(job_id) {
            Some(JobState::Open(output)) => Lookup::InMemory(Job {
                output: output.clone(),
                status: JobStatus::Processing,
            }),
            Some(JobState::Complete(output)) => Lookup::InMemory(Job {
                output: output.clone(),
                status: JobStatus::Complete,
            }),
            Some(JobState::Persisted) => Lookup::Persisted,
            None => Lookup::Missing,
        }
    }

    /// Full view of a job, reading through to storage.
    pub async fn get(&self, job_id: &str) -> Result<Job, JobError> {
        match self.lookup(job_id) {
            Lookup::InMemory(job) => Ok(job),
            Lookup::Persisted | Lookup::Missing => {
                let output = self.read_persisted(job_id).await?.ok_or_else(|| JobError::NotFound {
                    job_id: job_id.to_string(),
                })?;
                Ok(Job {
                    output,
                    status: JobStatus::Complete,
                })
            }
        }
    }

    /// Output of a job held only in storage, if storage has it.
    pub async fn read_persisted(&self, job_id: &str) -> Result<Option<Vec<String>>, JobError> {
        if !self
            .storage
            .is_key_exists(job_id)
            .await
            .map_err(JobError::Storage)?
        {
            return Ok(None);
        }
        let lines = self.storage.read(job_id).await.map_err(JobError::Storage)?;
        Ok(Some(lines))
    }

    /// Freeze the job and return its output. Closing an unknown job creates
    /// it empty and complete. Returns `None` if it was already complete.
    pub fn mark_complete(&self, job_id: &str) -> Option<Vec<String>> {
        let mut jobs = self.jobs();
        let state = jobs
            .entry(job_id.to_string())
            .or_insert_with(|| JobState::Open(Vec::new()));
        match state {
            JobState::Open(output) => {
                let output = std::mem::take(output);
                *state = JobState::Complete(output.clone());
                Some(output)
            }
            JobState::Complete(_) | JobState::Persisted => None,
        }
    }

    /// Write a completed job to storage. On success the in-memory buffer is
    /// freed; when storage declines or fails the buffer is kept.
    pub async fn persist(&self, job_id: &str, output: &[String]) -> Result<bool, JobError> {
        let persisted = self
            .storage
            .write(job_id, output)
            .await
            .map_err(JobError::Storage)?;
        if persisted {
            let mut jobs = self.jobs();
            if let Some(state) = jobs.get_mut(job_id)
                && matches!(state, JobState::Complete(_))
            {
                *state = JobState::Persisted;
            }
        }
        Ok(persisted)
    }

    /// Mark complete and persist in one call.
    pub async fn close(&self, job_id: &str) -> Result<bool, JobError> {
        match self.mark_complete(job_id) {
            Some(output) => self.persist(job_id, &output).await,
            None => Err(JobError::AlreadyComplete {
                job_id: job_id.to_string(),
            }),
        }
    }

    pub fn remove(&self, job_id: &str) {
        self.jobs().remove(job_id);
    }

    pub fn len(&self) -> usize {
        self.jobs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
