use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockWriteGuard};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::storage::StorageBackend;
use super::store::{JobStatus, JobStore, Lookup};
use crate::errors::JobError;
use crate::models::{JobInfo, PullInfo};

enum OutputMessage {
    Line {
        job_id: String,
        info: JobInfo,
        line: String,
    },
    Close {
        job_id: String,
    },
    Flush(oneshot::Sender<()>),
}

#[derive(Default)]
struct Registry {
    receivers: HashMap<String, Vec<mpsc::Sender<String>>>,
    pull_jobs: HashMap<PullInfo, HashSet<String>>,
}

struct Inner {
    input: mpsc::UnboundedSender<OutputMessage>,
    pending: Mutex<Option<mpsc::UnboundedReceiver<OutputMessage>>>,
    store: JobStore,
    registry: RwLock<Registry>,
    subscriber_buffer: usize,
    dropped_subscribers: AtomicU64,
}

/// Counters exposed for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct HandlerStats {
    pub dropped_subscribers: u64,
    pub live_subscribers: usize,
}

/// Fans job output from producers out to live subscribers and storage.
///
/// Producers call [`send`](Self::send) and [`close_job`](Self::close_job),
/// which only enqueue and so never block. [`handle`](Self::handle) is the
/// single loop that applies queued messages: it appends to the job buffer
/// and pushes each line to the job's subscribers with `try_send`. A
/// subscriber whose channel is full or closed is dropped and counted.
///
/// [`register`](Self::register) replays a job's buffer into a new channel
/// and joins the live set under the same registry lock the loop dispatches
/// under, so a subscriber sees every line exactly once and in order.
#[derive(Clone)]
pub struct OutputHandler {
    inner: Arc<Inner>,
}

impl OutputHandler {
    pub fn new(storage: Arc<dyn StorageBackend>, subscriber_buffer: usize) -> Self {
        let (input, pending) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                input,
                pending: Mutex::new(Some(pending)),
                store: JobStore::new(storage),
                registry: RwLock::new(Registry::default()),
                subscriber_buffer: subscriber_buffer.max(1),
                dropped_subscribers: AtomicU64::new(0),
            }),
        }
    }

    fn registry(&self) -> RwLockWriteGuard<'_, Registry> {
        self.inner
            .registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a line of output for `job_id`.
    pub fn send(&self, job_id: &str, info: &JobInfo, line: impl Into<String>) {
        let msg = OutputMessage::Line {
            job_id: job_id.to_string(),
            info: info.clone(),
            line: line.into(),
        };
        if self.inner.input.send(msg).is_err() {
            tracing::warn!(job_id, "output handler stopped; dropping line");
        }
    }

    /// Queue completion of `job_id`. Lines sent after this are discarded.
    pub fn close_job(&self, job_id: &str) {
        let msg = OutputMessage::Close {
            job_id: job_id.to_string(),
        };
        if self.inner.input.send(msg).is_err() {
            tracing::warn!(job_id, "output handler stopped; dropping close");
        }
    }

    /// Wait until every message queued before this call has been applied.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.inner.input.send(OutputMessage::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Consume queued output until `cancel` fires. Only the first caller
    /// runs the loop; later calls return immediately.
    pub async fn handle(&self, cancel: CancellationToken) {
        let pending = self
            .inner
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(mut input) = pending else {
            tracing::warn!("output handler loop already running");
            return;
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                msg = input.recv() => match msg {
                    Some(msg) => self.apply(msg).await,
                    None => break,
                },
            }
        }
        tracing::debug!("output handler loop stopped");
    }

    async fn apply(&self, msg: OutputMessage) {
        match msg {
            OutputMessage::Line { job_id, info, line } => self.apply_line(job_id, info, line),
            OutputMessage::Close { job_id } => self.apply_close(job_id).await,
            OutputMessage::Flush(done) => {
                let _ = done.send(());
            }
        }
    }

    fn apply_line(&self, job_id: String, info: JobInfo, line: String) {
        let mut registry = self.registry();
        if let Err(e) = self.inner.store.append(&job_id, line.clone()) {
            tracing::debug!(job_id = %job_id, error = %e, "discarding output");
            return;
        }
        registry
            .pull_jobs
            .entry(info.pull)
            .or_default()
            .insert(job_id.clone());

        if let Some(subscribers) = registry.receivers.get_mut(&job_id) {
            subscribers.retain(|tx| match tx.try_send(line.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.inner.dropped_subscribers.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(job_id = %job_id, "subscriber fell behind; dropping it");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.inner.dropped_subscribers.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(job_id = %job_id, "subscriber went away");
                    false
                }
            });
        }
    }

    async fn apply_close(&self, job_id: String) {
        let output = {
            let mut registry = self.registry();
            let output = self.inner.store.mark_complete(&job_id);
            // Dropping the senders closes every live subscriber.
            registry.receivers.remove(&job_id);
            output
        };
        let Some(output) = output else {
            tracing::debug!(job_id = %job_id, "job already complete");
            return;
        };

        match self.inner.store.persist(&job_id, &output).await {
            Ok(true) => tracing::debug!(job_id = %job_id, lines = output.len(), "job output persisted"),
            Ok(false) => tracing::debug!(job_id = %job_id, "job storage not configured; keeping output in memory"),
            Err(e) => tracing::error!(job_id = %job_id, error = %e, "failed to persist job output; keeping it in memory"),
        }
    }

    /// Subscribe to `job_id`. The returned channel first yields every line
    /// already buffered, then live lines, and closes when the job completes.
    /// A job nobody has sent to yet is subscribed to and waited for.
    pub async fn register(&self, job_id: &str) -> Result<mpsc::Receiver<String>, JobError> {
        if !matches!(self.inner.store.lookup(job_id), Lookup::InMemory(_))
            && let Some(lines) = self.inner.store.read_persisted(job_id).await?
        {
            return Ok(replay_closed(lines));
        }

        {
            let mut registry = self.registry();
            prune_disconnected(&mut registry.receivers);
            match self.inner.store.lookup(job_id) {
                Lookup::InMemory(job) => {
                    let (tx, rx) = mpsc::channel(job.output.len() + self.inner.subscriber_buffer);
                    for line in job.output {
                        // Capacity covers the whole replay.
                        let _ = tx.try_send(line);
                    }
                    if job.status == JobStatus::Processing {
                        registry
                            .receivers
                            .entry(job_id.to_string())
                            .or_default()
                            .push(tx);
                    }
                    return Ok(rx);
                }
                Lookup::Missing => {
                    let (tx, rx) = mpsc::channel(self.inner.subscriber_buffer);
                    registry
                        .receivers
                        .entry(job_id.to_string())
                        .or_default()
                        .push(tx);
                    return Ok(rx);
                }
                Lookup::Persisted => {}
            }
        }

        // Persisted between the first check and taking the lock.
        let lines = self
            .inner
            .store
            .read_persisted(job_id)
            .await?
            .ok_or_else(|| JobError::NotFound {
                job_id: job_id.to_string(),
            })?;
        Ok(replay_closed(lines))
    }

    /// Forget subscribers of `job_id` whose receiving end has been dropped.
    /// Called when a viewer disconnects before the job completes.
    pub fn deregister(&self, job_id: &str) {
        let mut registry = self.registry();
        if let Some(subscribers) = registry.receivers.get_mut(job_id) {
            subscribers.retain(|tx| !tx.is_closed());
            if subscribers.is_empty() {
                registry.receivers.remove(job_id);
            }
        }
    }

    /// Drop every job and subscriber belonging to a closed pull request.
    /// Returns the removed job ids.
    pub fn clean_up(&self, pull: &PullInfo) -> Vec<String> {
        let mut registry = self.registry();
        let Some(job_ids) = registry.pull_jobs.remove(pull) else {
            return Vec::new();
        };
        let mut removed: Vec<String> = job_ids.into_iter().collect();
        removed.sort();
        for job_id in &removed {
            registry.receivers.remove(job_id);
            self.inner.store.remove(job_id);
        }
        tracing::info!(
            repo = %pull.repo_full_name,
            pull = pull.pull_num,
            jobs = removed.len(),
            "cleaned up jobs for pull request"
        );
        removed
    }

    /// Full output of a job, in memory or persisted.
    pub async fn job_output(&self, job_id: &str) -> Result<(Vec<String>, JobStatus), JobError> {
        let job = self.inner.store.get(job_id).await?;
        Ok((job.output, job.status))
    }

    pub fn stats(&self) -> HandlerStats {
        let live_subscribers = self
            .inner
            .registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .receivers
            .values()
            .map(Vec::len)
            .sum();
        HandlerStats {
            dropped_subscribers: self.inner.dropped_subscribers.load(Ordering::Relaxed),
            live_subscribers,
        }
    }
}

fn prune_disconnected(receivers: &mut HashMap<String, Vec<mpsc::Sender<String>>>) {
    receivers.retain(|_, subscribers| {
        subscribers.retain(|tx| !tx.is_closed());
        !subscribers.is_empty()
    });
}

fn replay_closed(lines: Vec<String>) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(lines.len().max(1));
    for line in lines {
        let _ = tx.try_send(line);
    }
    rx
}
