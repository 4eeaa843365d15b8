//! File-backed job queue.
//!
//! Layout:
//! ```text
//! {base_dir}/{sha256(job_id)}.json   one job record per file
//! ```
//!
//! Scheduling runs in memory exactly as in [`InMemoryQueue`]. Every job
//! change is written through before the call returns, using the same
//! temp-file-then-rename writes as [`FileStore`](super::FileStore). On
//! open, jobs that were active when the previous process stopped are
//! waiting again, so an accepted job is never lost to a restart.

use std::path::PathBuf;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::in_memory_queue::{DEFAULT_FINISHED_RETENTION, InMemoryQueue, StoredJob};
use crate::errors::QueueError;
use crate::traits::{EnqueueOutcome, FailOutcome, Job, JobCounts, JobQueue, JobRecord, NewJob};
use crate::types::QueueName;

/// Durable [`JobQueue`] keeping one JSON record per job under a directory.
pub struct FileQueue {
    inner: InMemoryQueue,
}

impl FileQueue {
    /// Open the queue rooted at `base_dir`, creating it if needed.
    pub fn open(base_dir: PathBuf) -> Result<Self, QueueError> {
        Self::open_with_retention(base_dir, DEFAULT_FINISHED_RETENTION)
    }

    /// Like [`open`](Self::open), keeping at most `retention` finished jobs
    /// per queue.
    pub fn open_with_retention(base_dir: PathBuf, retention: usize) -> Result<Self, QueueError> {
        let journal = JobJournal::create(base_dir)?;
        let jobs = journal.load()?;
        tracing::info!(
            dir = %journal.base_dir.display(),
            jobs = jobs.len(),
            "job queue opened"
        );
        Ok(Self {
            inner: InMemoryQueue::restore(journal, jobs, retention)?,
        })
    }
}

#[async_trait]
impl JobQueue for FileQueue {
    async fn enqueue(&self, queue: QueueName, job: NewJob) -> Result<EnqueueOutcome, QueueError> {
        self.inner.enqueue(queue, job).await
    }

    async fn reserve(&self, queue: QueueName) -> Result<Job, QueueError> {
        self.inner.reserve(queue).await
    }

    async fn ack(&self, job_id: &str) -> Result<(), QueueError> {
        self.inner.ack(job_id).await
    }

    async fn fail(
        &self,
        job_id: &str,
        message: &str,
        retryable: bool,
    ) -> Result<FailOutcome, QueueError> {
        self.inner.fail(job_id, message, retryable).await
    }

    async fn remove(&self, job_id: &str) -> Result<bool, QueueError> {
        self.inner.remove(job_id).await
    }

    async fn job(&self, job_id: &str) -> Result<Option<JobRecord>, QueueError> {
        self.inner.job(job_id).await
    }

    async fn counts(&self, queue: QueueName) -> Result<JobCounts, QueueError> {
        self.inner.counts(queue).await
    }
}

// ---------------------------------------------------------------------------
// Journal
// ---------------------------------------------------------------------------

/// Directory of job records.
pub(crate) struct JobJournal {
    base_dir: PathBuf,
}

fn io_error(action: &str, e: std::io::Error) -> QueueError {
    QueueError::Queue {
        message: format!("failed to {action}: {e}"),
    }
}

impl JobJournal {
    fn create(base_dir: PathBuf) -> Result<Self, QueueError> {
        std::fs::create_dir_all(&base_dir).map_err(|e| io_error("create job directory", e))?;
        Ok(Self { base_dir })
    }

    fn path(&self, job_id: &str) -> PathBuf {
        let hash = Sha256::digest(job_id.as_bytes());
        self.base_dir.join(format!("{hash:x}.json"))
    }

    fn load(&self) -> Result<Vec<StoredJob>, QueueError> {
        let entries =
            std::fs::read_dir(&self.base_dir).map_err(|e| io_error("read job directory", e))?;
        let mut jobs = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let data = std::fs::read(&path).map_err(|e| io_error("read job record", e))?;
            match serde_json::from_slice::<StoredJob>(&data) {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping corrupt job record");
                }
            }
        }
        Ok(jobs)
    }

    pub(crate) fn save(&self, job: &StoredJob) -> Result<(), QueueError> {
        let data = serde_json::to_vec_pretty(job).map_err(|e| QueueError::Serialization {
            message: e.to_string(),
        })?;
        let path = self.path(&job.id);
        let mut temp = path.as_os_str().to_owned();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);
        std::fs::write(&temp, data).map_err(|e| io_error("write temp file", e))?;
        std::fs::rename(&temp, &path).map_err(|e| io_error("rename temp file", e))?;
        Ok(())
    }

    pub(crate) fn erase(&self, job_id: &str) -> Result<(), QueueError> {
        match std::fs::remove_file(self.path(job_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("remove job record", e)),
        }
    }
}
