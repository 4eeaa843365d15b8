//! Bounded-concurrency worker loop over one queue.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinHandle;

use crate::traits::{FailOutcome, Job, JobQueue};
use crate::types::QueueName;

/// Why a job attempt failed, and whether the queue may retry it.
#[derive(Debug, Clone, PartialEq)]
pub struct JobFailure {
    pub message: String,
    pub retryable: bool,
}

impl JobFailure {
    pub fn retryable(message: impl std::fmt::Display) -> Self {
        Self {
            message: message.to_string(),
            retryable: true,
        }
    }

    pub fn fatal(message: impl std::fmt::Display) -> Self {
        Self {
            message: message.to_string(),
            retryable: false,
        }
    }
}

/// Processes jobs of one queue.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<(), JobFailure>;
}

/// Spawns the consumer loop for a queue.
pub struct WorkerPool;

impl WorkerPool {
    /// Run `handler` over `queue_name` with at most `concurrency` jobs in
    /// flight, until `shutdown` fires. In-flight jobs finish on their own
    /// tasks after the loop exits.
    pub fn spawn(
        queue: Arc<dyn JobQueue>,
        queue_name: QueueName,
        concurrency: usize,
        handler: Arc<dyn JobHandler>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let permits = Arc::new(Semaphore::new(concurrency.max(1)));

        tokio::spawn(async move {
            tracing::debug!(queue = %queue_name, concurrency, "worker pool started");
            loop {
                // Take a slot before reserving so a reserved job never waits.
                let permit = tokio::select! {
                    permit = Arc::clone(&permits).acquire_owned() => match permit {
                        Ok(p) => p,
                        Err(_) => break,
                    },
                    _ = shutdown.recv() => break,
                };

                let job = tokio::select! {
                    job = queue.reserve(queue_name) => job,
                    _ = shutdown.recv() => break,
                };
                let job = match job {
                    Ok(job) => job,
                    Err(e) => {
                        tracing::error!(queue = %queue_name, "reserve failed: {e}");
                        continue;
                    }
                };

                let queue = Arc::clone(&queue);
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    let _permit = permit;
                    process(queue.as_ref(), handler.as_ref(), job).await;
                });
            }
            tracing::debug!(queue = %queue_name, "worker pool stopped");
        })
    }
}

async fn process(queue: &dyn JobQueue, handler: &dyn JobHandler, job: Job) {
    match handler.handle(&job).await {
        Ok(()) => {
            if let Err(e) = queue.ack(&job.id).await {
                tracing::error!(job_id = %job.id, "ack failed: {e}");
            }
        }
        Err(failure) => match queue.fail(&job.id, &failure.message, failure.retryable).await {
            Ok(FailOutcome::Retrying { delay }) => tracing::info!(
                queue = %job.queue,
                job_id = %job.id,
                attempt = job.attempts_made,
                delay_ms = delay.as_millis() as u64,
                "job failed, retrying: {}",
                failure.message
            ),
            Ok(FailOutcome::Failed) => tracing::warn!(
                queue = %job.queue,
                job_id = %job.id,
                attempt = job.attempts_made,
                "job failed: {}",
                failure.message
            ),
            Err(e) => tracing::error!(job_id = %job.id, "fail failed: {e}"),
        },
    }
}
