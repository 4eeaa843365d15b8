//! In-memory job queue with delayed jobs, acknowledgement and retries.
//!
//! Each queue keeps its own indexes of pending, active and finished jobs,
//! so reserving and counting never walk other queues or old history.
//! [`FileQueue`](super::FileQueue) runs on the same engine with a journal
//! that receives every job change.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::file_queue::JobJournal;
use crate::config::RetryPolicy;
use crate::errors::QueueError;
use crate::traits::{
    EnqueueOutcome, FailOutcome, Job, JobCounts, JobQueue, JobRecord, JobState, NewJob,
};
use crate::types::QueueName;

/// Finished jobs kept per queue unless configured otherwise.
pub const DEFAULT_FINISHED_RETENTION: usize = 1_000;

/// Process-local [`JobQueue`].
///
/// Jobs are served FIFO per queue once their delay has passed. The newest
/// finished jobs of each queue are kept (see
/// [`with_retention`](Self::with_retention)) and a job id is refused while
/// its job is remembered. Nothing survives a restart.
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
    notify: HashMap<QueueName, Arc<Notify>>,
    retention: usize,
    journal: Option<JobJournal>,
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<String, Entry>,
    lanes: HashMap<QueueName, Lane>,
    next_seq: u64,
}

#[derive(Default)]
struct Lane {
    /// Waiting and delayed jobs in enqueue order.
    pending: BTreeMap<u64, String>,
    active: HashSet<String>,
    /// Oldest first.
    finished: VecDeque<String>,
}

impl QueueState {
    fn lane(&mut self, queue: QueueName) -> &mut Lane {
        self.lanes.entry(queue).or_default()
    }

    /// Move `job_id` to its queue's finished list, then evict the oldest
    /// finished jobs beyond `retention`. Returns the evicted ids.
    fn finished(&mut self, queue: QueueName, job_id: &str, retention: usize) -> Vec<String> {
        let lane = self.lane(queue);
        lane.active.remove(job_id);
        lane.finished.push_back(job_id.to_string());
        self.trim(retention)
    }

    fn trim(&mut self, retention: usize) -> Vec<String> {
        let mut evicted = Vec::new();
        for lane in self.lanes.values_mut() {
            while lane.finished.len() > retention {
                if let Some(id) = lane.finished.pop_front() {
                    evicted.push(id);
                }
            }
        }
        for id in &evicted {
            self.jobs.remove(id);
        }
        evicted
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum Phase {
    Pending,
    Active,
    Completed,
    Failed,
}

struct Entry {
    queue: QueueName,
    payload: Value,
    phase: Phase,
    ready_at: Instant,
    seq: u64,
    attempts_made: u32,
    retry: RetryPolicy,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

/// A job as written to a [`JobJournal`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredJob {
    pub(crate) id: String,
    pub(crate) queue: QueueName,
    pub(crate) payload: Value,
    pub(crate) phase: Phase,
    /// When a pending job becomes ready.
    pub(crate) run_at: DateTime<Utc>,
    pub(crate) seq: u64,
    pub(crate) attempts_made: u32,
    pub(crate) retry: RetryPolicy,
    #[serde(default)]
    pub(crate) last_error: Option<String>,
    pub(crate) created_at: DateTime<Utc>,
    #[serde(default)]
    pub(crate) finished_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn state(&self, now: Instant) -> JobState {
        match self.phase {
            Phase::Pending if self.ready_at <= now => JobState::Waiting,
            Phase::Pending => JobState::Delayed,
            Phase::Active => JobState::Active,
            Phase::Completed => JobState::Completed,
            Phase::Failed => JobState::Failed,
        }
    }

    fn stored(&self, id: &str) -> StoredJob {
        let wait = self.ready_at.saturating_duration_since(Instant::now());
        let run_at =
            Utc::now() + chrono::Duration::from_std(wait).unwrap_or(chrono::Duration::zero());
        StoredJob {
            id: id.to_string(),
            queue: self.queue,
            payload: self.payload.clone(),
            phase: self.phase,
            run_at,
            seq: self.seq,
            attempts_made: self.attempts_made,
            retry: self.retry.clone(),
            last_error: self.last_error.clone(),
            created_at: self.created_at,
            finished_at: self.finished_at,
        }
    }

    fn from_stored(job: StoredJob) -> Self {
        // Past run times are ready now.
        let wait = (job.run_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        Self {
            queue: job.queue,
            payload: job.payload,
            phase: job.phase,
            ready_at: Instant::now() + wait,
            seq: job.seq,
            attempts_made: job.attempts_made,
            retry: job.retry,
            last_error: job.last_error,
            created_at: job.created_at,
            finished_at: job.finished_at,
        }
    }
}

enum Reserve {
    Ready(Job),
    WaitUntil(Instant),
    Wait,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_FINISHED_RETENTION)
    }

    /// A queue that keeps at most `retention` finished jobs per queue.
    pub fn with_retention(retention: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: QueueName::ALL
                .iter()
                .map(|q| (*q, Arc::new(Notify::new())))
                .collect(),
            retention,
            journal: None,
        }
    }

    /// Rebuild from journaled jobs. Jobs that were active when the previous
    /// process stopped are pending again.
    pub(crate) fn restore(
        journal: JobJournal,
        mut jobs: Vec<StoredJob>,
        retention: usize,
    ) -> Result<Self, QueueError> {
        let queue = Self {
            journal: Some(journal),
            ..Self::with_retention(retention)
        };
        // Pending first, then finished jobs oldest first.
        jobs.sort_by_key(|job| (job.finished_at, job.seq));

        let evicted = {
            let mut state = queue.state.lock();
            for mut job in jobs {
                if job.phase == Phase::Active {
                    job.phase = Phase::Pending;
                    queue.save(&job)?;
                    tracing::info!(queue = %job.queue, job_id = %job.id, "interrupted job requeued");
                }
                state.next_seq = state.next_seq.max(job.seq + 1);
                let id = job.id.clone();
                let entry = Entry::from_stored(job);
                let lane = state.lane(entry.queue);
                match entry.phase {
                    Phase::Pending | Phase::Active => {
                        lane.pending.insert(entry.seq, id.clone());
                    }
                    Phase::Completed | Phase::Failed => lane.finished.push_back(id.clone()),
                }
                state.jobs.insert(id, entry);
            }
            state.trim(retention)
        };
        queue.forget(&evicted);
        Ok(queue)
    }

    fn notifier(&self, queue: QueueName) -> Arc<Notify> {
        self.notify
            .get(&queue)
            .cloned()
            .unwrap_or_else(|| Arc::new(Notify::new()))
    }

    fn wake(&self, queue: QueueName) {
        if let Some(notify) = self.notify.get(&queue) {
            notify.notify_waiters();
        }
    }

    fn save(&self, job: &StoredJob) -> Result<(), QueueError> {
        match &self.journal {
            Some(journal) => journal.save(job),
            None => Ok(()),
        }
    }

    fn persist(&self, job_id: &str, entry: &Entry) -> Result<(), QueueError> {
        match &self.journal {
            Some(journal) => journal.save(&entry.stored(job_id)),
            None => Ok(()),
        }
    }

    fn forget(&self, job_ids: &[String]) {
        let Some(journal) = &self.journal else {
            return;
        };
        for job_id in job_ids {
            if let Err(e) = journal.erase(job_id) {
                tracing::warn!(job_id = %job_id, error = %e, "failed to erase evicted job");
            }
        }
    }

    fn try_reserve(&self, queue: QueueName) -> Reserve {
        let mut state = self.state.lock();
        let now = Instant::now();
        let QueueState { jobs, lanes, .. } = &mut *state;
        let lane = lanes.entry(queue).or_default();

        let mut wake_at: Option<Instant> = None;
        let mut ready = None;
        for (seq, id) in &lane.pending {
            let Some(entry) = jobs.get(id) else {
                continue;
            };
            if entry.ready_at <= now {
                ready = Some(*seq);
                break;
            }
            wake_at = Some(wake_at.map_or(entry.ready_at, |at| at.min(entry.ready_at)));
        }

        let Some(seq) = ready else {
            return wake_at.map_or(Reserve::Wait, Reserve::WaitUntil);
        };
        let Some(id) = lane.pending.remove(&seq) else {
            return Reserve::Wait;
        };
        let Some(entry) = jobs.get_mut(&id) else {
            return Reserve::Wait;
        };
        entry.phase = Phase::Active;
        entry.attempts_made += 1;
        lane.active.insert(id.clone());
        if let Err(e) = self.persist(&id, entry) {
            // Restored as pending either way.
            tracing::warn!(job_id = %id, error = %e, "failed to journal reserved job");
        }
        Reserve::Ready(Job {
            queue,
            payload: entry.payload.clone(),
            attempts_made: entry.attempts_made,
            max_attempts: entry.retry.max_attempts,
            id,
        })
    }

    fn finish(&self, job_id: &str, phase: Phase, error: Option<&str>) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        let entry = state
            .jobs
            .get_mut(job_id)
            .filter(|e| e.phase == Phase::Active)
            .ok_or_else(|| QueueError::JobNotFound {
                job_id: job_id.to_string(),
            })?;
        entry.phase = phase;
        entry.finished_at = Some(Utc::now());
        if let Some(error) = error {
            entry.last_error = Some(error.to_string());
        }
        let queue = entry.queue;
        let saved = self.persist(job_id, entry);
        let evicted = state.finished(queue, job_id, self.retention);
        self.forget(&evicted);
        saved
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobQueue for InMemoryQueue {
    async fn enqueue(&self, queue: QueueName, job: NewJob) -> Result<EnqueueOutcome, QueueError> {
        let job_id = job
            .job_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        {
            let mut state = self.state.lock();
            if state.jobs.contains_key(&job_id) {
                return Ok(EnqueueOutcome::Duplicate(job_id));
            }
            let seq = state.next_seq;
            let ready_at = match job.delay {
                Some(delay) => Instant::now() + delay,
                None => Instant::now(),
            };
            let entry = Entry {
                queue,
                payload: job.payload,
                phase: Phase::Pending,
                ready_at,
                seq,
                attempts_made: 0,
                retry: job.retry,
                last_error: None,
                created_at: Utc::now(),
                finished_at: None,
            };
            // Accepted only once written.
            self.persist(&job_id, &entry)?;
            state.next_seq += 1;
            state.lane(queue).pending.insert(seq, job_id.clone());
            state.jobs.insert(job_id.clone(), entry);
        }
        self.wake(queue);
        tracing::debug!(queue = %queue, job_id = %job_id, "job enqueued");
        Ok(EnqueueOutcome::Enqueued(job_id))
    }

    async fn reserve(&self, queue: QueueName) -> Result<Job, QueueError> {
        let notify = self.notifier(queue);
        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            // Register before looking, so an enqueue in between still wakes us.
            notified.as_mut().enable();

            match self.try_reserve(queue) {
                Reserve::Ready(job) => return Ok(job),
                Reserve::WaitUntil(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                Reserve::Wait => notified.await,
            }
        }
    }

    async fn ack(&self, job_id: &str) -> Result<(), QueueError> {
        self.finish(job_id, Phase::Completed, None)
    }

    async fn fail(
        &self,
        job_id: &str,
        message: &str,
        retryable: bool,
    ) -> Result<FailOutcome, QueueError> {
        let (queue, outcome) = {
            let mut state = self.state.lock();
            let seq = state.next_seq;
            let entry = state
                .jobs
                .get_mut(job_id)
                .filter(|e| e.phase == Phase::Active)
                .ok_or_else(|| QueueError::JobNotFound {
                    job_id: job_id.to_string(),
                })?;
            entry.last_error = Some(message.to_string());
            let queue = entry.queue;

            if retryable && entry.attempts_made < entry.retry.max_attempts {
                let delay = entry.retry.delay_after(entry.attempts_made);
                entry.phase = Phase::Pending;
                entry.ready_at = Instant::now() + delay;
                entry.seq = seq;
                let saved = self.persist(job_id, entry);
                state.next_seq += 1;
                let lane = state.lane(queue);
                lane.active.remove(job_id);
                lane.pending.insert(seq, job_id.to_string());
                saved?;
                (queue, FailOutcome::Retrying { delay })
            } else {
                entry.phase = Phase::Failed;
                entry.finished_at = Some(Utc::now());
                let saved = self.persist(job_id, entry);
                let evicted = state.finished(queue, job_id, self.retention);
                self.forget(&evicted);
                saved?;
                (queue, FailOutcome::Failed)
            }
        };
        if matches!(outcome, FailOutcome::Retrying { .. }) {
            self.wake(queue);
        }
        Ok(outcome)
    }

    async fn remove(&self, job_id: &str) -> Result<bool, QueueError> {
        let mut state = self.state.lock();
        let (queue, seq) = match state.jobs.get(job_id) {
            Some(e) if e.phase == Phase::Pending => (e.queue, e.seq),
            _ => return Ok(false),
        };
        state.jobs.remove(job_id);
        state.lane(queue).pending.remove(&seq);
        if let Some(journal) = &self.journal {
            journal.erase(job_id)?;
        }
        Ok(true)
    }

    async fn job(&self, job_id: &str) -> Result<Option<JobRecord>, QueueError> {
        let state = self.state.lock();
        let now = Instant::now();
        Ok(state.jobs.get(job_id).map(|e| JobRecord {
            id: job_id.to_string(),
            queue: e.queue,
            state: e.state(now),
            payload: e.payload.clone(),
            attempts_made: e.attempts_made,
            max_attempts: e.retry.max_attempts,
            last_error: e.last_error.clone(),
            created_at: e.created_at,
            finished_at: e.finished_at,
        }))
    }

    async fn counts(&self, queue: QueueName) -> Result<JobCounts, QueueError> {
        let state = self.state.lock();
        let now = Instant::now();
        let mut counts = JobCounts::default();
        let Some(lane) = state.lanes.get(&queue) else {
            return Ok(counts);
        };
        counts.active = lane.active.len();
        for id in lane.pending.values().chain(lane.finished.iter()) {
            match state.jobs.get(id).map(|e| e.state(now)) {
                Some(JobState::Waiting) => counts.waiting += 1,
                Some(JobState::Delayed) => counts.delayed += 1,
                Some(JobState::Completed) => counts.completed += 1,
                Some(JobState::Failed) => counts.failed += 1,
                Some(JobState::Active) | None => {}
            }
        }
        Ok(counts)
    }
}
