//! Persistence and transport seams.
//!
//! Every pluggable component is an async trait. Default implementations
//! live in [`defaults`](crate::defaults).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::config::RetryPolicy;
use super::errors::*;
use super::types::*;

// ---------------------------------------------------------------------------
// FlowStore
// ---------------------------------------------------------------------------

/// Default page size for [`FlowStore::list_flows`].
pub const DEFAULT_PAGE_SIZE: usize = 10;

/// Storage for flow definitions, their trigger state and connections.
#[async_trait]
pub trait FlowStore: Send + Sync {
    /// Insert or replace a flow.
    async fn put_flow(&self, flow: &Flow) -> Result<(), StoreError>;

    async fn get_flow(&self, flow_id: &str) -> Result<Option<Flow>, StoreError>;

    /// Flows ordered by most recently updated.
    async fn list_flows(&self, filter: &FlowFilter) -> Result<FlowPage, StoreError>;

    /// Delete a flow and its trigger data. Returns `true` if it existed.
    async fn delete_flow(&self, flow_id: &str) -> Result<bool, StoreError>;

    /// Update the `active` flag and trigger state together.
    async fn set_active(
        &self,
        flow_id: &str,
        active: bool,
        state: TriggerState,
    ) -> Result<Flow, StoreError>;

    /// Trigger data of a flow; default when none was stored.
    async fn get_trigger_data(&self, flow_id: &str) -> Result<TriggerData, StoreError>;

    async fn set_trigger_data(&self, flow_id: &str, data: &TriggerData) -> Result<(), StoreError>;

    /// Store the next poll cursor and scheduled poll job, but only if the
    /// flow is still active and `owner` is its current `scheduled_job_id`;
    /// the check and the write are one atomic step. Returns `false` (and
    /// writes nothing) otherwise. A `None` cursor keeps the stored one.
    async fn advance_cursor(
        &self,
        flow_id: &str,
        owner: Option<&str>,
        cursor: Option<String>,
        scheduled_job_id: Option<String>,
    ) -> Result<bool, StoreError>;

    async fn put_connection(&self, connection: &Connection) -> Result<(), StoreError>;

    async fn get_connection(&self, connection_id: &str) -> Result<Option<Connection>, StoreError>;
}

/// Filter criteria for listing flows.
#[derive(Debug, Clone, Default)]
pub struct FlowFilter {
    /// Case-insensitive substring of the flow name.
    pub name: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl FlowFilter {
    pub fn matches(&self, flow: &Flow) -> bool {
        match &self.name {
            Some(needle) => flow.name.to_lowercase().contains(&needle.to_lowercase()),
            None => true,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_PAGE_SIZE)
    }

    pub fn offset(&self) -> usize {
        self.offset.unwrap_or(0)
    }
}

/// Paginated flow listing result.
#[derive(Debug, Clone, Serialize)]
pub struct FlowPage {
    pub flows: Vec<Flow>,
    pub total: usize,
}

// ---------------------------------------------------------------------------
// ExecutionStore
// ---------------------------------------------------------------------------

/// Append-only execution history.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Create an execution. A non-test execution whose `(flow_id,
    /// internal_id)` already exists is not created again.
    async fn create_execution(&self, execution: &Execution) -> Result<CreateOutcome, StoreError>;

    /// Append a step record. A second record for the same position of the
    /// same execution is a [`StoreError::Conflict`].
    async fn append_step(&self, step: &ExecutionStep) -> Result<(), StoreError>;

    /// Set the terminal status of a running execution.
    async fn complete_execution(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
    ) -> Result<Execution, StoreError>;

    async fn get_execution(&self, execution_id: &str) -> Result<Option<Execution>, StoreError>;

    /// Step records in position order.
    async fn get_steps(&self, execution_id: &str) -> Result<Vec<ExecutionStep>, StoreError>;

    /// Executions ordered newest first.
    async fn list_executions(&self, filter: &ExecutionFilter)
    -> Result<ExecutionPage, StoreError>;

    /// Delete every execution of a flow with its steps. Returns the number
    /// of executions removed.
    async fn delete_for_flow(&self, flow_id: &str) -> Result<usize, StoreError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    Created,
    /// An execution for the same trigger event exists; carries its id.
    Duplicate(String),
}

/// Filter criteria for listing executions.
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub flow_id: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub test_run: Option<bool>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl ExecutionFilter {
    pub fn for_flow(flow_id: &str) -> Self {
        Self {
            flow_id: Some(flow_id.to_string()),
            ..Self::default()
        }
    }

    pub fn matches(&self, execution: &Execution) -> bool {
        self.flow_id.as_ref().is_none_or(|f| *f == execution.flow_id)
            && self.status.is_none_or(|s| s == execution.status)
            && self.test_run.is_none_or(|t| t == execution.test_run)
    }
}

/// Paginated execution listing result.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionPage {
    pub executions: Vec<Execution>,
    pub total: usize,
}

// ---------------------------------------------------------------------------
// JobQueue
// ---------------------------------------------------------------------------

/// Named job queues with acknowledgement, delayed jobs and retries.
///
/// A job lives on one queue for its whole life. Reserved jobs are invisible
/// to other workers until acked or failed.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Add a job. A `job_id` that already exists on the queue collapses
    /// onto the existing job.
    async fn enqueue(&self, queue: QueueName, job: NewJob) -> Result<EnqueueOutcome, QueueError>;

    /// Wait for the next ready job and mark it active.
    async fn reserve(&self, queue: QueueName) -> Result<Job, QueueError>;

    async fn ack(&self, job_id: &str) -> Result<(), QueueError>;

    /// Record a failed attempt. Retryable failures with attempts left are
    /// rescheduled with exponential backoff.
    async fn fail(
        &self,
        job_id: &str,
        message: &str,
        retryable: bool,
    ) -> Result<FailOutcome, QueueError>;

    /// Cancel a waiting or delayed job. Returns `false` for active,
    /// finished or unknown jobs.
    async fn remove(&self, job_id: &str) -> Result<bool, QueueError>;

    async fn job(&self, job_id: &str) -> Result<Option<JobRecord>, QueueError>;

    async fn counts(&self, queue: QueueName) -> Result<JobCounts, QueueError>;
}

/// A job to enqueue.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub payload: Value,
    /// Caller-chosen id; generated when `None`.
    pub job_id: Option<String>,
    pub delay: Option<Duration>,
    pub retry: RetryPolicy,
}

impl NewJob {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            job_id: None,
            delay: None,
            retry: RetryPolicy::none(),
        }
    }

    pub fn id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    Enqueued(String),
    Duplicate(String),
}

impl EnqueueOutcome {
    pub fn job_id(&self) -> &str {
        match self {
            Self::Enqueued(id) | Self::Duplicate(id) => id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FailOutcome {
    Retrying { delay: Duration },
    Failed,
}

/// A reserved job.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub queue: QueueName,
    pub payload: Value,
    /// Including the current attempt.
    pub attempts_made: u32,
    pub max_attempts: u32,
}

impl Job {
    pub fn has_attempts_left(&self) -> bool {
        self.attempts_made < self.max_attempts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

/// Status of a job, for inspection.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: String,
    pub queue: QueueName,
    pub state: JobState,
    pub payload: Value,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

/// Delivers failure notifications to a flow's owner.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notice: &FailureNotice) -> Result<(), NotifyError>;
}

/// Content of a failure notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct FailureNotice {
    pub flow_id: String,
    pub flow_name: String,
    pub execution_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_position: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepErrorPayload>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_filter_defaults() {
        let filter = FlowFilter::default();
        assert_eq!(filter.limit(), 10);
        assert_eq!(filter.offset(), 0);
    }

    #[test]
    fn flow_filter_name_is_case_insensitive() {
        let flow = Flow::new(
            "Sync Rows To Slack",
            vec![Step::trigger("webhook", "catch_raw_webhook")],
        )
        .unwrap();
        let filter = FlowFilter {
            name: Some("rows to".into()),
            ..Default::default()
        };
        assert!(filter.matches(&flow));
        let filter = FlowFilter {
            name: Some("gitlab".into()),
            ..Default::default()
        };
        assert!(!filter.matches(&flow));
    }

    #[test]
    fn execution_filter_matches() {
        let exec = Execution::new("f1", "k", true);
        assert!(ExecutionFilter::for_flow("f1").matches(&exec));
        assert!(!ExecutionFilter::for_flow("f2").matches(&exec));
        let filter = ExecutionFilter {
            test_run: Some(false),
            ..Default::default()
        };
        assert!(!filter.matches(&exec));
    }

    #[test]
    fn new_job_defaults_to_single_attempt() {
        let job = NewJob::new(Value::Null).id("j1");
        assert_eq!(job.retry.max_attempts, 1);
        assert_eq!(job.job_id.as_deref(), Some("j1"));
        assert!(job.delay.is_none());
    }
}
