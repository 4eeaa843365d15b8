//! Flow runner: turns one trigger event into an execution.
//!
//! Step 1 records the trigger payload verbatim. Every later step has its
//! parameters resolved against the outputs recorded so far, is dispatched,
//! and is awaited until its `ExecutionStep` is persisted. Only then does the
//! next step start. The first failure halts the execution.
//!
//! Live executions dispatch through the action queue. Test runs call the
//! connector inline against a scratch store so that nothing outlives the
//! caller.

pub(crate) mod action;
pub(crate) mod notify;
pub(crate) mod pending;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::config::{EngineConfig, RetryPolicy};
use crate::defaults::InMemoryStore;
use crate::errors::{QueueError, StoreError};
use crate::queue::{JobFailure, JobHandler};
use crate::traits::{CreateOutcome, ExecutionStore, FlowStore, Job, JobQueue, JobState, NewJob};
use crate::types::*;
use crate::variables::{StepOutputs, resolve_parameters};

use action::ActionInvoker;
use pending::{ActionOutcome, PendingActions};

/// How often a waiting run double-checks the action job's queue state.
const PENDING_CHECK_INTERVAL: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Errors that stop a flow run outside of step failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RunnerError {
    #[error("flow not found: {flow_id}")]
    FlowNotFound { flow_id: String },
    #[error("flow {flow_id} has no trigger step")]
    MissingTrigger { flow_id: String },
    #[error("action job {job_id} finished without a result")]
    ActionLost { job_id: String },
    #[error("runner store error: {0}")]
    Store(#[from] StoreError),
    #[error("runner queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Result of handling one flow-run job.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(Execution),
    /// The trigger event already produced an execution.
    Duplicate { existing_id: String },
}

/// Authoring-time run result. Nothing in it is persisted.
#[derive(Debug, Clone, Serialize)]
pub struct TestRunReport {
    pub execution: Execution,
    pub steps: Vec<ExecutionStep>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Dispatch {
    Queued,
    Inline,
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

pub(crate) struct FlowRunner {
    flows: Arc<dyn FlowStore>,
    executions: Arc<dyn ExecutionStore>,
    queue: Arc<dyn JobQueue>,
    invoker: Arc<ActionInvoker>,
    pending: PendingActions,
    config: Arc<EngineConfig>,
}

impl FlowRunner {
    pub(crate) fn new(
        flows: Arc<dyn FlowStore>,
        executions: Arc<dyn ExecutionStore>,
        queue: Arc<dyn JobQueue>,
        invoker: Arc<ActionInvoker>,
        pending: PendingActions,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            flows,
            executions,
            queue,
            invoker,
            pending,
            config,
        }
    }

    /// Handle one flow-run job from the queue.
    pub(crate) async fn run_job(&self, job: &FlowRunJob) -> Result<RunOutcome, RunnerError> {
        let flow = self
            .flows
            .get_flow(&job.flow_id)
            .await?
            .ok_or_else(|| RunnerError::FlowNotFound {
                flow_id: job.flow_id.clone(),
            })?;

        if job.test_run {
            let report = self.test_run(&flow, job, None).await?;
            tracing::info!(
                flow_id = %flow.id,
                status = %report.execution.status,
                steps = report.steps.len(),
                "test run finished"
            );
            return Ok(RunOutcome::Completed(report.execution));
        }

        self.execute(&flow, job, self.executions.as_ref(), Dispatch::Queued, None)
            .await
    }

    /// Run `job` inline against a scratch store, stopping after
    /// `until_position` when given.
    pub(crate) async fn test_run(
        &self,
        flow: &Flow,
        job: &FlowRunJob,
        until_position: Option<u32>,
    ) -> Result<TestRunReport, RunnerError> {
        let scratch = InMemoryStore::new();
        let execution = match self
            .execute(flow, job, &scratch, Dispatch::Inline, until_position)
            .await?
        {
            RunOutcome::Completed(execution) => execution,
            RunOutcome::Duplicate { existing_id } => {
                // Test runs skip dedupe; a fresh store cannot report one.
                return Err(RunnerError::Store(StoreError::Conflict {
                    message: format!("test run collided with execution {existing_id}"),
                }));
            }
        };
        let steps = scratch.get_steps(&execution.id).await?;
        Ok(TestRunReport { execution, steps })
    }

    async fn execute(
        &self,
        flow: &Flow,
        job: &FlowRunJob,
        store: &dyn ExecutionStore,
        dispatch: Dispatch,
        until_position: Option<u32>,
    ) -> Result<RunOutcome, RunnerError> {
        let execution = Execution::new(&flow.id, &job.dedupe_key, job.test_run);
        if let CreateOutcome::Duplicate(existing_id) = store.create_execution(&execution).await? {
            tracing::info!(
                flow_id = %flow.id,
                execution_id = %existing_id,
                dedupe_key = %job.dedupe_key,
                "duplicate trigger event, execution not created"
            );
            return Ok(RunOutcome::Duplicate { existing_id });
        }
        tracing::info!(
            flow_id = %flow.id,
            execution_id = %execution.id,
            test_run = execution.test_run,
            "execution created"
        );

        let status = match self
            .run_steps(flow, &execution, job, store, dispatch, until_position)
            .await
        {
            Ok(status) => status,
            Err(e) => {
                tracing::error!(execution_id = %execution.id, error = %e, "execution aborted");
                if let Err(e) = store
                    .complete_execution(&execution.id, ExecutionStatus::Failure)
                    .await
                {
                    tracing::error!(execution_id = %execution.id, error = %e, "failed to close execution");
                }
                self.notify_failure(&execution).await;
                return Err(e);
            }
        };

        let execution = store.complete_execution(&execution.id, status).await?;
        tracing::info!(
            flow_id = %flow.id,
            execution_id = %execution.id,
            status = %execution.status,
            "execution completed"
        );
        if status == ExecutionStatus::Failure {
            self.notify_failure(&execution).await;
        }
        Ok(RunOutcome::Completed(execution))
    }

    async fn run_steps(
        &self,
        flow: &Flow,
        execution: &Execution,
        job: &FlowRunJob,
        store: &dyn ExecutionStore,
        dispatch: Dispatch,
        until_position: Option<u32>,
    ) -> Result<ExecutionStatus, RunnerError> {
        let trigger = flow
            .trigger_step()
            .ok_or_else(|| RunnerError::MissingTrigger {
                flow_id: flow.id.clone(),
            })?;
        store
            .append_step(&ExecutionStep::success(
                &execution.id,
                trigger,
                trigger.parameters_value(),
                job.payload.clone(),
                0,
            ))
            .await?;

        let mut outputs = StepOutputs::new();
        outputs.insert(trigger.position, job.payload.clone());

        for step in flow.action_steps() {
            if until_position.is_some_and(|until| step.position > until) {
                break;
            }

            let input = match resolve_parameters(&step.parameters_value(), &outputs, step.position)
            {
                Ok(input) => input,
                Err(e) => {
                    tracing::warn!(
                        execution_id = %execution.id,
                        position = step.position,
                        error = %e,
                        "parameter resolution failed"
                    );
                    store
                        .append_step(&ExecutionStep::failure(
                            &execution.id,
                            step,
                            step.parameters_value(),
                            StepErrorPayload::from(&e),
                            0,
                        ))
                        .await?;
                    return Ok(ExecutionStatus::Failure);
                }
            };

            let outcome = match dispatch {
                Dispatch::Queued => self.dispatch_queued(flow, execution, step, input, store).await?,
                Dispatch::Inline => self.dispatch_inline(flow, execution, step, input, store).await?,
            };
            match outcome {
                ActionOutcome::Success(output) => outputs.insert(step.position, output),
                ActionOutcome::Failure(_) => return Ok(ExecutionStatus::Failure),
            }
        }
        Ok(ExecutionStatus::Success)
    }

    /// Enqueue the action job and wait for the worker to persist its step.
    async fn dispatch_queued(
        &self,
        flow: &Flow,
        execution: &Execution,
        step: &Step,
        input: Value,
        store: &dyn ExecutionStore,
    ) -> Result<ActionOutcome, RunnerError> {
        let action = ActionJob {
            execution_id: execution.id.clone(),
            step_id: step.id.clone(),
            connector_key: step.app_key.clone(),
            operation_key: step.operation_key.clone(),
            input,
            flow_id: flow.id.clone(),
            position: step.position,
            test_run: execution.test_run,
        };
        let job_id = action.job_id();
        let mut rx = self.pending.register(&job_id);

        let new_job = NewJob::new(action.to_payload()?)
            .id(job_id.clone())
            .retry(self.config.action_retry.clone());
        match self.queue.enqueue(QueueName::Action, new_job).await {
            Ok(outcome) => tracing::debug!(
                execution_id = %execution.id,
                position = step.position,
                job_id = %job_id,
                duplicate = outcome.is_duplicate(),
                "action dispatched"
            ),
            Err(e) => {
                self.pending.cancel(&job_id);
                return Err(e.into());
            }
        }

        let mut check = tokio::time::interval(PENDING_CHECK_INTERVAL);
        check.tick().await;
        loop {
            tokio::select! {
                outcome = &mut rx => {
                    return match outcome {
                        Ok(outcome) => Ok(outcome),
                        Err(_) => self
                            .recorded_outcome(store, &execution.id, step.position)
                            .await?
                            .ok_or(RunnerError::ActionLost { job_id }),
                    };
                }
                _ = check.tick() => {
                    // Covers a worker in another process, or one that died
                    // between persisting and notifying. A job no longer on
                    // the queue was finished and evicted.
                    let finished = self
                        .queue
                        .job(&job_id)
                        .await?
                        .is_none_or(|r| matches!(r.state, JobState::Completed | JobState::Failed));
                    if finished {
                        self.pending.cancel(&job_id);
                        return self
                            .recorded_outcome(store, &execution.id, step.position)
                            .await?
                            .ok_or(RunnerError::ActionLost { job_id });
                    }
                }
            }
        }
    }

    async fn recorded_outcome(
        &self,
        store: &dyn ExecutionStore,
        execution_id: &str,
        position: u32,
    ) -> Result<Option<ActionOutcome>, RunnerError> {
        Ok(store
            .get_steps(execution_id)
            .await?
            .iter()
            .find(|s| s.position == position)
            .map(ActionOutcome::from_step))
    }

    /// Call the connector in this task with the action retry policy.
    async fn dispatch_inline(
        &self,
        flow: &Flow,
        execution: &Execution,
        step: &Step,
        input: Value,
        store: &dyn ExecutionStore,
    ) -> Result<ActionOutcome, RunnerError> {
        let policy = &self.config.action_retry;
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 0;

        let result = loop {
            attempt += 1;
            match self
                .invoker
                .invoke(flow, step, &execution.id, execution.test_run, input.clone())
                .await
            {
                Ok(output) => break Ok(output),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    tracing::debug!(
                        execution_id = %execution.id,
                        position = step.position,
                        attempt,
                        error = %e,
                        "inline action attempt failed"
                    );
                    tokio::time::sleep(policy.delay_after(attempt)).await;
                }
                Err(e) => break Err(e),
            }
        };

        let record = match result {
            Ok(output) => ExecutionStep::success(&execution.id, step, input, output, attempt),
            Err(e) => ExecutionStep::failure(
                &execution.id,
                step,
                input,
                StepErrorPayload::from(&e),
                attempt,
            ),
        };
        store.append_step(&record).await?;
        Ok(ActionOutcome::from_step(&record))
    }

    /// Enqueue the owner notification. Once per execution, never for test
    /// runs, and not once the flow or the execution was deleted.
    async fn notify_failure(&self, execution: &Execution) {
        if execution.test_run {
            return;
        }
        match self.still_exists(execution).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(
                    flow_id = %execution.flow_id,
                    execution_id = %execution.id,
                    "flow or execution deleted, notification skipped"
                );
                return;
            }
            // The email handler checks again before sending.
            Err(e) => tracing::warn!(execution_id = %execution.id, error = %e, "existence check failed"),
        }
        let email = EmailJob {
            flow_id: execution.flow_id.clone(),
            execution_id: execution.id.clone(),
        };
        let payload = match email.to_payload() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(execution_id = %execution.id, error = %e, "email job not built");
                return;
            }
        };
        let job = NewJob::new(payload)
            .id(email.job_id())
            .retry(RetryPolicy::default());
        if let Err(e) = self.queue.enqueue(QueueName::Email, job).await {
            tracing::error!(execution_id = %execution.id, error = %e, "email job not enqueued");
        }
    }
}

impl FlowRunner {
    async fn still_exists(&self, execution: &Execution) -> Result<bool, StoreError> {
        if self.flows.get_flow(&execution.flow_id).await?.is_none() {
            return Ok(false);
        }
        Ok(self.executions.get_execution(&execution.id).await?.is_some())
    }
}

/// Consumes the flow queue.
pub(crate) struct FlowJobHandler {
    runner: Arc<FlowRunner>,
}

impl FlowJobHandler {
    pub(crate) fn new(runner: Arc<FlowRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl JobHandler for FlowJobHandler {
    async fn handle(&self, job: &Job) -> Result<(), JobFailure> {
        let run = FlowRunJob::from_payload(&job.payload).map_err(JobFailure::fatal)?;
        match self.runner.run_job(&run).await {
            Ok(_) => Ok(()),
            Err(e) => Err(JobFailure::fatal(e)),
        }
    }
}
