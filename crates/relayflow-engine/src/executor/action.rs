//! Action job handler: runs one connector action and persists its step.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::connector::ConnectorRegistry;
use crate::connector::ctx::ContextFactory;
use crate::errors::StoreError;
use crate::queue::{JobFailure, JobHandler};
use crate::traits::{ExecutionStore, FlowStore, Job};
use crate::types::{
    ActionJob, ConnectorError, ExecutionStatus, ExecutionStep, Flow, QueueJob, Step,
    StepErrorKind, StepErrorPayload,
};

use super::pending::{ActionOutcome, PendingActions};

/// Calls an action connector with its context and the configured timeout.
pub(crate) struct ActionInvoker {
    registry: ConnectorRegistry,
    contexts: ContextFactory,
    timeout: Duration,
}

impl ActionInvoker {
    pub(crate) fn new(registry: ConnectorRegistry, contexts: ContextFactory, timeout: Duration) -> Self {
        Self {
            registry,
            contexts,
            timeout,
        }
    }

    /// One attempt. Test runs prefer the action's `test_run` when declared.
    pub(crate) async fn invoke(
        &self,
        flow: &Flow,
        step: &Step,
        execution_id: &str,
        test_run: bool,
        input: Value,
    ) -> Result<Value, ConnectorError> {
        let action = self
            .registry
            .action(&step.app_key, &step.operation_key)
            .ok_or_else(|| {
                ConnectorError::unsupported(format!(
                    "unknown action {}.{}",
                    step.app_key, step.operation_key
                ))
            })?;
        let ctx = self
            .contexts
            .for_step(flow, step)
            .await?
            .execution_id(execution_id)
            .test_run(test_run)
            .parameters(input.clone())
            .build();

        let call = async {
            if test_run {
                if let Some(result) = action.test_run(&ctx, input.clone()).await {
                    return result;
                }
            }
            action.run(&ctx, input).await
        };

        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ConnectorError::Timeout {
                elapsed_ms: self.timeout.as_millis() as u64,
            }),
        }
    }
}

/// Consumes the action queue.
///
/// Transient failures with attempts left go back to the queue. Anything
/// else ends as a persisted step; the waiting flow run is told only after
/// the write.
pub(crate) struct ActionJobHandler {
    flows: Arc<dyn FlowStore>,
    executions: Arc<dyn ExecutionStore>,
    invoker: Arc<ActionInvoker>,
    pending: PendingActions,
}

impl ActionJobHandler {
    pub(crate) fn new(
        flows: Arc<dyn FlowStore>,
        executions: Arc<dyn ExecutionStore>,
        invoker: Arc<ActionInvoker>,
        pending: PendingActions,
    ) -> Self {
        Self {
            flows,
            executions,
            invoker,
            pending,
        }
    }

    /// The flow and step of `action`, or `None` when there is nothing left
    /// to run for: the flow was deleted, or the execution is gone or no
    /// longer running (interrupted by a restart).
    async fn locate(&self, action: &ActionJob) -> Result<Option<(Flow, Step)>, JobFailure> {
        let mut flow_id = action.flow_id.clone();
        // Test-run executions live in a scratch store.
        if !action.test_run {
            let execution = self
                .executions
                .get_execution(&action.execution_id)
                .await
                .map_err(JobFailure::retryable)?;
            match execution {
                None => {
                    tracing::info!(execution_id = %action.execution_id, "execution gone, action skipped");
                    return Ok(None);
                }
                Some(execution) if execution.status != ExecutionStatus::Running => {
                    tracing::info!(
                        execution_id = %action.execution_id,
                        status = %execution.status,
                        "execution no longer running, action skipped"
                    );
                    return Ok(None);
                }
                Some(execution) => {
                    if flow_id.is_empty() {
                        flow_id = execution.flow_id;
                    }
                }
            }
        }
        let Some(flow) = self
            .flows
            .get_flow(&flow_id)
            .await
            .map_err(JobFailure::retryable)?
        else {
            tracing::info!(flow_id = %flow_id, execution_id = %action.execution_id, "flow gone, action skipped");
            return Ok(None);
        };
        let step = flow
            .step(&action.step_id)
            .cloned()
            .ok_or_else(|| JobFailure::fatal(format!("step not found: {}", action.step_id)))?;
        Ok(Some((flow, step)))
    }

    async fn persist(&self, record: &ExecutionStep, job: &Job) -> Result<ActionOutcome, JobFailure> {
        match self.executions.append_step(record).await {
            Ok(()) => Ok(ActionOutcome::from_step(record)),
            // Redelivered after the step was already written.
            Err(StoreError::Conflict { .. }) => {
                let steps = self
                    .executions
                    .get_steps(&record.execution_id)
                    .await
                    .map_err(JobFailure::retryable)?;
                steps
                    .iter()
                    .find(|s| s.position == record.position)
                    .map(ActionOutcome::from_step)
                    .ok_or_else(|| JobFailure::fatal("step conflict without a stored step"))
            }
            Err(e) if job.has_attempts_left() => Err(JobFailure::retryable(e)),
            Err(e) => {
                let outcome = ActionOutcome::Failure(StepErrorPayload {
                    kind: StepErrorKind::Transient,
                    message: format!("failed to persist step: {e}"),
                    details: None,
                });
                self.pending.complete(&job.id, outcome);
                Err(JobFailure::fatal(e))
            }
        }
    }
}

#[async_trait]
impl JobHandler for ActionJobHandler {
    async fn handle(&self, job: &Job) -> Result<(), JobFailure> {
        let action = ActionJob::from_payload(&job.payload).map_err(JobFailure::fatal)?;
        let Some((flow, step)) = self.locate(&action).await? else {
            // Wakes a waiting runner, which then finds no recorded step.
            self.pending.cancel(&job.id);
            return Ok(());
        };

        let result = self
            .invoker
            .invoke(
                &flow,
                &step,
                &action.execution_id,
                action.test_run,
                action.input.clone(),
            )
            .await;

        let record = match result {
            Ok(output) => ExecutionStep::success(
                &action.execution_id,
                &step,
                action.input.clone(),
                output,
                job.attempts_made,
            ),
            Err(e) if e.is_retryable() && job.has_attempts_left() => {
                tracing::warn!(
                    execution_id = %action.execution_id,
                    position = step.position,
                    attempt = job.attempts_made,
                    error = %e,
                    "action attempt failed"
                );
                return Err(JobFailure::retryable(&e));
            }
            Err(e) => ExecutionStep::failure(
                &action.execution_id,
                &step,
                action.input.clone(),
                StepErrorPayload::from(&e),
                job.attempts_made,
            ),
        };

        let outcome = self.persist(&record, job).await?;
        match &outcome {
            ActionOutcome::Success(_) => tracing::info!(
                execution_id = %action.execution_id,
                position = step.position,
                operation = %format!("{}.{}", step.app_key, step.operation_key),
                attempts = job.attempts_made,
                "step succeeded"
            ),
            ActionOutcome::Failure(error) => tracing::warn!(
                execution_id = %action.execution_id,
                position = step.position,
                operation = %format!("{}.{}", step.app_key, step.operation_key),
                attempts = job.attempts_made,
                error = %error.message,
                "step failed"
            ),
        }

        let failure = match &outcome {
            ActionOutcome::Success(_) => None,
            ActionOutcome::Failure(error) => Some(JobFailure::fatal(&error.message)),
        };
        self.pending.complete(&job.id, outcome);
        match failure {
            None => Ok(()),
            Some(failure) => Err(failure),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::defaults::InMemoryStore;
    use crate::test_support::{MockApp, ScriptedAction};
    use crate::types::{Execution, QueueName, StepStatus};
    use serde_json::json;

    struct Fixture {
        store: Arc<InMemoryStore>,
        handler: ActionJobHandler,
        pending: PendingActions,
        action: Arc<ScriptedAction>,
        flow: Flow,
        execution: Execution,
    }

    async fn fixture(timeout: Duration) -> Fixture {
        let action = Arc::new(ScriptedAction::new("send"));
        let registry = ConnectorRegistry::new();
        registry.register(Arc::new(
            MockApp::new("mock").with_action(action.clone()),
        ));
        let store = Arc::new(InMemoryStore::new());
        let flow = Flow::new(
            "f",
            vec![
                Step::trigger("mock", "new_row"),
                Step::action("mock", "send").param("to", json!("{{step1.email}}")),
            ],
        )
        .unwrap();
        store.put_flow(&flow).await.unwrap();
        let execution = Execution::new(&flow.id, "k", false);
        store.create_execution(&execution).await.unwrap();

        let contexts = ContextFactory::new(
            registry.clone(),
            store.clone(),
            reqwest::Client::new(),
            Arc::new(EngineConfig::default()),
        );
        let invoker = Arc::new(ActionInvoker::new(registry, contexts, timeout));
        let pending = PendingActions::default();
        let handler = ActionJobHandler::new(store.clone(), store.clone(), invoker, pending.clone());
        Fixture {
            store,
            handler,
            pending,
            action,
            flow,
            execution,
        }
    }

    fn job(fx: &Fixture, attempts_made: u32, max_attempts: u32) -> Job {
        let step = &fx.flow.steps[1];
        let action = ActionJob {
            execution_id: fx.execution.id.clone(),
            step_id: step.id.clone(),
            connector_key: "mock".into(),
            operation_key: "send".into(),
            input: json!({"to": "a@b.com"}),
            flow_id: fx.flow.id.clone(),
            position: 2,
            test_run: false,
        };
        Job {
            id: action.job_id(),
            queue: QueueName::Action,
            payload: action.to_payload().unwrap(),
            attempts_made,
            max_attempts,
        }
    }

    #[tokio::test]
    async fn success_persists_and_notifies() {
        let fx = fixture(Duration::from_secs(5)).await;
        fx.action.push(Ok(json!({"sent": true})));
        let job = job(&fx, 1, 3);
        let rx = fx.pending.register(&job.id);

        fx.handler.handle(&job).await.unwrap();

        assert_eq!(rx.await.unwrap(), ActionOutcome::Success(json!({"sent": true})));
        let steps = fx.store.get_steps(&fx.execution.id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].status, StepStatus::Success);
        assert_eq!(steps[0].data_in, json!({"to": "a@b.com"}));
        assert_eq!(fx.action.calls(), vec![json!({"to": "a@b.com"})]);
    }

    #[tokio::test]
    async fn transient_with_attempts_left_goes_back_to_queue() {
        let fx = fixture(Duration::from_secs(5)).await;
        fx.action.push(Err(ConnectorError::transient("503")));
        let err = fx.handler.handle(&job(&fx, 1, 3)).await.unwrap_err();
        assert!(err.retryable);
        assert!(fx.store.get_steps(&fx.execution.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn transient_on_last_attempt_is_recorded() {
        let fx = fixture(Duration::from_secs(5)).await;
        fx.action.push(Err(ConnectorError::transient("503")));
        let err = fx.handler.handle(&job(&fx, 3, 3)).await.unwrap_err();
        assert!(!err.retryable);
        let steps = fx.store.get_steps(&fx.execution.id).await.unwrap();
        assert_eq!(steps[0].status, StepStatus::Failure);
        assert_eq!(steps[0].attempts, 3);
        assert_eq!(steps[0].error.as_ref().unwrap().kind, StepErrorKind::Transient);
    }

    #[tokio::test]
    async fn semantic_is_never_retried() {
        let fx = fixture(Duration::from_secs(5)).await;
        fx.action
            .push(Err(ConnectorError::semantic_with("invalid_auth", json!({"status": 401}))));
        let err = fx.handler.handle(&job(&fx, 1, 3)).await.unwrap_err();
        assert!(!err.retryable);
        let steps = fx.store.get_steps(&fx.execution.id).await.unwrap();
        let error = steps[0].error.as_ref().unwrap();
        assert_eq!(error.kind, StepErrorKind::Semantic);
        assert_eq!(error.details, Some(json!({"status": 401})));
        assert_eq!(steps[0].attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_action_times_out() {
        let fx = fixture(Duration::from_millis(50)).await;
        fx.action.delay(Duration::from_secs(10));
        let err = fx.handler.handle(&job(&fx, 1, 3)).await.unwrap_err();
        // Timeouts are transient.
        assert!(err.retryable);
        assert!(err.message.contains("timeout after 50ms"));
    }

    #[tokio::test]
    async fn redelivery_reuses_stored_step() {
        let fx = fixture(Duration::from_secs(5)).await;
        fx.action.push(Ok(json!("first")));
        fx.action.push(Ok(json!("second")));
        let job = job(&fx, 1, 3);
        fx.handler.handle(&job).await.unwrap();

        let rx = fx.pending.register(&job.id);
        fx.handler.handle(&job).await.unwrap();
        assert_eq!(rx.await.unwrap(), ActionOutcome::Success(json!("first")));
        assert_eq!(fx.store.get_steps(&fx.execution.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn finished_or_deleted_executions_are_skipped() {
        let fx = fixture(Duration::from_secs(5)).await;
        fx.store
            .complete_execution(&fx.execution.id, ExecutionStatus::Interrupted)
            .await
            .unwrap();
        let job = job(&fx, 1, 3);
        let rx = fx.pending.register(&job.id);
        fx.handler.handle(&job).await.unwrap();
        assert!(rx.await.is_err());
        assert!(fx.action.calls().is_empty());
        assert!(fx.store.get_steps(&fx.execution.id).await.unwrap().is_empty());

        let fx = fixture(Duration::from_secs(5)).await;
        fx.store.delete_flow(&fx.flow.id).await.unwrap();
        fx.store.delete_for_flow(&fx.flow.id).await.unwrap();
        fx.handler.handle(&self::job(&fx, 1, 3)).await.unwrap();
        assert!(fx.action.calls().is_empty());
    }
}
