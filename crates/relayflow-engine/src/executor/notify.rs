//! Email queue handler: turns a failed execution into a failure notice.

use std::sync::Arc;

use async_trait::async_trait;

use crate::queue::{JobFailure, JobHandler};
use crate::traits::{ExecutionStore, FailureNotice, FlowStore, Job, Notifier};
use crate::types::{EmailJob, QueueJob};

pub(crate) struct EmailJobHandler {
    flows: Arc<dyn FlowStore>,
    executions: Arc<dyn ExecutionStore>,
    notifier: Arc<dyn Notifier>,
}

impl EmailJobHandler {
    pub(crate) fn new(
        flows: Arc<dyn FlowStore>,
        executions: Arc<dyn ExecutionStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            flows,
            executions,
            notifier,
        }
    }
}

#[async_trait]
impl JobHandler for EmailJobHandler {
    async fn handle(&self, job: &Job) -> Result<(), JobFailure> {
        let email = EmailJob::from_payload(&job.payload).map_err(JobFailure::fatal)?;

        let Some(execution) = self
            .executions
            .get_execution(&email.execution_id)
            .await
            .map_err(JobFailure::retryable)?
        else {
            tracing::info!(execution_id = %email.execution_id, "execution gone, notification dropped");
            return Ok(());
        };
        let Some(flow) = self
            .flows
            .get_flow(&email.flow_id)
            .await
            .map_err(JobFailure::retryable)?
        else {
            tracing::info!(flow_id = %email.flow_id, "flow gone, notification dropped");
            return Ok(());
        };

        let steps = self
            .executions
            .get_steps(&execution.id)
            .await
            .map_err(JobFailure::retryable)?;
        let failed = steps.iter().find(|s| !s.is_success());

        let notice = FailureNotice {
            flow_id: flow.id.clone(),
            flow_name: flow.name.clone(),
            execution_id: execution.id.clone(),
            failed_position: failed.map(|s| s.position),
            error: failed.and_then(|s| s.error.clone()),
        };
        self.notifier
            .notify(&notice)
            .await
            .map_err(JobFailure::retryable)?;
        tracing::info!(
            flow_id = %flow.id,
            execution_id = %execution.id,
            "failure notification sent"
        );
        Ok(())
    }
}
