//! Trigger queue handler: one poll of one flow's polling trigger.
//!
//! Each poll job owns the flow's cursor for its run. Items are enqueued as
//! flow-run jobs first; only then are the cursor and the next poll stored,
//! and only while the flow is still active and the job is still its
//! scheduled poll.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::EngineConfig;
use crate::connector::ctx::ContextFactory;
use crate::connector::{ConnectorRegistry, PollResult, TriggerDef};
use crate::queue::{JobFailure, JobHandler};
use crate::traits::{FlowStore, Job, JobQueue, NewJob};
use crate::types::{
    ConnectorError, FlowRunJob, QueueJob, QueueName, TriggerPollJob, TriggerState,
};

use super::{FlowLocks, payload_dedupe_key, poll_job_id, trigger_context};

pub(crate) struct PollJobHandler {
    flows: Arc<dyn FlowStore>,
    queue: Arc<dyn JobQueue>,
    registry: ConnectorRegistry,
    contexts: ContextFactory,
    config: Arc<EngineConfig>,
    locks: FlowLocks,
}

impl PollJobHandler {
    pub(crate) fn new(
        flows: Arc<dyn FlowStore>,
        queue: Arc<dyn JobQueue>,
        registry: ConnectorRegistry,
        contexts: ContextFactory,
        config: Arc<EngineConfig>,
        locks: FlowLocks,
    ) -> Self {
        Self {
            flows,
            queue,
            registry,
            contexts,
            config,
            locks,
        }
    }

    /// Store `cursor` and the next poll, then enqueue that poll. Writes
    /// nothing once the flow is deactivated or `owner` is no longer its
    /// scheduled poll. Runs under the flow lock so activation and
    /// deactivation see either none or all of it.
    async fn schedule_next(
        &self,
        flow_id: &str,
        owner: &str,
        cursor: Option<String>,
    ) -> Result<(), JobFailure> {
        let _guard = self.locks.lock(flow_id).await;
        let next_id = poll_job_id(flow_id);
        let advanced = self
            .flows
            .advance_cursor(flow_id, Some(owner), cursor, Some(next_id.clone()))
            .await
            .map_err(JobFailure::fatal)?;
        if !advanced {
            tracing::info!(flow_id, job_id = %owner, "poll no longer owns the flow, cursor not advanced");
            return Ok(());
        }

        let payload = TriggerPollJob {
            flow_id: flow_id.to_string(),
        }
        .to_payload()
        .map_err(JobFailure::fatal)?;
        self.queue
            .enqueue(
                QueueName::Trigger,
                NewJob::new(payload)
                    .id(next_id.clone())
                    .delay(self.config.poll_interval()),
            )
            .await
            .map_err(JobFailure::fatal)?;
        tracing::debug!(flow_id, job_id = %next_id, "next poll scheduled");
        Ok(())
    }

    async fn enqueue_items(&self, flow_id: &str, poll: &PollResult) -> Result<(), JobFailure> {
        for item in &poll.items {
            let run = FlowRunJob {
                flow_id: flow_id.to_string(),
                payload: item.payload.clone(),
                test_run: false,
                dedupe_key: item
                    .dedupe_key
                    .clone()
                    .unwrap_or_else(|| payload_dedupe_key(&item.payload)),
            };
            let job = NewJob::new(run.to_payload().map_err(JobFailure::fatal)?).id(run.job_id());
            self.queue
                .enqueue(QueueName::Flow, job)
                .await
                .map_err(JobFailure::fatal)?;
        }
        Ok(())
    }
}

#[async_trait]
impl JobHandler for PollJobHandler {
    async fn handle(&self, job: &Job) -> Result<(), JobFailure> {
        let poll = TriggerPollJob::from_payload(&job.payload).map_err(JobFailure::fatal)?;

        // Wait out an activation or deactivation in progress.
        let (flow, data) = {
            let _guard = self.locks.lock(&poll.flow_id).await;
            let flow = self
                .flows
                .get_flow(&poll.flow_id)
                .await
                .map_err(JobFailure::fatal)?;
            let data = self
                .flows
                .get_trigger_data(&poll.flow_id)
                .await
                .map_err(JobFailure::fatal)?;
            (flow, data)
        };

        let Some(flow) = flow else {
            tracing::info!(flow_id = %poll.flow_id, "flow gone, poll dropped");
            return Ok(());
        };
        if !flow.active || flow.trigger_state != TriggerState::Active {
            tracing::debug!(flow_id = %flow.id, "flow inactive, poll dropped");
            return Ok(());
        }
        if data.scheduled_job_id.as_deref() != Some(job.id.as_str()) {
            tracing::info!(flow_id = %flow.id, job_id = %job.id, "stale poll job dropped");
            return Ok(());
        }

        let step = flow
            .trigger_step()
            .ok_or_else(|| JobFailure::fatal(format!("flow {} has no trigger step", flow.id)))?;
        let Some(TriggerDef::Polling(trigger)) =
            self.registry.trigger(&step.app_key, &step.operation_key)
        else {
            return Err(JobFailure::fatal(format!(
                "{}.{} is not a polling trigger",
                step.app_key, step.operation_key
            )));
        };

        let timeout = self.config.action_timeout();
        let result = match trigger_context(&self.contexts, &flow, step, &data, false).await {
            Ok(ctx) => match tokio::time::timeout(timeout, trigger.run(&ctx)).await {
                Ok(result) => result,
                Err(_) => Err(ConnectorError::Timeout {
                    elapsed_ms: timeout.as_millis() as u64,
                }),
            },
            Err(e) => Err(e),
        };

        let poll_result = match result {
            Ok(poll_result) => poll_result,
            Err(e) => {
                tracing::warn!(flow_id = %flow.id, error = %e, "poll failed");
                self.schedule_next(&flow.id, &job.id, None).await?;
                return Err(JobFailure::fatal(e));
            }
        };

        if let Err(failure) = self.enqueue_items(&flow.id, &poll_result).await {
            // Keep the old cursor; the next poll fetches the same items and
            // the dedupe key absorbs the ones already enqueued.
            tracing::warn!(flow_id = %flow.id, error = %failure.message, "enqueue failed");
            self.schedule_next(&flow.id, &job.id, None).await?;
            return Err(failure);
        }
        tracing::info!(
            flow_id = %flow.id,
            items = poll_result.items.len(),
            cursor = ?poll_result.next_cursor,
            "poll finished"
        );
        self.schedule_next(&flow.id, &job.id, poll_result.next_cursor).await
    }
}
