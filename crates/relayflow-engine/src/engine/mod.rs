//! Engine facade: the single entry point of the flow engine.
//!
//! The [`Engine`] owns the connector catalog, the stores, the job queue and
//! one worker pool per queue. Construct via [`Engine::builder()`], then call
//! [`start`](Engine::start) to begin consuming jobs.
//!
//! ```rust,ignore
//! let engine = Engine::builder()
//!     .store(InMemoryStore::new())
//!     .reference_apps()
//!     .config(EngineConfig::from_env()?)
//!     .build()
//!     .await?;
//! engine.start().await;
//!
//! let flow = engine.create_flow("Rows to Slack", steps).await?;
//! engine.activate_flow(&flow.id).await?;
//! engine.receive_webhook(&flow.id, WebhookRequest::new(body)).await?;
//! ```

mod builder;
pub mod error;

pub use builder::EngineBuilder;
pub use error::EngineError;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::connector::ctx::ContextFactory;
use crate::connector::{AppMeta, ConnectorRegistry, TriggerDef, WebhookRequest};
use crate::errors::{FlowValidationError, StoreError};
use crate::executor::{FlowRunner, RunnerError, TestRunReport};
use crate::queue::{JobHandler, WorkerPool};
use crate::request::AuthContext;
use crate::traits::{
    ExecutionFilter, ExecutionPage, ExecutionStore, FlowFilter, FlowPage, FlowStore, JobCounts,
    JobQueue, JobRecord, JobState, NewJob,
};
use crate::triggers::lifecycle::TriggerLifecycle;
use crate::triggers::webhook::WebhookIngress;
use crate::triggers::{FlowLocks, WebhookReceipt, poll_job_id, trigger_context};
use crate::types::*;
use crate::validate::validate_flow;

/// The assembled flow engine.
///
/// Every method takes `&self`; share the engine behind an `Arc`.
pub struct Engine {
    pub(super) registry: ConnectorRegistry,
    pub(super) config: Arc<EngineConfig>,
    pub(super) flows: Arc<dyn FlowStore>,
    pub(super) executions: Arc<dyn ExecutionStore>,
    pub(super) queue: Arc<dyn JobQueue>,
    pub(super) contexts: ContextFactory,
    pub(super) locks: FlowLocks,
    pub(super) runner: Arc<FlowRunner>,
    pub(super) lifecycle: Arc<TriggerLifecycle>,
    pub(super) ingress: WebhookIngress,
    pub(super) handlers: Vec<(QueueName, Arc<dyn JobHandler>)>,
    pub(super) shutdown_tx: broadcast::Sender<()>,
    /// Worker pool loops, one per queue while started.
    pub(super) workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Create a new [`EngineBuilder`].
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn registry(&self) -> &ConnectorRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Spawn one worker pool per queue. No-op if already started.
    pub async fn start(&self) {
        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            return;
        }
        for (queue_name, handler) in &self.handlers {
            workers.push(WorkerPool::spawn(
                Arc::clone(&self.queue),
                *queue_name,
                self.config.queue(*queue_name).concurrency,
                Arc::clone(handler),
                self.shutdown_tx.subscribe(),
            ));
        }
        tracing::info!(apps = self.registry.len(), "engine started");
    }

    /// Stop reserving new jobs. Jobs already handed to a handler run to
    /// completion on their own tasks.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        let handles = std::mem::take(&mut *self.workers.lock().await);
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!("engine stopped");
    }

    /// Mark executions left running by a previous process as interrupted
    /// and reschedule polls whose job did not survive.
    pub(super) async fn recover(&self) {
        let filter = ExecutionFilter {
            status: Some(ExecutionStatus::Running),
            ..Default::default()
        };
        match self.executions.list_executions(&filter).await {
            Ok(page) if !page.executions.is_empty() => {
                tracing::warn!(
                    count = page.executions.len(),
                    "marking interrupted executions from previous session"
                );
                for execution in &page.executions {
                    if let Err(e) = self
                        .executions
                        .complete_execution(&execution.id, ExecutionStatus::Interrupted)
                        .await
                    {
                        tracing::error!(
                            execution_id = %execution.id,
                            error = %e,
                            "failed to mark interrupted execution"
                        );
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "crash recovery scan failed"),
            _ => {}
        }

        if let Err(e) = self.resume_polls().await {
            tracing::warn!(error = %e, "poll recovery failed");
        }
    }

    async fn resume_polls(&self) -> Result<(), EngineError> {
        let filter = FlowFilter {
            limit: Some(usize::MAX),
            ..Default::default()
        };
        for flow in self.flows.list_flows(&filter).await?.flows {
            if !flow.active || flow.trigger_state != TriggerState::Active {
                continue;
            }
            let polling = flow.trigger_step().is_some_and(|step| {
                matches!(
                    self.registry.trigger(&step.app_key, &step.operation_key),
                    Some(TriggerDef::Polling(_))
                )
            });
            if !polling {
                continue;
            }

            let data = self.flows.get_trigger_data(&flow.id).await?;
            if let Some(job_id) = &data.scheduled_job_id {
                let alive = self.queue.job(job_id).await?.is_some_and(|r| {
                    !matches!(r.state, JobState::Completed | JobState::Failed)
                });
                if alive {
                    continue;
                }
            }

            let job_id = poll_job_id(&flow.id);
            if self
                .flows
                .advance_cursor(
                    &flow.id,
                    data.scheduled_job_id.as_deref(),
                    None,
                    Some(job_id.clone()),
                )
                .await?
            {
                let payload = TriggerPollJob {
                    flow_id: flow.id.clone(),
                }
                .to_payload()?;
                self.queue
                    .enqueue(QueueName::Trigger, NewJob::new(payload).id(job_id.clone()))
                    .await?;
                tracing::info!(flow_id = %flow.id, job_id = %job_id, "poll rescheduled");
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Flows
    // -----------------------------------------------------------------------

    /// Create an inactive flow. Steps are numbered in order and checked
    /// against the registered connectors.
    pub async fn create_flow(&self, name: &str, steps: Vec<Step>) -> Result<Flow, EngineError> {
        let flow = Flow::new(name, steps)?;
        validate_flow(&flow, &self.registry).map_err(|errors| FlowValidationError { errors })?;
        self.flows.put_flow(&flow).await?;
        tracing::info!(flow_id = %flow.id, steps = flow.steps.len(), "flow created");
        Ok(flow)
    }

    pub async fn get_flow(&self, flow_id: &str) -> Result<Flow, EngineError> {
        self.flows
            .get_flow(flow_id)
            .await?
            .ok_or_else(|| EngineError::FlowNotFound {
                flow_id: flow_id.to_string(),
            })
    }

    pub async fn list_flows(&self, filter: &FlowFilter) -> Result<FlowPage, EngineError> {
        Ok(self.flows.list_flows(filter).await?)
    }

    /// Deactivate a flow and delete it with its execution history.
    /// Returns the number of executions removed.
    pub async fn delete_flow(&self, flow_id: &str) -> Result<usize, EngineError> {
        self.get_flow(flow_id).await?;
        self.lifecycle.deactivate(flow_id).await?;
        let removed = self.executions.delete_for_flow(flow_id).await?;
        self.flows.delete_flow(flow_id).await?;
        self.locks.forget(flow_id);
        tracing::info!(flow_id, executions = removed, "flow deleted");
        Ok(removed)
    }

    /// Register the flow's trigger. On error the flow stays inactive.
    pub async fn activate_flow(&self, flow_id: &str) -> Result<Flow, EngineError> {
        Ok(self.lifecycle.activate(flow_id).await?)
    }

    /// Unregister the flow's trigger. Executions already queued still run.
    pub async fn deactivate_flow(&self, flow_id: &str) -> Result<Flow, EngineError> {
        Ok(self.lifecycle.deactivate(flow_id).await?)
    }

    /// Cursor, scheduled poll and hook data of a flow.
    pub async fn trigger_data(&self, flow_id: &str) -> Result<TriggerData, EngineError> {
        Ok(self.flows.get_trigger_data(flow_id).await?)
    }

    pub async fn export_flow(&self, flow_id: &str) -> Result<FlowBundle, EngineError> {
        let flow = self.get_flow(flow_id).await?;
        Ok(FlowBundle {
            schema_version: FLOW_BUNDLE_SCHEMA_VERSION,
            flow,
            exported_at: Utc::now(),
        })
    }

    /// Create a new inactive flow from an exported bundle, with fresh ids.
    pub async fn import_flow(&self, bundle: FlowBundle) -> Result<Flow, EngineError> {
        if bundle.schema_version > FLOW_BUNDLE_SCHEMA_VERSION {
            return Err(EngineError::BundleVersion {
                version: bundle.schema_version,
            });
        }
        let flow = bundle.flow.duplicate();
        validate_flow(&flow, &self.registry).map_err(|errors| FlowValidationError { errors })?;
        self.flows.put_flow(&flow).await?;
        tracing::info!(flow_id = %flow.id, source_flow_id = %bundle.flow.id, "flow imported");
        Ok(flow)
    }

    // -----------------------------------------------------------------------
    // Triggers and runs
    // -----------------------------------------------------------------------

    /// Accept an inbound webhook delivery for `flow_id`.
    pub async fn receive_webhook(
        &self,
        flow_id: &str,
        request: WebhookRequest,
    ) -> Result<WebhookReceipt, EngineError> {
        Ok(self.ingress.receive(flow_id, request).await?)
    }

    /// Run the flow synchronously in test mode, stopping after
    /// `until_position` when given. The trigger payload comes from the
    /// trigger's own sample, else the latest execution, else `{}`.
    pub async fn test_run(
        &self,
        flow_id: &str,
        until_position: Option<u32>,
    ) -> Result<TestRunReport, EngineError> {
        let flow = self.get_flow(flow_id).await?;
        let payload = self.sample_payload(&flow).await?;
        let job = FlowRunJob {
            flow_id: flow.id.clone(),
            payload,
            test_run: true,
            dedupe_key: format!("test:{}", uuid::Uuid::new_v4()),
        };
        let report = self.runner.test_run(&flow, &job, until_position).await?;
        tracing::info!(
            flow_id = %flow.id,
            status = %report.execution.status,
            steps = report.steps.len(),
            "test run finished"
        );
        Ok(report)
    }

    async fn sample_payload(&self, flow: &Flow) -> Result<Value, EngineError> {
        let step = flow
            .trigger_step()
            .ok_or_else(|| RunnerError::MissingTrigger {
                flow_id: flow.id.clone(),
            })?;

        if let Some(trigger) = self.registry.trigger(&step.app_key, &step.operation_key) {
            // Samples never see the poll cursor.
            let data = TriggerData {
                hook: self.flows.get_trigger_data(&flow.id).await?.hook,
                ..TriggerData::default()
            };
            let ctx = trigger_context(&self.contexts, flow, step, &data, true).await?;
            if let Some(sample) = trigger.test_run(&ctx).await? {
                return Ok(sample);
            }
        }

        let latest = self
            .executions
            .list_executions(&ExecutionFilter {
                flow_id: Some(flow.id.clone()),
                test_run: Some(false),
                limit: Some(1),
                ..Default::default()
            })
            .await?;
        if let Some(execution) = latest.executions.first() {
            let recorded = self
                .executions
                .get_steps(&execution.id)
                .await?
                .into_iter()
                .find(|s| s.position == 1)
                .and_then(|s| s.data_out);
            if let Some(payload) = recorded {
                return Ok(payload);
            }
        }
        Ok(json!({}))
    }

    // -----------------------------------------------------------------------
    // Execution history
    // -----------------------------------------------------------------------

    pub async fn execution(&self, execution_id: &str) -> Result<Execution, EngineError> {
        self.executions
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| EngineError::ExecutionNotFound {
                execution_id: execution_id.to_string(),
            })
    }

    /// Step records of an execution in position order.
    pub async fn execution_steps(
        &self,
        execution_id: &str,
    ) -> Result<Vec<ExecutionStep>, EngineError> {
        self.execution(execution_id).await?;
        Ok(self.executions.get_steps(execution_id).await?)
    }

    pub async fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<ExecutionPage, EngineError> {
        Ok(self.executions.list_executions(filter).await?)
    }

    /// Re-enqueue the original trigger payload of an execution. The new
    /// run gets its own dedupe key and so a new execution. Returns the job id.
    pub async fn retry_execution(&self, execution_id: &str) -> Result<String, EngineError> {
        let execution = self.execution(execution_id).await?;
        let payload = self
            .executions
            .get_steps(execution_id)
            .await?
            .into_iter()
            .find(|s| s.position == 1)
            .and_then(|s| s.data_out)
            .ok_or_else(|| EngineError::NothingToRetry {
                execution_id: execution_id.to_string(),
            })?;
        self.get_flow(&execution.flow_id).await?;

        let run = FlowRunJob {
            flow_id: execution.flow_id.clone(),
            payload,
            test_run: false,
            dedupe_key: format!("retry:{}:{}", execution.id, uuid::Uuid::new_v4()),
        };
        let outcome = self
            .queue
            .enqueue(
                QueueName::Flow,
                NewJob::new(run.to_payload()?).id(run.job_id()),
            )
            .await?;
        tracing::info!(
            flow_id = %execution.flow_id,
            execution_id,
            job_id = outcome.job_id(),
            "execution retry enqueued"
        );
        Ok(outcome.job_id().to_string())
    }

    // -----------------------------------------------------------------------
    // Connections and apps
    // -----------------------------------------------------------------------

    /// Store credentials for a registered app. Unverified until
    /// [`verify_connection`](Self::verify_connection) succeeds.
    pub async fn create_connection(
        &self,
        app_key: &str,
        data: BTreeMap<String, Value>,
    ) -> Result<Connection, EngineError> {
        if self.registry.app(app_key).is_none() {
            return Err(EngineError::UnknownApp {
                app_key: app_key.to_string(),
            });
        }
        let connection = Connection::new(app_key, data);
        self.flows.put_connection(&connection).await?;
        tracing::info!(connection_id = %connection.id, app_key, "connection created");
        Ok(connection)
    }

    /// Run the app's credential check. Credentials the app updated are
    /// stored either way; `verified` reflects the outcome.
    pub async fn verify_connection(&self, connection_id: &str) -> Result<Connection, EngineError> {
        let mut connection = self.connection(connection_id).await?;
        let app = self
            .registry
            .app(&connection.app_key)
            .ok_or_else(|| EngineError::UnknownApp {
                app_key: connection.app_key.clone(),
            })?;

        let auth = AuthContext::new(connection.data.clone());
        let ctx = self
            .contexts
            .for_app(&connection.app_key, auth.clone())
            .into_builder("", "")
            .build();
        let result = app.verify_credentials(&ctx).await;

        connection.data = auth.snapshot();
        connection.verified = result.is_ok();
        self.flows.put_connection(&connection).await?;
        match result {
            Ok(()) => {
                tracing::info!(connection_id, "connection verified");
                Ok(connection)
            }
            Err(e) => {
                tracing::warn!(connection_id, error = %e, "connection verification failed");
                Err(e.into())
            }
        }
    }

    async fn connection(&self, connection_id: &str) -> Result<Connection, EngineError> {
        match self.flows.get_connection(connection_id).await {
            Ok(Some(connection)) => Ok(connection),
            Ok(None) | Err(StoreError::NotFound { .. }) => Err(EngineError::ConnectionNotFound {
                connection_id: connection_id.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Metadata of every registered app with URL placeholders filled in.
    pub fn apps(&self) -> Vec<AppMeta> {
        self.registry
            .apps()
            .iter()
            .map(|meta| meta.resolved(&self.config.webhook_base_url, &self.config.docs_url))
            .collect()
    }

    /// Run a dynamic-data resolver (editor dropdowns), optionally with a
    /// connection's credentials.
    pub async fn dynamic_data(
        &self,
        app_key: &str,
        key: &str,
        connection_id: Option<&str>,
    ) -> Result<Value, EngineError> {
        let handler = self.registry.dynamic_data(app_key, key).ok_or_else(|| {
            EngineError::UnknownDynamicData {
                app_key: app_key.to_string(),
                key: key.to_string(),
            }
        })?;
        let auth = match connection_id {
            Some(id) => AuthContext::new(self.connection(id).await?.data),
            None => AuthContext::default(),
        };
        let ctx = self
            .contexts
            .for_app(app_key, auth)
            .into_builder("", "")
            .build();
        Ok(handler.run(&ctx).await?)
    }

    // -----------------------------------------------------------------------
    // Queue inspection
    // -----------------------------------------------------------------------

    pub async fn queue_counts(&self, queue: QueueName) -> Result<JobCounts, EngineError> {
        Ok(self.queue.counts(queue).await?)
    }

    pub async fn job(&self, job_id: &str) -> Result<Option<JobRecord>, EngineError> {
        Ok(self.queue.job(job_id).await?)
    }
}
