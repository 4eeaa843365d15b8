//! Webhook ingestion.
//!
//! A delivery for an active webhook flow becomes one flow-run job. The job
//! id embeds the dedupe key, so a replay collapses onto the queued job and,
//! once that job ran, onto the stored execution.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::connector::{ConnectorRegistry, TriggerDef, WebhookRequest};
use crate::errors::{QueueError, StoreError};
use crate::traits::{FlowStore, JobQueue, NewJob};
use crate::types::{FlowRunJob, QueueJob, QueueName};

/// Outcome of an accepted delivery.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct WebhookReceipt {
    pub flow_id: String,
    pub dedupe_key: String,
    pub job_id: String,
    /// The same event is already queued.
    pub duplicate: bool,
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WebhookError {
    #[error("flow not found: {flow_id}")]
    FlowNotFound { flow_id: String },
    #[error("flow {flow_id} is not active")]
    Inactive { flow_id: String },
    #[error("flow {flow_id} is not triggered by a webhook")]
    NotWebhook { flow_id: String },
    #[error("webhook store error: {0}")]
    Store(#[from] StoreError),
    #[error("webhook queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Hex SHA-256 of the canonical JSON of `payload`. Object keys serialize
/// in sorted order, so equal payloads hash equally.
pub fn payload_dedupe_key(payload: &Value) -> String {
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

pub(crate) struct WebhookIngress {
    flows: Arc<dyn FlowStore>,
    queue: Arc<dyn JobQueue>,
    registry: ConnectorRegistry,
}

impl WebhookIngress {
    pub(crate) fn new(
        flows: Arc<dyn FlowStore>,
        queue: Arc<dyn JobQueue>,
        registry: ConnectorRegistry,
    ) -> Self {
        Self {
            flows,
            queue,
            registry,
        }
    }

    pub(crate) async fn receive(
        &self,
        flow_id: &str,
        request: WebhookRequest,
    ) -> Result<WebhookReceipt, WebhookError> {
        let flow = self
            .flows
            .get_flow(flow_id)
            .await?
            .ok_or_else(|| WebhookError::FlowNotFound {
                flow_id: flow_id.to_string(),
            })?;
        if !flow.active {
            tracing::info!(flow_id, "webhook rejected, flow inactive");
            return Err(WebhookError::Inactive {
                flow_id: flow_id.to_string(),
            });
        }
        let trigger = flow
            .trigger_step()
            .and_then(|step| self.registry.trigger(&step.app_key, &step.operation_key));
        let Some(TriggerDef::Webhook(trigger)) = trigger else {
            tracing::info!(flow_id, "webhook rejected, not a webhook flow");
            return Err(WebhookError::NotWebhook {
                flow_id: flow_id.to_string(),
            });
        };

        let dedupe_key = trigger
            .dedupe_key(&request)
            .unwrap_or_else(|| payload_dedupe_key(&request.body));
        let run = FlowRunJob {
            flow_id: flow.id.clone(),
            payload: request.body,
            test_run: false,
            dedupe_key,
        };
        let outcome = self
            .queue
            .enqueue(
                QueueName::Flow,
                NewJob::new(run.to_payload()?).id(run.job_id()),
            )
            .await?;

        tracing::info!(
            flow_id,
            job_id = outcome.job_id(),
            duplicate = outcome.is_duplicate(),
            "webhook accepted"
        );
        Ok(WebhookReceipt {
            flow_id: flow.id,
            job_id: outcome.job_id().to_string(),
            duplicate: outcome.is_duplicate(),
            dedupe_key: run.dedupe_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defaults::{InMemoryQueue, InMemoryStore};
    use crate::test_support::{MockApp, MockPoller, MockWebhook};
    use crate::types::{Flow, Step, TriggerState};
    use serde_json::json;

    async fn setup(trigger: &str, active: bool) -> (WebhookIngress, Arc<InMemoryQueue>, Flow) {
        let registry = ConnectorRegistry::new();
        registry.register(Arc::new(
            MockApp::new("mock")
                .with_webhook(Arc::new(MockWebhook::new()))
                .with_poller(Arc::new(MockPoller::new())),
        ));
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(InMemoryQueue::new());
        let flow = Flow::new("f", vec![Step::trigger("mock", trigger)]).unwrap();
        store.put_flow(&flow).await.unwrap();
        if active {
            store
                .set_active(&flow.id, true, TriggerState::Active)
                .await
                .unwrap();
        }
        (
            WebhookIngress::new(store, queue.clone(), registry),
            queue,
            flow,
        )
    }

    #[test]
    fn payload_key_ignores_key_order() {
        let a: Value = serde_json::from_str(r#"{"a":1,"b":{"c":2,"d":3}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"b":{"d":3,"c":2},"a":1}"#).unwrap();
        assert_eq!(payload_dedupe_key(&a), payload_dedupe_key(&b));
        assert_eq!(payload_dedupe_key(&a).len(), 64);
        assert_ne!(payload_dedupe_key(&a), payload_dedupe_key(&json!({"a": 2})));
    }

    #[tokio::test]
    async fn replay_collapses_onto_queued_job() {
        let (ingress, queue, flow) = setup("new_row", true).await;
        let request = WebhookRequest::new(json!({"row": 1})).header("X-Event-Id", "evt-1");

        let first = ingress.receive(&flow.id, request.clone()).await.unwrap();
        assert!(!first.duplicate);
        assert_eq!(first.dedupe_key, "evt-1");
        let second = ingress.receive(&flow.id, request).await.unwrap();
        assert!(second.duplicate);
        assert_eq!(second.job_id, first.job_id);
        assert_eq!(queue.counts(QueueName::Flow).await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn payload_hash_is_the_fallback_key() {
        let (ingress, _queue, flow) = setup("new_row", true).await;
        let body = json!({"row": 2});
        let receipt = ingress
            .receive(&flow.id, WebhookRequest::new(body.clone()))
            .await
            .unwrap();
        assert_eq!(receipt.dedupe_key, payload_dedupe_key(&body));
    }

    #[tokio::test]
    async fn inactive_and_polling_flows_are_rejected() {
        let (ingress, _queue, flow) = setup("new_row", false).await;
        assert!(matches!(
            ingress.receive(&flow.id, WebhookRequest::new(json!({}))).await,
            Err(WebhookError::Inactive { .. })
        ));

        let (ingress, _queue, flow) = setup("new_items", true).await;
        assert!(matches!(
            ingress.receive(&flow.id, WebhookRequest::new(json!({}))).await,
            Err(WebhookError::NotWebhook { .. })
        ));

        assert!(matches!(
            ingress.receive("missing", WebhookRequest::new(json!({}))).await,
            Err(WebhookError::FlowNotFound { .. })
        ));
    }
}
