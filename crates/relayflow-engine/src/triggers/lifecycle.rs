//! Activation and deactivation of a flow's trigger.
//!
//! `inactive → registering → active → unregistering → inactive`. A failed
//! registration goes back to `inactive` and is reported to the caller.

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::connector::ctx::ContextFactory;
use crate::connector::{ConnectorRegistry, TriggerDef};
use crate::errors::{RegistrationError, StoreError};
use crate::traits::{FlowStore, JobQueue, NewJob};
use crate::types::{Flow, QueueJob, QueueName, TriggerData, TriggerPollJob, TriggerState};

use super::{FlowLocks, poll_job_id, trigger_context};

pub(crate) struct TriggerLifecycle {
    flows: Arc<dyn FlowStore>,
    queue: Arc<dyn JobQueue>,
    registry: ConnectorRegistry,
    contexts: ContextFactory,
    config: Arc<EngineConfig>,
    locks: FlowLocks,
}

impl TriggerLifecycle {
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

    async fn load(&self, flow_id: &str) -> Result<Flow, RegistrationError> {
        Ok(self
            .flows
            .get_flow(flow_id)
            .await?
            .ok_or_else(|| StoreError::flow_not_found(flow_id))?)
    }

    /// Register the trigger and mark the flow active. Activating an active
    /// flow is a no-op.
    pub(crate) async fn activate(&self, flow_id: &str) -> Result<Flow, RegistrationError> {
        let _guard = self.locks.lock(flow_id).await;
        let flow = self.load(flow_id).await?;
        if flow.active && flow.trigger_state == TriggerState::Active {
            return Ok(flow);
        }
        if !flow.trigger_state.can_transition_to(TriggerState::Registering) {
            return Err(RegistrationError::InvalidState {
                from: flow.trigger_state.to_string(),
                to: TriggerState::Registering.to_string(),
            });
        }

        let step = flow
            .trigger_step()
            .ok_or_else(|| RegistrationError::MissingTrigger {
                flow_id: flow.id.clone(),
            })?;
        let trigger = self
            .registry
            .trigger(&step.app_key, &step.operation_key)
            .ok_or_else(|| RegistrationError::UnknownTrigger {
                app_key: step.app_key.clone(),
                operation_key: step.operation_key.clone(),
            })?;

        self.flows
            .set_active(&flow.id, false, TriggerState::Registering)
            .await?;
        tracing::info!(flow_id = %flow.id, kind = trigger.kind_name(), "registering trigger");

        match self.register(&flow, &trigger).await {
            Ok(()) => {
                let flow = self
                    .flows
                    .set_active(&flow.id, true, TriggerState::Active)
                    .await?;
                tracing::info!(flow_id = %flow.id, "flow activated");
                Ok(flow)
            }
            Err(e) => {
                tracing::warn!(flow_id = %flow.id, error = %e, "trigger registration failed");
                self.flows
                    .set_active(&flow.id, false, TriggerState::Inactive)
                    .await?;
                Err(e)
            }
        }
    }

    async fn register(&self, flow: &Flow, trigger: &TriggerDef) -> Result<(), RegistrationError> {
        let mut data = self.flows.get_trigger_data(&flow.id).await?;
        match trigger {
            TriggerDef::Webhook(webhook) => {
                let step = flow
                    .trigger_step()
                    .ok_or_else(|| RegistrationError::MissingTrigger {
                        flow_id: flow.id.clone(),
                    })?;
                let ctx = trigger_context(&self.contexts, flow, step, &data, false).await?;
                let url = self.config.webhook_url(&flow.id);
                data.hook = Some(webhook.register_hook(&ctx, &url).await?);
            }
            TriggerDef::Polling(_) => {
                let job_id = poll_job_id(&flow.id);
                let payload = TriggerPollJob {
                    flow_id: flow.id.clone(),
                }
                .to_payload()?;
                self.queue
                    .enqueue(QueueName::Trigger, NewJob::new(payload).id(job_id.clone()))
                    .await?;
                data.scheduled_job_id = Some(job_id);
            }
        }
        self.flows.set_trigger_data(&flow.id, &data).await?;
        Ok(())
    }

    /// Unregister the trigger and mark the flow inactive. Remote unregister
    /// errors are logged; the flow ends inactive either way. The poll cursor
    /// is kept for the next activation.
    pub(crate) async fn deactivate(&self, flow_id: &str) -> Result<Flow, RegistrationError> {
        let _guard = self.locks.lock(flow_id).await;
        let flow = self.load(flow_id).await?;
        if !flow.active && flow.trigger_state == TriggerState::Inactive {
            return Ok(flow);
        }

        self.flows
            .set_active(&flow.id, false, TriggerState::Unregistering)
            .await?;
        let data = self.flows.get_trigger_data(&flow.id).await?;

        let trigger = flow
            .trigger_step()
            .and_then(|step| self.registry.trigger(&step.app_key, &step.operation_key));
        match (trigger, flow.trigger_step()) {
            (Some(TriggerDef::Webhook(webhook)), Some(step)) => {
                let result = match trigger_context(&self.contexts, &flow, step, &data, false).await
                {
                    Ok(ctx) => webhook.unregister_hook(&ctx).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    tracing::warn!(flow_id = %flow.id, error = %e, "unregister hook failed");
                }
            }
            (Some(TriggerDef::Polling(_)), _) => {
                if let Some(job_id) = &data.scheduled_job_id {
                    // An in-flight poll is not removable; it sees the
                    // inactive flow and stops.
                    let removed = self.queue.remove(job_id).await?;
                    tracing::debug!(flow_id = %flow.id, job_id = %job_id, removed, "poll cancelled");
                }
            }
            _ => tracing::warn!(flow_id = %flow.id, "trigger no longer registered, skipping unregister"),
        }

        self.flows
            .set_trigger_data(
                &flow.id,
                &TriggerData {
                    cursor: data.cursor,
                    ..TriggerData::default()
                },
            )
            .await?;
        let flow = self
            .flows
            .set_active(&flow.id, false, TriggerState::Inactive)
            .await?;
        tracing::info!(flow_id = %flow.id, "flow deactivated");
        Ok(flow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defaults::{InMemoryQueue, InMemoryStore};
    use crate::test_support::{MockApp, MockPoller, MockWebhook};
    use crate::traits::JobState;
    use crate::types::Step;
    use std::sync::atomic::Ordering;

    struct Fixture {
        store: Arc<InMemoryStore>,
        queue: Arc<InMemoryQueue>,
        lifecycle: TriggerLifecycle,
        webhook: Arc<MockWebhook>,
    }

    fn fixture() -> Fixture {
        let webhook = Arc::new(MockWebhook::new());
        let registry = ConnectorRegistry::new();
        registry.register(Arc::new(
            MockApp::new("mock")
                .with_webhook(webhook.clone())
                .with_poller(Arc::new(MockPoller::new())),
        ));
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(InMemoryQueue::new());
        let config = Arc::new(EngineConfig::default());
        let contexts = ContextFactory::new(
            registry.clone(),
            store.clone(),
            reqwest::Client::new(),
            config.clone(),
        );
        let lifecycle = TriggerLifecycle::new(
            store.clone(),
            queue.clone(),
            registry,
            contexts,
            config,
            FlowLocks::default(),
        );
        Fixture {
            store,
            queue,
            lifecycle,
            webhook,
        }
    }

    async fn flow(store: &InMemoryStore, trigger: &str) -> Flow {
        let flow = Flow::new("f", vec![Step::trigger("mock", trigger)]).unwrap();
        store.put_flow(&flow).await.unwrap();
        flow
    }

    #[tokio::test]
    async fn webhook_activation_round_trip() {
        let fx = fixture();
        let flow = flow(&fx.store, "new_row").await;

        let active = fx.lifecycle.activate(&flow.id).await.unwrap();
        assert!(active.active);
        assert_eq!(active.trigger_state, TriggerState::Active);
        assert_eq!(fx.webhook.registered.load(Ordering::SeqCst), 1);
        assert_eq!(
            fx.webhook.last_url.lock().clone().unwrap(),
            format!("http://localhost:3000/webhooks/flows/{}", flow.id)
        );

        // Idempotent.
        fx.lifecycle.activate(&flow.id).await.unwrap();
        assert_eq!(fx.webhook.registered.load(Ordering::SeqCst), 1);

        let inactive = fx.lifecycle.deactivate(&flow.id).await.unwrap();
        assert!(!inactive.active);
        assert_eq!(inactive.trigger_state, TriggerState::Inactive);
        assert_eq!(fx.webhook.unregistered.load(Ordering::SeqCst), 1);
        assert_eq!(
            *fx.webhook.unregistered_hook.lock(),
            Some(serde_json::json!({"hookId": "h-1"}))
        );
        assert_eq!(fx.store.get_trigger_data(&flow.id).await.unwrap().hook, None);
    }

    #[tokio::test]
    async fn failed_registration_leaves_flow_inactive() {
        let fx = fixture();
        fx.webhook.fail_register.store(true, Ordering::SeqCst);
        let flow = flow(&fx.store, "new_row").await;

        let err = fx.lifecycle.activate(&flow.id).await.unwrap_err();
        assert!(matches!(err, RegistrationError::Connector(_)));
        let stored = fx.store.get_flow(&flow.id).await.unwrap().unwrap();
        assert!(!stored.active);
        assert_eq!(stored.trigger_state, TriggerState::Inactive);
    }

    #[tokio::test]
    async fn polling_activation_schedules_and_cancels() {
        let fx = fixture();
        let flow = flow(&fx.store, "new_items").await;
        fx.store
            .set_trigger_data(
                &flow.id,
                &TriggerData {
                    cursor: Some("41".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        fx.lifecycle.activate(&flow.id).await.unwrap();
        let data = fx.store.get_trigger_data(&flow.id).await.unwrap();
        let job_id = data.scheduled_job_id.clone().unwrap();
        let record = fx.queue.job(&job_id).await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Waiting);
        assert_eq!(record.queue, QueueName::Trigger);

        fx.lifecycle.deactivate(&flow.id).await.unwrap();
        assert!(fx.queue.job(&job_id).await.unwrap().is_none());
        let data = fx.store.get_trigger_data(&flow.id).await.unwrap();
        assert_eq!(data.scheduled_job_id, None);
        assert_eq!(data.cursor.as_deref(), Some("41"));
    }

    #[tokio::test]
    async fn unknown_trigger_is_rejected() {
        let fx = fixture();
        let flow = flow(&fx.store, "no_such_trigger").await;
        assert!(matches!(
            fx.lifecycle.activate(&flow.id).await,
            Err(RegistrationError::UnknownTrigger { .. })
        ));
    }

    #[tokio::test]
    async fn activating_while_unregistering_is_invalid() {
        let fx = fixture();
        let flow = flow(&fx.store, "new_row").await;
        fx.store
            .set_active(&flow.id, false, TriggerState::Unregistering)
            .await
            .unwrap();
        assert!(matches!(
            fx.lifecycle.activate(&flow.id).await,
            Err(RegistrationError::InvalidState { .. })
        ));
        // Deactivate finishes the stuck transition.
        let flow = fx.lifecycle.deactivate(&flow.id).await.unwrap();
        assert_eq!(flow.trigger_state, TriggerState::Inactive);
    }
}
