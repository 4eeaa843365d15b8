//! Engine builder: assembles stores, queue, connectors and handlers.

use std::sync::Arc;

use tokio::sync::broadcast;

use super::Engine;
use super::error::EngineError;
use crate::config::EngineConfig;
use crate::connector::ctx::ContextFactory;
use crate::connector::{App, ConnectorRegistry};
use crate::defaults::{FileQueue, FileStore, LogNotifier};
use crate::executor::action::{ActionInvoker, ActionJobHandler};
use crate::executor::notify::EmailJobHandler;
use crate::executor::pending::PendingActions;
use crate::executor::{FlowJobHandler, FlowRunner};
use crate::queue::JobHandler;
use crate::traits::{ExecutionStore, FlowStore, JobQueue, Notifier};
use crate::triggers::FlowLocks;
use crate::triggers::lifecycle::TriggerLifecycle;
use crate::triggers::poller::PollJobHandler;
use crate::triggers::webhook::WebhookIngress;
use crate::types::QueueName;

/// Builder for assembling the [`Engine`].
///
/// All provider fields are optional; defaults are applied during
/// [`build()`](EngineBuilder::build).
pub struct EngineBuilder {
    flow_store: Option<Arc<dyn FlowStore>>,
    execution_store: Option<Arc<dyn ExecutionStore>>,
    queue: Option<Arc<dyn JobQueue>>,
    notifier: Option<Arc<dyn Notifier>>,
    apps: Vec<Arc<dyn App>>,
    reference_apps: bool,
    config: EngineConfig,
    http_client: Option<reqwest::Client>,
    crash_recovery: bool,
}

impl EngineBuilder {
    pub(super) fn new() -> Self {
        Self {
            flow_store: None,
            execution_store: None,
            queue: None,
            notifier: None,
            apps: Vec::new(),
            reference_apps: false,
            config: EngineConfig::default(),
            http_client: None,
            crash_recovery: true,
        }
    }

    /// Use one store for both flows and executions.
    pub fn store<S>(mut self, store: S) -> Self
    where
        S: FlowStore + ExecutionStore + 'static,
    {
        let store = Arc::new(store);
        let flows: Arc<dyn FlowStore> = store.clone();
        let executions: Arc<dyn ExecutionStore> = store;
        self.flow_store = Some(flows);
        self.execution_store = Some(executions);
        self
    }

    /// Set the flow store. Default: [`FileStore`] under `config.data_dir`.
    pub fn flow_store(mut self, store: impl FlowStore + 'static) -> Self {
        self.flow_store = Some(Arc::new(store));
        self
    }

    /// Set the execution store. Default: [`FileStore`] under `config.data_dir`.
    pub fn execution_store(mut self, store: impl ExecutionStore + 'static) -> Self {
        self.execution_store = Some(Arc::new(store));
        self
    }

    /// Set the job queue. Default: [`FileQueue`] under `config.data_dir/jobs`.
    pub fn queue(mut self, queue: impl JobQueue + 'static) -> Self {
        self.queue = Some(Arc::new(queue));
        self
    }

    /// Set the failure notifier. Default: [`LogNotifier`].
    pub fn notifier(mut self, notifier: impl Notifier + 'static) -> Self {
        self.notifier = Some(Arc::new(notifier));
        self
    }

    /// Register an app. A later app with the same key replaces an earlier one.
    pub fn app(mut self, app: Arc<dyn App>) -> Self {
        self.apps.push(app);
        self
    }

    /// Also register the bundled reference apps. Apps added through
    /// [`app`](Self::app) win on key collisions.
    pub fn reference_apps(mut self) -> Self {
        self.reference_apps = true;
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// HTTP client shared by every connector context.
    pub fn http_client(mut self, client: reqwest::Client) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Enable or disable crash recovery (marking orphaned executions as
    /// interrupted and rescheduling lost polls). Default: true.
    pub fn crash_recovery(mut self, enabled: bool) -> Self {
        self.crash_recovery = enabled;
        self
    }

    /// Assemble the engine. Workers are not started; call
    /// [`Engine::start`].
    pub async fn build(self) -> Result<Engine, EngineError> {
        let config = Arc::new(self.config);

        // 1. Apply defaults for unset providers.
        let (flow_store, execution_store) = match (self.flow_store, self.execution_store) {
            (Some(flows), Some(executions)) => (flows, executions),
            (flows, executions) => {
                let store = Arc::new(FileStore::new(config.data_dir.clone()).map_err(|e| {
                    EngineError::Build {
                        message: format!("failed to create default store: {e}"),
                    }
                })?);
                let default_flows: Arc<dyn FlowStore> = store.clone();
                let default_executions: Arc<dyn ExecutionStore> = store;
                (
                    flows.unwrap_or(default_flows),
                    executions.unwrap_or(default_executions),
                )
            }
        };
        let queue: Arc<dyn JobQueue> = match self.queue {
            Some(queue) => queue,
            None => Arc::new(FileQueue::open(config.data_dir.join("jobs")).map_err(|e| {
                EngineError::Build {
                    message: format!("failed to open default job queue: {e}"),
                }
            })?),
        };
        let notifier: Arc<dyn Notifier> = self.notifier.unwrap_or_else(|| Arc::new(LogNotifier));
        let client = match self.http_client {
            Some(client) => client,
            None => reqwest::Client::builder()
                .build()
                .map_err(|e| EngineError::Build {
                    message: format!("failed to create http client: {e}"),
                })?,
        };

        // 2. Connector catalog.
        let registry = ConnectorRegistry::new();
        if self.reference_apps {
            crate::apps::register_reference_apps(&registry);
        }
        for app in self.apps {
            registry.register(app);
        }

        // 3. Wire runtime components.
        let contexts = ContextFactory::new(
            registry.clone(),
            Arc::clone(&flow_store),
            client,
            Arc::clone(&config),
        );
        let locks = FlowLocks::default();
        let pending = PendingActions::default();
        let invoker = Arc::new(ActionInvoker::new(
            registry.clone(),
            contexts.clone(),
            config.action_timeout(),
        ));
        let runner = Arc::new(FlowRunner::new(
            Arc::clone(&flow_store),
            Arc::clone(&execution_store),
            Arc::clone(&queue),
            Arc::clone(&invoker),
            pending.clone(),
            Arc::clone(&config),
        ));
        let lifecycle = Arc::new(TriggerLifecycle::new(
            Arc::clone(&flow_store),
            Arc::clone(&queue),
            registry.clone(),
            contexts.clone(),
            Arc::clone(&config),
            locks.clone(),
        ));
        let ingress = WebhookIngress::new(
            Arc::clone(&flow_store),
            Arc::clone(&queue),
            registry.clone(),
        );

        // 4. One handler per queue.
        let flow_handler: Arc<dyn JobHandler> = Arc::new(FlowJobHandler::new(Arc::clone(&runner)));
        let trigger_handler: Arc<dyn JobHandler> = Arc::new(PollJobHandler::new(
            Arc::clone(&flow_store),
            Arc::clone(&queue),
            registry.clone(),
            contexts.clone(),
            Arc::clone(&config),
            locks.clone(),
        ));
        let action_handler: Arc<dyn JobHandler> = Arc::new(ActionJobHandler::new(
            Arc::clone(&flow_store),
            Arc::clone(&execution_store),
            invoker,
            pending,
        ));
        let email_handler: Arc<dyn JobHandler> = Arc::new(EmailJobHandler::new(
            Arc::clone(&flow_store),
            Arc::clone(&execution_store),
            notifier,
        ));
        let handlers = vec![
            (QueueName::Flow, flow_handler),
            (QueueName::Trigger, trigger_handler),
            (QueueName::Action, action_handler),
            (QueueName::Email, email_handler),
        ];

        let (shutdown_tx, _) = broadcast::channel::<()>(1);

        let engine = Engine {
            registry,
            config,
            flows: flow_store,
            executions: execution_store,
            queue,
            contexts,
            locks,
            runner,
            lifecycle,
            ingress,
            handlers,
            shutdown_tx,
            workers: tokio::sync::Mutex::new(Vec::new()),
        };

        // 5. Crash recovery.
        if self.crash_recovery {
            engine.recover().await;
        }

        Ok(engine)
    }
}
