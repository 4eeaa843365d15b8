//! Per-invocation context handed to connector code.

use std::sync::Arc;

use serde_json::Value;

use crate::config::EngineConfig;
use crate::errors::StoreError;
use crate::request::{AuthContext, HttpClient, RequestPipeline};
use crate::traits::FlowStore;
use crate::types::{ConnectorError, Flow, Step};

use super::ConnectorRegistry;

/// What a connector sees while running: identifiers, its step parameters,
/// the connection credentials, trigger state and an [`HttpClient`] that
/// already applies the app's `before_request` hooks.
pub struct ConnectorCtx {
    flow_id: String,
    step_id: String,
    execution_id: Option<String>,
    test_run: bool,
    parameters: Value,
    auth: AuthContext,
    cursor: Option<String>,
    webhook_url: Option<String>,
    hook: Option<Value>,
    http: HttpClient,
}

impl ConnectorCtx {
    pub fn builder(flow_id: &str, step_id: &str) -> ConnectorCtxBuilder {
        ConnectorCtxBuilder {
            flow_id: flow_id.to_string(),
            step_id: step_id.to_string(),
            execution_id: None,
            test_run: false,
            parameters: Value::Object(Default::default()),
            auth: AuthContext::default(),
            cursor: None,
            webhook_url: None,
            hook: None,
            pipeline: RequestPipeline::default(),
            api_base_url: None,
            client: None,
        }
    }

    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    pub fn execution_id(&self) -> Option<&str> {
        self.execution_id.as_deref()
    }

    pub fn test_run(&self) -> bool {
        self.test_run
    }

    /// The step's configured parameters (unresolved for triggers).
    pub fn parameters(&self) -> &Value {
        &self.parameters
    }

    /// String parameter `key`, or a semantic error naming it.
    pub fn required_str(&self, key: &str) -> Result<&str, ConnectorError> {
        self.parameters
            .get(key)
            .and_then(|v| v.as_str())
            .ok_or_else(|| ConnectorError::semantic(format!("missing required parameter: {key}")))
    }

    pub fn auth(&self) -> &AuthContext {
        &self.auth
    }

    /// Poll cursor stored for this flow. Read-only; a poll returns the next
    /// cursor instead of writing it.
    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    pub fn webhook_url(&self) -> Option<&str> {
        self.webhook_url.as_deref()
    }

    /// Data returned by `register_hook` when the flow was activated.
    pub fn hook(&self) -> Option<&Value> {
        self.hook.as_ref()
    }

    pub fn http(&self) -> &HttpClient {
        &self.http
    }
}

pub struct ConnectorCtxBuilder {
    flow_id: String,
    step_id: String,
    execution_id: Option<String>,
    test_run: bool,
    parameters: Value,
    auth: AuthContext,
    cursor: Option<String>,
    webhook_url: Option<String>,
    hook: Option<Value>,
    pipeline: RequestPipeline,
    api_base_url: Option<String>,
    client: Option<reqwest::Client>,
}

impl ConnectorCtxBuilder {
    pub fn execution_id(mut self, id: &str) -> Self {
        self.execution_id = Some(id.to_string());
        self
    }

    pub fn test_run(mut self, test_run: bool) -> Self {
        self.test_run = test_run;
        self
    }

    pub fn parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn auth(mut self, auth: AuthContext) -> Self {
        self.auth = auth;
        self
    }

    pub fn cursor(mut self, cursor: Option<String>) -> Self {
        self.cursor = cursor;
        self
    }

    pub fn webhook_url(mut self, url: &str) -> Self {
        self.webhook_url = Some(url.to_string());
        self
    }

    pub fn hook(mut self, hook: Option<Value>) -> Self {
        self.hook = hook;
        self
    }

    pub fn pipeline(mut self, pipeline: RequestPipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn api_base_url(mut self, url: Option<String>) -> Self {
        self.api_base_url = url;
        self
    }

    pub fn http_client(mut self, client: reqwest::Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn build(self) -> ConnectorCtx {
        let http = HttpClient::new(
            self.client.unwrap_or_default(),
            self.pipeline,
            self.auth.clone(),
            self.api_base_url,
        );
        ConnectorCtx {
            flow_id: self.flow_id,
            step_id: self.step_id,
            execution_id: self.execution_id,
            test_run: self.test_run,
            parameters: self.parameters,
            auth: self.auth,
            cursor: self.cursor,
            webhook_url: self.webhook_url,
            hook: self.hook,
            http,
        }
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Wires contexts for a step: connection credentials, the app's hook chain
/// and base URL, and the flow's webhook URL.
#[derive(Clone)]
pub(crate) struct ContextFactory {
    registry: ConnectorRegistry,
    flows: Arc<dyn FlowStore>,
    client: reqwest::Client,
    config: Arc<EngineConfig>,
}

impl ContextFactory {
    pub(crate) fn new(
        registry: ConnectorRegistry,
        flows: Arc<dyn FlowStore>,
        client: reqwest::Client,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            registry,
            flows,
            client,
            config,
        }
    }

    /// Builder for `step` of `flow`. A missing connection is a semantic
    /// error; a store failure is transient.
    pub(crate) async fn for_step(
        &self,
        flow: &Flow,
        step: &Step,
    ) -> Result<ConnectorCtxBuilder, ConnectorError> {
        let auth = match &step.connection_id {
            Some(connection_id) => match self.flows.get_connection(connection_id).await {
                Ok(Some(conn)) => AuthContext::new(conn.data),
                Ok(None) | Err(StoreError::NotFound { .. }) => {
                    return Err(ConnectorError::semantic(format!(
                        "connection not found: {connection_id}"
                    )));
                }
                Err(e) => return Err(ConnectorError::transient(e.to_string())),
            },
            None => AuthContext::default(),
        };

        Ok(self
            .for_app(&step.app_key, auth)
            .into_builder(&flow.id, &step.id)
            .parameters(step.parameters_value())
            .webhook_url(&self.config.webhook_url(&flow.id)))
    }

    /// Pieces that depend only on the app and its credentials.
    pub(crate) fn for_app(&self, app_key: &str, auth: AuthContext) -> AppWiring {
        let (pipeline, api_base_url) = match self.registry.app(app_key) {
            Some(app) => (
                RequestPipeline::new(app.before_request()),
                app.meta().api_base_url,
            ),
            None => (RequestPipeline::default(), None),
        };
        AppWiring {
            auth,
            pipeline,
            api_base_url,
            client: self.client.clone(),
        }
    }
}

pub(crate) struct AppWiring {
    auth: AuthContext,
    pipeline: RequestPipeline,
    api_base_url: Option<String>,
    client: reqwest::Client,
}

impl AppWiring {
    pub(crate) fn into_builder(self, flow_id: &str, step_id: &str) -> ConnectorCtxBuilder {
        ConnectorCtx::builder(flow_id, step_id)
            .auth(self.auth)
            .pipeline(self.pipeline)
            .api_base_url(self.api_base_url)
            .http_client(self.client)
    }
}
