//! Connector contract.
//!
//! An [`App`] is one third-party service: static metadata, a `before_request`
//! hook chain, and the triggers, actions and dynamic-data resolvers it
//! offers. Operations are looked up by `(app_key, operation_key)` through the
//! [`ConnectorRegistry`].
//!
//! Optional capabilities (`test_run`, `dedupe_key`, `verify_credentials`) are
//! default methods, so a connector implements only what it supports.

pub mod ctx;
pub mod registry;

pub use ctx::{ConnectorCtx, ConnectorCtxBuilder};
pub use registry::ConnectorRegistry;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::request::BeforeRequest;
use crate::types::ConnectorError;

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// Static description of an app.
///
/// `icon_url` and `auth_doc_url` may contain `{BASE_URL}` / `{DOCS_URL}`
/// placeholders; see [`resolved`](Self::resolved).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub struct AppMeta {
    pub key: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_doc_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_color: Option<String>,
    #[serde(default)]
    pub supports_connections: bool,
}

impl AppMeta {
    pub fn new(key: &str, name: &str) -> Self {
        Self {
            key: key.to_string(),
            name: name.to_string(),
            base_url: None,
            api_base_url: None,
            icon_url: None,
            auth_doc_url: None,
            primary_color: None,
            supports_connections: false,
        }
    }

    /// Copy with `{BASE_URL}` and `{DOCS_URL}` substituted.
    pub fn resolved(&self, base_url: &str, docs_url: &str) -> Self {
        let fill = |s: &Option<String>| {
            s.as_ref().map(|s| {
                s.replace("{BASE_URL}", base_url.trim_end_matches('/'))
                    .replace("{DOCS_URL}", docs_url.trim_end_matches('/'))
            })
        };
        Self {
            icon_url: fill(&self.icon_url),
            auth_doc_url: fill(&self.auth_doc_url),
            ..self.clone()
        }
    }
}

/// One user-facing argument of an operation, for the editor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub struct ArgumentDef {
    pub key: String,
    pub label: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ArgumentDef {
    pub fn required(key: &str, label: &str) -> Self {
        Self {
            key: key.to_string(),
            label: label.to_string(),
            required: true,
            description: None,
        }
    }

    pub fn optional(key: &str, label: &str) -> Self {
        Self {
            required: false,
            ..Self::required(key, label)
        }
    }
}

/// Description of one trigger or action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub struct OperationMeta {
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub arguments: Vec<ArgumentDef>,
}

impl OperationMeta {
    pub fn new(key: &str, name: &str, description: &str) -> Self {
        Self {
            key: key.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            arguments: Vec::new(),
        }
    }

    pub fn argument(mut self, arg: ArgumentDef) -> Self {
        self.arguments.push(arg);
        self
    }

    /// Names of required arguments missing from `parameters`.
    pub fn missing_arguments(&self, parameters: &BTreeMap<String, Value>) -> Vec<String> {
        self.arguments
            .iter()
            .filter(|a| a.required && !parameters.contains_key(&a.key))
            .map(|a| a.key.clone())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Triggers
// ---------------------------------------------------------------------------

/// Inbound webhook delivery, as handed over by the HTTP layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct WebhookRequest {
    /// Header names are matched case-insensitively.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub body: Value,
}

impl WebhookRequest {
    pub fn new(body: Value) -> Self {
        Self {
            headers: BTreeMap::new(),
            body,
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A trigger fed by the remote service POSTing to the engine.
#[async_trait]
pub trait WebhookTrigger: Send + Sync {
    fn meta(&self) -> OperationMeta;

    /// Tell the remote service to deliver events to `webhook_url`. The
    /// returned value is stored and visible to `unregister_hook` through
    /// [`ConnectorCtx::hook`].
    async fn register_hook(
        &self,
        ctx: &ConnectorCtx,
        webhook_url: &str,
    ) -> Result<Value, ConnectorError>;

    async fn unregister_hook(&self, ctx: &ConnectorCtx) -> Result<(), ConnectorError>;

    /// Connector-defined dedupe key for a delivery. `None` makes the engine
    /// fall back to a hash of the payload.
    fn dedupe_key(&self, _request: &WebhookRequest) -> Option<String> {
        None
    }

    /// Sample payload for authoring.
    async fn test_run(&self, _ctx: &ConnectorCtx) -> Result<Option<Value>, ConnectorError> {
        Ok(None)
    }
}

/// One new item found by a poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TriggerItem {
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<String>,
}

impl TriggerItem {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            dedupe_key: None,
        }
    }

    pub fn with_key(payload: Value, dedupe_key: impl Into<String>) -> Self {
        Self {
            payload,
            dedupe_key: Some(dedupe_key.into()),
        }
    }
}

/// Result of one poll: new items oldest first, and the cursor to store
/// once they are all enqueued (`None` keeps the current cursor).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PollResult {
    pub items: Vec<TriggerItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// A trigger the engine polls on an interval.
#[async_trait]
pub trait PollingTrigger: Send + Sync {
    fn meta(&self) -> OperationMeta;

    /// Fetch items newer than [`ConnectorCtx::cursor`].
    async fn run(&self, ctx: &ConnectorCtx) -> Result<PollResult, ConnectorError>;

    /// Sample payload for authoring. Never sees or moves the cursor.
    async fn test_run(&self, _ctx: &ConnectorCtx) -> Result<Option<Value>, ConnectorError> {
        Ok(None)
    }
}

/// The two kinds of trigger.
#[derive(Clone)]
pub enum TriggerDef {
    Webhook(Arc<dyn WebhookTrigger>),
    Polling(Arc<dyn PollingTrigger>),
}

impl TriggerDef {
    pub fn meta(&self) -> OperationMeta {
        match self {
            Self::Webhook(t) => t.meta(),
            Self::Polling(t) => t.meta(),
        }
    }

    pub fn key(&self) -> String {
        self.meta().key
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Webhook(_) => "webhook",
            Self::Polling(_) => "polling",
        }
    }

    pub async fn test_run(&self, ctx: &ConnectorCtx) -> Result<Option<Value>, ConnectorError> {
        match self {
            Self::Webhook(t) => t.test_run(ctx).await,
            Self::Polling(t) => t.test_run(ctx).await,
        }
    }
}

// ---------------------------------------------------------------------------
// Actions and dynamic data
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ActionHandler: Send + Sync {
    fn meta(&self) -> OperationMeta;

    /// Call the remote service with resolved `input`.
    async fn run(&self, ctx: &ConnectorCtx, input: Value) -> Result<Value, ConnectorError>;

    /// Authoring-time variant. `None` means not declared; the engine then
    /// calls [`run`](Self::run).
    async fn test_run(
        &self,
        _ctx: &ConnectorCtx,
        _input: Value,
    ) -> Option<Result<Value, ConnectorError>> {
        None
    }
}

/// Populates editor dropdowns (channels, spreadsheets, ...).
#[async_trait]
pub trait DynamicDataHandler: Send + Sync {
    fn key(&self) -> &str;

    async fn run(&self, ctx: &ConnectorCtx) -> Result<Value, ConnectorError>;
}

// ---------------------------------------------------------------------------
// App
// ---------------------------------------------------------------------------

#[async_trait]
pub trait App: Send + Sync {
    fn meta(&self) -> AppMeta;

    fn before_request(&self) -> Vec<Arc<dyn BeforeRequest>> {
        Vec::new()
    }

    fn triggers(&self) -> Vec<TriggerDef> {
        Vec::new()
    }

    fn actions(&self) -> Vec<Arc<dyn ActionHandler>> {
        Vec::new()
    }

    fn dynamic_data(&self) -> Vec<Arc<dyn DynamicDataHandler>> {
        Vec::new()
    }

    /// Check the connection's credentials. May update them through
    /// `ctx.auth().set(..)`.
    async fn verify_credentials(&self, _ctx: &ConnectorCtx) -> Result<(), ConnectorError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn placeholders_resolve() {
        let meta = AppMeta {
            icon_url: Some("{BASE_URL}/apps/slack/assets/favicon.svg".into()),
            auth_doc_url: Some("{DOCS_URL}/apps/slack/connection".into()),
            ..AppMeta::new("slack", "Slack")
        };
        let resolved = meta.resolved("https://relay.example.com/", "https://docs.example.com");
        assert_eq!(
            resolved.icon_url.as_deref(),
            Some("https://relay.example.com/apps/slack/assets/favicon.svg")
        );
        assert_eq!(
            resolved.auth_doc_url.as_deref(),
            Some("https://docs.example.com/apps/slack/connection")
        );
        assert_eq!(resolved.key, "slack");
    }

    #[test]
    fn missing_required_arguments() {
        let meta = OperationMeta::new("send_message", "Send message", "")
            .argument(ArgumentDef::required("channel", "Channel"))
            .argument(ArgumentDef::required("text", "Text"))
            .argument(ArgumentDef::optional("username", "Bot name"));
        let mut params = BTreeMap::new();
        params.insert("text".to_string(), json!("hi"));
        assert_eq!(meta.missing_arguments(&params), vec!["channel".to_string()]);
    }

    #[test]
    fn webhook_header_lookup_ignores_case() {
        let req = WebhookRequest::new(json!({})).header("X-Idempotency-Key", "k1");
        assert_eq!(req.header_value("x-idempotency-key"), Some("k1"));
        assert_eq!(req.header_value("x-other"), None);
    }
}
