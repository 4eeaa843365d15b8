//! Scriptable connectors shared by the unit tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::Notify;

use crate::connector::{
    ActionHandler, App, AppMeta, ConnectorCtx, OperationMeta, PollResult, PollingTrigger,
    TriggerDef, WebhookRequest, WebhookTrigger,
};
use crate::types::ConnectorError;

pub(crate) struct MockApp {
    key: String,
    triggers: Vec<TriggerDef>,
    actions: Vec<Arc<dyn ActionHandler>>,
}

impl MockApp {
    pub(crate) fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            triggers: Vec::new(),
            actions: Vec::new(),
        }
    }

    pub(crate) fn with_action(mut self, action: Arc<dyn ActionHandler>) -> Self {
        self.actions.push(action);
        self
    }

    pub(crate) fn with_webhook(mut self, trigger: Arc<dyn WebhookTrigger>) -> Self {
        self.triggers.push(TriggerDef::Webhook(trigger));
        self
    }

    pub(crate) fn with_poller(mut self, trigger: Arc<dyn PollingTrigger>) -> Self {
        self.triggers.push(TriggerDef::Polling(trigger));
        self
    }
}

#[async_trait]
impl App for MockApp {
    fn meta(&self) -> AppMeta {
        AppMeta::new(&self.key, &self.key)
    }

    fn triggers(&self) -> Vec<TriggerDef> {
        self.triggers.clone()
    }

    fn actions(&self) -> Vec<Arc<dyn ActionHandler>> {
        self.actions.clone()
    }
}

/// Action that answers from a script, then echoes its input.
pub(crate) struct ScriptedAction {
    key: String,
    script: Mutex<VecDeque<Result<Value, ConnectorError>>>,
    calls: Mutex<Vec<Value>>,
    delay: Mutex<Option<Duration>>,
}

impl ScriptedAction {
    pub(crate) fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            delay: Mutex::new(None),
        }
    }

    pub(crate) fn push(&self, result: Result<Value, ConnectorError>) {
        self.script.lock().push_back(result);
    }

    pub(crate) fn delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub(crate) fn calls(&self) -> Vec<Value> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ActionHandler for ScriptedAction {
    fn meta(&self) -> OperationMeta {
        OperationMeta::new(&self.key, &self.key, "scripted")
    }

    async fn run(&self, _ctx: &ConnectorCtx, input: Value) -> Result<Value, ConnectorError> {
        self.calls.lock().push(input.clone());
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.lock().pop_front();
        next.unwrap_or(Ok(input))
    }
}

/// Webhook trigger counting registrations. Dedupes on `x-event-id`.
pub(crate) struct MockWebhook {
    pub(crate) fail_register: AtomicBool,
    pub(crate) registered: AtomicUsize,
    pub(crate) unregistered: AtomicUsize,
    pub(crate) last_url: Mutex<Option<String>>,
    pub(crate) unregistered_hook: Mutex<Option<Value>>,
}

impl MockWebhook {
    pub(crate) fn new() -> Self {
        Self {
            fail_register: AtomicBool::new(false),
            registered: AtomicUsize::new(0),
            unregistered: AtomicUsize::new(0),
            last_url: Mutex::new(None),
            unregistered_hook: Mutex::new(None),
        }
    }
}

#[async_trait]
impl WebhookTrigger for MockWebhook {
    fn meta(&self) -> OperationMeta {
        OperationMeta::new("new_row", "New row", "mock webhook")
    }

    async fn register_hook(
        &self,
        _ctx: &ConnectorCtx,
        webhook_url: &str,
    ) -> Result<Value, ConnectorError> {
        if self.fail_register.load(Ordering::SeqCst) {
            return Err(ConnectorError::semantic("remote refused the hook"));
        }
        self.registered.fetch_add(1, Ordering::SeqCst);
        *self.last_url.lock() = Some(webhook_url.to_string());
        Ok(json!({"hookId": "h-1"}))
    }

    async fn unregister_hook(&self, ctx: &ConnectorCtx) -> Result<(), ConnectorError> {
        *self.unregistered_hook.lock() = ctx.hook().cloned();
        self.unregistered.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn dedupe_key(&self, request: &WebhookRequest) -> Option<String> {
        request.header_value("x-event-id").map(str::to_string)
    }

    async fn test_run(&self, _ctx: &ConnectorCtx) -> Result<Option<Value>, ConnectorError> {
        Ok(Some(json!({"row": {"email": "sample@example.com"}})))
    }
}

/// Polling trigger answering from a script. With a gate set, each run
/// signals `entered` and then blocks until the gate is opened.
pub(crate) struct MockPoller {
    script: Mutex<VecDeque<Result<PollResult, ConnectorError>>>,
    pub(crate) cursors: Mutex<Vec<Option<String>>>,
    gate: Mutex<Option<Arc<Notify>>>,
    pub(crate) entered: Notify,
}

impl MockPoller {
    pub(crate) fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            cursors: Mutex::new(Vec::new()),
            gate: Mutex::new(None),
            entered: Notify::new(),
        }
    }

    pub(crate) fn push(&self, result: Result<PollResult, ConnectorError>) {
        self.script.lock().push_back(result);
    }

    pub(crate) fn gate(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock() = Some(gate.clone());
        gate
    }
}

#[async_trait]
impl PollingTrigger for MockPoller {
    fn meta(&self) -> OperationMeta {
        OperationMeta::new("new_items", "New items", "mock poller")
    }

    async fn run(&self, ctx: &ConnectorCtx) -> Result<PollResult, ConnectorError> {
        self.cursors.lock().push(ctx.cursor().map(str::to_string));
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            self.entered.notify_one();
            gate.notified().await;
        }
        let next = self.script.lock().pop_front();
        next.unwrap_or_else(|| Ok(PollResult::default()))
    }
}
