//! Raw webhook trigger: whatever is POSTed to the flow's URL starts a run.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::connector::{
    App, AppMeta, ConnectorCtx, OperationMeta, TriggerDef, WebhookRequest, WebhookTrigger,
};
use crate::types::ConnectorError;

/// Header a sender can set to make redeliveries collapse.
pub const IDEMPOTENCY_HEADER: &str = "x-idempotency-key";

pub struct WebhookApp;

#[async_trait]
impl App for WebhookApp {
    fn meta(&self) -> AppMeta {
        AppMeta {
            icon_url: Some("{BASE_URL}/apps/webhook/assets/favicon.svg".into()),
            auth_doc_url: Some("{DOCS_URL}/apps/webhook/connection".into()),
            primary_color: Some("0059F7".into()),
            ..AppMeta::new("webhook", "Webhook")
        }
    }

    fn triggers(&self) -> Vec<TriggerDef> {
        vec![TriggerDef::Webhook(Arc::new(CatchRawWebhook))]
    }
}

pub struct CatchRawWebhook;

#[async_trait]
impl WebhookTrigger for CatchRawWebhook {
    fn meta(&self) -> OperationMeta {
        OperationMeta::new(
            "catch_raw_webhook",
            "Catch raw webhook",
            "Triggers when the webhook receives a request.",
        )
    }

    /// Nothing to register remotely; the URL is kept for display.
    async fn register_hook(
        &self,
        _ctx: &ConnectorCtx,
        webhook_url: &str,
    ) -> Result<Value, ConnectorError> {
        Ok(json!({ "url": webhook_url }))
    }

    async fn unregister_hook(&self, _ctx: &ConnectorCtx) -> Result<(), ConnectorError> {
        Ok(())
    }

    fn dedupe_key(&self, request: &WebhookRequest) -> Option<String> {
        request
            .header_value(IDEMPOTENCY_HEADER)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hook_echoes_url() {
        let ctx = ConnectorCtx::builder("f", "s").build();
        let hook = CatchRawWebhook
            .register_hook(&ctx, "http://localhost:3000/webhooks/flows/f")
            .await
            .unwrap();
        assert_eq!(hook["url"], "http://localhost:3000/webhooks/flows/f");
        CatchRawWebhook.unregister_hook(&ctx).await.unwrap();
    }

    #[test]
    fn idempotency_header_is_the_key() {
        let req = WebhookRequest::new(json!({"a": 1})).header("X-Idempotency-Key", "k-9");
        assert_eq!(CatchRawWebhook.dedupe_key(&req).as_deref(), Some("k-9"));

        let blank = WebhookRequest::new(json!({})).header("X-Idempotency-Key", "");
        assert_eq!(CatchRawWebhook.dedupe_key(&blank), None);
        assert_eq!(CatchRawWebhook.dedupe_key(&WebhookRequest::new(json!({}))), None);
    }
}
