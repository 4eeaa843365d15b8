//! Slack app: send a message, list channels, verify a bot token.
//!
//! Slack answers most errors with HTTP 200 and `{"ok": false, "error": ..}`;
//! those become semantic errors carrying the response body.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use super::common::AddAuthHeader;
use crate::connector::{
    ActionHandler, App, AppMeta, ArgumentDef, ConnectorCtx, DynamicDataHandler, OperationMeta,
};
use crate::request::{BeforeRequest, HttpResponse, RequestConfig};
use crate::types::ConnectorError;

pub const SLACK_API_BASE_URL: &str = "https://slack.com/api";

pub struct SlackApp;

#[async_trait]
impl App for SlackApp {
    fn meta(&self) -> AppMeta {
        AppMeta {
            base_url: Some("https://slack.com".into()),
            api_base_url: Some(SLACK_API_BASE_URL.into()),
            icon_url: Some("{BASE_URL}/apps/slack/assets/favicon.svg".into()),
            auth_doc_url: Some("{DOCS_URL}/apps/slack/connection".into()),
            primary_color: Some("4a154b".into()),
            supports_connections: true,
            ..AppMeta::new("slack", "Slack")
        }
    }

    fn before_request(&self) -> Vec<Arc<dyn BeforeRequest>> {
        vec![Arc::new(AddAuthHeader)]
    }

    fn actions(&self) -> Vec<Arc<dyn ActionHandler>> {
        vec![Arc::new(SendMessage)]
    }

    fn dynamic_data(&self) -> Vec<Arc<dyn DynamicDataHandler>> {
        vec![Arc::new(ListChannels)]
    }

    /// `auth.test` must accept the token; the team and bot user are kept
    /// on the connection.
    async fn verify_credentials(&self, ctx: &ConnectorCtx) -> Result<(), ConnectorError> {
        let body = ok_body(ctx.http().post("/auth.test", json!({})).await?)?;
        if let Some(team) = body.get("team").and_then(Value::as_str) {
            ctx.auth().set("team", team);
        }
        if let Some(user_id) = body.get("user_id").and_then(Value::as_str) {
            ctx.auth().set("botUserId", user_id);
        }
        Ok(())
    }
}

/// Body of a successful Slack call, or a semantic error for `ok: false`.
fn ok_body(response: HttpResponse) -> Result<Value, ConnectorError> {
    if response.body.get("ok").and_then(Value::as_bool) == Some(true) {
        return Ok(response.body);
    }
    let error = response
        .body
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("unknown_error")
        .to_string();
    Err(ConnectorError::semantic_with(error, response.body))
}

pub struct SendMessage;

#[async_trait]
impl ActionHandler for SendMessage {
    fn meta(&self) -> OperationMeta {
        OperationMeta::new(
            "send_message",
            "Send a message to channel",
            "Posts a message to a channel.",
        )
        .argument(ArgumentDef::required("channel", "Channel"))
        .argument(ArgumentDef::required("text", "Message text"))
        .argument(ArgumentDef::optional("username", "Bot name"))
    }

    async fn run(&self, ctx: &ConnectorCtx, input: Value) -> Result<Value, ConnectorError> {
        let mut message = Map::new();
        for key in ["channel", "text"] {
            let value = input
                .get(key)
                .and_then(Value::as_str)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| {
                    ConnectorError::semantic(format!("missing required parameter: {key}"))
                })?;
            message.insert(key.to_string(), json!(value));
        }
        if let Some(username) = input.get("username").and_then(Value::as_str) {
            message.insert("username".into(), json!(username));
        }

        let request = RequestConfig::post("/chat.postMessage").json(Value::Object(message));
        let body = ok_body(ctx.http().request(request).await?)?;
        Ok(json!({
            "channel": body.get("channel").cloned().unwrap_or(Value::Null),
            "ts": body.get("ts").cloned().unwrap_or(Value::Null),
            "message": body.get("message").cloned().unwrap_or(Value::Null),
        }))
    }
}

pub struct ListChannels;

#[async_trait]
impl DynamicDataHandler for ListChannels {
    fn key(&self) -> &str {
        "list_channels"
    }

    async fn run(&self, ctx: &ConnectorCtx) -> Result<Value, ConnectorError> {
        let request = RequestConfig::get("/conversations.list")
            .query("types", "public_channel,private_channel")
            .query("limit", "1000");
        let body = ok_body(ctx.http().request(request).await?)?;
        let channels: Vec<Value> = body
            .get("channels")
            .and_then(Value::as_array)
            .map(|channels| {
                channels
                    .iter()
                    .map(|c| json!({ "value": c["id"], "name": c["name"] }))
                    .collect()
            })
            .unwrap_or_default();
        Ok(Value::Array(channels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{AuthContext, RequestPipeline};
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ctx(server: &MockServer, auth: AuthContext) -> ConnectorCtx {
        // The connection's apiBaseUrl points the app at the mock server.
        auth.set("apiBaseUrl", server.uri());
        ConnectorCtx::builder("f", "s")
            .auth(auth)
            .pipeline(RequestPipeline::new(SlackApp.before_request()))
            .api_base_url(SlackApp.meta().api_base_url)
            .build()
    }

    fn token(value: &str) -> AuthContext {
        let auth = AuthContext::default();
        auth.set("accessToken", value);
        auth
    }

    #[tokio::test]
    async fn send_message_posts_with_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat.postMessage"))
            .and(header("authorization", "Bearer xoxb-1"))
            .and(body_json(json!({"channel": "C1", "text": "a@b.com"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true, "channel": "C1", "ts": "1.2", "message": {"text": "a@b.com"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let out = SendMessage
            .run(
                &ctx(&server, token("xoxb-1")),
                json!({"channel": "C1", "text": "a@b.com"}),
            )
            .await
            .unwrap();
        assert_eq!(out["ts"], "1.2");
        assert_eq!(out["channel"], "C1");
    }

    #[tokio::test]
    async fn ok_false_is_semantic_with_body() {
        let server = MockServer::start().await;
        Mock::given(path("/chat.postMessage"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"ok": false, "error": "channel_not_found"})),
            )
            .mount(&server)
            .await;

        let err = SendMessage
            .run(
                &ctx(&server, token("xoxb-1")),
                json!({"channel": "nope", "text": "hi"}),
            )
            .await
            .unwrap_err();
        match err {
            ConnectorError::Semantic { message, details } => {
                assert_eq!(message, "channel_not_found");
                assert_eq!(details.unwrap()["ok"], false);
            }
            other => panic!("expected semantic, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_text_fails_before_calling_slack() {
        let server = MockServer::start().await;
        let err = SendMessage
            .run(&ctx(&server, token("t")), json!({"channel": "C1"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("text"));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn channels_for_dropdown() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/conversations.list"))
            .and(query_param("limit", "1000"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "channels": [{"id": "C1", "name": "general"}, {"id": "C2", "name": "random"}]
            })))
            .mount(&server)
            .await;

        let channels = ListChannels.run(&ctx(&server, token("t"))).await.unwrap();
        assert_eq!(
            channels,
            json!([{"value": "C1", "name": "general"}, {"value": "C2", "name": "random"}])
        );
    }

    #[tokio::test]
    async fn verify_stores_team() {
        let server = MockServer::start().await;
        Mock::given(path("/auth.test"))
            .and(header("authorization", "Bearer good"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true, "team": "Acme", "user_id": "U1"
            })))
            .mount(&server)
            .await;
        Mock::given(path("/auth.test"))
            .and(header("authorization", "Bearer bad"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"ok": false, "error": "invalid_auth"})),
            )
            .mount(&server)
            .await;

        let auth = token("good");
        SlackApp
            .verify_credentials(&ctx(&server, auth.clone()))
            .await
            .unwrap();
        assert_eq!(auth.get_str("team").as_deref(), Some("Acme"));
        assert_eq!(auth.get_str("botUserId").as_deref(), Some("U1"));

        let err = SlackApp
            .verify_credentials(&ctx(&server, token("bad")))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::Semantic { .. }));
    }
}
