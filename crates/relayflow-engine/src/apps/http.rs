//! Generic HTTP request action.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::connector::{ActionHandler, App, AppMeta, ArgumentDef, ConnectorCtx, OperationMeta};
use crate::request::RequestConfig;
use crate::types::ConnectorError;

pub struct HttpApp;

#[async_trait]
impl App for HttpApp {
    fn meta(&self) -> AppMeta {
        AppMeta {
            icon_url: Some("{BASE_URL}/apps/http-request/assets/favicon.svg".into()),
            ..AppMeta::new("http", "HTTP Request")
        }
    }

    fn actions(&self) -> Vec<Arc<dyn ActionHandler>> {
        vec![Arc::new(MakeRequest)]
    }
}

pub struct MakeRequest;

/// Request draft from resolved step input.
fn request_from_input(input: &Value) -> Result<RequestConfig, ConnectorError> {
    let url = input
        .get("url")
        .and_then(Value::as_str)
        .filter(|u| !u.is_empty())
        .ok_or_else(|| ConnectorError::semantic("missing required parameter: url"))?;
    let method = input
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or("GET");

    let mut request = RequestConfig::new(method, url);
    if let Some(headers) = input.get("headers").and_then(Value::as_object) {
        for (name, value) in headers {
            match value {
                Value::String(s) => request.set_header(name, s),
                other => request.set_header(name, &other.to_string()),
            }
        }
    }
    match input.get("body") {
        None | Some(Value::Null) => {}
        Some(body) => request = request.json(body.clone()),
    }
    Ok(request)
}

#[async_trait]
impl ActionHandler for MakeRequest {
    fn meta(&self) -> OperationMeta {
        OperationMeta::new(
            "make_request",
            "Make request",
            "Sends an HTTP request and returns the response.",
        )
        .argument(ArgumentDef::required("url", "URL"))
        .argument(ArgumentDef::optional("method", "Method"))
        .argument(ArgumentDef::optional("headers", "Headers"))
        .argument(ArgumentDef::optional("body", "Body"))
    }

    async fn run(&self, ctx: &ConnectorCtx, input: Value) -> Result<Value, ConnectorError> {
        let request = request_from_input(&input)?;
        let response = ctx.http().request(request).await?;
        Ok(json!({
            "status": response.status,
            "headers": response.headers,
            "body": response.body,
        }))
    }
}
