//! Dynamic request pipeline.
//!
//! Every outbound call a connector makes goes through [`HttpClient`], which
//! runs the app's `before_request` hooks over a [`RequestConfig`] draft
//! before sending it. Hooks compose left to right: each one receives the
//! config the previous hook returned.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::ConnectorError;

// ---------------------------------------------------------------------------
// Auth context
// ---------------------------------------------------------------------------

/// Credentials of the connection a step runs with.
///
/// Cheaply cloneable; clones share the same data so a value written through
/// [`set`](Self::set) (e.g. a refreshed token) is visible to later hooks.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    data: Arc<RwLock<BTreeMap<String, Value>>>,
}

impl AuthContext {
    pub fn new(data: BTreeMap<String, Value>) -> Self {
        Self {
            data: Arc::new(RwLock::new(data)),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.data.read().get(key).cloned()
    }

    /// String value of `key`, if present and a string.
    pub fn get_str(&self, key: &str) -> Option<String> {
        self.data
            .read()
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }

    pub fn set(&self, key: &str, value: impl Into<Value>) {
        self.data.write().insert(key.to_string(), value.into());
    }

    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.data.read().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

// ---------------------------------------------------------------------------
// Request config
// ---------------------------------------------------------------------------

/// Draft of an outbound request, before base-URL resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RequestConfig {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    pub path: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl RequestConfig {
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            method: method.to_uppercase(),
            base_url: None,
            path: path.to_string(),
            headers: BTreeMap::new(),
            query: BTreeMap::new(),
            body: None,
        }
    }

    pub fn get(path: &str) -> Self {
        Self::new("GET", path)
    }

    pub fn post(path: &str) -> Self {
        Self::new("POST", path)
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.set_header(name, value);
        self
    }

    pub fn query(mut self, key: &str, value: &str) -> Self {
        self.query.insert(key.to_string(), value.to_string());
        self
    }

    pub fn base_url(mut self, url: &str) -> Self {
        self.base_url = Some(url.to_string());
        self
    }

    /// Header lookup, ignoring ASCII case.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.header_value(name).is_some()
    }

    /// Insert or overwrite a header. An existing entry with different
    /// casing is replaced rather than duplicated.
    pub fn set_header(&mut self, name: &str, value: &str) {
        self.headers.retain(|k, _| !k.eq_ignore_ascii_case(name));
        self.headers.insert(name.to_string(), value.to_string());
    }

    /// Full URL: explicit `base_url`, else the connection's `apiBaseUrl`,
    /// else the app default. Absolute paths are used unchanged.
    pub fn resolve_url(
        &self,
        auth: &AuthContext,
        app_base_url: Option<&str>,
    ) -> Result<String, ConnectorError> {
        if self.path.starts_with("http://") || self.path.starts_with("https://") {
            return Ok(self.path.clone());
        }
        let base = self
            .base_url
            .clone()
            .or_else(|| auth.get_str("apiBaseUrl"))
            .or_else(|| app_base_url.map(str::to_string))
            .ok_or_else(|| {
                ConnectorError::semantic(format!("no base URL for request path {}", self.path))
            })?;

        let base = base.trim_end_matches('/');
        if self.path.is_empty() {
            Ok(base.to_string())
        } else if self.path.starts_with('/') {
            Ok(format!("{base}{}", self.path))
        } else {
            Ok(format!("{base}/{}", self.path))
        }
    }
}

// ---------------------------------------------------------------------------
// Hooks
// ---------------------------------------------------------------------------

/// A `before_request` hook.
pub trait BeforeRequest: Send + Sync {
    fn apply(
        &self,
        auth: &AuthContext,
        request: RequestConfig,
    ) -> Result<RequestConfig, ConnectorError>;
}

impl<F> BeforeRequest for F
where
    F: Fn(&AuthContext, RequestConfig) -> Result<RequestConfig, ConnectorError> + Send + Sync,
{
    fn apply(
        &self,
        auth: &AuthContext,
        request: RequestConfig,
    ) -> Result<RequestConfig, ConnectorError> {
        self(auth, request)
    }
}

/// Ordered hook chain.
#[derive(Clone, Default)]
pub struct RequestPipeline {
    hooks: Vec<Arc<dyn BeforeRequest>>,
}

impl RequestPipeline {
    pub fn new(hooks: Vec<Arc<dyn BeforeRequest>>) -> Self {
        Self { hooks }
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn apply(
        &self,
        auth: &AuthContext,
        request: RequestConfig,
    ) -> Result<RequestConfig, ConnectorError> {
        self.hooks
            .iter()
            .try_fold(request, |req, hook| hook.apply(auth, req))
    }
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

/// A decoded response.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    /// JSON body, or the raw text as a string when it is not JSON.
    pub body: Value,
}

/// `reqwest` client wired with an app's hook chain and credentials.
#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    pipeline: RequestPipeline,
    auth: AuthContext,
    api_base_url: Option<String>,
}

impl HttpClient {
    pub fn new(
        client: reqwest::Client,
        pipeline: RequestPipeline,
        auth: AuthContext,
        api_base_url: Option<String>,
    ) -> Self {
        Self {
            client,
            pipeline,
            auth,
            api_base_url,
        }
    }

    /// Run the hooks over `config` and return the final draft with its URL,
    /// without sending anything.
    pub fn prepare(&self, config: RequestConfig) -> Result<(String, RequestConfig), ConnectorError> {
        let config = self.pipeline.apply(&self.auth, config)?;
        let url = config.resolve_url(&self.auth, self.api_base_url.as_deref())?;
        Ok((url, config))
    }

    /// Send a request. Network errors, 5xx and 429 are transient; any other
    /// non-success status is semantic with the body attached.
    pub async fn request(&self, config: RequestConfig) -> Result<HttpResponse, ConnectorError> {
        let (url, config) = self.prepare(config)?;

        let method = reqwest::Method::from_bytes(config.method.as_bytes()).map_err(|_| {
            ConnectorError::semantic(format!("invalid HTTP method: {}", config.method))
        })?;

        let mut builder = self.client.request(method.clone(), &url);
        for (name, value) in &config.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !config.query.is_empty() {
            builder = builder.query(&config.query);
        }
        if let Some(body) = &config.body {
            builder = builder.json(body);
        }

        tracing::debug!(method = %method, url = %url, "outbound request");

        let response = builder
            .send()
            .await
            .map_err(|e| ConnectorError::transient(format!("HTTP request failed: {e}")))?;

        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let text = response
            .text()
            .await
            .map_err(|e| ConnectorError::transient(format!("failed to read response body: {e}")))?;
        let body: Value = serde_json::from_str(&text).unwrap_or(Value::String(text));

        if status.is_success() {
            Ok(HttpResponse {
                status: status.as_u16(),
                headers,
                body,
            })
        } else if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Err(ConnectorError::transient(format!("HTTP {status}")))
        } else {
            Err(ConnectorError::semantic_with(
                format!("HTTP {status}"),
                serde_json::json!({ "status": status.as_u16(), "body": body }),
            ))
        }
    }

    pub async fn get(&self, path: &str) -> Result<HttpResponse, ConnectorError> {
        self.request(RequestConfig::get(path)).await
    }

    pub async fn post(&self, path: &str, body: Value) -> Result<HttpResponse, ConnectorError> {
        self.request(RequestConfig::post(path).json(body)).await
    }

    pub fn auth(&self) -> &AuthContext {
        &self.auth
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    type HookResult = Result<RequestConfig, ConnectorError>;

    fn auth(pairs: &[(&str, &str)]) -> AuthContext {
        AuthContext::new(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), json!(v)))
                .collect(),
        )
    }

    #[test]
    fn hooks_see_earlier_mutations() {
        let first = |_: &AuthContext, req: RequestConfig| -> HookResult {
            Ok(req.header("X-Trace", "1"))
        };
        let second = |_: &AuthContext, req: RequestConfig| -> HookResult {
            let trace = req.header_value("x-trace").unwrap_or("missing").to_string();
            Ok(req.header("X-Seen", &trace))
        };
        let pipeline = RequestPipeline::new(vec![Arc::new(first), Arc::new(second)]);

        let req = pipeline
            .apply(&AuthContext::default(), RequestConfig::get("/x"))
            .unwrap();
        assert_eq!(req.header_value("X-Seen"), Some("1"));
    }

    #[test]
    fn hook_error_stops_chain() {
        let fail = |_: &AuthContext, _: RequestConfig| -> HookResult {
            Err(ConnectorError::semantic("no token"))
        };
        let never = |_: &AuthContext, _: RequestConfig| -> HookResult {
            panic!("must not run")
        };
        let pipeline = RequestPipeline::new(vec![Arc::new(fail), Arc::new(never)]);
        let err = pipeline
            .apply(&AuthContext::default(), RequestConfig::get("/x"))
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn set_header_overwrites_case_insensitively() {
        let mut req = RequestConfig::get("/").header("authorization", "old");
        req.set_header("Authorization", "new");
        assert_eq!(req.headers.len(), 1);
        assert_eq!(req.header_value("AUTHORIZATION"), Some("new"));
    }

    #[test]
    fn base_url_precedence() {
        let app_base = Some("https://app.example.com");
        let with_auth = auth(&[("apiBaseUrl", "https://tenant.example.com/")]);

        let req = RequestConfig::get("/v1/items");
        assert_eq!(
            req.resolve_url(&AuthContext::default(), app_base).unwrap(),
            "https://app.example.com/v1/items"
        );
        assert_eq!(
            req.resolve_url(&with_auth, app_base).unwrap(),
            "https://tenant.example.com/v1/items"
        );
        let explicit = req.clone().base_url("https://explicit.example.com");
        assert_eq!(
            explicit.resolve_url(&with_auth, app_base).unwrap(),
            "https://explicit.example.com/v1/items"
        );
        let absolute = RequestConfig::get("https://other.example.com/x");
        assert_eq!(
            absolute.resolve_url(&with_auth, app_base).unwrap(),
            "https://other.example.com/x"
        );
    }

    #[test]
    fn missing_base_url_is_semantic() {
        let err = RequestConfig::get("/x")
            .resolve_url(&AuthContext::default(), None)
            .unwrap_err();
        assert!(matches!(err, ConnectorError::Semantic { .. }));
    }

    #[test]
    fn auth_context_clones_share_data() {
        let a = AuthContext::default();
        let b = a.clone();
        b.set("accessToken", "t");
        assert_eq!(a.get_str("accessToken").as_deref(), Some("t"));
    }

    fn client(server: &MockServer, hooks: Vec<Arc<dyn BeforeRequest>>) -> HttpClient {
        HttpClient::new(
            reqwest::Client::new(),
            RequestPipeline::new(hooks),
            AuthContext::default(),
            Some(server.uri()),
        )
    }

    #[tokio::test]
    async fn sends_decorated_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/items"))
            .and(query_param("page", "2"))
            .and(header("x-api-key", "k"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([1, 2])))
            .expect(1)
            .mount(&server)
            .await;

        let hook = |_: &AuthContext, req: RequestConfig| -> HookResult {
            Ok(req.header("X-Api-Key", "k"))
        };
        let http = client(&server, vec![Arc::new(hook)]);
        let resp = http
            .request(RequestConfig::get("/items").query("page", "2"))
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, json!([1, 2]));
    }

    #[tokio::test]
    async fn non_json_body_is_text() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("pong"))
            .mount(&server)
            .await;

        let resp = client(&server, vec![]).get("/ping").await.unwrap();
        assert_eq!(resp.body, json!("pong"));
    }

    #[tokio::test]
    async fn status_mapping() {
        let server = MockServer::start().await;
        Mock::given(path("/boom"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(path("/slow-down"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;
        Mock::given(path("/denied"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({"error": "bad token"})))
            .mount(&server)
            .await;

        let http = client(&server, vec![]);
        assert!(http.get("/boom").await.unwrap_err().is_retryable());
        assert!(http.get("/slow-down").await.unwrap_err().is_retryable());

        match http.get("/denied").await.unwrap_err() {
            ConnectorError::Semantic { details, .. } => {
                let details = details.unwrap();
                assert_eq!(details["status"], 401);
                assert_eq!(details["body"]["error"], "bad token");
            }
            other => panic!("expected semantic, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn connection_refused_is_transient() {
        let http = HttpClient::new(
            reqwest::Client::new(),
            RequestPipeline::default(),
            AuthContext::default(),
            Some("http://127.0.0.1:1".into()),
        );
        let err = http.get("/x").await.unwrap_err();
        assert!(matches!(err, ConnectorError::Transient { .. }));
    }
}
