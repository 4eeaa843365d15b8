//! Hooks and helpers shared by the reference apps.

use serde_json::Value;

use crate::request::{AuthContext, BeforeRequest, RequestConfig};
use crate::types::ConnectorError;

/// Marks the body as JSON and adds `Authorization: Bearer <accessToken>`
/// from the connection unless the request already carries one.
#[derive(Debug, Clone, Copy, Default)]
pub struct AddAuthHeader;

impl BeforeRequest for AddAuthHeader {
    fn apply(
        &self,
        auth: &AuthContext,
        mut request: RequestConfig,
    ) -> Result<RequestConfig, ConnectorError> {
        if !request.has_header("content-type") {
            request.set_header("Content-Type", "application/json");
        }
        if request.has_header("authorization") {
            return Ok(request);
        }
        if let Some(token) = auth.get_str("accessToken") {
            request.set_header("Authorization", &format!("Bearer {token}"));
        }
        Ok(request)
    }
}

/// String form of an id field: strings as-is, numbers printed.
pub(crate) fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bearer_from_access_token() {
        let auth = AuthContext::default();
        auth.set("accessToken", "xoxb-1");
        let req = AddAuthHeader.apply(&auth, RequestConfig::get("/x")).unwrap();
        assert_eq!(req.header_value("authorization"), Some("Bearer xoxb-1"));
        assert_eq!(req.header_value("content-type"), Some("application/json"));
    }

    #[test]
    fn explicit_header_and_missing_token_are_left_alone() {
        let auth = AuthContext::default();
        let req = AddAuthHeader.apply(&auth, RequestConfig::get("/x")).unwrap();
        assert!(!req.has_header("authorization"));

        auth.set("accessToken", "t");
        let req = RequestConfig::get("/x").header("Authorization", "Basic abc");
        let req = AddAuthHeader.apply(&auth, req).unwrap();
        assert_eq!(req.header_value("authorization"), Some("Basic abc"));
    }

    #[test]
    fn ids_from_strings_and_numbers() {
        assert_eq!(id_string(&json!("a1")).as_deref(), Some("a1"));
        assert_eq!(id_string(&json!(42)).as_deref(), Some("42"));
        assert_eq!(id_string(&json!(null)), None);
    }
}
