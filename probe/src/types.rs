use crate::provider::ProbeResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    #[default]
    Get,
    Post,
    Put,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Post => write!(f, "POST"),
            Method::Put => write!(f, "PUT"),
            Method::Delete => write!(f, "DELETE"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
    pub bearer: Option<String>,
}

impl ProbeRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            bearer: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Post, path).with_body(body)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResponse {
    pub status: u16,
    pub body: String,
    pub latency: Duration,
}

impl ProbeResponse {
    /// 2xx for HTTP, 101 for a completed WebSocket exchange.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status) || self.status == 101
    }

    pub fn json(&self) -> ProbeResult<Value> {
        Ok(serde_json::from_str(&self.body)?)
    }

    /// Look up a JSON pointer such as `/token` in the body.
    pub fn field(&self, pointer: &str) -> Option<Value> {
        let value: Value = serde_json::from_str(&self.body).ok()?;
        value.pointer(pointer).cloned()
    }
}

/// Body accepted by the server's login endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub login_id: String,
    pub password: String,
    pub api_key: String,
    pub tz: String,
    pub database: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenGrant {
    pub token: String,
    pub expires_at: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_method_display_and_serde() {
        assert_eq!(Method::Get.to_string(), "GET");
        assert_eq!(Method::Delete.to_string(), "DELETE");
        assert_eq!(serde_json::to_string(&Method::Post).unwrap(), "\"POST\"");
        let parsed: Method = serde_json::from_str("\"PUT\"").unwrap();
        assert_eq!(parsed, Method::Put);
    }

    #[test]
    fn test_request_builders() {
        let request = ProbeRequest::post("/api/conduit/query", json!({ "query_ref": 1 }))
            .with_bearer("abc");

        assert_eq!(request.method, Method::Post);
        assert_eq!(request.path, "/api/conduit/query");
        assert_eq!(request.body, Some(json!({ "query_ref": 1 })));
        assert_eq!(request.bearer.as_deref(), Some("abc"));

        let request = ProbeRequest::get("/api/system/health");
        assert_eq!(request.method, Method::Get);
        assert!(request.body.is_none());
    }

    #[test]
    fn test_response_success_range() {
        let mut response = ProbeResponse {
            status: 200,
            body: String::new(),
            latency: Duration::from_millis(5),
        };
        assert!(response.is_success());

        response.status = 101;
        assert!(response.is_success());

        response.status = 302;
        assert!(!response.is_success());

        response.status = 500;
        assert!(!response.is_success());
    }

    #[test]
    fn test_response_field_lookup() {
        let response = ProbeResponse {
            status: 200,
            body: r#"{"token":"jwt","nested":{"ok":true}}"#.to_string(),
            latency: Duration::ZERO,
        };

        assert_eq!(response.field("/token"), Some(json!("jwt")));
        assert_eq!(response.field("/nested/ok"), Some(json!(true)));
        assert_eq!(response.field("/missing"), None);

        let plain = ProbeResponse {
            status: 200,
            body: "not json".to_string(),
            latency: Duration::ZERO,
        };
        assert_eq!(plain.field("/token"), None);
        assert!(plain.json().is_err());
    }
}
