use crate::types::{ProbeRequest, ProbeResponse};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("WebSocket error: {message}")]
    WebSocket { message: String },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Unexpected status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Response is missing field '{field}'")]
    MissingField { field: String },

    #[error("Authentication failed: {message}")]
    Authentication { message: String },
}

pub type ProbeResult<T> = Result<T, ProbeError>;

/// A transport able to talk to the running subject.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn exchange(&self, request: ProbeRequest) -> ProbeResult<ProbeResponse>;

    async fn health_check(&self) -> ProbeResult<()>;

    fn probe_name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct MockProbe;

    #[async_trait]
    impl Probe for MockProbe {
        async fn exchange(&self, request: ProbeRequest) -> ProbeResult<ProbeResponse> {
            Ok(ProbeResponse {
                status: 200,
                body: format!("{{\"path\":\"{}\"}}", request.path),
                latency: Duration::from_millis(1),
            })
        }

        async fn health_check(&self) -> ProbeResult<()> {
            Ok(())
        }

        fn probe_name(&self) -> &'static str {
            "mock"
        }
    }

    #[tokio::test]
    async fn test_mock_probe() {
        let probe = MockProbe;

        let response = probe
            .exchange(ProbeRequest::get("/api/system/health"))
            .await
            .unwrap();
        assert!(response.is_success());
        assert_eq!(
            response.field("/path"),
            Some(serde_json::json!("/api/system/health"))
        );

        probe.health_check().await.unwrap();
        assert_eq!(probe.probe_name(), "mock");
    }

    #[test]
    fn test_error_display() {
        let error = ProbeError::UnexpectedStatus {
            status: 503,
            body: "down".to_string(),
        };
        assert_eq!(error.to_string(), "Unexpected status 503: down");

        let error = ProbeError::Timeout {
            operation: "websocket handshake".to_string(),
            timeout_ms: 250,
        };
        assert!(error.to_string().contains("250ms"));
    }
}
