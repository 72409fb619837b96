use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    pub base_url: String,
    pub ws_url: Option<String>,
    pub timeout: Duration,
    pub websocket_protocol: String,
    pub websocket_key: Option<String>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5000".to_string(),
            ws_url: None,
            timeout: Duration::from_secs(10),
            websocket_protocol: "hydrogen".to_string(),
            websocket_key: None,
        }
    }
}

impl ProbeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_ws_url(mut self, ws_url: impl Into<String>) -> Self {
        self.ws_url = Some(ws_url.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.websocket_protocol = protocol.into();
        self
    }

    pub fn with_websocket_key(mut self, key: impl Into<String>) -> Self {
        self.websocket_key = Some(key.into());
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.base_url.is_empty() {
            return Err("Base URL cannot be empty".to_string());
        }

        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err("Base URL must start with http:// or https://".to_string());
        }

        if let Some(ws_url) = &self.ws_url {
            if !ws_url.starts_with("ws://") && !ws_url.starts_with("wss://") {
                return Err("WebSocket URL must start with ws:// or wss://".to_string());
            }
        }

        if self.timeout.is_zero() {
            return Err("Timeout must be greater than 0".to_string());
        }

        if self.websocket_protocol.is_empty() {
            return Err("WebSocket protocol cannot be empty".to_string());
        }

        if self
            .websocket_protocol
            .chars()
            .any(|c| c.is_whitespace() || c == ',')
        {
            return Err("WebSocket protocol must be a single token".to_string());
        }

        Ok(())
    }

    /// Join `path` onto the HTTP base URL.
    pub fn url_for(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }

    /// Join `path` onto the WebSocket URL, deriving it from the HTTP base URL
    /// when no explicit one is configured.
    pub fn ws_url_for(&self, path: &str) -> String {
        let base = match &self.ws_url {
            Some(url) => url.clone(),
            None => {
                if let Some(rest) = self.base_url.strip_prefix("https://") {
                    format!("wss://{}", rest)
                } else if let Some(rest) = self.base_url.strip_prefix("http://") {
                    format!("ws://{}", rest)
                } else {
                    self.base_url.clone()
                }
            }
        };
        join_url(&base, path)
    }
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ProbeConfig::default();
        assert_eq!(config.base_url, "http://localhost:5000");
        assert_eq!(config.websocket_protocol, "hydrogen");
        assert!(config.ws_url.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = ProbeConfig::new()
            .with_base_url("https://hydrogen.example.com")
            .with_ws_url("wss://hydrogen.example.com:5001")
            .with_protocol("hydrogen-protocol")
            .with_websocket_key("secret")
            .with_timeout(Duration::from_secs(3));

        assert_eq!(config.base_url, "https://hydrogen.example.com");
        assert_eq!(config.websocket_protocol, "hydrogen-protocol");
        assert_eq!(config.websocket_key.as_deref(), Some("secret"));
        assert_eq!(config.timeout, Duration::from_secs(3));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = ProbeConfig::default();

        config.base_url = "".to_string();
        assert!(config.validate().is_err());

        config.base_url = "localhost:5000".to_string();
        assert!(config.validate().is_err());

        config.base_url = "http://localhost:5000".to_string();
        config.ws_url = Some("http://localhost:5001".to_string());
        assert!(config.validate().is_err());

        config.ws_url = None;
        config.timeout = Duration::from_secs(0);
        assert!(config.validate().is_err());

        config.timeout = Duration::from_secs(1);
        config.websocket_protocol = "a, b".to_string();
        assert!(config.validate().is_err());

        config.websocket_protocol = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_url_joining() {
        let config = ProbeConfig::default().with_base_url("http://localhost:5030/");
        assert_eq!(
            config.url_for("/api/system/health"),
            "http://localhost:5030/api/system/health"
        );
        assert_eq!(
            config.url_for("api/conduit/query"),
            "http://localhost:5030/api/conduit/query"
        );
        assert_eq!(config.url_for(""), "http://localhost:5030");
    }

    #[test]
    fn test_ws_url_derivation() {
        let config = ProbeConfig::default().with_base_url("http://localhost:5030");
        assert_eq!(config.ws_url_for("/"), "ws://localhost:5030");

        let secure = ProbeConfig::default().with_base_url("https://example.com");
        assert_eq!(secure.ws_url_for("term"), "wss://example.com/term");

        let explicit = ProbeConfig::default().with_ws_url("ws://localhost:5261");
        assert_eq!(explicit.ws_url_for(""), "ws://localhost:5261");
    }
}
