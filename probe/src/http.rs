use crate::config::ProbeConfig;
use crate::provider::{Probe, ProbeError, ProbeResult};
use crate::types::{LoginRequest, Method, ProbeRequest, ProbeResponse, TokenGrant};
use async_trait::async_trait;
use std::time::Instant;
use tracing::{debug, error, info};

pub const HEALTH_PATH: &str = "/api/system/health";

pub struct HttpProbe {
    client: reqwest::Client,
    config: ProbeConfig,
}

impl HttpProbe {
    pub fn new(config: ProbeConfig) -> ProbeResult<Self> {
        config
            .validate()
            .map_err(|message| ProbeError::InvalidConfig { message })?;

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ProbeError::InvalidConfig {
                message: format!("Failed to build HTTP client: {}", e),
            })?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    fn map_send_error(&self, url: &str, e: reqwest::Error) -> ProbeError {
        if e.is_timeout() {
            ProbeError::Timeout {
                operation: format!("request to {}", url),
                timeout_ms: self.config.timeout.as_millis() as u64,
            }
        } else {
            ProbeError::Network(e)
        }
    }

    /// POST credentials to the login endpoint and pull the JWT out of the reply.
    pub async fn acquire_token(&self, path: &str, login: &LoginRequest) -> ProbeResult<TokenGrant> {
        debug!("Requesting bearer token for {}", login.login_id);

        let body = serde_json::to_value(login)?;
        let response = self.exchange(ProbeRequest::post(path, body)).await?;

        match response.status {
            401 | 403 => {
                let message = response
                    .field("/error")
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_else(|| format!("status {}", response.status));
                return Err(ProbeError::Authentication { message });
            }
            status if !(200..300).contains(&status) => {
                return Err(ProbeError::UnexpectedStatus {
                    status,
                    body: response.body,
                });
            }
            _ => {}
        }

        let token = response
            .field("/token")
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| ProbeError::MissingField {
                field: "token".to_string(),
            })?;
        let expires_at = response.field("/expires_at").and_then(|v| v.as_i64());

        info!("Bearer token acquired for {}", login.login_id);
        Ok(TokenGrant { token, expires_at })
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn exchange(&self, request: ProbeRequest) -> ProbeResult<ProbeResponse> {
        let url = self.config.url_for(&request.path);
        debug!("{} {}", request.method, url);

        let mut builder = match request.method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
            Method::Put => self.client.put(&url),
            Method::Delete => self.client.delete(&url),
        };

        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        if let Some(token) = &request.bearer {
            builder = builder.bearer_auth(token);
        }

        let started = Instant::now();
        let response = builder
            .send()
            .await
            .map_err(|e| self.map_send_error(&url, e))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| self.map_send_error(&url, e))?;
        let latency = started.elapsed();

        debug!("{} {} -> {} in {:?}", request.method, url, status, latency);

        Ok(ProbeResponse {
            status,
            body,
            latency,
        })
    }

    async fn health_check(&self) -> ProbeResult<()> {
        debug!("Performing health check");

        let response = self.exchange(ProbeRequest::get(HEALTH_PATH)).await?;
        if response.is_success() {
            info!("Health check passed");
            Ok(())
        } else {
            error!("Health check failed with status {}", response.status);
            Err(ProbeError::UnexpectedStatus {
                status: response.status,
                body: response.body,
            })
        }
    }

    fn probe_name(&self) -> &'static str {
        "http"
    }
}
