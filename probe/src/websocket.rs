use crate::config::ProbeConfig;
use crate::provider::{Probe, ProbeError, ProbeResult};
use crate::types::{ProbeRequest, ProbeResponse};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

/// Handshake timeout used when the caller has no configuration at hand.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

pub struct WebSocketProbe {
    config: ProbeConfig,
}

impl WebSocketProbe {
    pub fn new(config: ProbeConfig) -> ProbeResult<Self> {
        config
            .validate()
            .map_err(|message| ProbeError::InvalidConfig { message })?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    fn timeout_ms(&self) -> u64 {
        self.config.timeout.as_millis() as u64
    }

    async fn connect(&self, path: &str) -> ProbeResult<Socket> {
        let url = self.config.ws_url_for(path);
        debug!(
            "Connecting to {} with protocol {}",
            url, self.config.websocket_protocol
        );

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| ProbeError::WebSocket {
                message: format!("Invalid WebSocket URL {}: {}", url, e),
            })?;

        let headers = request.headers_mut();
        headers.insert(
            "Sec-WebSocket-Protocol",
            header_value(&self.config.websocket_protocol)?,
        );
        if let Some(key) = &self.config.websocket_key {
            headers.insert("Authorization", header_value(&format!("Key {}", key))?);
        }

        let (socket, response) = timeout(self.config.timeout, connect_async(request))
            .await
            .map_err(|_| ProbeError::Timeout {
                operation: format!("WebSocket handshake with {}", url),
                timeout_ms: self.timeout_ms(),
            })?
            .map_err(|e| ProbeError::WebSocket {
                message: format!("Handshake with {} failed: {}", url, e),
            })?;

        debug!("WebSocket handshake completed: {}", response.status());
        Ok(socket)
    }

    async fn next_reply(&self, socket: &mut Socket) -> ProbeResult<String> {
        let read = async {
            while let Some(frame) = socket.next().await {
                match frame {
                    Ok(Message::Text(text)) => return Ok(text),
                    Ok(Message::Binary(bytes)) => {
                        return Ok(String::from_utf8_lossy(&bytes).into_owned())
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        return Err(ProbeError::WebSocket {
                            message: format!("Read failed: {}", e),
                        })
                    }
                }
            }
            Err(ProbeError::WebSocket {
                message: "Connection closed before a reply arrived".to_string(),
            })
        };

        timeout(self.config.timeout, read)
            .await
            .map_err(|_| ProbeError::Timeout {
                operation: "WebSocket reply".to_string(),
                timeout_ms: self.timeout_ms(),
            })?
    }
}

fn header_value(value: &str) -> ProbeResult<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| ProbeError::WebSocket {
        message: format!("Invalid header value: {}", e),
    })
}

#[async_trait]
impl Probe for WebSocketProbe {
    async fn exchange(&self, request: ProbeRequest) -> ProbeResult<ProbeResponse> {
        let started = Instant::now();
        let mut socket = self.connect(&request.path).await?;

        let body = match &request.body {
            Some(payload) => {
                let frame = match payload {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                };
                socket
                    .send(Message::Text(frame))
                    .await
                    .map_err(|e| ProbeError::WebSocket {
                        message: format!("Send failed: {}", e),
                    })?;
                self.next_reply(&mut socket).await?
            }
            None => String::new(),
        };

        if let Err(e) = socket.close(None).await {
            warn!("WebSocket close failed: {}", e);
        }

        Ok(ProbeResponse {
            status: 101,
            body,
            latency: started.elapsed(),
        })
    }

    async fn health_check(&self) -> ProbeResult<()> {
        let mut socket = self.connect("").await?;
        let _ = socket.close(None).await;
        info!("WebSocket health check passed");
        Ok(())
    }

    fn probe_name(&self) -> &'static str {
        "websocket"
    }
}
