use futures::{SinkExt, StreamExt};
use probe::{
    HttpProbe, LoginRequest, Method, Probe, ProbeConfig, ProbeError, ProbeRequest, WebSocketProbe,
};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TIMEOUT: Duration = Duration::from_secs(5);

fn http_probe(server: &MockServer) -> HttpProbe {
    HttpProbe::new(
        ProbeConfig::default()
            .with_base_url(server.uri())
            .with_timeout(TIMEOUT),
    )
    .expect("probe creation")
}

fn demo_login() -> LoginRequest {
    LoginRequest {
        login_id: "demo".to_string(),
        password: "secret".to_string(),
        api_key: "key-123".to_string(),
        tz: "UTC".to_string(),
        database: "Acuranzo".to_string(),
    }
}

#[tokio::test]
async fn test_health_check_passes_on_200() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/system/health"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "ok" })))
        .expect(1)
        .mount(&server)
        .await;

    http_probe(&server).health_check().await.unwrap();
}

#[tokio::test]
async fn test_health_check_fails_on_503() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/system/health"))
        .respond_with(ResponseTemplate::new(503).set_body_string("starting"))
        .mount(&server)
        .await;

    let result = http_probe(&server).health_check().await;
    match result {
        Err(ProbeError::UnexpectedStatus { status, body }) => {
            assert_eq!(status, 503);
            assert_eq!(body, "starting");
        }
        other => panic!("expected UnexpectedStatus, got {:?}", other),
    }
}

#[tokio::test]
async fn test_exchange_sends_bearer_and_json_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/conduit/auth_query"))
        .and(header("authorization", "Bearer jwt-token"))
        .and(body_json(json!({ "query_ref": 30, "params": {} })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "rows": [{ "id": 1 }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let request = ProbeRequest::post(
        "/api/conduit/auth_query",
        json!({ "query_ref": 30, "params": {} }),
    )
    .with_bearer("jwt-token");

    let response = http_probe(&server).exchange(request).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.field("/success"), Some(json!(true)));
    assert_eq!(response.field("/rows/0/id"), Some(json!(1)));
}

#[tokio::test]
async fn test_exchange_returns_non_success_status_without_error() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/api/conduit/queries"))
        .respond_with(ResponseTemplate::new(405))
        .mount(&server)
        .await;

    let response = http_probe(&server)
        .exchange(ProbeRequest::new(Method::Delete, "/api/conduit/queries"))
        .await
        .unwrap();
    assert_eq!(response.status, 405);
    assert!(!response.is_success());
}

#[tokio::test]
async fn test_acquire_token_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/auth/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "token": "eyJhbGciOi",
            "expires_at": 1_900_000_000i64,
            "user_id": 7
        })))
        .mount(&server)
        .await;

    let grant = http_probe(&server)
        .acquire_token("/api/auth/login", &demo_login())
        .await
        .unwrap();
    assert_eq!(grant.token, "eyJhbGciOi");
    assert_eq!(grant.expires_at, Some(1_900_000_000));
}

#[tokio::test]
async fn test_acquire_token_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/auth/login"))
        .respond_with(
            ResponseTemplate::new(401).set_body_json(json!({ "error": "Invalid credentials" })),
        )
        .mount(&server)
        .await;

    let result = http_probe(&server)
        .acquire_token("/api/auth/login", &demo_login())
        .await;
    match result {
        Err(ProbeError::Authentication { message }) => {
            assert_eq!(message, "Invalid credentials")
        }
        other => panic!("expected Authentication, got {:?}", other),
    }
}

#[tokio::test]
async fn test_acquire_token_missing_field() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/auth/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "success": true })))
        .mount(&server)
        .await;

    let result = http_probe(&server)
        .acquire_token("/api/auth/login", &demo_login())
        .await;
    assert!(matches!(result, Err(ProbeError::MissingField { field }) if field == "token"));
}

#[derive(Default, Debug)]
struct SeenHeaders {
    protocol: Option<String>,
    authorization: Option<String>,
}

/// Accepts one WebSocket connection, records its handshake headers and
/// echoes the first text frame back with an `echo:` prefix.
async fn spawn_echo_server(protocol: &'static str) -> (String, Arc<Mutex<SeenHeaders>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen = Arc::new(Mutex::new(SeenHeaders::default()));
    let seen_in_server = seen.clone();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let callback = move |request: &Request, mut response: Response| {
            let header = |name: &str| {
                request
                    .headers()
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            };
            let mut seen = seen_in_server.lock().unwrap();
            seen.protocol = header("sec-websocket-protocol");
            seen.authorization = header("authorization");
            response
                .headers_mut()
                .insert("sec-websocket-protocol", HeaderValue::from_static(protocol));
            Ok::<Response, ErrorResponse>(response)
        };

        let mut socket = tokio_tungstenite::accept_hdr_async(stream, callback)
            .await
            .unwrap();
        while let Some(Ok(message)) = socket.next().await {
            if let Message::Text(text) = message {
                socket
                    .send(Message::Text(format!("echo:{}", text)))
                    .await
                    .unwrap();
                break;
            }
        }
        let _ = socket.close(None).await;
    });

    (format!("ws://{}", addr), seen)
}

#[tokio::test]
async fn test_websocket_exchange_with_protocol_and_key() {
    let (url, seen) = spawn_echo_server("hydrogen").await;
    let probe = WebSocketProbe::new(
        ProbeConfig::default()
            .with_ws_url(url)
            .with_protocol("hydrogen")
            .with_websocket_key("abc123")
            .with_timeout(TIMEOUT),
    )
    .unwrap();

    let request = ProbeRequest::new(Method::Get, "").with_body(json!({ "type": "status" }));
    let response = probe.exchange(request).await.unwrap();

    assert_eq!(response.status, 101);
    assert!(response.is_success());
    assert_eq!(response.body, r#"echo:{"type":"status"}"#);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.protocol.as_deref(), Some("hydrogen"));
    assert_eq!(seen.authorization.as_deref(), Some("Key abc123"));
}

#[tokio::test]
async fn test_websocket_handshake_only() {
    let (url, seen) = spawn_echo_server("hydrogen").await;
    let probe = WebSocketProbe::new(
        ProbeConfig::default()
            .with_ws_url(url)
            .with_timeout(TIMEOUT),
    )
    .unwrap();

    let response = probe.exchange(ProbeRequest::get("")).await.unwrap();
    assert_eq!(response.status, 101);
    assert!(response.body.is_empty());
    assert!(seen.lock().unwrap().authorization.is_none());
}

#[tokio::test]
async fn test_websocket_string_body_sent_verbatim() {
    let (url, _seen) = spawn_echo_server("hydrogen").await;
    let probe = WebSocketProbe::new(
        ProbeConfig::default()
            .with_ws_url(url)
            .with_timeout(TIMEOUT),
    )
    .unwrap();

    let request = ProbeRequest::get("").with_body(json!("ping"));
    let response = probe.exchange(request).await.unwrap();
    assert_eq!(response.body, "echo:ping");
}
