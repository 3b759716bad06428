use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tower::util::ServiceExt;

use portico::gateway::auth::hash_credential;
use portico::gateway::http::{router, AppState};
use portico::gateway::{Gateway, GatewayConfig, TenantConfig};
use portico::profiles::{Profile, ProfileError, ProfileRegistry, ToolSpec};

const PEPPER: &str = "test-pepper";
const DOMAIN: &str = "tools.acme.test";
const CREDENTIAL: &str = "cred-1";

struct EchoProfile;

#[async_trait]
impl Profile for EchoProfile {
    fn id(&self) -> &str {
        "echo"
    }

    fn tools(&self) -> Vec<ToolSpec> {
        vec![ToolSpec {
            name: "echo".to_string(),
            description: "Echo the input back".to_string(),
            input_schema: json!({"type": "object"}),
        }]
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: &Value,
        env: &HashMap<String, String>,
    ) -> Result<String, ProfileError> {
        match name {
            "echo" => Ok(format!(
                "echo: {}",
                arguments.get("text").and_then(Value::as_str).unwrap_or("")
            )),
            "env" => Ok(env.get("GREETING").cloned().unwrap_or_default()),
            "fail" => Err(ProfileError::Failed("boom".to_string())),
            other => Err(ProfileError::UnknownTool(other.to_string())),
        }
    }
}

fn tenant_config(rate_limit: u32, max_concurrency: u32) -> TenantConfig {
    TenantConfig {
        id: "conn-1".to_string(),
        slug: "acme-tools".to_string(),
        domain: DOMAIN.to_string(),
        profile: "echo".to_string(),
        api_key_hash: hash_credential(PEPPER, CREDENTIAL),
        prev_key_hash: None,
        prev_key_expiry: None,
        enabled: true,
        env_vars: HashMap::new(),
        rate_limit,
        max_concurrency,
        created_at: None,
    }
}

fn gateway_config(connections: Vec<TenantConfig>) -> GatewayConfig {
    GatewayConfig {
        server_id: "srv-1".to_string(),
        gateway_id: "gw-1".to_string(),
        pepper: PEPPER.to_string(),
        connections,
        version: 1,
    }
}

async fn app_with(config: GatewayConfig) -> (Arc<Gateway>, AppState, Router) {
    let mut profiles = ProfileRegistry::new();
    profiles.register(Arc::new(EchoProfile));
    let gateway = Arc::new(Gateway::new(profiles));
    gateway.apply_config(config).await;
    let state = AppState::new(gateway.clone());
    let app = router(state.clone());
    (gateway, state, app)
}

async fn default_app() -> (Arc<Gateway>, AppState, Router) {
    app_with(gateway_config(vec![tenant_config(0, 0)])).await
}

fn mcp_request(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/mcp")
        .header("host", DOMAIN)
        .header("authorization", format!("Bearer {CREDENTIAL}"))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn initialize_frame(id: i64) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "initialize",
        "params": {
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "clientInfo": {"name": "c", "version": "1"},
        },
    })
}

#[tokio::test]
async fn health_is_unauthenticated() {
    let (_gateway, _state, app) = default_app().await;
    let request = Request::builder()
        .method("GET")
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let parsed: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed, json!({"status": "ok"}));
}

#[tokio::test]
async fn unknown_host_is_404() {
    let (_gateway, _state, app) = default_app().await;
    let request = Request::builder()
        .method("POST")
        .uri("/mcp")
        .header("host", "nobody.example.com")
        .header("authorization", format!("Bearer {CREDENTIAL}"))
        .body(Body::from(initialize_frame(1).to_string()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unlisted_methods_fall_through_to_404() {
    let (_gateway, _state, app) = default_app().await;
    for (method, uri) in [
        ("PUT", "/mcp"),
        ("PATCH", "/mcp"),
        ("POST", "/health"),
        ("GET", "/message"),
        ("POST", "/sse"),
        ("DELETE", "/sse"),
    ] {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("host", DOMAIN)
            .header("authorization", format!("Bearer {CREDENTIAL}"))
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{method} {uri}");
    }
}

#[tokio::test]
async fn unknown_path_is_404() {
    let (_gateway, _state, app) = default_app().await;
    let request = Request::builder()
        .method("GET")
        .uri("/does-not-exist")
        .header("host", DOMAIN)
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn initialize_round_trip() {
    let (_gateway, _state, app) = default_app().await;
    let response = app.oneshot(mcp_request(initialize_frame(1))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("mcp-session-id"));

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let parsed: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["id"], json!(1));
    assert_eq!(parsed["result"]["protocolVersion"], json!("2024-11-05"));
    assert!(parsed["result"]["capabilities"]["tools"].is_object());
    assert!(!parsed["result"]["serverInfo"]["name"]
        .as_str()
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn mcp_session_id_header_is_echoed() {
    let (_gateway, _state, app) = default_app().await;
    let mut request = mcp_request(initialize_frame(7));
    request
        .headers_mut()
        .insert("mcp-session-id", "client-chosen".parse().unwrap());
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(
        response.headers().get("mcp-session-id").unwrap(),
        "client-chosen"
    );
}

#[tokio::test]
async fn missing_bearer_is_401_and_counted() {
    let (gateway, _state, app) = default_app().await;
    let request = Request::builder()
        .method("GET")
        .uri("/sse")
        .header("host", DOMAIN)
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let bad = Request::builder()
        .method("GET")
        .uri("/sse")
        .header("host", DOMAIN)
        .header("authorization", "Bearer wrong")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(bad).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let reports = gateway.collect_and_reset_metrics().await;
    let report = reports
        .iter()
        .find(|report| report.connection_id == "conn-1")
        .expect("report for tenant");
    assert_eq!(report.auth_failures, 2);
    assert_eq!(report.request_count, 0);
}

#[tokio::test]
async fn rate_limit_rejects_the_fourth_request() {
    let (_gateway, _state, app) = app_with(gateway_config(vec![tenant_config(3, 0)])).await;
    for i in 0..3 {
        let response = app
            .clone()
            .oneshot(mcp_request(initialize_frame(i)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK, "request {i}");
    }
    let response = app.oneshot(mcp_request(initialize_frame(3))).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn notification_gets_202_and_no_body() {
    let (_gateway, _state, app) = default_app().await;
    let frame = json!({"jsonrpc": "2.0", "method": "notifications/initialized"});
    let response = app.oneshot(mcp_request(frame)).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert!(body.is_empty());
}

#[tokio::test]
async fn oversized_body_is_413() {
    let (_gateway, _state, app) = default_app().await;
    let request = Request::builder()
        .method("POST")
        .uri("/mcp")
        .header("host", DOMAIN)
        .header("authorization", format!("Bearer {CREDENTIAL}"))
        .body(Body::from(vec![b'x'; 1024 * 1024 + 1]))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn tool_error_is_200_with_is_error_and_counted() {
    let (gateway, _state, app) = default_app().await;
    let frame = json!({
        "jsonrpc": "2.0",
        "id": 5,
        "method": "tools/call",
        "params": {"name": "fail"},
    });
    let response = app.oneshot(mcp_request(frame)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let parsed: Value = serde_json::from_slice(&body).unwrap();
    assert!(parsed.get("error").is_none());
    assert_eq!(parsed["result"]["isError"], json!(true));

    // A tool failure is not a protocol error, and not an error metric either.
    let reports = gateway.collect_and_reset_metrics().await;
    let report = reports
        .iter()
        .find(|report| report.connection_id == "conn-1")
        .expect("report");
    assert_eq!(report.request_count, 1);
    assert_eq!(report.error_count, 0);
}

#[tokio::test]
async fn sse_handshake_delivers_endpoint_then_messages() {
    let (_gateway, _state, app) = default_app().await;

    let attach = Request::builder()
        .method("GET")
        .uri("/sse")
        .header("host", DOMAIN)
        .header("authorization", format!("Bearer {CREDENTIAL}"))
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(attach).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );

    let mut stream = response.into_body().into_data_stream();
    let first = stream.next().await.expect("endpoint frame").unwrap();
    let first = String::from_utf8(first.to_vec()).unwrap();
    assert!(first.starts_with("event: endpoint\ndata: /message?sessionId="));

    let session_id = first
        .trim_end()
        .rsplit_once("sessionId=")
        .map(|(_, id)| id.to_string())
        .expect("session id in endpoint event");

    let post = Request::builder()
        .method("POST")
        .uri(format!("/message?sessionId={session_id}"))
        .header("host", DOMAIN)
        .header("authorization", format!("Bearer {CREDENTIAL}"))
        .header("content-type", "application/json")
        .body(Body::from(initialize_frame(1).to_string()))
        .unwrap();
    let response = app.oneshot(post).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let second = stream.next().await.expect("message frame").unwrap();
    let second = String::from_utf8(second.to_vec()).unwrap();
    assert!(second.starts_with("event: message\ndata: "));
    assert!(second.contains("\"protocolVersion\":\"2024-11-05\""));
    assert!(second.contains("\"id\":1"));
}

#[tokio::test]
async fn message_without_session_is_400_unknown_is_404() {
    let (_gateway, _state, app) = default_app().await;

    let missing = Request::builder()
        .method("POST")
        .uri("/message")
        .header("host", DOMAIN)
        .header("authorization", format!("Bearer {CREDENTIAL}"))
        .body(Body::from(initialize_frame(1).to_string()))
        .unwrap();
    let response = app.clone().oneshot(missing).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let unknown = Request::builder()
        .method("POST")
        .uri("/message?sessionId=s-0-0")
        .header("host", DOMAIN)
        .header("authorization", format!("Bearer {CREDENTIAL}"))
        .body(Body::from(initialize_frame(1).to_string()))
        .unwrap();
    let response = app.oneshot(unknown).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn delete_is_idempotent() {
    let (_gateway, _state, app) = default_app().await;
    for _ in 0..2 {
        let request = Request::builder()
            .method("DELETE")
            .uri("/mcp")
            .header("host", DOMAIN)
            .header("mcp-session-id", "s-never-existed")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }
}

#[tokio::test]
async fn concurrency_ceiling_then_release_on_disconnect() {
    let (gateway, state, app) = app_with(gateway_config(vec![tenant_config(0, 1)])).await;
    let tenant = gateway.lookup(DOMAIN).await.expect("tenant");

    let attach = |app: Router| async move {
        let request = Request::builder()
            .method("GET")
            .uri("/sse")
            .header("host", DOMAIN)
            .header("authorization", format!("Bearer {CREDENTIAL}"))
            .body(Body::empty())
            .unwrap();
        app.oneshot(request).await.unwrap()
    };

    let first = attach(app.clone()).await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(tenant.active_sessions().await, 1);

    let second = attach(app.clone()).await;
    assert_eq!(second.status(), StatusCode::SERVICE_UNAVAILABLE);

    // Dropping the stream is a client disconnect; the writer tears down and
    // releases the slot.
    drop(first);
    for _ in 0..100 {
        if tenant.active_sessions().await == 0 && state.sessions().is_empty().await {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(tenant.active_sessions().await, 0);
    assert!(state.sessions().is_empty().await);

    let third = attach(app).await;
    assert_eq!(third.status(), StatusCode::OK);
}
