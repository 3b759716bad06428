//! HTTP transport layer: host-based tenant dispatch, the legacy SSE
//! transport (`/sse` + `/message`), and the streamable transport (`/mcp`).

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::{to_bytes, Body};
use axum::extract::{Host, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tower_http::trace::TraceLayer;
use tracing::warn;

use super::session::{generate_session_id, Session, SessionRegistry};
use super::{Gateway, GatewayError, Tenant};

/// Body cap on the two JSON-RPC entry points.
const MAX_BODY_BYTES: usize = 1024 * 1024;
const BODY_READ_TIMEOUT: Duration = Duration::from_secs(5);
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

const SESSION_ID_HEADER: &str = "mcp-session-id";

#[derive(Clone)]
pub struct AppState {
    gateway: Arc<Gateway>,
    sessions: Arc<SessionRegistry>,
}

impl AppState {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self {
            gateway,
            sessions: Arc::new(SessionRegistry::new()),
        }
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }
}

/// Every path is routed through `any` and dispatched on method inside the
/// handler: an unmatched method is a 404 like any other unknown route, never
/// a method-router 405.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", any(health))
        .route("/sse", any(handle_sse))
        .route("/message", any(handle_sse_message))
        .route("/mcp", any(handle_mcp))
        .fallback(handle_fallback)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

fn error_response(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: ErrorDetail {
                code,
                message: message.into(),
            },
        }),
    )
}

fn map_gateway_error(err: &GatewayError) -> Response {
    let (status, code) = match err {
        GatewayError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
        GatewayError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, "rate_limited"),
        GatewayError::ConcurrencyExhausted => {
            (StatusCode::SERVICE_UNAVAILABLE, "too_many_sessions")
        }
        GatewayError::Config(_) | GatewayError::ControlPlane(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "internal")
        }
    };
    error_response(status, code, err.to_string()).into_response()
}

async fn health(method: Method) -> Response {
    if method != Method::GET {
        return handle_fallback().await;
    }
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

async fn handle_fallback() -> Response {
    error_response(StatusCode::NOT_FOUND, "not_found", "not found").into_response()
}

fn strip_port(host: &str) -> &str {
    host.split(':').next().unwrap_or(host)
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

async fn resolve_tenant(state: &AppState, host: &str) -> Result<Arc<Tenant>, Response> {
    let domain = strip_port(host);
    state.gateway.lookup(domain).await.ok_or_else(|| {
        error_response(
            StatusCode::NOT_FOUND,
            "unknown_host",
            format!("no tenant for host {domain}"),
        )
        .into_response()
    })
}

/// Shared gate: bearer presence, credential verification, then the
/// per-minute window. Auth failures are counted; rate rejections are not.
async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
    tenant: &Arc<Tenant>,
) -> Result<(), Response> {
    let tenant_id = tenant.config().await.id.clone();

    let Some(credential) = extract_bearer(headers) else {
        state.gateway.record_auth_failure(&tenant_id).await;
        return Err(map_gateway_error(&GatewayError::Unauthorized));
    };
    if !state.gateway.verify_credential(tenant, &credential).await {
        state.gateway.record_auth_failure(&tenant_id).await;
        return Err(map_gateway_error(&GatewayError::Unauthorized));
    }
    if !state.gateway.admit_request(tenant).await {
        return Err(map_gateway_error(&GatewayError::RateLimited));
    }
    Ok(())
}

async fn read_body(body: Body) -> Result<Bytes, Response> {
    match tokio::time::timeout(BODY_READ_TIMEOUT, to_bytes(body, MAX_BODY_BYTES)).await {
        Ok(Ok(bytes)) => Ok(bytes),
        Ok(Err(_)) => Err(error_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            "request_too_large",
            format!("request exceeded max bytes ({MAX_BODY_BYTES})"),
        )
        .into_response()),
        Err(_) => Err(error_response(
            StatusCode::REQUEST_TIMEOUT,
            "read_timeout",
            "request body read timed out",
        )
        .into_response()),
    }
}

fn sse_response(frames: mpsc::Receiver<Bytes>, allow_any_origin: bool) -> Response {
    let stream = stream::unfold(frames, |mut rx| async move {
        rx.recv().await.map(|chunk| (Ok::<_, Infallible>(chunk), rx))
    });
    let mut response = Response::new(Body::from_stream(stream));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    if allow_any_origin {
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        );
    }
    response
}

// ---------- Legacy SSE transport ----------

async fn handle_sse(
    State(state): State<AppState>,
    method: Method,
    Host(host): Host,
    headers: HeaderMap,
) -> Response {
    if method != Method::GET {
        return handle_fallback().await;
    }
    let tenant = match resolve_tenant(&state, &host).await {
        Ok(tenant) => tenant,
        Err(response) => return response,
    };
    if let Err(response) = authenticate(&state, &headers, &tenant).await {
        return response;
    }
    if !state.gateway.try_acquire_session(&tenant).await {
        return map_gateway_error(&GatewayError::ConcurrencyExhausted);
    }

    let tenant_id = tenant.config().await.id.clone();
    let (session, outbound) = Session::new(generate_session_id(), tenant_id);
    state.sessions.insert(session.clone()).await;

    let (frames_tx, frames_rx) = mpsc::channel::<Bytes>(8);
    tokio::spawn(sse_writer(
        state.gateway.clone(),
        state.sessions.clone(),
        tenant,
        session,
        outbound,
        frames_tx,
    ));

    sse_response(frames_rx, true)
}

/// Per-session writer loop. Runs until client disconnect, explicit
/// termination, or buffer closure; teardown then removes the session from
/// the registry and releases the tenant's session slot exactly once.
async fn sse_writer(
    gateway: Arc<Gateway>,
    sessions: Arc<SessionRegistry>,
    tenant: Arc<Tenant>,
    session: Arc<Session>,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    frames: mpsc::Sender<Bytes>,
) {
    let endpoint = format!(
        "event: endpoint\ndata: /message?sessionId={}\n\n",
        session.id()
    );
    if frames.send(Bytes::from(endpoint)).await.is_ok() {
        let mut keep_alive = tokio::time::interval(KEEP_ALIVE_INTERVAL);
        keep_alive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; consume it so the first
        // ping fires one full interval from now.
        keep_alive.tick().await;

        loop {
            tokio::select! {
                _ = frames.closed() => break,
                _ = session.cancelled() => break,
                payload = outbound.recv() => {
                    let Some(payload) = payload else { break };
                    let frame = format!(
                        "event: message\ndata: {}\n\n",
                        String::from_utf8_lossy(&payload)
                    );
                    if frames.send(Bytes::from(frame)).await.is_err() {
                        break;
                    }
                }
                _ = keep_alive.tick() => {
                    if frames.send(Bytes::from_static(b": ping\n\n")).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    sessions.remove(session.id()).await;
    gateway.release_session(&tenant).await;
}

#[derive(Debug, Deserialize)]
struct MessageQuery {
    #[serde(rename = "sessionId", default)]
    session_id: Option<String>,
}

async fn handle_sse_message(
    State(state): State<AppState>,
    method: Method,
    Host(host): Host,
    Query(query): Query<MessageQuery>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    if method != Method::POST {
        return handle_fallback().await;
    }
    let tenant = match resolve_tenant(&state, &host).await {
        Ok(tenant) => tenant,
        Err(response) => return response,
    };
    if let Err(response) = authenticate(&state, &headers, &tenant).await {
        return response;
    }

    let Some(session_id) = query.session_id.filter(|id| !id.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "missing_session", "missing sessionId")
            .into_response();
    };
    let Some(session) = state.sessions.get(&session_id).await else {
        return error_response(StatusCode::NOT_FOUND, "unknown_session", "session not found")
            .into_response();
    };

    let bytes = match read_body(body).await {
        Ok(bytes) => bytes,
        Err(response) => return response,
    };

    let tenant_id = tenant.config().await.id.clone();
    let start = Instant::now();
    let response = tenant.handler().handle_message(&bytes).await;
    let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
    let is_error = response.as_ref().is_some_and(|r| r.is_error());
    state
        .gateway
        .record_request(&tenant_id, latency_ms, is_error)
        .await;

    if let Some(response) = response {
        match serde_json::to_vec(&response) {
            Ok(payload) => {
                if !session.enqueue(payload) {
                    warn!(session = %session_id, "session message buffer full, dropping response");
                }
            }
            Err(err) => {
                warn!(session = %session_id, error = %err, "failed to encode response");
            }
        }
    }

    StatusCode::ACCEPTED.into_response()
}

// ---------- Streamable HTTP transport ----------

async fn handle_mcp(
    State(state): State<AppState>,
    method: Method,
    Host(host): Host,
    headers: HeaderMap,
    body: Body,
) -> Response {
    if method == Method::POST {
        handle_mcp_post(state, host, headers, body).await
    } else if method == Method::GET {
        handle_mcp_stream(state, host, headers).await
    } else if method == Method::DELETE {
        handle_mcp_delete(state, host, headers).await
    } else {
        handle_fallback().await
    }
}

async fn handle_mcp_post(
    state: AppState,
    host: String,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let tenant = match resolve_tenant(&state, &host).await {
        Ok(tenant) => tenant,
        Err(response) => return response,
    };
    if let Err(response) = authenticate(&state, &headers, &tenant).await {
        return response;
    }

    let bytes = match read_body(body).await {
        Ok(bytes) => bytes,
        Err(response) => return response,
    };

    // A frame without an "id" key is a notification: process it, answer
    // 202 with no body. An explicit null id counts as present.
    if let Ok(Value::Object(frame)) = serde_json::from_slice::<Value>(&bytes) {
        if !frame.contains_key("id") {
            tenant.handler().handle_message(&bytes).await;
            return StatusCode::ACCEPTED.into_response();
        }
    }

    let tenant_id = tenant.config().await.id.clone();
    let start = Instant::now();
    let response = tenant.handler().handle_message(&bytes).await;
    let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
    let is_error = response.as_ref().is_some_and(|r| r.is_error());
    state
        .gateway
        .record_request(&tenant_id, latency_ms, is_error)
        .await;

    let Some(response) = response else {
        return StatusCode::ACCEPTED.into_response();
    };

    let session_id = headers
        .get(SESSION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(generate_session_id);

    let mut http_response = (StatusCode::OK, Json(response)).into_response();
    if let Ok(value) = HeaderValue::from_str(&session_id) {
        http_response.headers_mut().insert(SESSION_ID_HEADER, value);
    }
    http_response
}

async fn handle_mcp_stream(state: AppState, host: String, headers: HeaderMap) -> Response {
    let tenant = match resolve_tenant(&state, &host).await {
        Ok(tenant) => tenant,
        Err(response) => return response,
    };
    if let Err(response) = authenticate(&state, &headers, &tenant).await {
        return response;
    }

    let (frames_tx, frames_rx) = mpsc::channel::<Bytes>(1);
    tokio::spawn(async move {
        let mut keep_alive = tokio::time::interval(KEEP_ALIVE_INTERVAL);
        keep_alive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        keep_alive.tick().await;
        loop {
            tokio::select! {
                _ = frames_tx.closed() => break,
                _ = keep_alive.tick() => {
                    if frames_tx.send(Bytes::from_static(b": ping\n\n")).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    sse_response(frames_rx, false)
}

/// Session termination. Idempotent, and deliberately unauthenticated:
/// closing an already-dead session is harmless cleanup.
async fn handle_mcp_delete(state: AppState, host: String, headers: HeaderMap) -> Response {
    if let Err(response) = resolve_tenant(&state, &host).await {
        return response;
    }

    if let Some(session_id) = headers
        .get(SESSION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
    {
        if let Some(session) = state.sessions.remove(session_id).await {
            session.close();
        }
    }
    StatusCode::NO_CONTENT.into_response()
}
