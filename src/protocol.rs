//! JSON-RPC 2.0 framing and MCP method dispatch.
//!
//! One handler is bound per tenant; it owns the tenant's profile and a
//! snapshot of the tenant's environment map. The snapshot is replaced by
//! value on config swaps so in-flight calls keep the map they started with.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::profiles::Profile;

/// Protocol version advertised in `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

const SERVER_NAME: &str = "portico-gateway";

#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    #[serde(default)]
    jsonrpc: Option<String>,
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: String,
    #[serde(default)]
    params: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcResponse {
    pub fn result(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<Value>, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitializeParams {
    #[serde(default)]
    protocol_version: String,
}

#[derive(Debug, Default, Deserialize)]
struct ToolCallParams {
    #[serde(default)]
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolDef {
    name: String,
    description: String,
    input_schema: Value,
}

/// Per-tenant MCP message handler.
pub struct McpHandler {
    profile: Arc<dyn Profile>,
    env: RwLock<Arc<HashMap<String, String>>>,
}

impl McpHandler {
    pub fn new(profile: Arc<dyn Profile>, env: HashMap<String, String>) -> Self {
        Self {
            profile,
            env: RwLock::new(Arc::new(env)),
        }
    }

    /// Replaces the environment snapshot. Calls already holding the previous
    /// snapshot are unaffected.
    pub async fn update_env(&self, env: HashMap<String, String>) {
        *self.env.write().await = Arc::new(env);
    }

    pub async fn env_snapshot(&self) -> Arc<HashMap<String, String>> {
        self.env.read().await.clone()
    }

    /// Processes one JSON-RPC frame. Returns `None` for notifications.
    pub async fn handle_message(&self, raw: &[u8]) -> Option<JsonRpcResponse> {
        let req: JsonRpcRequest = match serde_json::from_slice(raw) {
            Ok(req) => req,
            Err(_) => return Some(JsonRpcResponse::error(None, PARSE_ERROR, "Parse error")),
        };
        let JsonRpcRequest {
            jsonrpc,
            id,
            method,
            params,
        } = req;

        if jsonrpc.as_deref() != Some("2.0") {
            return Some(JsonRpcResponse::error(
                id,
                INVALID_REQUEST,
                "Invalid JSON-RPC version",
            ));
        }

        match method.as_str() {
            "initialize" => Some(self.handle_initialize(id, params)),
            "initialized" | "notifications/initialized" => None,
            "ping" => Some(JsonRpcResponse::result(id, json!({}))),
            "tools/list" => Some(self.handle_tools_list(id)),
            "tools/call" => Some(self.handle_tools_call(id, params).await),
            "notifications/cancelled" => None,
            other => Some(JsonRpcResponse::error(
                id,
                METHOD_NOT_FOUND,
                format!("Method not found: {other}"),
            )),
        }
    }

    fn handle_initialize(&self, id: Option<Value>, params: Option<Value>) -> JsonRpcResponse {
        if let Some(params) = params {
            if let Ok(params) = serde_json::from_value::<InitializeParams>(params) {
                if !params.protocol_version.is_empty()
                    && params.protocol_version != PROTOCOL_VERSION
                {
                    return JsonRpcResponse::error(
                        id,
                        INVALID_PARAMS,
                        format!(
                            "Unsupported protocol version: {}. Supported: {}",
                            params.protocol_version, PROTOCOL_VERSION
                        ),
                    );
                }
            }
        }

        JsonRpcResponse::result(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {
                    "tools": {},
                },
                "serverInfo": {
                    "name": SERVER_NAME,
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        )
    }

    fn handle_tools_list(&self, id: Option<Value>) -> JsonRpcResponse {
        let tools: Vec<ToolDef> = self
            .profile
            .tools()
            .into_iter()
            .map(|tool| ToolDef {
                name: tool.name,
                description: tool.description,
                input_schema: tool.input_schema,
            })
            .collect();
        JsonRpcResponse::result(id, json!({ "tools": tools }))
    }

    async fn handle_tools_call(&self, id: Option<Value>, params: Option<Value>) -> JsonRpcResponse {
        // Absent or null params decode as an empty call; the profile then
        // rejects the empty tool name through its normal error path. Only a
        // structurally undecodable params value is an envelope error.
        let params: ToolCallParams = match params {
            None | Some(Value::Null) => ToolCallParams::default(),
            Some(params) => match serde_json::from_value(params) {
                Ok(params) => params,
                Err(_) => {
                    return JsonRpcResponse::error(id, INVALID_PARAMS, "Invalid tool call params");
                }
            },
        };

        let env = self.env.read().await.clone();
        match self
            .profile
            .call_tool(&params.name, &params.arguments, &env)
            .await
        {
            Ok(text) => JsonRpcResponse::result(
                id,
                json!({
                    "content": [{ "type": "text", "text": text }],
                }),
            ),
            // Tool failures are protocol-level successes; only envelope
            // problems use JSON-RPC error codes.
            Err(err) => JsonRpcResponse::result(
                id,
                json!({
                    "content": [{ "type": "text", "text": format!("Error: {err}") }],
                    "isError": true,
                }),
            ),
        }
    }
}
