//! JSON-RPC 2.0 protocol types and the stdio transport
//!
//! The stdio channel is line-delimited: each line is one full JSON
//! object. Write tools are disabled on this transport.

use std::io::{BufRead, Write};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::Result;
use crate::mcp::ServerState;

/// Protocol versions this server speaks, newest first
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] =
    &["2025-11-25", "2025-06-18", "2025-03-26", "2024-11-05"];

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    #[allow(dead_code)]
    pub jsonrpc: Option<String>,
    pub id: Option<Value>,
    pub method: Option<String>,
    #[serde(default)]
    pub params: Value,
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
}

impl JsonRpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
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
            }),
        }
    }

    pub fn from_error(id: Option<Value>, err: crate::error::HoardError) -> Self {
        Self::error(id, err.code(), err.to_string())
    }
}

/// Pick the client's requested version when supported, else ours
pub fn negotiate_version(requested: Option<&str>) -> &'static str {
    requested
        .and_then(|v| SUPPORTED_PROTOCOL_VERSIONS.iter().find(|s| **s == v))
        .copied()
        .unwrap_or(SUPPORTED_PROTOCOL_VERSIONS[0])
}

/// The `initialize` result payload
pub fn initialize_result(requested: Option<&str>) -> Value {
    json!({
        "protocolVersion": negotiate_version(requested),
        "capabilities": { "tools": { "listChanged": false } },
        "serverInfo": { "name": "hoard", "version": env!("CARGO_PKG_VERSION") },
    })
}

/// Handle one JSON-RPC message against the server state.
///
/// `writes_enabled` is false on the stdio transport; write tools then
/// fail with `-32004`. `bearer` is the transport-level token (HTTP
/// Authorization header); without it the token is taken from the tool
/// arguments or `HOARD_TOKEN`.
pub fn handle_message(
    state: &ServerState,
    payload: &Value,
    writes_enabled: bool,
    bearer: Option<&str>,
) -> Option<JsonRpcResponse> {
    let request: JsonRpcRequest = match serde_json::from_value(payload.clone()) {
        Ok(request) => request,
        Err(_) => return Some(JsonRpcResponse::error(None, -32600, "Invalid Request")),
    };
    let id = request.id.clone();

    let Some(method) = request.method.as_deref() else {
        return Some(JsonRpcResponse::error(id, -32600, "Invalid Request"));
    };

    match method {
        "initialize" => {
            let requested = request.params.get("protocolVersion").and_then(Value::as_str);
            Some(JsonRpcResponse::success(id, initialize_result(requested)))
        }
        "notifications/initialized" => None,
        "ping" => Some(JsonRpcResponse::success(id, json!({}))),
        "tools/list" => Some(JsonRpcResponse::success(
            id,
            json!({
                "tools": crate::mcp::tools::tool_definitions(),
                "nextCursor": null,
            }),
        )),
        "tools/call" => Some(handle_tools_call(
            state,
            id,
            &request.params,
            writes_enabled,
            bearer,
        )),
        _ => Some(JsonRpcResponse::error(id, -32601, "Method not found")),
    }
}

fn handle_tools_call(
    state: &ServerState,
    id: Option<Value>,
    params: &Value,
    writes_enabled: bool,
    bearer: Option<&str>,
) -> JsonRpcResponse {
    let Some(tool_name) = params.get("name").and_then(Value::as_str) else {
        return JsonRpcResponse::error(id, -32602, "Missing tool name");
    };
    let arguments = params
        .get("arguments")
        .cloned()
        .unwrap_or_else(|| json!({}));

    // The HTTP transport supplies the bearer token from the
    // Authorization header; on stdio it travels in the tool arguments
    // or the HOARD_TOKEN environment variable.
    let token = bearer
        .map(String::from)
        .or_else(|| {
            arguments
                .get("token")
                .and_then(Value::as_str)
                .map(String::from)
        })
        .or_else(|| std::env::var("HOARD_TOKEN").ok())
        .unwrap_or_default();

    let principal = match state.authenticate(&token) {
        Ok(principal) => principal,
        Err(e) => return JsonRpcResponse::from_error(id, e),
    };

    match state.call_tool(tool_name, &arguments, &principal, writes_enabled) {
        Ok(result) => JsonRpcResponse::success(id, result),
        Err(e) => JsonRpcResponse::from_error(id, e),
    }
}

/// Serve line-delimited JSON-RPC over stdio until EOF
pub fn serve_stdio(state: &ServerState) -> Result<()> {
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let mut writer = stdout.lock();

    for line in stdin.lock().lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Value>(trimmed) {
            Ok(payload) => handle_message(state, &payload, false, None),
            Err(_) => Some(JsonRpcResponse::error(None, -32700, "Parse error")),
        };
        if let Some(response) = response {
            writeln!(writer, "{}", serde_json::to_string(&response)?)?;
            writer.flush()?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_negotiation() {
        assert_eq!(negotiate_version(Some("2024-11-05")), "2024-11-05");
        assert_eq!(negotiate_version(Some("1999-01-01")), "2025-11-25");
        assert_eq!(negotiate_version(None), "2025-11-25");
    }

    #[test]
    fn test_error_serialization_skips_result() {
        let response = JsonRpcResponse::error(Some(json!(1)), -32601, "Method not found");
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["error"]["code"], json!(-32601));
        assert!(value.get("result").is_none());
    }
}
