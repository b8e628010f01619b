//! HTTP transport: JSON-RPC over a single `POST /mcp` endpoint
//!
//! All tool calls require `Authorization: Bearer <token>`. Auth,
//! scope, and rate-limit failures map onto 401/403/429 with the
//! matching JSON-RPC error in the body.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::Value;
use tower_http::trace::TraceLayer;

use crate::error::Result;
use crate::mcp::protocol::{handle_message, JsonRpcResponse};
use crate::mcp::ServerState;

/// Build the router for the HTTP transport
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/mcp", post(mcp_endpoint))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until the process exits
pub async fn serve(state: Arc<ServerState>, host: &str, port: u16) -> Result<()> {
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "HTTP transport listening");
    axum::serve(listener, router(state))
        .await
        .map_err(crate::error::HoardError::Io)
}

async fn mcp_endpoint(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    let bearer = bearer_token(&headers);

    // The dispatcher is synchronous (SQLite + file locks); keep it off
    // the async executor threads.
    let response = tokio::task::spawn_blocking(move || {
        handle_message(&state, &payload, true, bearer.as_deref())
    })
    .await
    .unwrap_or_else(|_| {
        Some(JsonRpcResponse::error(None, -32000, "Internal server error"))
    });

    match response {
        Some(response) => (http_status(&response), Json(response)).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(String::from)
}

fn http_status(response: &JsonRpcResponse) -> StatusCode {
    match response.error.as_ref().map(|e| e.code) {
        Some(-32001) => StatusCode::UNAUTHORIZED,
        Some(-32002) => StatusCode::FORBIDDEN,
        Some(-32003) => StatusCode::TOO_MANY_REQUESTS,
        _ => StatusCode::OK,
    }
}
