//! JSON-RPC protocol behaviour: version negotiation, auth and scope
//! error codes, write-disabled stdio semantics, and legacy aliases.

use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};

use hoard::auth::limits::RateLimiter;
use hoard::auth::tokens::{register_agent, AgentRegistration};
use hoard::config::{Config, DataPaths};
use hoard::embedding::EmbedderRegistry;
use hoard::mcp::protocol::handle_message;
use hoard::mcp::ServerState;
use hoard::storage::writer::{WriteCoordinator, WriterOptions};
use hoard::storage::{Storage, StoragePool};

const SECRET: &str = "protocol-test-secret";

fn server_state(data_dir: &Path, secret_env: &str) -> ServerState {
    std::env::set_var(secret_env, SECRET);
    let mut config = Config::default();
    config.write.server_secret_env = secret_env.to_string();

    let paths = DataPaths::resolve(data_dir, &config);
    let _ = Storage::open(&paths.db_path).unwrap();
    ServerState {
        readers: StoragePool::new(&paths.db_path, 2, 5000).unwrap(),
        writer: Arc::new(WriteCoordinator::new(&paths.db_path, WriterOptions::default()).unwrap()),
        limiter: RateLimiter::new(config.security.rate_limits.clone()),
        embedders: Arc::new(EmbedderRegistry::new()),
        config,
        paths,
    }
}

fn rpc(method: &str, params: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": 1, "method": method, "params": params })
}

fn call(name: &str, arguments: Value) -> Value {
    rpc("tools/call", json!({ "name": name, "arguments": arguments }))
}

#[test]
fn initialize_negotiates_protocol_version() {
    let dir = tempfile::tempdir().unwrap();
    let state = server_state(dir.path(), "HOARD_TEST_SECRET_INIT");

    let response = handle_message(
        &state,
        &rpc("initialize", json!({ "protocolVersion": "2024-11-05" })),
        true,
        None,
    )
    .unwrap();
    let result = serde_json::to_value(&response).unwrap();
    assert_eq!(result["result"]["protocolVersion"], json!("2024-11-05"));
    assert_eq!(result["result"]["serverInfo"]["name"], json!("hoard"));

    // unsupported version falls back to the server default
    let response = handle_message(
        &state,
        &rpc("initialize", json!({ "protocolVersion": "1999-01-01" })),
        true,
        None,
    )
    .unwrap();
    let result = serde_json::to_value(&response).unwrap();
    assert_eq!(result["result"]["protocolVersion"], json!("2025-11-25"));
}

#[test]
fn tools_list_contains_catalogue_and_aliases() {
    let dir = tempfile::tempdir().unwrap();
    let state = server_state(dir.path(), "HOARD_TEST_SECRET_LIST");

    let response = handle_message(&state, &rpc("tools/list", json!({})), true, None).unwrap();
    let result = serde_json::to_value(&response).unwrap();
    let tools = result["result"]["tools"].as_array().unwrap();

    let names: Vec<&str> = tools.iter().filter_map(|t| t["name"].as_str()).collect();
    for expected in [
        "data.search",
        "memory.write",
        "memory.conflicts.resolve",
        "ingest.inbox.put",
        "admin.agent.register",
        "memory_write",
        "sync",
    ] {
        assert!(names.contains(&expected), "missing tool {}", expected);
    }
    assert_eq!(result["result"]["nextCursor"], Value::Null);
}

#[test]
fn unknown_method_and_tool_error_codes() {
    let dir = tempfile::tempdir().unwrap();
    let state = server_state(dir.path(), "HOARD_TEST_SECRET_UNKNOWN");

    let response = handle_message(&state, &rpc("bogus/method", json!({})), true, None).unwrap();
    let result = serde_json::to_value(&response).unwrap();
    assert_eq!(result["error"]["code"], json!(-32601));

    let response = handle_message(
        &state,
        &call("data.unknown", json!({})),
        true,
        Some(SECRET),
    )
    .unwrap();
    let result = serde_json::to_value(&response).unwrap();
    assert_eq!(result["error"]["code"], json!(-32601));
}

#[test]
fn missing_token_maps_to_auth_code() {
    let dir = tempfile::tempdir().unwrap();
    let state = server_state(dir.path(), "HOARD_TEST_SECRET_AUTH");

    let response = handle_message(
        &state,
        &call("data.search", json!({ "query": "x" })),
        true,
        Some("not-the-secret"),
    )
    .unwrap();
    let result = serde_json::to_value(&response).unwrap();
    assert_eq!(result["error"]["code"], json!(-32001));
    // the message never reveals whether the token existed
    assert_eq!(result["error"]["message"], json!("Authentication failed"));
}

#[test]
fn scope_violation_maps_to_scope_code() {
    let dir = tempfile::tempdir().unwrap();
    let state = server_state(dir.path(), "HOARD_TEST_SECRET_SCOPE");

    // register an agent that can only search
    state
        .writer
        .submit(|conn| {
            register_agent(
                conn,
                &AgentRegistration::new("searcher", vec!["search".to_string()]),
                "searcher-token",
                SECRET,
            )
        })
        .unwrap();

    let response = handle_message(
        &state,
        &call("memory.write", json!({
            "content": "x",
            "memory_type": "fact",
            "scope_type": "user",
        })),
        true,
        Some("searcher-token"),
    )
    .unwrap();
    let result = serde_json::to_value(&response).unwrap();
    assert_eq!(result["error"]["code"], json!(-32002));
    // the message names the required scope
    assert!(result["error"]["message"].as_str().unwrap().contains("memory"));
}

#[test]
fn write_tools_disabled_on_stdio() {
    let dir = tempfile::tempdir().unwrap();
    let state = server_state(dir.path(), "HOARD_TEST_SECRET_STDIO");

    let response = handle_message(
        &state,
        &call("memory.write", json!({
            "content": "x",
            "memory_type": "fact",
            "scope_type": "user",
        })),
        false,
        Some(SECRET),
    )
    .unwrap();
    let result = serde_json::to_value(&response).unwrap();
    assert_eq!(result["error"]["code"], json!(-32004));

    // reads still work on stdio
    let response = handle_message(
        &state,
        &call("memory.query", json!({ "limit": 5 })),
        false,
        Some(SECRET),
    )
    .unwrap();
    let result = serde_json::to_value(&response).unwrap();
    assert!(result["error"].is_null());
}

#[test]
fn legacy_alias_dispatches_like_canonical() {
    let dir = tempfile::tempdir().unwrap();
    let state = server_state(dir.path(), "HOARD_TEST_SECRET_ALIAS");

    let write = handle_message(
        &state,
        &call("memory_write", json!({
            "content": "alias write",
            "memory_type": "fact",
            "scope_type": "user",
        })),
        true,
        Some(SECRET),
    )
    .unwrap();
    let write = serde_json::to_value(&write).unwrap();
    assert!(write["error"].is_null());
    let id = write["result"]["memory"]["id"].as_str().unwrap();

    let get = handle_message(
        &state,
        &call("memory_get", json!({ "id": id })),
        true,
        Some(SECRET),
    )
    .unwrap();
    let get = serde_json::to_value(&get).unwrap();
    assert_eq!(get["result"]["memory"]["content"], json!("alias write"));
}

#[test]
fn malformed_payload_is_invalid_request() {
    let dir = tempfile::tempdir().unwrap();
    let state = server_state(dir.path(), "HOARD_TEST_SECRET_MALFORMED");

    let response = handle_message(&state, &json!(["not", "an", "object"]), true, None).unwrap();
    let result = serde_json::to_value(&response).unwrap();
    assert_eq!(result["error"]["code"], json!(-32600));
}

#[test]
fn search_rate_limit_maps_to_rate_code() {
    let dir = tempfile::tempdir().unwrap();
    std::env::set_var("HOARD_TEST_SECRET_RATE", SECRET);
    let mut config = Config::default();
    config.write.server_secret_env = "HOARD_TEST_SECRET_RATE".to_string();
    config.security.rate_limits.search_requests_per_minute = 2;

    let paths = DataPaths::resolve(dir.path(), &config);
    let _ = Storage::open(&paths.db_path).unwrap();
    let state = ServerState {
        readers: StoragePool::new(&paths.db_path, 2, 5000).unwrap(),
        writer: Arc::new(WriteCoordinator::new(&paths.db_path, WriterOptions::default()).unwrap()),
        limiter: RateLimiter::new(config.security.rate_limits.clone()),
        embedders: Arc::new(EmbedderRegistry::new()),
        config,
        paths,
    };

    for _ in 0..2 {
        let response = handle_message(
            &state,
            &call("data.search", json!({ "query": "x" })),
            true,
            Some(SECRET),
        )
        .unwrap();
        let result = serde_json::to_value(&response).unwrap();
        assert!(result["error"].is_null());
    }
    let response = handle_message(
        &state,
        &call("data.search", json!({ "query": "x" })),
        true,
        Some(SECRET),
    )
    .unwrap();
    let result = serde_json::to_value(&response).unwrap();
    assert_eq!(result["error"]["code"], json!(-32003));
}
