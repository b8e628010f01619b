//! Handlers for the `memory.*` tool group

use serde_json::{json, Value};

use crate::auth::{require_scope, Principal};
use crate::error::{HoardError, Result};
use crate::mcp::tools::Tool;
use crate::mcp::ServerState;
use crate::memory::query::{memory_query, MemoryQueryParams};
use crate::memory::store;
use crate::types::MemoryInput;

pub fn dispatch(
    state: &ServerState,
    tool: Tool,
    arguments: &Value,
    principal: &Principal,
) -> Result<Value> {
    require_scope(principal, "memory")?;
    match tool {
        Tool::MemoryWrite => memory_write(state, arguments, principal),
        Tool::MemoryGet => memory_get(state, arguments),
        Tool::MemoryQuery | Tool::MemorySearch => memory_query_tool(state, arguments, principal),
        Tool::MemoryRetract => memory_retract(state, arguments, principal),
        Tool::MemorySupersede => memory_supersede(state, arguments, principal),
        Tool::MemoryPropose => memory_propose(state, arguments, principal),
        Tool::MemoryReview => memory_review(state, arguments, principal),
        Tool::MemoryConflictsList => conflicts_list(state, arguments),
        Tool::MemoryConflictsResolve => conflicts_resolve(state, arguments, principal),
        Tool::MemoryDuplicatesList => duplicates_list(state, arguments),
        Tool::MemoryDuplicatesResolve => duplicates_resolve(state, arguments),
        _ => Err(HoardError::UnknownTool(tool.name().to_string())),
    }
}

fn parse_input(arguments: &Value, principal: &Principal) -> Result<MemoryInput> {
    let mut input: MemoryInput = serde_json::from_value(arguments.clone())
        .map_err(|e| HoardError::Validation(format!("Malformed memory payload: {}", e)))?;
    if input.source_agent.is_none() {
        input.source_agent = Some(principal.name.clone());
    }
    Ok(input)
}

fn memory_write(state: &ServerState, arguments: &Value, principal: &Principal) -> Result<Value> {
    let input = parse_input(arguments, principal)?;
    let config = state.config.clone();
    let principal = principal.clone();
    let memory = state.writer.submit(move |conn| {
        store::memory_write(conn, &input, &principal.name, Some(&principal), &config)
    })?;
    Ok(json!({ "memory": memory }))
}

fn memory_get(state: &ServerState, arguments: &Value) -> Result<Value> {
    let id = required_str(arguments, "id")?;
    state.readers.with_connection(move |conn| {
        let memory = store::memory_get(conn, &id)?
            .ok_or_else(|| HoardError::NotFound(format!("memory {}", id)))?;
        Ok(json!({ "memory": memory }))
    })
}

fn memory_query_tool(
    state: &ServerState,
    arguments: &Value,
    principal: &Principal,
) -> Result<Value> {
    let memory_types = match arguments.get("memory_type") {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(arr)) => arr
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        _ => vec![],
    };
    let params = MemoryQueryParams {
        query: arguments
            .get("query")
            .and_then(Value::as_str)
            .map(String::from),
        slot: arguments
            .get("slot")
            .and_then(Value::as_str)
            .map(String::from),
        scope_type: arguments
            .get("scope_type")
            .and_then(Value::as_str)
            .map(String::from),
        scope_id: arguments
            .get("scope_id")
            .and_then(Value::as_str)
            .map(String::from),
        memory_types,
        tags: arguments
            .get("tags")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default(),
        limit: arguments.get("limit").and_then(Value::as_i64).unwrap_or(20),
    };

    let config = state.config.clone();
    let embedder = if config.vectors.enabled {
        state.embedders.get(&config.vectors).ok()
    } else {
        None
    };
    let principal = principal.clone();

    state.readers.with_connection(move |conn| {
        let results = memory_query(conn, &params, &principal, &config, embedder.as_deref())?;
        Ok(json!({ "results": results }))
    })
}

fn memory_retract(state: &ServerState, arguments: &Value, principal: &Principal) -> Result<Value> {
    let id = required_str(arguments, "id")?;
    let reason = arguments
        .get("reason")
        .and_then(Value::as_str)
        .map(String::from);
    let actor = principal.name.clone();
    let retracted = state
        .writer
        .submit(move |conn| store::memory_retract(conn, &id, &actor, reason.as_deref()))?;
    if !retracted {
        return Err(HoardError::NotFound("memory not found".into()));
    }
    Ok(json!({ "retracted": true }))
}

fn memory_supersede(
    state: &ServerState,
    arguments: &Value,
    principal: &Principal,
) -> Result<Value> {
    let id = required_str(arguments, "id")?;
    let superseded_by = required_str(arguments, "superseded_by")?;
    let actor = principal.name.clone();
    let updated = state
        .writer
        .submit(move |conn| store::memory_supersede(conn, &id, &superseded_by, &actor))?;
    if !updated {
        return Err(HoardError::NotFound("memory not found".into()));
    }
    Ok(json!({ "superseded": true }))
}

fn memory_propose(state: &ServerState, arguments: &Value, principal: &Principal) -> Result<Value> {
    let payload = arguments
        .get("memory")
        .cloned()
        .ok_or_else(|| HoardError::Validation("memory payload is required".into()))?;
    let ttl_days = arguments
        .get("ttl_days")
        .and_then(Value::as_i64)
        .or(principal.proposal_ttl_days);
    let config = state.config.clone();
    let proposer = principal.name.clone();
    let proposal = state
        .writer
        .submit(move |conn| store::memory_propose(conn, &payload, &proposer, ttl_days, &config))?;
    Ok(json!({ "proposal": proposal }))
}

fn memory_review(state: &ServerState, arguments: &Value, principal: &Principal) -> Result<Value> {
    let id = required_str(arguments, "id")?;
    let approved = arguments
        .get("approved")
        .and_then(Value::as_bool)
        .ok_or_else(|| HoardError::Validation("approved is required".into()))?;
    let config = state.config.clone();
    let reviewer = principal.name.clone();
    let outcome = state
        .writer
        .submit(move |conn| store::memory_review(conn, &id, approved, &reviewer, &config))?;
    Ok(json!(outcome))
}

fn conflicts_list(state: &ServerState, arguments: &Value) -> Result<Value> {
    let unresolved_only = arguments
        .get("status")
        .and_then(Value::as_str)
        .map(|s| s == "unresolved")
        .unwrap_or(true);
    state.readers.with_connection(move |conn| {
        let conflicts = store::conflicts_list(conn, unresolved_only)?;
        Ok(json!({ "conflicts": conflicts }))
    })
}

fn conflicts_resolve(
    state: &ServerState,
    arguments: &Value,
    principal: &Principal,
) -> Result<Value> {
    let id = required_str(arguments, "id")?;
    let resolution = required_str(arguments, "resolution")?;
    let resolved_by = principal.name.clone();
    let resolved = state
        .writer
        .submit(move |conn| store::conflict_resolve(conn, &id, &resolution, &resolved_by))?;
    if !resolved {
        return Err(HoardError::NotFound("conflict not found".into()));
    }
    Ok(json!({ "resolved": true }))
}

fn duplicates_list(state: &ServerState, arguments: &Value) -> Result<Value> {
    let unresolved_only = arguments
        .get("status")
        .and_then(Value::as_str)
        .map(|s| s == "unresolved")
        .unwrap_or(true);
    state.readers.with_connection(move |conn| {
        let duplicates = store::duplicates_list(conn, unresolved_only)?;
        Ok(json!({ "duplicates": duplicates }))
    })
}

fn duplicates_resolve(state: &ServerState, arguments: &Value) -> Result<Value> {
    let id = required_str(arguments, "id")?;
    let resolution = required_str(arguments, "resolution")?;
    let resolved = state
        .writer
        .submit(move |conn| store::duplicate_resolve(conn, &id, &resolution))?;
    if !resolved {
        return Err(HoardError::NotFound("duplicate not found".into()));
    }
    Ok(json!({ "resolved": true }))
}

fn required_str(arguments: &Value, key: &str) -> Result<String> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or_else(|| HoardError::Validation(format!("{} is required", key)))
}
