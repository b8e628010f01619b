//! Handlers for the `admin.agent.*` tool group

use serde_json::{json, Value};

use crate::auth::tokens::{delete_agent, generate_token, list_agents, register_agent, AgentRegistration};
use crate::auth::{require_scope, Principal};
use crate::error::{HoardError, Result};
use crate::mcp::tools::Tool;
use crate::mcp::ServerState;

pub fn dispatch(
    state: &ServerState,
    tool: Tool,
    arguments: &Value,
    principal: &Principal,
) -> Result<Value> {
    require_scope(principal, "admin")?;
    match tool {
        Tool::AdminAgentRegister => agent_register(state, arguments),
        Tool::AdminAgentList => agent_list(state),
        Tool::AdminAgentRemove => agent_remove(state, arguments),
        _ => Err(HoardError::UnknownTool(tool.name().to_string())),
    }
}

fn agent_register(state: &ServerState, arguments: &Value) -> Result<Value> {
    let agent_id = arguments
        .get("agent_id")
        .and_then(Value::as_str)
        .ok_or_else(|| HoardError::Validation("agent_id is required".into()))?
        .to_string();
    let scopes: Vec<String> = arguments
        .get("scopes")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default();
    if scopes.is_empty() {
        return Err(HoardError::Validation("scopes are required".into()));
    }
    let server_secret = state
        .config
        .server_secret()
        .ok_or_else(|| HoardError::Config("server secret is not configured".into()))?;

    let mut registration = AgentRegistration::new(agent_id.clone(), scopes);
    if let Some(rate_limit) = arguments.get("rate_limit_per_hour").and_then(Value::as_i64) {
        registration.rate_limit_per_hour = rate_limit;
    }
    if let Some(ttl) = arguments.get("proposal_ttl_days").and_then(Value::as_i64) {
        registration.proposal_ttl_days = Some(ttl);
    }
    registration.overwrite = arguments
        .get("overwrite")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    // The raw token is returned exactly once.
    let token = generate_token();
    let token_for_insert = token.clone();
    state
        .writer
        .submit(move |conn| register_agent(conn, &registration, &token_for_insert, &server_secret))?;

    Ok(json!({ "agent_id": agent_id, "token": token }))
}

fn agent_list(state: &ServerState) -> Result<Value> {
    state.readers.with_connection(|conn| {
        let agents = list_agents(conn)?;
        Ok(json!({ "agents": agents }))
    })
}

fn agent_remove(state: &ServerState, arguments: &Value) -> Result<Value> {
    let agent_id = arguments
        .get("agent_id")
        .and_then(Value::as_str)
        .ok_or_else(|| HoardError::Validation("agent_id is required".into()))?
        .to_string();
    let removed = state
        .writer
        .submit(move |conn| delete_agent(conn, &agent_id))?;
    if !removed {
        return Err(HoardError::NotFound("agent not found".into()));
    }
    Ok(json!({ "removed": true }))
}
