//! Tool catalogue and dispatch
//!
//! Tools are an enum of canonical dotted names plus a small table of
//! legacy underscore aliases. Aliases dispatch identically and are
//! listed with a deprecation marker; the first use of each alias is
//! logged once.

use std::collections::HashSet;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::warn;

use crate::auth::Principal;
use crate::error::{HoardError, Result};
use crate::mcp::ServerState;

/// Canonical tool set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    DataSearch,
    DataGet,
    DataGetChunk,
    MemoryWrite,
    MemoryGet,
    MemoryQuery,
    MemoryRetract,
    MemorySupersede,
    MemoryPropose,
    MemoryReview,
    MemorySearch,
    MemoryConflictsList,
    MemoryConflictsResolve,
    MemoryDuplicatesList,
    MemoryDuplicatesResolve,
    IngestSync,
    IngestStatus,
    IngestRun,
    IngestEmbeddingsBuild,
    IngestInboxPut,
    AdminAgentRegister,
    AdminAgentList,
    AdminAgentRemove,
}

impl Tool {
    pub const ALL: &'static [Tool] = &[
        Tool::DataSearch,
        Tool::DataGet,
        Tool::DataGetChunk,
        Tool::MemoryWrite,
        Tool::MemoryGet,
        Tool::MemoryQuery,
        Tool::MemoryRetract,
        Tool::MemorySupersede,
        Tool::MemoryPropose,
        Tool::MemoryReview,
        Tool::MemorySearch,
        Tool::MemoryConflictsList,
        Tool::MemoryConflictsResolve,
        Tool::MemoryDuplicatesList,
        Tool::MemoryDuplicatesResolve,
        Tool::IngestSync,
        Tool::IngestStatus,
        Tool::IngestRun,
        Tool::IngestEmbeddingsBuild,
        Tool::IngestInboxPut,
        Tool::AdminAgentRegister,
        Tool::AdminAgentList,
        Tool::AdminAgentRemove,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Tool::DataSearch => "data.search",
            Tool::DataGet => "data.get",
            Tool::DataGetChunk => "data.get_chunk",
            Tool::MemoryWrite => "memory.write",
            Tool::MemoryGet => "memory.get",
            Tool::MemoryQuery => "memory.query",
            Tool::MemoryRetract => "memory.retract",
            Tool::MemorySupersede => "memory.supersede",
            Tool::MemoryPropose => "memory.propose",
            Tool::MemoryReview => "memory.review",
            Tool::MemorySearch => "memory.search",
            Tool::MemoryConflictsList => "memory.conflicts.list",
            Tool::MemoryConflictsResolve => "memory.conflicts.resolve",
            Tool::MemoryDuplicatesList => "memory.duplicates.list",
            Tool::MemoryDuplicatesResolve => "memory.duplicates.resolve",
            Tool::IngestSync => "ingest.sync",
            Tool::IngestStatus => "ingest.status",
            Tool::IngestRun => "ingest.run",
            Tool::IngestEmbeddingsBuild => "ingest.embeddings.build",
            Tool::IngestInboxPut => "ingest.inbox.put",
            Tool::AdminAgentRegister => "admin.agent.register",
            Tool::AdminAgentList => "admin.agent.list",
            Tool::AdminAgentRemove => "admin.agent.remove",
        }
    }

    /// Tools that mutate the store; these run through the write
    /// coordinator and are disabled on the stdio transport.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Tool::MemoryWrite
                | Tool::MemoryRetract
                | Tool::MemorySupersede
                | Tool::MemoryPropose
                | Tool::MemoryReview
                | Tool::MemoryConflictsResolve
                | Tool::MemoryDuplicatesResolve
                | Tool::IngestSync
                | Tool::IngestRun
                | Tool::IngestEmbeddingsBuild
                | Tool::IngestInboxPut
                | Tool::AdminAgentRegister
                | Tool::AdminAgentRemove
        )
    }

    fn description(&self) -> &'static str {
        match self {
            Tool::DataSearch => "Hybrid search over ingested documents",
            Tool::DataGet => "Fetch one entity with its chunks",
            Tool::DataGetChunk => "Fetch one chunk with optional surrounding context",
            Tool::MemoryWrite => "Store a new memory",
            Tool::MemoryGet => "Fetch one memory by id (any lifecycle state)",
            Tool::MemoryQuery => "Ranked query over active memories",
            Tool::MemoryRetract => "Retract a memory",
            Tool::MemorySupersede => "Mark a memory superseded by another",
            Tool::MemoryPropose => "Propose a memory for review",
            Tool::MemoryReview => "Approve or reject a pending proposal",
            Tool::MemorySearch => "Lexical/semantic search over active memories",
            Tool::MemoryConflictsList => "List slot conflict clusters",
            Tool::MemoryConflictsResolve => "Resolve a conflict cluster",
            Tool::MemoryDuplicatesList => "List duplicate clusters",
            Tool::MemoryDuplicatesResolve => "Resolve a duplicate cluster",
            Tool::IngestSync => "Run all enabled connectors",
            Tool::IngestStatus => "Connector and job queue status",
            Tool::IngestRun => "Run one connector by source name",
            Tool::IngestEmbeddingsBuild => "Build missing chunk embeddings",
            Tool::IngestInboxPut => "Drop a note into the inbox",
            Tool::AdminAgentRegister => "Register an agent token",
            Tool::AdminAgentList => "List registered agents",
            Tool::AdminAgentRemove => "Remove an agent token",
        }
    }
}

/// Legacy underscore-style aliases, kept for older clients
pub const LEGACY_ALIASES: &[(&str, &str)] = &[
    ("search", "data.search"),
    ("get", "data.get"),
    ("get_chunk", "data.get_chunk"),
    ("memory_write", "memory.write"),
    ("memory_get", "memory.get"),
    ("memory_query", "memory.query"),
    ("memory_retract", "memory.retract"),
    ("memory_supersede", "memory.supersede"),
    ("memory_propose", "memory.propose"),
    ("memory_review", "memory.review"),
    ("memory_search", "memory.search"),
    ("conflicts_list", "memory.conflicts.list"),
    ("conflict_resolve", "memory.conflicts.resolve"),
    ("duplicates_list", "memory.duplicates.list"),
    ("duplicate_resolve", "memory.duplicates.resolve"),
    ("sync", "ingest.sync"),
    ("sync_status", "ingest.status"),
    ("sync_run", "ingest.run"),
    ("embeddings_build", "ingest.embeddings.build"),
    ("inbox_put", "ingest.inbox.put"),
    ("agent_register", "admin.agent.register"),
    ("agent_list", "admin.agent.list"),
    ("agent_remove", "admin.agent.remove"),
];

static WARNED_ALIASES: Mutex<Option<HashSet<String>>> = Mutex::new(None);

/// Map a legacy alias onto its canonical name; canonical names pass
/// through unchanged.
pub fn canonical_tool_name(name: &str) -> &str {
    LEGACY_ALIASES
        .iter()
        .find(|(alias, _)| *alias == name)
        .map(|(_, canonical)| *canonical)
        .unwrap_or(name)
}

/// Resolve a tool name (canonical or legacy) onto the enum.
pub fn resolve_tool(name: &str) -> Result<Tool> {
    let canonical = canonical_tool_name(name);
    if canonical != name {
        let mut warned = WARNED_ALIASES.lock();
        let warned = warned.get_or_insert_with(HashSet::new);
        if warned.insert(name.to_string()) {
            warn!(alias = name, canonical, "legacy tool alias used");
        }
    }
    Tool::ALL
        .iter()
        .find(|tool| tool.name() == canonical)
        .copied()
        .ok_or_else(|| HoardError::UnknownTool(name.to_string()))
}

/// Catalogue for `tools/list`: canonical entries plus deprecated
/// legacy aliases.
pub fn tool_definitions() -> Vec<Value> {
    let mut definitions = Vec::new();
    for tool in Tool::ALL {
        definitions.push(json!({
            "name": tool.name(),
            "description": tool.description(),
            "inputSchema": input_schema(*tool),
        }));
    }
    for (alias, canonical) in LEGACY_ALIASES {
        let tool = Tool::ALL
            .iter()
            .find(|tool| tool.name() == *canonical)
            .expect("alias table matches the catalogue");
        definitions.push(json!({
            "name": alias,
            "description": format!(
                "{} (Legacy alias; prefer `{}`.)",
                tool.description(),
                canonical
            ),
            "inputSchema": input_schema(*tool),
            "deprecated": true,
        }));
    }
    definitions
}

fn input_schema(tool: Tool) -> Value {
    let (properties, required): (Value, Vec<&str>) = match tool {
        Tool::DataSearch => (
            json!({
                "query": { "type": "string" },
                "limit": { "type": "integer" },
                "cursor": { "type": "string" },
                "source": { "type": "string" },
                "types": { "type": "array", "items": { "type": "string" } },
                "include_memory": { "type": "boolean" },
            }),
            vec!["query"],
        ),
        Tool::DataGet => (json!({ "entity_id": { "type": "string" } }), vec!["entity_id"]),
        Tool::DataGetChunk => (
            json!({
                "chunk_id": { "type": "string" },
                "context_chunks": { "type": "integer" },
            }),
            vec!["chunk_id"],
        ),
        Tool::MemoryWrite => (
            json!({
                "content": { "type": "string" },
                "memory_type": { "type": "string" },
                "scope_type": { "type": "string" },
                "scope_id": { "type": "string" },
                "slot": { "type": "string" },
                "tags": { "type": "array", "items": { "type": "string" } },
                "relations": { "type": "array" },
                "expires_at": { "type": "string" },
                "sensitivity": { "type": "string" },
            }),
            vec!["content", "memory_type", "scope_type"],
        ),
        Tool::MemoryGet => (json!({ "id": { "type": "string" } }), vec!["id"]),
        Tool::MemoryQuery | Tool::MemorySearch => (
            json!({
                "query": { "type": "string" },
                "slot": { "type": "string" },
                "scope_type": { "type": "string" },
                "scope_id": { "type": "string" },
                "memory_type": { "type": "string" },
                "tags": { "type": "array", "items": { "type": "string" } },
                "limit": { "type": "integer" },
            }),
            vec![],
        ),
        Tool::MemoryRetract => (
            json!({ "id": { "type": "string" }, "reason": { "type": "string" } }),
            vec!["id"],
        ),
        Tool::MemorySupersede => (
            json!({ "id": { "type": "string" }, "superseded_by": { "type": "string" } }),
            vec!["id", "superseded_by"],
        ),
        Tool::MemoryPropose => (
            json!({ "memory": { "type": "object" }, "ttl_days": { "type": "integer" } }),
            vec!["memory"],
        ),
        Tool::MemoryReview => (
            json!({ "id": { "type": "string" }, "approved": { "type": "boolean" } }),
            vec!["id", "approved"],
        ),
        Tool::MemoryConflictsList | Tool::MemoryDuplicatesList => (
            json!({ "status": { "type": "string" } }),
            vec![],
        ),
        Tool::MemoryConflictsResolve => (
            json!({ "id": { "type": "string" }, "resolution": { "type": "string" } }),
            vec!["id", "resolution"],
        ),
        Tool::MemoryDuplicatesResolve => (
            json!({ "id": { "type": "string" }, "resolution": { "type": "string" } }),
            vec!["id", "resolution"],
        ),
        Tool::IngestSync | Tool::IngestStatus => (
            json!({ "source": { "type": "string" } }),
            vec![],
        ),
        Tool::IngestRun => (json!({ "source": { "type": "string" } }), vec!["source"]),
        Tool::IngestEmbeddingsBuild => (
            json!({ "source": { "type": "string" }, "batch_size": { "type": "integer" } }),
            vec![],
        ),
        Tool::IngestInboxPut => (
            json!({
                "content": { "type": "string" },
                "title": { "type": "string" },
                "tags": { "type": "array", "items": { "type": "string" } },
            }),
            vec!["content"],
        ),
        Tool::AdminAgentRegister => (
            json!({
                "agent_id": { "type": "string" },
                "scopes": { "type": "array", "items": { "type": "string" } },
                "rate_limit_per_hour": { "type": "integer" },
                "overwrite": { "type": "boolean" },
            }),
            vec!["agent_id", "scopes"],
        ),
        Tool::AdminAgentList => (json!({}), vec![]),
        Tool::AdminAgentRemove => (json!({ "agent_id": { "type": "string" } }), vec!["agent_id"]),
    };
    let mut schema = json!({
        "type": "object",
        "properties": properties,
    });
    schema["properties"]["token"] = json!({ "type": "string" });
    if !required.is_empty() {
        schema["required"] = json!(required);
    }
    schema
}

/// Dispatch a resolved tool to its handler
pub fn dispatch(
    state: &ServerState,
    tool: Tool,
    arguments: &Value,
    principal: &Principal,
) -> Result<Value> {
    match tool {
        Tool::DataSearch | Tool::DataGet | Tool::DataGetChunk => {
            crate::mcp::tools_data::dispatch(state, tool, arguments, principal)
        }
        Tool::MemoryWrite
        | Tool::MemoryGet
        | Tool::MemoryQuery
        | Tool::MemoryRetract
        | Tool::MemorySupersede
        | Tool::MemoryPropose
        | Tool::MemoryReview
        | Tool::MemorySearch
        | Tool::MemoryConflictsList
        | Tool::MemoryConflictsResolve
        | Tool::MemoryDuplicatesList
        | Tool::MemoryDuplicatesResolve => {
            crate::mcp::tools_memory::dispatch(state, tool, arguments, principal)
        }
        Tool::IngestSync
        | Tool::IngestStatus
        | Tool::IngestRun
        | Tool::IngestEmbeddingsBuild
        | Tool::IngestInboxPut => {
            crate::mcp::tools_ingest::dispatch(state, tool, arguments, principal)
        }
        Tool::AdminAgentRegister | Tool::AdminAgentList | Tool::AdminAgentRemove => {
            crate::mcp::tools_admin::dispatch(state, tool, arguments, principal)
        }
    }
}

/// Chunk count of a response, for quota accounting
pub fn count_chunks(response: &Value) -> u64 {
    if let Some(results) = response.get("results").and_then(Value::as_array) {
        return results
            .iter()
            .map(|entry| {
                entry
                    .get("chunks")
                    .and_then(Value::as_array)
                    .map(|chunks| chunks.len() as u64)
                    .unwrap_or(0)
            })
            .sum();
    }
    if let Some(entity) = response.get("entity") {
        return entity
            .get("chunks")
            .and_then(Value::as_array)
            .map(|chunks| chunks.len() as u64)
            .unwrap_or(0);
    }
    if response.get("chunk").is_some() {
        return 1;
    }
    0
}
