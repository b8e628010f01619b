//! Handlers for the `ingest.*` tool group

use serde_json::{json, Value};

use crate::auth::{require_any_scope, Principal};
use crate::embedding::build_chunk_embeddings;
use crate::error::{HoardError, Result};
use crate::ingest::inbox::write_inbox_entry;
use crate::ingest::sync::run_sync;
use crate::ingest::enabled_connectors;
use crate::mcp::tools::Tool;
use crate::mcp::ServerState;

pub fn dispatch(
    state: &ServerState,
    tool: Tool,
    arguments: &Value,
    principal: &Principal,
) -> Result<Value> {
    require_any_scope(principal, &["sync", "ingest"])?;
    match tool {
        Tool::IngestSync => ingest_sync(state, arguments, None),
        Tool::IngestRun => {
            let source = arguments
                .get("source")
                .and_then(Value::as_str)
                .ok_or_else(|| HoardError::Validation("source is required".into()))?
                .to_string();
            ingest_sync(state, arguments, Some(source))
        }
        Tool::IngestStatus => ingest_status(state),
        Tool::IngestEmbeddingsBuild => embeddings_build(state, arguments),
        Tool::IngestInboxPut => inbox_put(state, arguments),
        _ => Err(HoardError::UnknownTool(tool.name().to_string())),
    }
}

fn ingest_sync(state: &ServerState, arguments: &Value, forced: Option<String>) -> Result<Value> {
    let source = forced.or_else(|| {
        arguments
            .get("source")
            .and_then(Value::as_str)
            .map(String::from)
    });
    let report = run_sync(
        &state.writer,
        &state.config,
        source.as_deref(),
        &state.paths.sync_lock_path,
    )?;
    match report {
        Some(report) => Ok(json!(report)),
        None => Ok(json!({ "skipped": true, "reason": "sync lock held" })),
    }
}

fn ingest_status(state: &ServerState) -> Result<Value> {
    let mut connectors = Vec::new();
    for (name, connector, settings) in enabled_connectors(&state.config) {
        let discovery = connector.discover(&settings);
        connectors.push(json!({
            "name": name,
            "source": connector.source_name(),
            "version": connector.version(),
            "discovery": discovery,
        }));
    }

    state.readers.with_connection(move |conn| {
        let mut sources = Vec::new();
        let mut stmt = conn.prepare(
            "SELECT source,
                    COUNT(*) AS total,
                    SUM(CASE WHEN tombstoned_at IS NOT NULL THEN 1 ELSE 0 END) AS tombstoned,
                    MAX(synced_at) AS last_synced_at
             FROM entities GROUP BY source ORDER BY source",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(json!({
                "source": row.get::<_, String>(0)?,
                "entities": row.get::<_, i64>(1)?,
                "tombstoned": row.get::<_, i64>(2)?,
                "last_synced_at": row.get::<_, Option<String>>(3)?,
            }))
        })?;
        for row in rows {
            sources.push(row?);
        }

        let mut jobs = serde_json::Map::new();
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM background_jobs GROUP BY status",
        )?;
        let job_rows: Vec<(String, i64)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        for (status, count) in job_rows {
            jobs.insert(status, json!(count));
        }

        Ok(json!({
            "connectors": connectors,
            "sources": sources,
            "jobs": jobs,
        }))
    })
}

fn embeddings_build(state: &ServerState, arguments: &Value) -> Result<Value> {
    if !state.config.vectors.enabled {
        return Ok(json!({ "built": 0, "reason": "vectors disabled" }));
    }
    let embedder = state.embedders.get(&state.config.vectors)?;
    let batch_size = arguments
        .get("batch_size")
        .and_then(Value::as_u64)
        .unwrap_or(32) as usize;
    let source = arguments
        .get("source")
        .and_then(Value::as_str)
        .map(String::from);

    let built = state.writer.submit(move |conn| {
        build_chunk_embeddings(conn, embedder.as_ref(), batch_size, source.as_deref())
    })?;
    Ok(json!({ "built": built }))
}

fn inbox_put(state: &ServerState, arguments: &Value) -> Result<Value> {
    let content = arguments
        .get("content")
        .and_then(Value::as_str)
        .ok_or_else(|| HoardError::Validation("content is required".into()))?;
    let title = arguments.get("title").and_then(Value::as_str);
    let tags: Vec<String> = arguments
        .get("tags")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default();

    let path = write_inbox_entry(&state.config, content, title, &tags)?;
    Ok(json!({ "path": path.display().to_string() }))
}
