//! Handlers for the `data.*` tool group

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Value};

use crate::auth::{require_any_scope, require_scope, Principal};
use crate::error::{HoardError, Result};
use crate::mcp::tools::Tool;
use crate::mcp::ServerState;
use crate::search::{hybrid_search, unified_search};

pub fn dispatch(
    state: &ServerState,
    tool: Tool,
    arguments: &Value,
    principal: &Principal,
) -> Result<Value> {
    match tool {
        Tool::DataSearch => data_search(state, arguments, principal),
        Tool::DataGet => data_get(state, arguments, principal),
        Tool::DataGetChunk => data_get_chunk(state, arguments, principal),
        _ => Err(HoardError::UnknownTool(tool.name().to_string())),
    }
}

fn data_search(state: &ServerState, arguments: &Value, principal: &Principal) -> Result<Value> {
    require_scope(principal, "search")?;

    let query = arguments
        .get("query")
        .and_then(Value::as_str)
        .ok_or_else(|| HoardError::Validation("query is required".into()))?
        .to_string();
    let limit = arguments
        .get("limit")
        .and_then(Value::as_u64)
        .unwrap_or(10)
        .clamp(1, 100) as usize;
    let offset: usize = arguments
        .get("cursor")
        .and_then(Value::as_str)
        .map(|cursor| {
            cursor
                .parse()
                .map_err(|_| HoardError::Validation(format!("Bad cursor: {}", cursor)))
        })
        .transpose()?
        .unwrap_or(0);
    let source = arguments
        .get("source")
        .and_then(Value::as_str)
        .map(String::from);
    let types: Vec<String> = arguments
        .get("types")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default();
    let include_memory = arguments
        .get("include_memory")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let config = state.config.clone();
    let embedder = if config.vectors.enabled {
        state.embedders.get(&config.vectors).ok()
    } else {
        None
    };
    let principal = principal.clone();

    state.readers.with_connection(move |conn| {
        if include_memory {
            let hits = unified_search(
                conn,
                &query,
                limit,
                source.as_deref(),
                true,
                &principal,
                &config,
                embedder.as_deref(),
            )?;
            return Ok(json!({
                "results": hits,
                "next_cursor": null,
            }));
        }

        // Fetch one entity past the requested page to detect the tail.
        let mut entities = hybrid_search(
            conn,
            &query,
            offset + limit + 1,
            source.as_deref(),
            principal.max_sensitivity(),
            &config,
            embedder.as_deref(),
            None,
        )?;
        if !types.is_empty() {
            let allowed = entity_ids_of_types(conn, &types)?;
            entities.retain(|entity| allowed.contains(&entity.entity_id));
        }

        let has_more = entities.len() > offset + limit;
        let page: Vec<_> = entities
            .into_iter()
            .skip(offset)
            .take(limit)
            .collect();
        let next_cursor = if has_more {
            Value::from((offset + limit).to_string())
        } else {
            Value::Null
        };
        Ok(json!({
            "results": page,
            "next_cursor": next_cursor,
        }))
    })
}

fn entity_ids_of_types(
    conn: &Connection,
    types: &[String],
) -> Result<std::collections::HashSet<String>> {
    let placeholders: Vec<&str> = types.iter().map(|_| "?").collect();
    let sql = format!(
        "SELECT id FROM entities WHERE entity_type IN ({})",
        placeholders.join(",")
    );
    let mut stmt = conn.prepare(&sql)?;
    let bind: Vec<&dyn rusqlite::ToSql> =
        types.iter().map(|t| t as &dyn rusqlite::ToSql).collect();
    let ids = stmt
        .query_map(bind.as_slice(), |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<_, _>>()?;
    Ok(ids)
}

fn data_get(state: &ServerState, arguments: &Value, principal: &Principal) -> Result<Value> {
    require_any_scope(principal, &["get", "search"])?;

    let entity_id = arguments
        .get("entity_id")
        .and_then(Value::as_str)
        .ok_or_else(|| HoardError::Validation("entity_id is required".into()))?
        .to_string();
    let max_tier = principal.max_sensitivity();

    state.readers.with_connection(move |conn| {
        let entity = entity_json(conn, &entity_id, max_tier)?
            .ok_or_else(|| HoardError::NotFound(format!("entity {}", entity_id)))?;
        Ok(json!({ "entity": entity }))
    })
}

fn entity_json(
    conn: &Connection,
    entity_id: &str,
    max_tier: crate::types::Sensitivity,
) -> Result<Option<Value>> {
    let mut sql = String::from(
        "SELECT id, source, source_id, entity_type, title, uri, mime_type,
                tags, metadata, sensitivity, created_at, updated_at,
                synced_at, last_seen_at, tombstoned_at, content_hash
         FROM entities WHERE id = ?1 AND tombstoned_at IS NULL",
    );
    if let Some(filter) = crate::search::sensitivity_filter(max_tier, "entities") {
        sql.push_str(" AND ");
        sql.push_str(&filter);
    }
    let row = conn
        .query_row(&sql, params![entity_id], |row| {
            let tags: Option<String> = row.get(7)?;
            let metadata: Option<String> = row.get(8)?;
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "source": row.get::<_, String>(1)?,
                "source_id": row.get::<_, String>(2)?,
                "entity_type": row.get::<_, String>(3)?,
                "title": row.get::<_, Option<String>>(4)?,
                "uri": row.get::<_, Option<String>>(5)?,
                "mime_type": row.get::<_, Option<String>>(6)?,
                "tags": tags
                    .and_then(|t| serde_json::from_str::<Value>(&t).ok())
                    .unwrap_or_else(|| json!([])),
                "metadata": metadata
                    .and_then(|m| serde_json::from_str::<Value>(&m).ok())
                    .unwrap_or_else(|| json!({})),
                "sensitivity": row.get::<_, String>(9)?,
                "created_at": row.get::<_, Option<String>>(10)?,
                "updated_at": row.get::<_, Option<String>>(11)?,
                "synced_at": row.get::<_, Option<String>>(12)?,
                "last_seen_at": row.get::<_, Option<String>>(13)?,
                "tombstoned_at": row.get::<_, Option<String>>(14)?,
                "content_hash": row.get::<_, Option<String>>(15)?,
            }))
        })
        .optional()?;

    let Some(mut entity) = row else {
        return Ok(None);
    };

    let mut stmt = conn.prepare_cached(
        "SELECT id, chunk_index, content, char_offset_start, char_offset_end, chunk_type
         FROM chunks WHERE entity_id = ?1 ORDER BY chunk_index",
    )?;
    let chunks: Vec<Value> = stmt
        .query_map(params![entity_id], chunk_row_json)?
        .collect::<std::result::Result<_, _>>()?;
    entity["chunks"] = json!(chunks);
    Ok(Some(entity))
}

fn chunk_row_json(row: &rusqlite::Row) -> rusqlite::Result<Value> {
    Ok(json!({
        "chunk_id": row.get::<_, String>(0)?,
        "chunk_index": row.get::<_, i64>(1)?,
        "content": row.get::<_, String>(2)?,
        "char_offset_start": row.get::<_, Option<i64>>(3)?,
        "char_offset_end": row.get::<_, Option<i64>>(4)?,
        "chunk_type": row.get::<_, String>(5)?,
    }))
}

fn data_get_chunk(state: &ServerState, arguments: &Value, principal: &Principal) -> Result<Value> {
    require_any_scope(principal, &["get", "search"])?;

    let chunk_id = arguments
        .get("chunk_id")
        .and_then(Value::as_str)
        .ok_or_else(|| HoardError::Validation("chunk_id is required".into()))?
        .to_string();
    let context_chunks = arguments
        .get("context_chunks")
        .and_then(Value::as_i64)
        .unwrap_or(0)
        .clamp(0, 10);
    let max_tier = principal.max_sensitivity();

    state.readers.with_connection(move |conn| {
        let mut sql = String::from(
            "SELECT chunks.id, chunks.chunk_index, chunks.content,
                    chunks.char_offset_start, chunks.char_offset_end, chunks.chunk_type,
                    chunks.entity_id
             FROM chunks
             JOIN entities ON entities.id = chunks.entity_id
             WHERE chunks.id = ?1 AND entities.tombstoned_at IS NULL",
        );
        if let Some(filter) = crate::search::sensitivity_filter(max_tier, "entities") {
            sql.push_str(" AND ");
            sql.push_str(&filter);
        }
        let row: Option<(Value, String, i64)> = conn
            .query_row(&sql, params![chunk_id], |row| {
                let chunk = chunk_row_json(row)?;
                Ok((chunk, row.get::<_, String>(6)?, row.get::<_, i64>(1)?))
            })
            .optional()?;
        let Some((chunk, entity_id, chunk_index)) = row else {
            return Err(HoardError::NotFound(format!("chunk {}", chunk_id)));
        };

        let mut context: Vec<Value> = Vec::new();
        if context_chunks > 0 {
            let mut stmt = conn.prepare_cached(
                "SELECT id, chunk_index, content, char_offset_start, char_offset_end, chunk_type
                 FROM chunks
                 WHERE entity_id = ?1 AND chunk_index BETWEEN ?2 AND ?3 AND id != ?4
                 ORDER BY chunk_index",
            )?;
            context = stmt
                .query_map(
                    params![
                        entity_id,
                        chunk_index - context_chunks,
                        chunk_index + context_chunks,
                        chunk_id
                    ],
                    chunk_row_json,
                )?
                .collect::<std::result::Result<_, _>>()?;
        }

        Ok(json!({
            "chunk": chunk,
            "entity_id": entity_id,
            "context": context,
        }))
    })
}
