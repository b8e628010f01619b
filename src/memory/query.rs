//! Hybrid ranked query over active memories
//!
//! BM25 scores are normalised as `1/(1+bm25)` then max-scaled; vector
//! scores are min/max-scaled and both are combined with configurable
//! weights. Slot matches union into the ranked set with a bonus, or a
//! baseline score when unranked. With neither query nor slot the most
//! recent active memories are returned.

use std::collections::HashMap;

use rusqlite::Connection;

use crate::auth::Principal;
use crate::config::Config;
use crate::embedding::{decode_embedding, dot, Embedder};
use crate::error::Result;
use crate::memory::predicates::{active_memory_conditions, sensitivity_conditions};
use crate::memory::store::{load_tags, memory_from_row};
use crate::types::{now_iso, Memory};

/// Parameters for `memory.query`
#[derive(Debug, Clone, Default)]
pub struct MemoryQueryParams {
    pub query: Option<String>,
    pub slot: Option<String>,
    pub scope_type: Option<String>,
    pub scope_id: Option<String>,
    pub memory_types: Vec<String>,
    pub tags: Vec<String>,
    pub limit: i64,
}

/// A memory with its combined relevance score
#[derive(Debug, Clone, serde::Serialize)]
pub struct ScoredMemory {
    #[serde(flatten)]
    pub memory: Memory,
    pub score: Option<f32>,
}

const MEMORY_COLUMNS: &str = "m.id, m.content, m.memory_type, m.slot, m.scope_type, m.scope_id,
    m.source_agent, m.source_agent_version, m.source_session_id,
    m.source_conversation_id, m.source_context, m.created_at,
    m.expires_at, m.superseded_by, m.superseded_at,
    m.retracted_at, m.retracted_by, m.retraction_reason, m.sensitivity";

pub fn memory_query(
    conn: &Connection,
    params: &MemoryQueryParams,
    principal: &Principal,
    config: &Config,
    embedder: Option<&dyn Embedder>,
) -> Result<Vec<ScoredMemory>> {
    let limit = if params.limit > 0 { params.limit } else { 20 };
    let now = now_iso();

    // Base predicate: active + sensitivity + optional filters.
    let mut conditions = active_memory_conditions("m");
    let mut base_params: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(now.clone())];
    conditions.extend(sensitivity_conditions(principal, "m"));

    if let Some(scope_type) = &params.scope_type {
        conditions.push("m.scope_type = ?".to_string());
        base_params.push(Box::new(scope_type.clone()));
    }
    if let Some(scope_id) = &params.scope_id {
        conditions.push("m.scope_id = ?".to_string());
        base_params.push(Box::new(scope_id.clone()));
    }
    if !params.memory_types.is_empty() {
        let placeholders: Vec<&str> = params.memory_types.iter().map(|_| "?").collect();
        conditions.push(format!("m.memory_type IN ({})", placeholders.join(", ")));
        for memory_type in &params.memory_types {
            base_params.push(Box::new(memory_type.clone()));
        }
    }

    let mut tag_filter = String::new();
    let mut tag_params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
    for (i, tag) in params.tags.iter().enumerate() {
        tag_filter.push_str(&format!(
            " AND EXISTS (SELECT 1 FROM memory_tags t{i} WHERE t{i}.memory_id = m.id AND t{i}.tag = ?)",
            i = i
        ));
        tag_params.push(Box::new(tag.to_lowercase()));
    }

    let where_clause = conditions.join(" AND ");
    let union_limit = ((limit as f32) * config.write.query.union_multiplier) as i64;

    let query_text = params.query.as_deref().map(str::trim).unwrap_or("");
    let mut score_map: HashMap<String, f32> = HashMap::new();

    if !query_text.is_empty() {
        let fts_scores = fts_scores(
            conn,
            query_text,
            &where_clause,
            &tag_filter,
            &base_params,
            &tag_params,
            union_limit * 5,
        )?;

        let vec_scores = if config.vectors.enabled {
            match embedder {
                Some(embedder) => vector_scores(
                    conn,
                    query_text,
                    embedder,
                    &where_clause,
                    &tag_filter,
                    &base_params,
                    &tag_params,
                )
                .unwrap_or_default(),
                None => HashMap::new(),
            }
        } else {
            HashMap::new()
        };

        let w_fts = config.write.query.hybrid_weight_fts;
        let w_vec = config.write.query.hybrid_weight_vector;
        for id in fts_scores.keys().chain(vec_scores.keys()) {
            if score_map.contains_key(id) {
                continue;
            }
            let score = fts_scores.get(id).copied().unwrap_or(0.0) * w_fts
                + vec_scores.get(id).copied().unwrap_or(0.0) * w_vec;
            score_map.insert(id.clone(), score);
        }
    }

    if let Some(slot) = &params.slot {
        let sql = format!(
            "SELECT m.id FROM memories m
             WHERE {} AND m.slot = ?{}
             ORDER BY m.created_at DESC LIMIT ?",
            where_clause, tag_filter
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut bind: Vec<&dyn rusqlite::ToSql> =
            base_params.iter().map(|b| b.as_ref()).collect();
        bind.push(slot);
        for tag in &tag_params {
            bind.push(tag.as_ref());
        }
        bind.push(&union_limit);

        let slot_ids: Vec<String> = stmt
            .query_map(bind.as_slice(), |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        for id in slot_ids {
            match score_map.get_mut(&id) {
                Some(score) => *score += config.write.query.slot_match_bonus,
                None => {
                    score_map.insert(id, config.write.query.slot_only_baseline);
                }
            }
        }
    }

    // Recency fallback without query and slot.
    if query_text.is_empty() && params.slot.is_none() {
        let sql = format!(
            "SELECT {} FROM memories m
             WHERE {}{}
             ORDER BY m.created_at DESC LIMIT ?",
            MEMORY_COLUMNS, where_clause, tag_filter
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut bind: Vec<&dyn rusqlite::ToSql> =
            base_params.iter().map(|b| b.as_ref()).collect();
        for tag in &tag_params {
            bind.push(tag.as_ref());
        }
        bind.push(&limit);

        let mut results = Vec::new();
        let memories: Vec<Memory> = stmt
            .query_map(bind.as_slice(), memory_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        for mut memory in memories {
            memory.tags = load_tags(conn, &memory.id)?;
            results.push(ScoredMemory {
                memory,
                score: None,
            });
        }
        return Ok(results);
    }

    let mut ranked: Vec<(String, f32)> = score_map.into_iter().collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    ranked.truncate(limit as usize);

    let mut results = Vec::with_capacity(ranked.len());
    for (id, score) in ranked {
        if let Some(mut memory) = crate::memory::store::memory_get(conn, &id)? {
            memory.relations.clear();
            results.push(ScoredMemory {
                memory,
                score: Some(score),
            });
        }
    }
    Ok(results)
}

/// BM25 scores normalised as `1/(1+bm25)` then scaled by the max
fn fts_scores(
    conn: &Connection,
    query: &str,
    where_clause: &str,
    tag_filter: &str,
    base_params: &[Box<dyn rusqlite::ToSql>],
    tag_params: &[Box<dyn rusqlite::ToSql>],
    fetch_limit: i64,
) -> Result<HashMap<String, f32>> {
    let escaped = escape_fts_query(query);
    let sql = format!(
        "SELECT m.id, bm25(memories_fts) AS bm25_score
         FROM memories_fts
         JOIN memories m ON memories_fts.rowid = m.rowid
         WHERE memories_fts MATCH ? AND {}{}
         ORDER BY bm25(memories_fts)
         LIMIT ?",
        where_clause, tag_filter
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut bind: Vec<&dyn rusqlite::ToSql> = vec![&escaped];
    for param in base_params {
        bind.push(param.as_ref());
    }
    for param in tag_params {
        bind.push(param.as_ref());
    }
    bind.push(&fetch_limit);

    let rows: Vec<(String, f64)> = stmt
        .query_map(bind.as_slice(), |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut scores: HashMap<String, f32> = rows
        .into_iter()
        .map(|(id, bm25)| (id, 1.0 / (1.0 + bm25.abs() as f32)))
        .collect();

    let max = scores.values().cloned().fold(0.0_f32, f32::max);
    if max > 0.0 {
        for score in scores.values_mut() {
            *score /= max;
        }
    }
    Ok(scores)
}

/// Cosine scores against candidate embeddings, min/max-scaled.
///
/// A candidate set with fewer than two members keeps its raw score;
/// min/max collapses to a degenerate 0 otherwise.
fn vector_scores(
    conn: &Connection,
    query: &str,
    embedder: &dyn Embedder,
    where_clause: &str,
    tag_filter: &str,
    base_params: &[Box<dyn rusqlite::ToSql>],
    tag_params: &[Box<dyn rusqlite::ToSql>],
) -> Result<HashMap<String, f32>> {
    let query_vec = embedder
        .encode(&[query.to_string()])?
        .into_iter()
        .next()
        .unwrap_or_default();
    if query_vec.is_empty() {
        return Ok(HashMap::new());
    }

    let sql = format!(
        "SELECT e.memory_id, e.embedding, e.dimensions
         FROM memory_embeddings e
         JOIN memories m ON m.id = e.memory_id
         WHERE e.model_name = ? AND {}{}",
        where_clause, tag_filter
    );
    let model_name = embedder.model_name().to_string();
    let mut stmt = conn.prepare(&sql)?;
    let mut bind: Vec<&dyn rusqlite::ToSql> = vec![&model_name];
    for param in base_params {
        bind.push(param.as_ref());
    }
    for param in tag_params {
        bind.push(param.as_ref());
    }

    let rows: Vec<(String, Vec<u8>, usize)> = stmt
        .query_map(bind.as_slice(), |row| {
            Ok((row.get(0)?, row.get(1)?, row.get::<_, i64>(2)? as usize))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut scores: HashMap<String, f32> = HashMap::new();
    for (memory_id, blob, dims) in rows {
        if dims != embedder.dims() {
            continue;
        }
        let Ok(vector) = decode_embedding(&blob, dims) else {
            continue;
        };
        scores.insert(memory_id, dot(&query_vec, &vector));
    }

    if scores.len() >= 2 {
        let max = scores.values().cloned().fold(f32::MIN, f32::max);
        let min = scores.values().cloned().fold(f32::MAX, f32::min);
        let denom = if (max - min).abs() > f32::EPSILON {
            max - min
        } else {
            1.0
        };
        for score in scores.values_mut() {
            *score = (*score - min) / denom;
        }
    }
    Ok(scores)
}

/// Quote each token so user input cannot break FTS5 query syntax
pub(crate) fn escape_fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|token| format!("\"{}\"", token.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}
