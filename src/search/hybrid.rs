//! Hybrid search: BM25 and vector ranks fused by RRF
//!
//! BM25 always runs over the filtered chunk corpus; when vectors are
//! enabled the query is encoded once and ranked by cosine. On a large
//! corpus BM25 becomes a prefilter feeding the vector scan. Fused
//! chunks are grouped into entities in descending score. A missing
//! model or ANN failure degrades to BM25-only with a warning, never an
//! error to the caller.

use std::collections::HashMap;

use rusqlite::Connection;
use serde::Serialize;
use tracing::warn;

use crate::auth::Principal;
use crate::config::Config;
use crate::embedding::Embedder;
use crate::error::Result;
use crate::memory::query::{memory_query, MemoryQueryParams, ScoredMemory};
use crate::search::bm25::search_chunks_flat;
use crate::search::vector::{vector_search, AnnBackend, AnnParams};
use crate::search::sensitivity_filter;
use crate::types::Sensitivity;

/// Corpus size beyond which BM25 becomes a prefilter for vectors
const PREFILTER_CORPUS_THRESHOLD: i64 = 50_000;

/// One ranked chunk inside an entity group
#[derive(Debug, Clone, Serialize)]
pub struct ScoredChunk {
    pub chunk_id: String,
    pub content: String,
    pub score: f64,
    pub bm25_score: Option<f64>,
    pub vector_score: Option<f64>,
    pub char_offset_start: Option<i64>,
    pub char_offset_end: Option<i64>,
}

/// Entity-grouped search result
#[derive(Debug, Clone, Serialize)]
pub struct EntityResult {
    pub entity_id: String,
    pub entity_title: Option<String>,
    pub source: String,
    pub uri: Option<String>,
    pub entity_updated_at: Option<String>,
    pub chunks: Vec<ScoredChunk>,
}

/// Unified result joining entities and memories with type annotations
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result_type", rename_all = "lowercase")]
pub enum UnifiedHit {
    Entity { score: f64, entity: EntityResult },
    Memory { score: f64, memory: ScoredMemory },
}

impl UnifiedHit {
    pub fn score(&self) -> f64 {
        match self {
            UnifiedHit::Entity { score, .. } => *score,
            UnifiedHit::Memory { score, .. } => *score,
        }
    }
}

/// Hybrid entity search with reciprocal-rank fusion
#[allow(clippy::too_many_arguments)]
pub fn hybrid_search(
    conn: &Connection,
    query: &str,
    limit: usize,
    source: Option<&str>,
    max_tier: Sensitivity,
    config: &Config,
    embedder: Option<&dyn Embedder>,
    ann: Option<(&dyn AnnBackend, AnnParams)>,
) -> Result<Vec<EntityResult>> {
    if query.trim().is_empty() {
        return Ok(Vec::new());
    }

    let rrf_k = config.search.rrf_k as f64;
    let max_chunks_per_entity = config.search.max_chunks_per_entity;

    let vectors_enabled = config.vectors.enabled && embedder.is_some();
    let total_chunks = count_chunks(conn, source, max_tier)?;
    let use_prefilter = vectors_enabled && total_chunks > PREFILTER_CORPUS_THRESHOLD;

    let bm25_limit = if use_prefilter {
        config.vectors.prefilter_limit as i64
    } else {
        (limit as i64 * 20).max(200)
    };

    let bm25_hits = search_chunks_flat(conn, query, bm25_limit, 0, source, max_tier)?;
    let mut bm25_rank: HashMap<String, usize> = HashMap::new();
    let mut bm25_scores: HashMap<String, f64> = HashMap::new();
    for (rank, hit) in bm25_hits.iter().enumerate() {
        bm25_rank.insert(hit.chunk_id.clone(), rank + 1);
        bm25_scores.insert(hit.chunk_id.clone(), hit.score);
    }

    let mut vector_rank: HashMap<String, usize> = HashMap::new();
    let mut vector_scores: HashMap<String, f64> = HashMap::new();
    if vectors_enabled {
        let embedder = embedder.expect("vectors_enabled implies embedder");
        match embedder.encode(&[query.to_string()]) {
            Ok(mut encoded) => {
                let query_vector = encoded.pop().unwrap_or_default();
                let candidate_ids: Option<Vec<String>> = if use_prefilter {
                    Some(bm25_hits.iter().map(|h| h.chunk_id.clone()).collect())
                } else {
                    None
                };
                let results = vector_search(
                    conn,
                    &query_vector,
                    embedder.model_name(),
                    bm25_limit as usize,
                    candidate_ids.as_deref(),
                    source,
                    max_tier,
                    config.vectors.vector_candidate_limit,
                    ann,
                )?;
                for (rank, (chunk_id, score)) in results.into_iter().enumerate() {
                    vector_rank.insert(chunk_id.clone(), rank + 1);
                    vector_scores.insert(chunk_id, score as f64);
                }
            }
            Err(e) => {
                warn!(error = %e, "query encoding failed, degrading to BM25-only");
            }
        }
    }

    // RRF: score = 1/(k + rank_bm25) + 1/(k + rank_vec)
    let mut fused: Vec<(String, f64)> = bm25_rank
        .keys()
        .chain(vector_rank.keys())
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .map(|chunk_id| {
            let mut score = 0.0;
            if let Some(rank) = bm25_rank.get(chunk_id) {
                score += 1.0 / (rrf_k + *rank as f64);
            }
            if let Some(rank) = vector_rank.get(chunk_id) {
                score += 1.0 / (rrf_k + *rank as f64);
            }
            (chunk_id.clone(), score)
        })
        .collect();
    fused.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let chunk_ids: Vec<String> = fused.iter().map(|(id, _)| id.clone()).collect();
    let details = fetch_chunk_details(conn, &chunk_ids)?;

    let mut grouped: Vec<EntityResult> = Vec::new();
    for (chunk_id, score) in fused {
        let Some(detail) = details.get(&chunk_id) else {
            continue;
        };
        let entry = match grouped
            .iter_mut()
            .find(|e| e.entity_id == detail.entity_id)
        {
            Some(entry) => entry,
            None => {
                if grouped.len() >= limit {
                    continue;
                }
                grouped.push(EntityResult {
                    entity_id: detail.entity_id.clone(),
                    entity_title: detail.entity_title.clone(),
                    source: detail.source.clone(),
                    uri: detail.uri.clone(),
                    entity_updated_at: detail.entity_updated_at.clone(),
                    chunks: Vec::new(),
                });
                grouped.last_mut().expect("just pushed")
            }
        };
        if entry.chunks.len() >= max_chunks_per_entity {
            continue;
        }
        entry.chunks.push(ScoredChunk {
            chunk_id: chunk_id.clone(),
            content: detail.content.clone(),
            score,
            bm25_score: bm25_scores.get(&chunk_id).copied(),
            vector_score: vector_scores.get(&chunk_id).copied(),
            char_offset_start: detail.char_offset_start,
            char_offset_end: detail.char_offset_end,
        });
    }

    Ok(grouped)
}

/// Unified ranker joining entities and memories.
///
/// Memory results are included only when the caller holds a
/// memory-read scope; both lists are fused with the same RRF constant
/// and annotated by type.
#[allow(clippy::too_many_arguments)]
pub fn unified_search(
    conn: &Connection,
    query: &str,
    limit: usize,
    source: Option<&str>,
    include_memory: bool,
    principal: &Principal,
    config: &Config,
    embedder: Option<&dyn Embedder>,
) -> Result<Vec<UnifiedHit>> {
    let entities = hybrid_search(
        conn,
        query,
        limit,
        source,
        principal.max_sensitivity(),
        config,
        embedder,
        None,
    )?;

    let memories = if include_memory && principal.has_any_scope(["memory", "memory.read"]) {
        let params = MemoryQueryParams {
            query: Some(query.to_string()),
            limit: limit as i64,
            ..Default::default()
        };
        memory_query(conn, &params, principal, config, embedder)?
    } else {
        Vec::new()
    };

    let k = config.search.rrf_k as f64;
    let mut hits: Vec<UnifiedHit> = Vec::new();
    for (rank, entity) in entities.into_iter().enumerate() {
        hits.push(UnifiedHit::Entity {
            score: 1.0 / (k + rank as f64 + 1.0),
            entity,
        });
    }
    for (rank, memory) in memories.into_iter().enumerate() {
        hits.push(UnifiedHit::Memory {
            score: 1.0 / (k + rank as f64 + 1.0),
            memory,
        });
    }
    hits.sort_by(|a, b| {
        b.score()
            .partial_cmp(&a.score())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    hits.truncate(limit);
    Ok(hits)
}

fn count_chunks(conn: &Connection, source: Option<&str>, max_tier: Sensitivity) -> Result<i64> {
    let mut filters = vec!["entities.tombstoned_at IS NULL".to_string()];
    let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
    if let Some(source) = source {
        filters.push("entities.source = ?".to_string());
        params.push(Box::new(source.to_string()));
    }
    if let Some(filter) = sensitivity_filter(max_tier, "entities") {
        filters.push(filter);
    }
    let sql = format!(
        "SELECT COUNT(*) FROM chunks
         JOIN entities ON entities.id = chunks.entity_id
         WHERE {}",
        filters.join(" AND ")
    );
    let bind: Vec<&dyn rusqlite::ToSql> = params.iter().map(|b| b.as_ref()).collect();
    let count = conn.query_row(&sql, bind.as_slice(), |row| row.get(0))?;
    Ok(count)
}

struct ChunkDetail {
    entity_id: String,
    content: String,
    char_offset_start: Option<i64>,
    char_offset_end: Option<i64>,
    entity_title: Option<String>,
    source: String,
    uri: Option<String>,
    entity_updated_at: Option<String>,
}

fn fetch_chunk_details(
    conn: &Connection,
    chunk_ids: &[String],
) -> Result<HashMap<String, ChunkDetail>> {
    if chunk_ids.is_empty() {
        return Ok(HashMap::new());
    }
    let placeholders: Vec<&str> = chunk_ids.iter().map(|_| "?").collect();
    let sql = format!(
        "SELECT chunks.id, chunks.entity_id, chunks.content,
                chunks.char_offset_start, chunks.char_offset_end,
                entities.title, entities.source, entities.uri, entities.updated_at
         FROM chunks
         JOIN entities ON entities.id = chunks.entity_id
         WHERE chunks.id IN ({})",
        placeholders.join(",")
    );
    let mut stmt = conn.prepare(&sql)?;
    let bind: Vec<&dyn rusqlite::ToSql> =
        chunk_ids.iter().map(|id| id as &dyn rusqlite::ToSql).collect();
    let mut details = HashMap::new();
    let rows = stmt.query_map(bind.as_slice(), |row| {
        Ok((
            row.get::<_, String>(0)?,
            ChunkDetail {
                entity_id: row.get(1)?,
                content: row.get(2)?,
                char_offset_start: row.get(3)?,
                char_offset_end: row.get(4)?,
                entity_title: row.get(5)?,
                source: row.get(6)?,
                uri: row.get(7)?,
                entity_updated_at: row.get(8)?,
            },
        ))
    })?;
    for row in rows {
        let (chunk_id, detail) = row?;
        details.insert(chunk_id, detail);
    }
    Ok(details)
}
