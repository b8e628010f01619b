//! Exact vector scan over chunk embeddings, with an ANN backend seam
//!
//! Stored vectors are pre-normalised, so cosine similarity is a dot
//! product. An ANN backend may take over candidate ranking; any ANN
//! failure falls back to the exact scan.

use rusqlite::Connection;
use tracing::warn;

use crate::embedding::{decode_embedding, dot};
use crate::error::Result;
use crate::search::sensitivity_filter;
use crate::types::Sensitivity;

/// Approximate nearest-neighbour backend parameters (cosine space)
#[derive(Debug, Clone, Copy)]
pub struct AnnParams {
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
}

/// Seam for approximate nearest-neighbour ranking over an in-memory
/// candidate set.
pub trait AnnBackend: Send + Sync {
    fn search(
        &self,
        query: &[f32],
        candidates: &[(String, Vec<f32>)],
        limit: usize,
        params: AnnParams,
    ) -> Result<Vec<(String, f32)>>;
}

/// Exhaustive dot-product ranking; the always-available backend
pub struct ExactScanBackend;

impl AnnBackend for ExactScanBackend {
    fn search(
        &self,
        query: &[f32],
        candidates: &[(String, Vec<f32>)],
        limit: usize,
        _params: AnnParams,
    ) -> Result<Vec<(String, f32)>> {
        let mut scored: Vec<(String, f32)> = candidates
            .iter()
            .map(|(id, vector)| (id.clone(), dot(query, vector)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }
}

/// Rank chunks by cosine similarity to the query vector.
///
/// `candidate_chunk_ids` restricts the scan (BM25 prefilter); without
/// it the scan is capped at `max_candidates`.
#[allow(clippy::too_many_arguments)]
pub fn vector_search(
    conn: &Connection,
    query_vector: &[f32],
    model_name: &str,
    limit: usize,
    candidate_chunk_ids: Option<&[String]>,
    source: Option<&str>,
    max_tier: Sensitivity,
    max_candidates: usize,
    ann: Option<(&dyn AnnBackend, AnnParams)>,
) -> Result<Vec<(String, f32)>> {
    if query_vector.is_empty() {
        return Ok(Vec::new());
    }

    let mut filters = vec![
        "embeddings.model = ?".to_string(),
        "entities.tombstoned_at IS NULL".to_string(),
    ];
    let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(model_name.to_string())];

    if let Some(source) = source {
        filters.push("entities.source = ?".to_string());
        params.push(Box::new(source.to_string()));
    }
    if let Some(filter) = sensitivity_filter(max_tier, "entities") {
        filters.push(filter);
    }
    if let Some(ids) = candidate_chunk_ids {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders: Vec<&str> = ids.iter().map(|_| "?").collect();
        filters.push(format!(
            "embeddings.chunk_id IN ({})",
            placeholders.join(",")
        ));
        for id in ids {
            params.push(Box::new(id.clone()));
        }
    }

    let limit_clause = if candidate_chunk_ids.is_none() {
        format!(" LIMIT {}", max_candidates.max(1))
    } else {
        String::new()
    };

    let sql = format!(
        "SELECT embeddings.chunk_id, embeddings.vector, embeddings.dims
         FROM embeddings
         JOIN chunks ON chunks.id = embeddings.chunk_id
         JOIN entities ON entities.id = chunks.entity_id
         WHERE {}{}",
        filters.join(" AND "),
        limit_clause
    );

    let mut stmt = conn.prepare(&sql)?;
    let bind: Vec<&dyn rusqlite::ToSql> = params.iter().map(|b| b.as_ref()).collect();
    let rows: Vec<(String, Vec<u8>, usize)> = stmt
        .query_map(bind.as_slice(), |row| {
            Ok((row.get(0)?, row.get(1)?, row.get::<_, i64>(2)? as usize))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut candidates: Vec<(String, Vec<f32>)> = Vec::with_capacity(rows.len());
    for (chunk_id, blob, dims) in rows {
        match decode_embedding(&blob, dims) {
            Ok(vector) if vector.len() == query_vector.len() => {
                candidates.push((chunk_id, vector))
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(chunk_id = %chunk_id, error = %e, "skipping undecodable embedding");
                continue;
            }
        }
    }

    if let Some((backend, ann_params)) = ann {
        match backend.search(query_vector, &candidates, limit, ann_params) {
            Ok(results) => return Ok(results),
            Err(e) => {
                warn!(error = %e, "ANN backend failed, falling back to exact scan");
            }
        }
    }

    ExactScanBackend.search(
        query_vector,
        &candidates,
        limit,
        AnnParams {
            m: 0,
            ef_construction: 0,
            ef_search: 0,
        },
    )
}
