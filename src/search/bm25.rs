//! Chunk-level BM25 search over the FTS5 shadow index

use rusqlite::Connection;

use crate::error::Result;
use crate::memory::query::escape_fts_query;
use crate::search::sensitivity_filter;
use crate::types::Sensitivity;

/// One matching chunk joined with its entity metadata
#[derive(Debug, Clone, serde::Serialize)]
pub struct ChunkHit {
    pub chunk_id: String,
    pub entity_id: String,
    pub content: String,
    pub score: f64,
    pub char_offset_start: Option<i64>,
    pub char_offset_end: Option<i64>,
    pub entity_title: Option<String>,
    pub source: String,
    pub uri: Option<String>,
    pub entity_updated_at: Option<String>,
}

/// Flat BM25 hit list over non-tombstoned chunks, best first.
///
/// SQLite's bm25() is lower-is-better; the negated value is exposed so
/// callers sort descending like every other score.
pub fn search_chunks_flat(
    conn: &Connection,
    query: &str,
    limit: i64,
    offset: i64,
    source: Option<&str>,
    max_tier: Sensitivity,
) -> Result<Vec<ChunkHit>> {
    if query.trim().is_empty() {
        return Ok(Vec::new());
    }

    let mut sql = String::from(
        "SELECT chunks.id, chunks.entity_id, chunks.content,
                chunks.char_offset_start, chunks.char_offset_end,
                entities.title, entities.source, entities.uri, entities.updated_at,
                -bm25(chunks_fts) AS score
         FROM chunks_fts
         JOIN chunks ON chunks_fts.rowid = chunks.rowid
         JOIN entities ON entities.id = chunks.entity_id
         WHERE chunks_fts MATCH ?
           AND entities.tombstoned_at IS NULL",
    );
    let escaped = escape_fts_query(query);
    let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(escaped)];

    if let Some(source) = source {
        sql.push_str(" AND entities.source = ?");
        params.push(Box::new(source.to_string()));
    }
    if let Some(filter) = sensitivity_filter(max_tier, "entities") {
        sql.push_str(" AND ");
        sql.push_str(&filter);
    }
    sql.push_str(" ORDER BY score DESC LIMIT ? OFFSET ?");
    params.push(Box::new(limit));
    params.push(Box::new(offset));

    let mut stmt = conn.prepare(&sql)?;
    let bind: Vec<&dyn rusqlite::ToSql> = params.iter().map(|b| b.as_ref()).collect();
    let hits = stmt
        .query_map(bind.as_slice(), |row| {
            Ok(ChunkHit {
                chunk_id: row.get(0)?,
                entity_id: row.get(1)?,
                content: row.get(2)?,
                char_offset_start: row.get(3)?,
                char_offset_end: row.get(4)?,
                entity_title: row.get(5)?,
                source: row.get(6)?,
                uri: row.get(7)?,
                entity_updated_at: row.get(8)?,
                score: row.get(9)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(hits)
}

/// Entity-grouped BM25 results with integer-offset cursor pagination.
///
/// `next_cursor` is `None` at the pagination tail.
pub fn search_entities_bm25(
    conn: &Connection,
    query: &str,
    limit: i64,
    offset: i64,
    source: Option<&str>,
    max_tier: Sensitivity,
    max_chunks_per_entity: usize,
) -> Result<(Vec<crate::search::EntityResult>, Option<String>)> {
    let limit = limit.max(0);
    let offset = offset.max(0);

    let fetch_limit = (limit + offset + 1) * max_chunks_per_entity.max(1) as i64;
    let hits = search_chunks_flat(conn, query, fetch_limit, 0, source, max_tier)?;

    let mut grouped: Vec<crate::search::EntityResult> = Vec::new();
    for hit in hits {
        let entry = match grouped.iter_mut().find(|e| e.entity_id == hit.entity_id) {
            Some(entry) => entry,
            None => {
                grouped.push(crate::search::EntityResult {
                    entity_id: hit.entity_id.clone(),
                    entity_title: hit.entity_title.clone(),
                    source: hit.source.clone(),
                    uri: hit.uri.clone(),
                    entity_updated_at: hit.entity_updated_at.clone(),
                    chunks: Vec::new(),
                });
                grouped.last_mut().expect("just pushed")
            }
        };
        if entry.chunks.len() >= max_chunks_per_entity {
            continue;
        }
        entry.chunks.push(crate::search::ScoredChunk {
            chunk_id: hit.chunk_id,
            content: hit.content,
            score: hit.score,
            bm25_score: Some(hit.score),
            vector_score: None,
            char_offset_start: hit.char_offset_start,
            char_offset_end: hit.char_offset_end,
        });
    }

    let has_more = grouped.len() as i64 > offset + limit;
    let page: Vec<_> = grouped
        .into_iter()
        .skip(offset as usize)
        .take(limit as usize)
        .collect();
    let next_cursor = if has_more {
        Some((offset + limit).to_string())
    } else {
        None
    };
    Ok((page, next_cursor))
}
