//! Entity and chunk store
//!
//! Entities are keyed by `(source, source_id)`; the opaque row id is a
//! content hash of that pair. Chunks are replaced wholesale whenever
//! the parent entity's content changes.

use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::types::{now_iso, ChunkInput, EntityInput};

/// First 32 hex chars of SHA-256 of the UTF-8 content
pub fn compute_content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())[..32].to_string()
}

/// Derive the opaque entity id from its source coordinates
pub fn build_entity_id(source: &str, source_id: &str) -> String {
    compute_content_hash(&format!("{}:{}", source, source_id))
}

/// Minimal view of a stored entity used by the sync fast path
#[derive(Debug, Clone)]
pub struct StoredEntity {
    pub id: String,
    pub content_hash: Option<String>,
    pub connector_version: Option<String>,
}

pub fn get_entity_by_source(
    conn: &Connection,
    source: &str,
    source_id: &str,
) -> Result<Option<StoredEntity>> {
    let row = conn
        .query_row(
            "SELECT id, content_hash, connector_version
             FROM entities WHERE source = ?1 AND source_id = ?2",
            params![source, source_id],
            |row| {
                Ok(StoredEntity {
                    id: row.get(0)?,
                    content_hash: row.get(1)?,
                    connector_version: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

/// Insert or refresh an entity row. Clears any tombstone and stamps
/// `synced_at` and `last_seen_at`.
pub fn upsert_entity(conn: &Connection, entity: &EntityInput) -> Result<String> {
    let entity_id = build_entity_id(&entity.source, &entity.source_id);
    let now = now_iso();

    let tags_text = entity.tags.join(" ");
    let tags_json = if entity.tags.is_empty() {
        None
    } else {
        Some(serde_json::to_string(&entity.tags)?)
    };
    let metadata_json = if entity.metadata.is_empty() {
        None
    } else {
        Some(serde_json::to_string(&entity.metadata)?)
    };
    let created_at = entity
        .created_at
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S").to_string())
        .unwrap_or_else(|| now.clone());
    let updated_at = entity
        .updated_at
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S").to_string())
        .unwrap_or_else(|| now.clone());

    conn.execute(
        "INSERT INTO entities (
            id, source, source_id, entity_type, title, uri, mime_type,
            tags, tags_text, metadata, sensitivity, created_at, updated_at,
            synced_at, last_seen_at, tombstoned_at, content_hash,
            connector_name, connector_version
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, NULL, ?16, ?17, ?18)
        ON CONFLICT(source, source_id) DO UPDATE SET
            entity_type = excluded.entity_type,
            title = excluded.title,
            uri = excluded.uri,
            mime_type = excluded.mime_type,
            tags = excluded.tags,
            tags_text = excluded.tags_text,
            metadata = excluded.metadata,
            sensitivity = excluded.sensitivity,
            updated_at = excluded.updated_at,
            synced_at = excluded.synced_at,
            last_seen_at = excluded.last_seen_at,
            tombstoned_at = NULL,
            content_hash = excluded.content_hash,
            connector_name = excluded.connector_name,
            connector_version = excluded.connector_version",
        params![
            entity_id,
            entity.source,
            entity.source_id,
            entity.entity_type,
            entity.title,
            entity.uri,
            entity.mime_type,
            tags_json,
            tags_text,
            metadata_json,
            entity.sensitivity.as_str(),
            created_at,
            updated_at,
            now,
            now,
            entity.content_hash,
            entity.connector_name,
            entity.connector_version,
        ],
    )?;
    Ok(entity_id)
}

/// Replace all chunks of an entity with a new sequence.
///
/// Must run in the same transaction as the parent upsert so a reader
/// never observes an entity with half its chunks.
pub fn replace_chunks(conn: &Connection, entity_id: &str, chunks: &[ChunkInput]) -> Result<u64> {
    conn.execute("DELETE FROM chunks WHERE entity_id = ?1", params![entity_id])?;

    let mut stmt = conn.prepare_cached(
        "INSERT INTO chunks (
            id, entity_id, chunk_index, content, content_hash,
            char_offset_start, char_offset_end, chunk_type
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )?;
    for (index, chunk) in chunks.iter().enumerate() {
        stmt.execute(params![
            format!("{}:{}", entity_id, index),
            entity_id,
            index as i64,
            chunk.content,
            compute_content_hash(&chunk.content),
            chunk.char_offset_start,
            chunk.char_offset_end,
            chunk.chunk_type,
        ])?;
    }
    Ok(chunks.len() as u64)
}

/// Soft-delete every non-tombstoned entity of a source whose source_id
/// was not observed in the latest clean scan.
///
/// The seen-set is staged in a temp table so large scans stay a single
/// set-based UPDATE.
pub fn tombstone_missing<I, S>(conn: &Connection, source: &str, seen_source_ids: I) -> Result<u64>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let now = now_iso();
    let seen: Vec<String> = seen_source_ids
        .into_iter()
        .map(|s| s.as_ref().to_string())
        .collect();

    if seen.is_empty() {
        let count = conn.execute(
            "UPDATE entities SET tombstoned_at = ?1, last_seen_at = NULL WHERE source = ?2",
            params![now, source],
        )?;
        return Ok(count as u64);
    }

    conn.execute_batch(
        "CREATE TEMP TABLE IF NOT EXISTS _seen_source_ids (source_id TEXT PRIMARY KEY);
         DELETE FROM _seen_source_ids;",
    )?;
    {
        let mut stmt =
            conn.prepare_cached("INSERT OR IGNORE INTO _seen_source_ids (source_id) VALUES (?1)")?;
        for source_id in &seen {
            stmt.execute(params![source_id])?;
        }
    }

    let count = conn.execute(
        "UPDATE entities
         SET tombstoned_at = ?1, last_seen_at = NULL
         WHERE source = ?2
           AND source_id NOT IN (SELECT source_id FROM _seen_source_ids)",
        params![now, source],
    )?;
    conn.execute_batch("DROP TABLE IF EXISTS _seen_source_ids;")?;
    Ok(count as u64)
}
