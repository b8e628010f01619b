//! Ordered, checksum-verified schema migrations
//!
//! Migrations are numbered 1..N with no gaps. The applied version is
//! the `user_version` pragma; a `schema_migrations` history table
//! records name, timing and a checksum of the migration source so
//! drift between the database and the running code can be detected.
//!
//! Each migration applies inside `BEGIN IMMEDIATE`; a failure rolls
//! back that single migration and leaves the database at the last
//! successfully applied version.

use rusqlite::Connection;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::{HoardError, Result};

/// One schema migration step
pub struct Migration {
    pub version: i32,
    pub name: &'static str,
    /// SQL batch applied by this migration; also the checksum input
    pub source: &'static str,
}

/// All migrations, ordered by version
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        source: V1_INITIAL_SCHEMA,
    },
    Migration {
        version: 2,
        name: "memory_write_layer",
        source: V2_MEMORY_WRITE_LAYER,
    },
    Migration {
        version: 3,
        name: "perf_indexes_and_ann_meta",
        source: V3_PERF_INDEXES_AND_ANN_META,
    },
];

/// Latest schema version known to this build
pub fn latest_version() -> i32 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

/// First 16 hex chars of SHA-256 of the migration source
pub fn compute_checksum(source: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hex::encode(hasher.finalize())[..16].to_string()
}

/// Current `user_version` of the database
pub fn current_version(conn: &Connection) -> Result<i32> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

/// Run all pending migrations up to the latest version.
///
/// Returns the list of applied version numbers.
pub fn migrate(conn: &Connection, app_version: Option<&str>) -> Result<Vec<i32>> {
    ensure_history_table(conn)?;

    let current = current_version(conn)?;
    let latest = latest_version();
    if current > latest {
        return Err(HoardError::Migration(format!(
            "Database version ({}) is newer than this build ({}). \
             Hot schema downgrade is not supported; upgrade hoard or restore a backup.",
            current, latest
        )));
    }
    if current == latest {
        return Ok(vec![]);
    }

    validate_sequence(current, latest)?;
    warn_on_checksum_drift(conn)?;

    let mut applied = Vec::new();
    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        let started = std::time::Instant::now();
        conn.execute_batch("BEGIN IMMEDIATE")?;

        let result = conn
            .execute_batch(migration.source)
            .map_err(HoardError::from)
            .and_then(|_| {
                conn.pragma_update(None, "user_version", migration.version)?;
                record_migration(
                    conn,
                    migration,
                    started.elapsed().as_millis() as i64,
                    app_version,
                )
            });

        match result {
            Ok(()) => {
                conn.execute_batch("COMMIT")?;
                info!(
                    version = migration.version,
                    name = migration.name,
                    "applied migration"
                );
                applied.push(migration.version);
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(HoardError::Migration(format!(
                    "Migration {} ({}) failed: {}. Database left at version {}",
                    migration.version,
                    migration.name,
                    e,
                    current_version(conn).unwrap_or(-1)
                )));
            }
        }
    }

    if !applied.is_empty() {
        check_foreign_keys(conn)?;
    }
    Ok(applied)
}

fn ensure_history_table(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL,
            app_version TEXT,
            duration_ms INTEGER,
            checksum TEXT
        )",
        [],
    )?;
    Ok(())
}

fn validate_sequence(current: i32, target: i32) -> Result<()> {
    for version in (current + 1)..=target {
        if !MIGRATIONS.iter().any(|m| m.version == version) {
            let available: Vec<i32> = MIGRATIONS.iter().map(|m| m.version).collect();
            return Err(HoardError::Migration(format!(
                "Missing migration for version {}. Available versions: {:?}",
                version, available
            )));
        }
    }
    Ok(())
}

fn warn_on_checksum_drift(conn: &Connection) -> Result<()> {
    let mut stmt = conn.prepare(
        "SELECT version, name, checksum FROM schema_migrations WHERE checksum IS NOT NULL",
    )?;
    let rows: Vec<(i32, String, String)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
        .filter_map(|r| r.ok())
        .collect();

    for (version, name, stored) in rows {
        if let Some(migration) = MIGRATIONS.iter().find(|m| m.version == version) {
            let current = compute_checksum(migration.source);
            if current != stored {
                warn!(
                    version,
                    name = %name,
                    stored = %stored,
                    current = %current,
                    "migration checksum mismatch; database was migrated by different code"
                );
            }
        }
    }
    Ok(())
}

fn record_migration(
    conn: &Connection,
    migration: &Migration,
    duration_ms: i64,
    app_version: Option<&str>,
) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO schema_migrations
         (version, name, applied_at, app_version, duration_ms, checksum)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            migration.version,
            migration.name,
            crate::types::now_iso(),
            app_version,
            duration_ms,
            compute_checksum(migration.source),
        ],
    )?;
    Ok(())
}

fn check_foreign_keys(conn: &Connection) -> Result<()> {
    let mut stmt = conn.prepare("PRAGMA foreign_key_check")?;
    let violations: Vec<String> = stmt
        .query_map([], |row| {
            let table: String = row.get(0)?;
            let rowid: Option<i64> = row.get(1)?;
            Ok(format!("{}:{:?}", table, rowid))
        })?
        .filter_map(|r| r.ok())
        .collect();
    if !violations.is_empty() {
        warn!(
            count = violations.len(),
            sample = ?violations.iter().take(5).collect::<Vec<_>>(),
            "foreign key violations detected after migrations"
        );
    }
    Ok(())
}

// ============================================
// v1: entities, chunks, lexical shadows, chunk embeddings, audit log
// ============================================
const V1_INITIAL_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS entities (
    id TEXT PRIMARY KEY,
    source TEXT NOT NULL,
    source_id TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    title TEXT,
    uri TEXT,
    mime_type TEXT,
    tags TEXT,
    tags_text TEXT,
    metadata JSON,
    sensitivity TEXT DEFAULT 'normal',
    created_at TEXT,
    updated_at TEXT,
    synced_at TEXT,
    last_seen_at TEXT,
    tombstoned_at TEXT,
    content_hash TEXT,
    connector_name TEXT,
    connector_version TEXT,
    UNIQUE(source, source_id)
);

CREATE TABLE IF NOT EXISTS chunks (
    id TEXT PRIMARY KEY,
    entity_id TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    chunk_index INTEGER NOT NULL,
    content TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    char_offset_start INTEGER,
    char_offset_end INTEGER,
    chunk_type TEXT DEFAULT 'semantic',
    created_at TEXT DEFAULT CURRENT_TIMESTAMP,
    UNIQUE(entity_id, chunk_index)
);

CREATE VIRTUAL TABLE IF NOT EXISTS entities_fts USING fts5(
    title,
    tags_text,
    uri,
    content='entities',
    content_rowid='rowid'
);

CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
    content,
    entity_id UNINDEXED,
    chunk_id UNINDEXED,
    content='chunks',
    content_rowid='rowid'
);

CREATE TRIGGER IF NOT EXISTS entities_ai AFTER INSERT ON entities BEGIN
    INSERT INTO entities_fts(rowid, title, tags_text, uri)
    VALUES (new.rowid, new.title, new.tags_text, new.uri);
END;

CREATE TRIGGER IF NOT EXISTS entities_ad AFTER DELETE ON entities BEGIN
    INSERT INTO entities_fts(entities_fts, rowid, title, tags_text, uri)
    VALUES('delete', old.rowid, old.title, old.tags_text, old.uri);
END;

CREATE TRIGGER IF NOT EXISTS entities_au AFTER UPDATE ON entities BEGIN
    INSERT INTO entities_fts(entities_fts, rowid, title, tags_text, uri)
    VALUES('delete', old.rowid, old.title, old.tags_text, old.uri);
    INSERT INTO entities_fts(rowid, title, tags_text, uri)
    VALUES (new.rowid, new.title, new.tags_text, new.uri);
END;

CREATE TRIGGER IF NOT EXISTS chunks_ai AFTER INSERT ON chunks BEGIN
    INSERT INTO chunks_fts(rowid, content, entity_id, chunk_id)
    VALUES (new.rowid, new.content, new.entity_id, new.id);
END;

CREATE TRIGGER IF NOT EXISTS chunks_ad AFTER DELETE ON chunks BEGIN
    INSERT INTO chunks_fts(chunks_fts, rowid, content, entity_id, chunk_id)
    VALUES('delete', old.rowid, old.content, old.entity_id, old.id);
END;

CREATE TRIGGER IF NOT EXISTS chunks_au AFTER UPDATE ON chunks BEGIN
    INSERT INTO chunks_fts(chunks_fts, rowid, content, entity_id, chunk_id)
    VALUES('delete', old.rowid, old.content, old.entity_id, old.id);
    INSERT INTO chunks_fts(rowid, content, entity_id, chunk_id)
    VALUES (new.rowid, new.content, new.entity_id, new.id);
END;

CREATE TABLE IF NOT EXISTS embeddings (
    chunk_id TEXT PRIMARY KEY REFERENCES chunks(id) ON DELETE CASCADE,
    model TEXT NOT NULL,
    vector BLOB NOT NULL,
    dims INTEGER NOT NULL,
    created_at TEXT DEFAULT CURRENT_TIMESTAMP,
    CHECK (length(vector) = dims * 4)
);

CREATE TABLE IF NOT EXISTS audit_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    token_name TEXT,
    tool TEXT NOT NULL,
    scope TEXT,
    request_at TEXT DEFAULT CURRENT_TIMESTAMP,
    success INTEGER NOT NULL,
    chunks_returned INTEGER DEFAULT 0,
    bytes_returned INTEGER DEFAULT 0,
    metadata JSON
);

CREATE INDEX IF NOT EXISTS audit_logs_time_idx ON audit_logs(request_at);
CREATE INDEX IF NOT EXISTS audit_logs_token_tool_time_idx
    ON audit_logs(token_name, tool, request_at);
"#;

// ============================================
// v2: memory write layer
// ============================================
const V2_MEMORY_WRITE_LAYER: &str = r#"
CREATE TABLE IF NOT EXISTS memories (
    id TEXT PRIMARY KEY,
    content TEXT NOT NULL,
    memory_type TEXT NOT NULL,
    slot TEXT,
    scope_type TEXT NOT NULL,
    scope_id TEXT,
    source_agent TEXT NOT NULL,
    source_agent_version TEXT,
    source_session_id TEXT,
    source_conversation_id TEXT,
    source_context TEXT,
    created_at TEXT NOT NULL,
    expires_at TEXT,
    superseded_by TEXT REFERENCES memories(id) ON DELETE SET NULL,
    superseded_at TEXT,
    retracted_at TEXT,
    retracted_by TEXT,
    retraction_reason TEXT,
    sensitivity TEXT NOT NULL DEFAULT 'normal',
    CHECK (memory_type IN ('fact','preference','decision','observation','event','context')),
    CHECK (scope_type IN ('user','project','entity','domain')),
    CHECK (sensitivity IN ('normal','sensitive','restricted')),
    CHECK ((scope_type = 'user' AND scope_id IS NULL) OR (scope_type != 'user' AND scope_id IS NOT NULL)),
    CHECK (
        slot IS NULL
        OR slot LIKE 'pref:%'
        OR slot LIKE 'fact:%'
        OR slot LIKE 'ctx:%'
        OR slot LIKE 'decision:%'
        OR slot LIKE 'event:%'
    )
);

CREATE TABLE IF NOT EXISTS memory_counters (
    memory_id TEXT PRIMARY KEY REFERENCES memories(id) ON DELETE CASCADE,
    confidence REAL NOT NULL DEFAULT 0.8 CHECK (confidence >= 0 AND confidence <= 1),
    last_accessed_at TEXT,
    access_count_30d INTEGER DEFAULT 0,
    decay_count INTEGER DEFAULT 0
);

CREATE TABLE IF NOT EXISTS memory_embeddings (
    memory_id TEXT PRIMARY KEY REFERENCES memories(id) ON DELETE CASCADE,
    embedding BLOB NOT NULL,
    model_name TEXT NOT NULL,
    model_version TEXT NOT NULL,
    dimensions INTEGER NOT NULL CHECK (dimensions > 0),
    embedded_at TEXT NOT NULL,
    CHECK (length(embedding) = dimensions * 4)
);
CREATE INDEX IF NOT EXISTS idx_embeddings_model
    ON memory_embeddings(model_name, model_version);

CREATE TABLE IF NOT EXISTS memory_tags (
    memory_id TEXT NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    tag TEXT NOT NULL CHECK (tag = lower(tag)),
    PRIMARY KEY (memory_id, tag)
);
CREATE INDEX IF NOT EXISTS idx_tags_by_tag ON memory_tags(tag);

CREATE TABLE IF NOT EXISTS memory_relations (
    memory_id TEXT NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    related_uri TEXT NOT NULL,
    relation_type TEXT DEFAULT 'related',
    PRIMARY KEY (memory_id, related_uri)
);

CREATE TABLE IF NOT EXISTS memory_events (
    id TEXT PRIMARY KEY,
    memory_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    event_at TEXT NOT NULL,
    actor TEXT NOT NULL,
    snapshot TEXT,
    event_data TEXT,
    CHECK (event_type IN (
        'created','superseded','retracted','hard_deleted',
        'conflict_detected','conflict_resolved','merged','decayed',
        'embedding_added','embedding_upgraded','accessed'
    ))
);
CREATE INDEX IF NOT EXISTS idx_events_by_memory ON memory_events(memory_id, event_at);

CREATE TABLE IF NOT EXISTS memory_duplicates (
    id TEXT PRIMARY KEY,
    detected_at TEXT NOT NULL,
    similarity REAL NOT NULL CHECK (similarity >= 0 AND similarity <= 1),
    resolved_at TEXT,
    resolution TEXT
);

CREATE TABLE IF NOT EXISTS duplicate_members (
    duplicate_id TEXT NOT NULL REFERENCES memory_duplicates(id) ON DELETE CASCADE,
    memory_id TEXT NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    is_canonical INTEGER DEFAULT 0,
    PRIMARY KEY (duplicate_id, memory_id)
);
CREATE INDEX IF NOT EXISTS idx_duplicate_members_by_memory ON duplicate_members(memory_id);

CREATE TABLE IF NOT EXISTS memory_conflicts (
    id TEXT PRIMARY KEY,
    slot TEXT NOT NULL,
    scope_type TEXT NOT NULL,
    scope_id TEXT,
    detected_at TEXT NOT NULL,
    resolved_at TEXT,
    resolution TEXT,
    resolved_by TEXT
);

CREATE TABLE IF NOT EXISTS conflict_members (
    conflict_id TEXT NOT NULL REFERENCES memory_conflicts(id) ON DELETE CASCADE,
    memory_id TEXT NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    nli_label TEXT,
    added_at TEXT NOT NULL,
    PRIMARY KEY (conflict_id, memory_id)
);
CREATE INDEX IF NOT EXISTS idx_conflict_members_by_memory ON conflict_members(memory_id);

CREATE TABLE IF NOT EXISTS memory_proposals (
    id TEXT PRIMARY KEY,
    proposed_memory TEXT NOT NULL,
    proposed_by TEXT NOT NULL,
    proposed_at TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    reviewed_at TEXT,
    reviewed_by TEXT,
    rejection_reason TEXT,
    CHECK (status IN ('pending','approved','rejected','expired'))
);
CREATE INDEX IF NOT EXISTS idx_proposals_pending
    ON memory_proposals(status, proposed_at) WHERE status = 'pending';
CREATE INDEX IF NOT EXISTS idx_proposals_expiring
    ON memory_proposals(expires_at) WHERE status = 'pending';

CREATE TABLE IF NOT EXISTS agent_tokens (
    agent_id TEXT PRIMARY KEY,
    token_lookup_hash TEXT NOT NULL UNIQUE,
    token_secure_hash TEXT NOT NULL,
    trust_level REAL NOT NULL DEFAULT 0.5,
    capabilities TEXT NOT NULL,
    allowed_scopes TEXT NOT NULL,
    rate_limit_per_hour INTEGER DEFAULT 100,
    requires_user_confirm INTEGER DEFAULT 0,
    proposal_ttl_days INTEGER,
    can_access_sensitive INTEGER DEFAULT 0,
    can_access_restricted INTEGER DEFAULT 0,
    created_at TEXT NOT NULL,
    last_used_at TEXT
);

CREATE TABLE IF NOT EXISTS agent_rate_limits (
    agent_id TEXT NOT NULL REFERENCES agent_tokens(agent_id) ON DELETE CASCADE,
    window_start TEXT NOT NULL,
    write_count INTEGER DEFAULT 0,
    PRIMARY KEY (agent_id, window_start)
);

CREATE TABLE IF NOT EXISTS background_jobs (
    id TEXT PRIMARY KEY,
    job_type TEXT NOT NULL,
    memory_id TEXT REFERENCES memories(id) ON DELETE CASCADE,
    status TEXT NOT NULL DEFAULT 'pending',
    priority INTEGER DEFAULT 0,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    error TEXT,
    retry_count INTEGER DEFAULT 0,
    max_retries INTEGER DEFAULT 3,
    CHECK (status IN ('pending','running','completed','failed'))
);
CREATE INDEX IF NOT EXISTS idx_jobs_pending
    ON background_jobs(status, priority DESC, created_at)
    WHERE status = 'pending';
CREATE INDEX IF NOT EXISTS idx_jobs_running
    ON background_jobs(status, started_at)
    WHERE status = 'running';

CREATE TABLE IF NOT EXISTS worker_lease (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    worker_id TEXT NOT NULL,
    hostname TEXT NOT NULL,
    pid INTEGER NOT NULL,
    acquired_at TEXT NOT NULL,
    heartbeat_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS system_config (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
    content,
    content='memories',
    content_rowid='rowid'
);

CREATE TRIGGER IF NOT EXISTS memories_fts_ai AFTER INSERT ON memories
WHEN NEW.sensitivity != 'restricted' BEGIN
    INSERT INTO memories_fts(rowid, content) VALUES (NEW.rowid, NEW.content);
END;

CREATE TRIGGER IF NOT EXISTS memories_fts_ad AFTER DELETE ON memories BEGIN
    INSERT INTO memories_fts(memories_fts, rowid, content)
    VALUES('delete', OLD.rowid, OLD.content);
END;

CREATE TRIGGER IF NOT EXISTS memories_fts_retract AFTER UPDATE OF retracted_at ON memories
WHEN NEW.retracted_at IS NOT NULL AND OLD.retracted_at IS NULL BEGIN
    INSERT INTO memories_fts(memories_fts, rowid, content)
    VALUES('delete', OLD.rowid, OLD.content);
END;

CREATE TRIGGER IF NOT EXISTS memories_fts_supersede AFTER UPDATE OF superseded_at ON memories
WHEN NEW.superseded_at IS NOT NULL AND OLD.superseded_at IS NULL BEGIN
    INSERT INTO memories_fts(memories_fts, rowid, content)
    VALUES('delete', OLD.rowid, OLD.content);
END;

CREATE INDEX IF NOT EXISTS idx_memories_active ON memories(scope_type, scope_id)
    WHERE retracted_at IS NULL AND superseded_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_memories_slot ON memories(slot, scope_type, scope_id)
    WHERE slot IS NOT NULL AND retracted_at IS NULL AND superseded_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_memories_sensitivity ON memories(sensitivity)
    WHERE sensitivity != 'normal';
CREATE INDEX IF NOT EXISTS idx_memories_agent ON memories(source_agent);
CREATE INDEX IF NOT EXISTS idx_memories_created ON memories(created_at DESC);
CREATE INDEX IF NOT EXISTS idx_memories_expires ON memories(expires_at)
    WHERE expires_at IS NOT NULL AND retracted_at IS NULL;
"#;

// ============================================
// v3: performance indexes and ANN index metadata
// ============================================
const V3_PERF_INDEXES_AND_ANN_META: &str = r#"
CREATE INDEX IF NOT EXISTS idx_chunks_entity ON chunks(entity_id, chunk_index);
CREATE INDEX IF NOT EXISTS idx_entities_source ON entities(source, tombstoned_at);
CREATE INDEX IF NOT EXISTS idx_entities_last_seen ON entities(last_seen_at);
CREATE INDEX IF NOT EXISTS idx_embeddings_by_model ON embeddings(model);

CREATE TABLE IF NOT EXISTS ann_index_meta (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    backend TEXT NOT NULL,
    model_name TEXT NOT NULL,
    vectors_count INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL,
    state TEXT NOT NULL DEFAULT 'stale'
);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn open_raw() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys=ON;").unwrap();
        conn
    }

    #[test]
    fn test_migrate_from_empty() {
        let conn = open_raw();
        let applied = migrate(&conn, Some("0.7.0")).unwrap();
        assert_eq!(applied, vec![1, 2, 3]);
        assert_eq!(current_version(&conn).unwrap(), latest_version());

        // one history row per version
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(count, latest_version() as i64);
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = open_raw();
        migrate(&conn, None).unwrap();
        let applied = migrate(&conn, None).unwrap();
        assert!(applied.is_empty());
    }

    #[test]
    fn test_downgrade_is_rejected() {
        let conn = open_raw();
        migrate(&conn, None).unwrap();
        conn.pragma_update(None, "user_version", latest_version() + 5)
            .unwrap();
        let err = migrate(&conn, None).unwrap_err();
        assert!(matches!(err, HoardError::Migration(_)));
    }

    #[test]
    fn test_checksums_are_stable() {
        let a = compute_checksum(V1_INITIAL_SCHEMA);
        let b = compute_checksum(V1_INITIAL_SCHEMA);
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert_ne!(a, compute_checksum(V2_MEMORY_WRITE_LAYER));
    }

    #[test]
    fn test_history_records_checksums() {
        let conn = open_raw();
        migrate(&conn, Some("test")).unwrap();
        let checksum: String = conn
            .query_row(
                "SELECT checksum FROM schema_migrations WHERE version = 1",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(checksum, compute_checksum(V1_INITIAL_SCHEMA));
    }

    #[test]
    fn test_scope_pair_check_constraint() {
        let conn = open_raw();
        migrate(&conn, None).unwrap();
        // user scope with a scope_id violates the pair constraint
        let result = conn.execute(
            "INSERT INTO memories (id, content, memory_type, scope_type, scope_id, source_agent, created_at)
             VALUES ('m1', 'x', 'fact', 'user', 'u1', 'agent', '2026-01-01T00:00:00')",
            [],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_embedding_blob_length_check() {
        let conn = open_raw();
        migrate(&conn, None).unwrap();
        conn.execute(
            "INSERT INTO memories (id, content, memory_type, scope_type, source_agent, created_at)
             VALUES ('m1', 'x', 'fact', 'user', 'agent', '2026-01-01T00:00:00')",
            [],
        )
        .unwrap();
        // 4 dims but 17 bytes: rejected by the CHECK
        let blob = vec![0u8; 17];
        let result = conn.execute(
            "INSERT INTO memory_embeddings (memory_id, embedding, model_name, model_version, dimensions, embedded_at)
             VALUES ('m1', ?1, 'm', '1', 4, '2026-01-01T00:00:00')",
            rusqlite::params![blob],
        );
        assert!(result.is_err());
    }
}
