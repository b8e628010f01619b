//! Background worker: job queue, worker lease, embedding and the
//! duplicate/conflict detectors
//!
//! Exactly one worker per storage file runs at a time, enforced by the
//! singleton `worker_lease` row claimed with a conditional upsert on
//! `expires_at < now`. The loop polls the `background_jobs` table,
//! requeues stuck jobs, claims the oldest pending job by
//! `(priority DESC, created_at ASC)`, and dispatches by job type.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::embedding::{encode_embedding, dot, decode_embedding, EmbedderRegistry};
use crate::error::{HoardError, Result};
use crate::memory::predicates::active_memory_conditions;
use crate::memory::store::insert_event;
use crate::storage::open_connection;
use crate::storage::writer::WriteCoordinator;
use crate::types::{now_iso, JobType};

/// A claimed job ready for dispatch
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: String,
    pub job_type: JobType,
    pub memory_id: String,
}

/// Long-running background worker thread
pub struct Worker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawn the worker loop.
    pub fn start(
        db_path: PathBuf,
        config: Config,
        writer: Arc<WriteCoordinator>,
        registry: Arc<EmbedderRegistry>,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();

        let handle = std::thread::Builder::new()
            .name("hoard-worker".to_string())
            .spawn(move || {
                let worker_id = format!(
                    "worker-{}-{}",
                    hostname(),
                    std::process::id()
                );
                info!(worker_id = %worker_id, "background worker started");
                run_loop(&db_path, &config, &writer, &registry, &worker_id, &stop_flag);
                info!(worker_id = %worker_id, "background worker stopped");
            })
            .map_err(|e| HoardError::Internal(format!("spawn worker thread: {}", e)))?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn hostname() -> String {
    std::fs::read_to_string("/etc/hostname")
        .map(|s| s.trim().to_string())
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

fn run_loop(
    db_path: &PathBuf,
    config: &Config,
    writer: &WriteCoordinator,
    registry: &EmbedderRegistry,
    worker_id: &str,
    stop: &AtomicBool,
) {
    let poll_interval = Duration::from_millis(config.write.worker.poll_interval_ms);
    let job_timeout = config.write.worker.job_timeout_seconds;
    let lease_seconds = config.write.worker.lease_duration_seconds;

    while !stop.load(Ordering::SeqCst) {
        let tick = (|| -> Result<bool> {
            let owner = worker_id.to_string();
            let leased =
                writer.submit(move |conn| lease_acquire_or_renew(conn, &owner, lease_seconds))?;
            if !leased {
                return Ok(false);
            }

            writer.submit(move |conn| requeue_stuck_jobs(conn, job_timeout))?;

            let Some(job) = writer.submit(claim_next_job)? else {
                return Ok(false);
            };

            let outcome = dispatch_job(db_path, config, writer, registry, &job);
            let job_id = job.id.clone();
            match outcome {
                Ok(()) => {
                    writer.submit(move |conn| complete_job(conn, &job_id))?;
                }
                Err(e) => {
                    warn!(job = %job.id, job_type = ?job.job_type, error = %e, "job failed");
                    let message = e.to_string();
                    writer.submit(move |conn| fail_job(conn, &job_id, &message))?;
                }
            }
            Ok(true)
        })();

        match tick {
            Ok(true) => {}
            Ok(false) => std::thread::sleep(poll_interval),
            Err(e) => {
                error!(error = %e, "worker tick failed");
                std::thread::sleep(poll_interval);
            }
        }
    }
}

fn dispatch_job(
    db_path: &PathBuf,
    config: &Config,
    writer: &WriteCoordinator,
    registry: &EmbedderRegistry,
    job: &ClaimedJob,
) -> Result<()> {
    debug!(job = %job.id, job_type = ?job.job_type, memory = %job.memory_id, "dispatching job");
    match job.job_type {
        JobType::EmbedMemory => process_embed(db_path, config, writer, registry, &job.memory_id),
        JobType::DetectDuplicates => {
            let memory_id = job.memory_id.clone();
            let config = config.clone();
            writer.submit(move |conn| detect_duplicates(conn, &memory_id, &config).map(|_| ()))
        }
        JobType::DetectConflicts => {
            let memory_id = job.memory_id.clone();
            writer.submit(move |conn| detect_conflicts(conn, &memory_id).map(|_| ()))
        }
    }
}

/// Claim or renew the singleton lease.
///
/// The conditional upsert only replaces an expired lease; when it
/// matches nothing, the current owner re-reads the row and takes the
/// heartbeat branch if the lease is its own.
pub fn lease_acquire_or_renew(
    conn: &Connection,
    worker_id: &str,
    lease_seconds: i64,
) -> Result<bool> {
    let now = now_iso();
    let expires_at = (Utc::now() + ChronoDuration::seconds(lease_seconds))
        .format("%Y-%m-%dT%H:%M:%S")
        .to_string();

    let changed = conn.execute(
        "INSERT INTO worker_lease (id, worker_id, hostname, pid, acquired_at, heartbeat_at, expires_at)
         VALUES (1, ?1, ?2, ?3, ?4, ?4, ?5)
         ON CONFLICT (id) DO UPDATE SET
             worker_id = excluded.worker_id,
             hostname = excluded.hostname,
             pid = excluded.pid,
             acquired_at = excluded.acquired_at,
             heartbeat_at = excluded.heartbeat_at,
             expires_at = excluded.expires_at
         WHERE worker_lease.expires_at < ?4",
        params![worker_id, hostname(), std::process::id() as i64, now, expires_at],
    )?;

    if changed == 0 {
        let owner: Option<String> = conn
            .query_row("SELECT worker_id FROM worker_lease WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()?;
        if owner.as_deref() != Some(worker_id) {
            return Ok(false);
        }
        conn.execute(
            "UPDATE worker_lease SET heartbeat_at = ?1, expires_at = ?2 WHERE id = 1",
            params![now, expires_at],
        )?;
    }
    Ok(true)
}

/// Reset timed-out running jobs to pending, or fail them once retries
/// are exhausted. Returns the number of rows touched.
pub fn requeue_stuck_jobs(conn: &Connection, job_timeout_seconds: i64) -> Result<u64> {
    let threshold = (Utc::now() - ChronoDuration::seconds(job_timeout_seconds))
        .format("%Y-%m-%dT%H:%M:%S")
        .to_string();

    let stuck: Vec<(String, i64, i64)> = conn
        .prepare(
            "SELECT id, retry_count, max_retries FROM background_jobs
             WHERE status = 'running' AND started_at < ?1",
        )?
        .query_map(params![threshold], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let count = stuck.len() as u64;
    for (job_id, retry_count, max_retries) in stuck {
        if retry_count >= max_retries {
            conn.execute(
                "UPDATE background_jobs
                 SET status = 'failed', completed_at = ?1, error = 'Job timed out'
                 WHERE id = ?2",
                params![now_iso(), job_id],
            )?;
        } else {
            conn.execute(
                "UPDATE background_jobs
                 SET status = 'pending', retry_count = retry_count + 1, started_at = NULL
                 WHERE id = ?1",
                params![job_id],
            )?;
        }
    }
    Ok(count)
}

/// Claim the oldest pending job by `(priority DESC, created_at ASC)`
pub fn claim_next_job(conn: &Connection) -> Result<Option<ClaimedJob>> {
    let row: Option<(String, String, String)> = conn
        .query_row(
            "SELECT id, job_type, memory_id FROM background_jobs
             WHERE status = 'pending'
             ORDER BY priority DESC, created_at
             LIMIT 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    let Some((id, job_type, memory_id)) = row else {
        return Ok(None);
    };
    conn.execute(
        "UPDATE background_jobs SET status = 'running', started_at = ?1 WHERE id = ?2",
        params![now_iso(), id],
    )?;
    let job_type = job_type
        .parse()
        .map_err(|e: String| HoardError::Job(e))?;
    Ok(Some(ClaimedJob {
        id,
        job_type,
        memory_id,
    }))
}

pub fn complete_job(conn: &Connection, job_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE background_jobs SET status = 'completed', completed_at = ?1 WHERE id = ?2",
        params![now_iso(), job_id],
    )?;
    Ok(())
}

pub fn fail_job(conn: &Connection, job_id: &str, error: &str) -> Result<()> {
    conn.execute(
        "UPDATE background_jobs
         SET status = 'failed', completed_at = ?1, error = ?2
         WHERE id = ?3",
        params![now_iso(), job_id, error],
    )?;
    Ok(())
}

/// Encode the memory content outside the write lock, then persist the
/// vector and append the event.
fn process_embed(
    db_path: &PathBuf,
    config: &Config,
    writer: &WriteCoordinator,
    registry: &EmbedderRegistry,
    memory_id: &str,
) -> Result<()> {
    if !config.vectors.enabled {
        return Ok(());
    }

    let reader = open_connection(db_path, config.write.database.busy_timeout_ms)?;
    let content: Option<String> = reader
        .query_row(
            "SELECT content FROM memories WHERE id = ?1",
            params![memory_id],
            |row| row.get(0),
        )
        .optional()?;
    drop(reader);
    let Some(content) = content else {
        return Ok(());
    };

    let embedder = registry.get(&config.vectors)?;
    let vector = embedder
        .encode(&[content])?
        .into_iter()
        .next()
        .ok_or_else(|| HoardError::Embedding("empty batch result".into()))?;
    let blob = encode_embedding(&vector, embedder.dims())?;

    let memory_id = memory_id.to_string();
    let model_name = embedder.model_name().to_string();
    let model_version = embedder.model_version().to_string();
    let dims = embedder.dims() as i64;
    writer.submit(move |conn| {
        store_memory_embedding(conn, &memory_id, &blob, &model_name, &model_version, dims)
    })
}

/// Upsert the memory embedding (re-embedding on model change) and
/// append `embedding_added`.
pub fn store_memory_embedding(
    conn: &Connection,
    memory_id: &str,
    blob: &[u8],
    model_name: &str,
    model_version: &str,
    dims: i64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO memory_embeddings
         (memory_id, embedding, model_name, model_version, dimensions, embedded_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(memory_id) DO UPDATE SET
             embedding = excluded.embedding,
             model_name = excluded.model_name,
             model_version = excluded.model_version,
             dimensions = excluded.dimensions,
             embedded_at = excluded.embedded_at",
        params![memory_id, blob, model_name, model_version, dims, now_iso()],
    )?;
    insert_event(conn, memory_id, "embedding_added", "worker", None)?;
    Ok(())
}

/// Find same-scope near-duplicates of a memory and record clusters.
///
/// Idempotent: a pair already covered by an open cluster is skipped.
/// Returns the number of new clusters.
pub fn detect_duplicates(conn: &Connection, memory_id: &str, config: &Config) -> Result<u64> {
    if !config.vectors.enabled {
        return Ok(0);
    }
    let threshold = config.write.duplicates.similarity_threshold;
    let model_name = &config.vectors.model_name;
    let dims = config.vectors.dimensions;

    let emb_row: Option<(Vec<u8>, String, usize)> = conn
        .query_row(
            "SELECT embedding, model_name, dimensions FROM memory_embeddings WHERE memory_id = ?1",
            params![memory_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get::<_, i64>(2)? as usize)),
        )
        .optional()?;
    let Some((blob, row_model, row_dims)) = emb_row else {
        return Ok(0);
    };
    if row_model != *model_name || row_dims != dims {
        return Ok(0);
    }
    let query_vec = decode_embedding(&blob, dims)?;

    // Scope of the source memory; skip when no longer active.
    let now = now_iso();
    let src_where = active_memory_conditions("m").join(" AND ");
    let scope: Option<(String, Option<String>)> = conn
        .query_row(
            &format!(
                "SELECT m.scope_type, m.scope_id FROM memories m WHERE {} AND m.id = ?",
                src_where
            ),
            params![now, memory_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let Some((scope_type, scope_id)) = scope else {
        return Ok(0);
    };

    let mut conditions = active_memory_conditions("m");
    conditions.push("m.id != ?".to_string());
    conditions.push("m.scope_type = ?".to_string());
    let mut bind: Vec<Box<dyn rusqlite::ToSql>> = vec![
        Box::new(now.clone()),
        Box::new(memory_id.to_string()),
        Box::new(scope_type),
    ];
    match &scope_id {
        Some(id) => {
            conditions.push("m.scope_id = ?".to_string());
            bind.push(Box::new(id.clone()));
        }
        None => conditions.push("m.scope_id IS NULL".to_string()),
    }

    let sql = format!(
        "SELECT e.memory_id, e.embedding, e.model_name, e.dimensions
         FROM memory_embeddings e
         JOIN memories m ON m.id = e.memory_id
         WHERE {}",
        conditions.join(" AND ")
    );
    let mut stmt = conn.prepare(&sql)?;
    let bind_refs: Vec<&dyn rusqlite::ToSql> = bind.iter().map(|b| b.as_ref()).collect();
    let candidates: Vec<(String, Vec<u8>, String, usize)> = stmt
        .query_map(bind_refs.as_slice(), |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get::<_, i64>(3)? as usize,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut duplicates: Vec<(String, f32)> = Vec::new();
    for (candidate_id, candidate_blob, candidate_model, candidate_dims) in candidates {
        if candidate_model != *model_name || candidate_dims != dims {
            continue;
        }
        let Ok(candidate_vec) = decode_embedding(&candidate_blob, dims) else {
            continue;
        };
        // Vectors are pre-normalised; cosine is a dot product.
        let similarity = dot(&query_vec, &candidate_vec);
        if similarity >= threshold {
            duplicates.push((candidate_id, similarity));
        }
    }

    let mut new_clusters = 0;
    for (other_id, similarity) in duplicates {
        let open_pair: Option<String> = conn
            .query_row(
                "SELECT d.id FROM memory_duplicates d
                 JOIN duplicate_members dm1 ON dm1.duplicate_id = d.id
                 JOIN duplicate_members dm2 ON dm2.duplicate_id = d.id
                 WHERE dm1.memory_id = ?1 AND dm2.memory_id = ?2
                   AND d.resolved_at IS NULL",
                params![memory_id, other_id],
                |row| row.get(0),
            )
            .optional()?;
        if open_pair.is_some() {
            continue;
        }
        let duplicate_id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO memory_duplicates (id, detected_at, similarity) VALUES (?1, ?2, ?3)",
            params![duplicate_id, now_iso(), similarity.min(1.0) as f64],
        )?;
        // The earlier memory is canonical.
        conn.execute(
            "INSERT INTO duplicate_members (duplicate_id, memory_id, is_canonical) VALUES (?1, ?2, 1)",
            params![duplicate_id, other_id],
        )?;
        conn.execute(
            "INSERT INTO duplicate_members (duplicate_id, memory_id, is_canonical) VALUES (?1, ?2, 0)",
            params![duplicate_id, memory_id],
        )?;
        new_clusters += 1;
    }
    Ok(new_clusters)
}

/// Find active memories sharing the source's `(slot, scope)` and
/// record or extend a conflict cluster. Idempotent.
pub fn detect_conflicts(conn: &Connection, memory_id: &str) -> Result<u64> {
    let now = now_iso();
    let src_where = active_memory_conditions("m").join(" AND ");
    let source: Option<(Option<String>, String, Option<String>)> = conn
        .query_row(
            &format!(
                "SELECT m.slot, m.scope_type, m.scope_id FROM memories m WHERE {} AND m.id = ?",
                src_where
            ),
            params![now, memory_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    let Some((slot, scope_type, scope_id)) = source else {
        return Ok(0);
    };
    let Some(slot) = slot else {
        return Ok(0);
    };

    let mut conditions = active_memory_conditions("m");
    conditions.push("m.id != ?".to_string());
    conditions.push("m.slot = ?".to_string());
    conditions.push("m.scope_type = ?".to_string());
    let mut bind: Vec<Box<dyn rusqlite::ToSql>> = vec![
        Box::new(now.clone()),
        Box::new(memory_id.to_string()),
        Box::new(slot.clone()),
        Box::new(scope_type.clone()),
    ];
    match &scope_id {
        Some(id) => {
            conditions.push("m.scope_id = ?".to_string());
            bind.push(Box::new(id.clone()));
        }
        None => conditions.push("m.scope_id IS NULL".to_string()),
    }

    let sql = format!(
        "SELECT m.id FROM memories m WHERE {}",
        conditions.join(" AND ")
    );
    let mut stmt = conn.prepare(&sql)?;
    let bind_refs: Vec<&dyn rusqlite::ToSql> = bind.iter().map(|b| b.as_ref()).collect();
    let other_ids: Vec<String> = stmt
        .query_map(bind_refs.as_slice(), |row| row.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    if other_ids.is_empty() {
        return Ok(0);
    }

    // Reuse an open cluster already covering any of the others.
    let mut existing_conflict_id: Option<String> = None;
    for other_id in &other_ids {
        let found: Option<String> = conn
            .query_row(
                "SELECT cm.conflict_id FROM conflict_members cm
                 JOIN memory_conflicts c ON c.id = cm.conflict_id
                 WHERE cm.memory_id = ?1 AND c.resolved_at IS NULL
                   AND c.slot = ?2 AND c.scope_type = ?3",
                params![other_id, slot, scope_type],
                |row| row.get(0),
            )
            .optional()?;
        if found.is_some() {
            existing_conflict_id = found;
            break;
        }
    }

    let now_ts = now_iso();
    match existing_conflict_id {
        Some(conflict_id) => {
            let already: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM conflict_members WHERE conflict_id = ?1 AND memory_id = ?2",
                    params![conflict_id, memory_id],
                    |row| row.get(0),
                )
                .optional()?;
            if already.is_none() {
                conn.execute(
                    "INSERT INTO conflict_members (conflict_id, memory_id, nli_label, added_at)
                     VALUES (?1, ?2, NULL, ?3)",
                    params![conflict_id, memory_id, now_ts],
                )?;
            }
            Ok(0)
        }
        None => {
            let conflict_id = Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO memory_conflicts (id, slot, scope_type, scope_id, detected_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![conflict_id, slot, scope_type, scope_id, now_ts],
            )?;
            for member in other_ids.iter().chain(std::iter::once(&memory_id.to_string())) {
                conn.execute(
                    "INSERT OR IGNORE INTO conflict_members (conflict_id, memory_id, nli_label, added_at)
                     VALUES (?1, ?2, NULL, ?3)",
                    params![conflict_id, member, now_ts],
                )?;
            }
            Ok(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use crate::embedding::Embedder;
    use crate::memory::store::{memory_write, enqueue_job};
    use crate::storage::Storage;
    use crate::types::{MemoryInput, MemoryType, ScopeType, Sensitivity};

    fn write_memory(
        conn: &Connection,
        content: &str,
        slot: Option<&str>,
        config: &Config,
    ) -> String {
        let input = MemoryInput {
            content: content.to_string(),
            memory_type: MemoryType::Preference,
            scope_type: ScopeType::User,
            scope_id: None,
            slot: slot.map(String::from),
            tags: vec![],
            relations: vec![],
            expires_at: None,
            sensitivity: Sensitivity::Normal,
            source_agent: Some("agent".to_string()),
            source_agent_version: None,
            source_session_id: None,
            source_conversation_id: None,
            source_context: None,
        };
        memory_write(conn, &input, "agent", None, config).unwrap().id
    }

    fn embed(conn: &Connection, memory_id: &str, vector: &[f32], config: &Config) {
        let blob = encode_embedding(vector, config.vectors.dimensions).unwrap();
        store_memory_embedding(
            conn,
            memory_id,
            &blob,
            &config.vectors.model_name,
            &config.vectors.model_version,
            config.vectors.dimensions as i64,
        )
        .unwrap();
    }

    fn vector_config() -> Config {
        let mut config = Config::default();
        config.vectors.enabled = true;
        config.vectors.dimensions = 4;
        config
    }

    #[test]
    fn test_lease_acquire_renew_and_contention() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                assert!(lease_acquire_or_renew(conn, "worker-a", 60)?);
                // same owner renews via the heartbeat branch
                assert!(lease_acquire_or_renew(conn, "worker-a", 60)?);
                // another worker is excluded while the lease is live
                assert!(!lease_acquire_or_renew(conn, "worker-b", 60)?);

                // expire the lease; the other worker takes over
                conn.execute(
                    "UPDATE worker_lease SET expires_at = '2020-01-01T00:00:00' WHERE id = 1",
                    [],
                )?;
                assert!(lease_acquire_or_renew(conn, "worker-b", 60)?);
                let owner: String = conn.query_row(
                    "SELECT worker_id FROM worker_lease WHERE id = 1",
                    [],
                    |row| row.get(0),
                )?;
                assert_eq!(owner, "worker-b");
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_claim_order_priority_then_age() {
        let storage = Storage::open_in_memory().unwrap();
        let config = Config::default();
        storage
            .with_connection(|conn| {
                let m1 = write_memory(conn, "one", None, &config);
                conn.execute("DELETE FROM background_jobs", [])?;
                conn.execute(
                    "INSERT INTO background_jobs (id, job_type, memory_id, status, priority, created_at)
                     VALUES ('old-low', 'embed_memory', ?1, 'pending', 0, '2026-01-01T00:00:00'),
                            ('new-high', 'detect_conflicts', ?1, 'pending', 5, '2026-01-02T00:00:00'),
                            ('old-high', 'detect_duplicates', ?1, 'pending', 5, '2026-01-01T12:00:00')",
                    params![m1],
                )?;

                let first = claim_next_job(conn)?.unwrap();
                assert_eq!(first.id, "old-high");
                let second = claim_next_job(conn)?.unwrap();
                assert_eq!(second.id, "new-high");
                let third = claim_next_job(conn)?.unwrap();
                assert_eq!(third.id, "old-low");
                assert!(claim_next_job(conn)?.is_none());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_requeue_resets_then_fails() {
        let storage = Storage::open_in_memory().unwrap();
        let config = Config::default();
        storage
            .with_connection(|conn| {
                let m1 = write_memory(conn, "one", None, &config);
                conn.execute("DELETE FROM background_jobs", [])?;
                conn.execute(
                    "INSERT INTO background_jobs
                     (id, job_type, memory_id, status, priority, created_at, started_at, retry_count, max_retries)
                     VALUES ('stuck', 'embed_memory', ?1, 'running', 0, '2026-01-01T00:00:00',
                             '2026-01-01T00:00:00', 0, 1)",
                    params![m1],
                )?;

                assert_eq!(requeue_stuck_jobs(conn, 60)?, 1);
                let (status, retries): (String, i64) = conn.query_row(
                    "SELECT status, retry_count FROM background_jobs WHERE id = 'stuck'",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;
                assert_eq!(status, "pending");
                assert_eq!(retries, 1);

                // run it again past max_retries: now it fails
                conn.execute(
                    "UPDATE background_jobs
                     SET status = 'running', started_at = '2026-01-01T00:00:00'
                     WHERE id = 'stuck'",
                    [],
                )?;
                requeue_stuck_jobs(conn, 60)?;
                let (status, error): (String, Option<String>) = conn.query_row(
                    "SELECT status, error FROM background_jobs WHERE id = 'stuck'",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;
                assert_eq!(status, "failed");
                assert_eq!(error.as_deref(), Some("Job timed out"));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_duplicate_detection_idempotent() {
        let storage = Storage::open_in_memory().unwrap();
        let config = vector_config();
        storage
            .with_connection(|conn| {
                let earlier = write_memory(conn, "the user prefers dark mode", None, &config);
                let later = write_memory(conn, "the user prefers dark mode", None, &config);
                let vector = [0.5_f32, 0.5, 0.5, 0.5];
                embed(conn, &earlier, &vector, &config);
                embed(conn, &later, &vector, &config);

                assert_eq!(detect_duplicates(conn, &later, &config)?, 1);

                let clusters = crate::memory::store::duplicates_list(conn, true)?;
                assert_eq!(clusters.len(), 1);
                assert!(clusters[0].similarity > 0.99);
                let canonical: Vec<_> = clusters[0]
                    .members
                    .iter()
                    .filter(|m| m.is_canonical)
                    .collect();
                assert_eq!(canonical.len(), 1);
                assert_eq!(canonical[0].memory_id, earlier);

                // second run adds nothing
                assert_eq!(detect_duplicates(conn, &later, &config)?, 0);
                assert_eq!(crate::memory::store::duplicates_list(conn, true)?.len(), 1);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_dissimilar_vectors_not_clustered() {
        let storage = Storage::open_in_memory().unwrap();
        let config = vector_config();
        storage
            .with_connection(|conn| {
                let a = write_memory(conn, "dark mode", None, &config);
                let b = write_memory(conn, "lunch at noon", None, &config);
                embed(conn, &a, &[1.0, 0.0, 0.0, 0.0], &config);
                embed(conn, &b, &[0.0, 1.0, 0.0, 0.0], &config);
                assert_eq!(detect_duplicates(conn, &b, &config)?, 0);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_conflict_detection_and_append() {
        let storage = Storage::open_in_memory().unwrap();
        let config = Config::default();
        storage
            .with_connection(|conn| {
                let _first = write_memory(conn, "dark mode", Some("pref:theme"), &config);
                let second = write_memory(conn, "light mode", Some("pref:theme"), &config);

                assert_eq!(detect_conflicts(conn, &second)?, 1);
                let clusters = crate::memory::store::conflicts_list(conn, true)?;
                assert_eq!(clusters.len(), 1);
                assert_eq!(clusters[0].slot, "pref:theme");
                assert_eq!(clusters[0].members.len(), 2);

                // a third memory with the same slot joins the open cluster
                let third = write_memory(conn, "high contrast", Some("pref:theme"), &config);
                assert_eq!(detect_conflicts(conn, &third)?, 0);
                let clusters = crate::memory::store::conflicts_list(conn, true)?;
                assert_eq!(clusters.len(), 1);
                assert_eq!(clusters[0].members.len(), 3);

                // re-running for the same memory changes nothing
                assert_eq!(detect_conflicts(conn, &third)?, 0);
                assert_eq!(
                    crate::memory::store::conflicts_list(conn, true)?[0].members.len(),
                    3
                );
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_slotless_memory_never_conflicts() {
        let storage = Storage::open_in_memory().unwrap();
        let config = Config::default();
        storage
            .with_connection(|conn| {
                let a = write_memory(conn, "one", None, &config);
                let _b = write_memory(conn, "two", None, &config);
                assert_eq!(detect_conflicts(conn, &a)?, 0);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_worker_processes_jobs_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("hoard.db");
        let _ = Storage::open(&db_path).unwrap();

        let mut config = vector_config();
        config.write.worker.poll_interval_ms = 20;

        let writer = Arc::new(
            WriteCoordinator::new(&db_path, crate::storage::writer::WriterOptions::default())
                .unwrap(),
        );
        let registry = Arc::new(EmbedderRegistry::new());
        let embedder = HashEmbedder::new(4);
        assert_eq!(embedder.dims(), 4);

        let config_for_write = config.clone();
        let memory_id = writer
            .submit(move |conn| {
                Ok(write_memory(conn, "dark mode", None, &config_for_write))
            })
            .unwrap();

        let mut worker = Worker::start(
            db_path.clone(),
            config.clone(),
            writer.clone(),
            registry,
        )
        .unwrap();

        // wait for the embed job to complete
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        let storage = Storage::open_existing(&db_path, 5000).unwrap();
        loop {
            let pending: i64 = storage
                .with_connection(|conn| {
                    Ok(conn.query_row(
                        "SELECT COUNT(*) FROM background_jobs WHERE status IN ('pending','running')",
                        [],
                        |row| row.get(0),
                    )?)
                })
                .unwrap();
            if pending == 0 {
                break;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "worker did not drain the job queue"
            );
            std::thread::sleep(Duration::from_millis(50));
        }
        worker.stop();

        let embedded: i64 = storage
            .with_connection(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM memory_embeddings WHERE memory_id = ?1",
                    params![memory_id],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(embedded, 1);

        let failed: i64 = storage
            .with_connection(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM background_jobs WHERE status = 'failed'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(failed, 0);
    }

    #[test]
    fn test_enqueue_job_helper() {
        let storage = Storage::open_in_memory().unwrap();
        let config = Config::default();
        storage
            .with_connection(|conn| {
                let memory_id = write_memory(conn, "x", None, &config);
                conn.execute("DELETE FROM background_jobs", [])?;
                enqueue_job(conn, "embed_memory", &memory_id, 3, &config)?;
                let job = claim_next_job(conn)?.unwrap();
                assert_eq!(job.job_type, JobType::EmbedMemory);
                assert_eq!(job.memory_id, memory_id);
                Ok(())
            })
            .unwrap();
    }
}
