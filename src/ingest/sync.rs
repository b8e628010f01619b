//! Sync engine: drives connectors and reconciles the entity store
//!
//! One pass per connector: discover, scan, upsert entities, replace
//! chunks on content change, then tombstone everything the scan did
//! not see. A failed scan disables tombstoning for that run so a
//! partial scan can never soft-delete live documents.

use std::io::Write;
use std::path::{Path, PathBuf};

use rusqlite::Connection;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::{Config, ConnectorSettings};
use crate::error::{HoardError, Result};
use crate::ingest::store::{get_entity_by_source, replace_chunks, tombstone_missing, upsert_entity};
use crate::ingest::{enabled_connectors, Connector};
use crate::memory::store::prune_expired_proposals;
use crate::storage::writer::WriteCoordinator;
use crate::types::SyncStats;

/// Outcome of one `ingest.sync` run
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub connectors: Vec<ConnectorReport>,
    pub proposals_expired: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectorReport {
    pub source: String,
    pub success: bool,
    pub message: String,
    pub stats: Option<SyncStats>,
}

/// Run one sync pass for a single connector against a writable
/// connection. The caller owns transaction boundaries (one commit per
/// connector when run through the write coordinator).
pub fn sync_connector(
    conn: &Connection,
    connector: &dyn Connector,
    settings: &ConnectorSettings,
) -> Result<SyncStats> {
    let mut stats = SyncStats::default();
    let mut seen_source_ids: Vec<String> = Vec::new();
    let mut scan_failed = false;

    match connector.scan(settings) {
        Ok(stream) => {
            for item in stream {
                match item {
                    Ok((mut entity, chunks)) => {
                        stats.entities_seen += 1;
                        apply_provenance(connector, &mut entity);
                        // The scan observed this source_id; record it
                        // before the ingest attempt so a per-entity
                        // error cannot tombstone a live document.
                        seen_source_ids.push(entity.source_id.clone());
                        if let Err(e) = ingest_one(conn, &entity, &chunks, &mut stats) {
                            warn!(
                                source = connector.source_name(),
                                source_id = %entity.source_id,
                                error = %e,
                                "failed to ingest entity"
                            );
                            stats.errors += 1;
                        }
                    }
                    Err(e) => {
                        // A producer failure aborts the scan; never
                        // tombstone from a partial view of the source.
                        warn!(source = connector.source_name(), error = %e, "scan aborted");
                        stats.errors += 1;
                        scan_failed = true;
                        break;
                    }
                }
            }
        }
        Err(e) => {
            warn!(source = connector.source_name(), error = %e, "scan failed to start");
            stats.errors += 1;
            scan_failed = true;
        }
    }

    if !scan_failed {
        stats.entities_tombstoned =
            tombstone_missing(conn, connector.source_name(), &seen_source_ids)?;
    }
    connector.cleanup();
    Ok(stats)
}

fn ingest_one(
    conn: &Connection,
    entity: &crate::types::EntityInput,
    chunks: &[crate::types::ChunkInput],
    stats: &mut SyncStats,
) -> Result<()> {
    let existing = get_entity_by_source(conn, &entity.source, &entity.source_id)?;
    let entity_id = upsert_entity(conn, entity)?;

    // Fast path: identical content from the same connector version
    // leaves the chunk set untouched. A connector upgrade re-chunks
    // even when content is unchanged.
    if let Some(existing) = existing {
        let same_content =
            existing.content_hash.is_some() && existing.content_hash == entity.content_hash;
        let same_connector = existing.connector_version == entity.connector_version;
        if same_content && same_connector {
            return Ok(());
        }
    }

    stats.chunks_written += replace_chunks(conn, &entity_id, chunks)?;
    Ok(())
}

fn apply_provenance(connector: &dyn Connector, entity: &mut crate::types::EntityInput) {
    if entity.connector_name.is_none() {
        entity.connector_name = Some(connector.name().to_string());
    }
    if entity.connector_version.is_none() {
        entity.connector_version = Some(connector.version().to_string());
    }
    if entity.source.is_empty() {
        entity.source = connector.source_name().to_string();
    }
}

/// Run every enabled connector through the write coordinator, guarded
/// by the sync lock file. Returns `None` when another sync holds the
/// lock.
pub fn run_sync(
    writer: &WriteCoordinator,
    config: &Config,
    source: Option<&str>,
    sync_lock_path: &Path,
) -> Result<Option<SyncReport>> {
    let mut lock = SyncLock::new(sync_lock_path.to_path_buf());
    if !lock.acquire()? {
        info!("sync already in progress, skipping");
        return Ok(None);
    }

    let result = run_sync_inner(writer, config, source);
    lock.release();
    result.map(Some)
}

fn run_sync_inner(
    writer: &WriteCoordinator,
    config: &Config,
    source: Option<&str>,
) -> Result<SyncReport> {
    let mut reports = Vec::new();

    for (name, connector, settings) in enabled_connectors(config) {
        if let Some(filter) = source {
            if filter != name && filter != connector.source_name() {
                continue;
            }
        }

        let discovery = connector.discover(&settings);
        if !discovery.success {
            reports.push(ConnectorReport {
                source: name,
                success: false,
                message: discovery.message,
                stats: None,
            });
            continue;
        }

        // One write transaction per connector.
        let message = discovery.message.clone();
        let stats = writer.submit(move |conn| sync_connector(conn, connector.as_ref(), &settings))?;
        info!(
            source = %name,
            entities = stats.entities_seen,
            chunks = stats.chunks_written,
            tombstoned = stats.entities_tombstoned,
            errors = stats.errors,
            "sync pass complete"
        );
        reports.push(ConnectorReport {
            source: name,
            success: true,
            message,
            stats: Some(stats),
        });
    }

    let proposals_expired = if config.memory.prune_on_sync {
        writer.submit(|conn| prune_expired_proposals(conn))?
    } else {
        0
    };

    Ok(SyncReport {
        connectors: reports,
        proposals_expired,
    })
}

/// System-wide sync serialisation via a pid-stamped lock file.
///
/// A lock left by a dead process is forcibly cleared.
pub struct SyncLock {
    path: PathBuf,
    held: bool,
}

impl SyncLock {
    pub fn new(path: PathBuf) -> Self {
        Self { path, held: false }
    }

    pub fn acquire(&mut self) -> Result<bool> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        for _ in 0..2 {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.path)
            {
                Ok(mut file) => {
                    writeln!(file, "{}", std::process::id())?;
                    writeln!(file, "{}", crate::types::now_iso())?;
                    self.held = true;
                    return Ok(true);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if self.is_stale() {
                        warn!(path = %self.path.display(), "clearing stale sync lock");
                        let _ = std::fs::remove_file(&self.path);
                        continue;
                    }
                    return Ok(false);
                }
                Err(e) => return Err(HoardError::Io(e)),
            }
        }
        Ok(false)
    }

    pub fn release(&mut self) {
        if self.held {
            let _ = std::fs::remove_file(&self.path);
            self.held = false;
        }
    }

    fn is_stale(&self) -> bool {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(_) => return true,
        };
        let pid: u32 = match content.lines().next().and_then(|line| line.parse().ok()) {
            Some(pid) => pid,
            None => return true,
        };
        !pid_alive(pid)
    }
}

impl Drop for SyncLock {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(target_os = "linux")]
fn pid_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{}", pid)).exists()
}

#[cfg(not(target_os = "linux"))]
fn pid_alive(_pid: u32) -> bool {
    // Without a portable liveness probe, never force-clear.
    true
}
