//! Memory store operations
//!
//! All writers here expect to run inside the write coordinator; they
//! take a plain connection so tests can drive them directly.

use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::auth::Principal;
use crate::config::{Config, SlotPolicy};
use crate::error::{HoardError, Result};
use crate::types::{
    now_iso, Memory, MemoryInput, MemoryRelation, Proposal, ProposalStatus, Sensitivity,
};

/// A duplicate cluster with its members
#[derive(Debug, Clone, Serialize)]
pub struct DuplicateCluster {
    pub id: String,
    pub detected_at: String,
    pub similarity: f64,
    pub resolved_at: Option<String>,
    pub resolution: Option<String>,
    pub members: Vec<DuplicateMember>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DuplicateMember {
    pub memory_id: String,
    pub is_canonical: bool,
}

/// A slot conflict cluster with its members
#[derive(Debug, Clone, Serialize)]
pub struct ConflictCluster {
    pub id: String,
    pub slot: String,
    pub scope_type: String,
    pub scope_id: Option<String>,
    pub detected_at: String,
    pub resolved_at: Option<String>,
    pub resolution: Option<String>,
    pub resolved_by: Option<String>,
    pub members: Vec<ConflictMember>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConflictMember {
    pub memory_id: String,
    pub nli_label: Option<String>,
    pub added_at: String,
}

/// Outcome of `memory.review`
#[derive(Debug, Clone, Serialize)]
pub struct ReviewOutcome {
    pub status: ProposalStatus,
    pub memory: Option<Memory>,
}

/// Validate and store a new memory with its sidecars, then enqueue
/// the embedding and detector jobs.
pub fn memory_write(
    conn: &Connection,
    input: &MemoryInput,
    actor: &str,
    agent: Option<&Principal>,
    config: &Config,
) -> Result<Memory> {
    if input.content.is_empty() {
        return Err(HoardError::Validation("Memory content is required".into()));
    }
    let source_agent = input
        .source_agent
        .clone()
        .unwrap_or_else(|| actor.to_string());
    if source_agent.is_empty() {
        return Err(HoardError::Validation("source_agent is required".into()));
    }

    let slot = validate_slot(input.slot.as_deref(), config)?;

    let scope_id = match input.scope_type {
        crate::types::ScopeType::User => {
            if input.scope_id.is_some() {
                return Err(HoardError::Validation(
                    "scope_id must be null for user scope".into(),
                ));
            }
            None
        }
        _ => Some(input.scope_id.clone().ok_or_else(|| {
            HoardError::Validation("scope_id required for non-user scope".into())
        })?),
    };

    let tags = normalize_tags(&input.tags);
    for relation in &input.relations {
        if relation.related_uri.is_empty() {
            return Err(HoardError::Validation(
                "relations require a related_uri".into(),
            ));
        }
    }

    if let Some(agent) = agent {
        check_and_update_rate_limit(conn, agent)?;
    }

    let memory_id = Uuid::new_v4().to_string();
    let now = now_iso();

    conn.execute(
        "INSERT INTO memories (
            id, content, memory_type, slot, scope_type, scope_id,
            source_agent, source_agent_version, source_session_id,
            source_conversation_id, source_context, created_at,
            expires_at, sensitivity
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            memory_id,
            input.content,
            input.memory_type.as_str(),
            slot,
            input.scope_type.as_str(),
            scope_id,
            source_agent,
            input.source_agent_version,
            input.source_session_id,
            input.source_conversation_id,
            input.source_context,
            now,
            input.expires_at,
            input.sensitivity.as_str(),
        ],
    )?;

    conn.execute(
        "INSERT INTO memory_counters (memory_id) VALUES (?1)",
        params![memory_id],
    )?;

    for tag in &tags {
        conn.execute(
            "INSERT INTO memory_tags (memory_id, tag) VALUES (?1, ?2)",
            params![memory_id, tag],
        )?;
    }
    for relation in &input.relations {
        conn.execute(
            "INSERT OR IGNORE INTO memory_relations (memory_id, related_uri, relation_type)
             VALUES (?1, ?2, ?3)",
            params![memory_id, relation.related_uri, relation.relation_type],
        )?;
    }

    insert_event(conn, &memory_id, "created", actor, None)?;

    enqueue_job(conn, "embed_memory", &memory_id, 0, config)?;
    enqueue_job(conn, "detect_duplicates", &memory_id, 0, config)?;
    enqueue_job(conn, "detect_conflicts", &memory_id, 0, config)?;

    Ok(Memory {
        id: memory_id,
        content: input.content.clone(),
        memory_type: input.memory_type,
        slot,
        scope_type: input.scope_type,
        scope_id,
        source_agent,
        source_agent_version: input.source_agent_version.clone(),
        source_session_id: input.source_session_id.clone(),
        source_conversation_id: input.source_conversation_id.clone(),
        source_context: input.source_context.clone(),
        created_at: now,
        expires_at: input.expires_at.clone(),
        superseded_by: None,
        superseded_at: None,
        retracted_at: None,
        retracted_by: None,
        retraction_reason: None,
        sensitivity: input.sensitivity,
        tags,
        relations: input.relations.clone(),
    })
}

/// Validate a slot against the configured pattern.
///
/// `reject` refuses the write; `drop` stores the memory without the
/// invalid slot.
fn validate_slot(slot: Option<&str>, config: &Config) -> Result<Option<String>> {
    let slot = match slot {
        Some(slot) if !slot.is_empty() => slot,
        _ => return Ok(None),
    };
    let pattern = Regex::new(&config.write.slots.pattern)
        .map_err(|e| HoardError::Config(format!("invalid slot pattern: {}", e)))?;
    if pattern.is_match(slot) {
        return Ok(Some(slot.to_string()));
    }
    match config.write.slots.on_invalid {
        SlotPolicy::Reject => Err(HoardError::Validation(format!("Invalid slot: {}", slot))),
        SlotPolicy::Drop => {
            warn!(slot, "dropping invalid slot");
            Ok(None)
        }
    }
}

fn normalize_tags(tags: &[String]) -> Vec<String> {
    let mut normalized: Vec<String> = tags
        .iter()
        .map(|tag| tag.trim().to_lowercase())
        .filter(|tag| !tag.is_empty())
        .collect();
    normalized.sort();
    normalized.dedup();
    normalized
}

/// Per-agent hour-bucket write counter, checked under the write lock
fn check_and_update_rate_limit(conn: &Connection, agent: &Principal) -> Result<()> {
    if agent.rate_limit_per_hour <= 0 {
        return Ok(());
    }
    let window_start = chrono::Utc::now()
        .format("%Y-%m-%dT%H:00:00")
        .to_string();

    let current: Option<i64> = conn
        .query_row(
            "SELECT write_count FROM agent_rate_limits
             WHERE agent_id = ?1 AND window_start = ?2",
            params![agent.name, window_start],
            |row| row.get(0),
        )
        .optional()?;

    match current {
        Some(count) if count >= agent.rate_limit_per_hour => Err(HoardError::RateLimit(
            "Write rate limit exceeded".to_string(),
        )),
        Some(_) => {
            conn.execute(
                "UPDATE agent_rate_limits SET write_count = write_count + 1
                 WHERE agent_id = ?1 AND window_start = ?2",
                params![agent.name, window_start],
            )?;
            Ok(())
        }
        None => {
            conn.execute(
                "INSERT INTO agent_rate_limits (agent_id, window_start, write_count)
                 VALUES (?1, ?2, 1)",
                params![agent.name, window_start],
            )?;
            Ok(())
        }
    }
}

pub(crate) fn insert_event(
    conn: &Connection,
    memory_id: &str,
    event_type: &str,
    actor: &str,
    event_data: Option<&serde_json::Value>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO memory_events (id, memory_id, event_type, event_at, actor, event_data)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            Uuid::new_v4().to_string(),
            memory_id,
            event_type,
            now_iso(),
            actor,
            event_data.map(|d| d.to_string()),
        ],
    )?;
    Ok(())
}

pub(crate) fn enqueue_job(
    conn: &Connection,
    job_type: &str,
    memory_id: &str,
    priority: i64,
    config: &Config,
) -> Result<()> {
    conn.execute(
        "INSERT INTO background_jobs
         (id, job_type, memory_id, status, priority, created_at, max_retries)
         VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6)",
        params![
            Uuid::new_v4().to_string(),
            job_type,
            memory_id,
            priority,
            now_iso(),
            config.write.worker.max_retries,
        ],
    )?;
    Ok(())
}

/// Fetch any memory row, active or not (audit view), with sidecars
pub fn memory_get(conn: &Connection, memory_id: &str) -> Result<Option<Memory>> {
    let memory = conn
        .query_row(
            "SELECT id, content, memory_type, slot, scope_type, scope_id,
                    source_agent, source_agent_version, source_session_id,
                    source_conversation_id, source_context, created_at,
                    expires_at, superseded_by, superseded_at,
                    retracted_at, retracted_by, retraction_reason, sensitivity
             FROM memories WHERE id = ?1",
            params![memory_id],
            memory_from_row,
        )
        .optional()?;

    let Some(mut memory) = memory else {
        return Ok(None);
    };
    memory.tags = load_tags(conn, memory_id)?;
    memory.relations = load_relations(conn, memory_id)?;
    Ok(Some(memory))
}

pub(crate) fn memory_from_row(row: &Row) -> rusqlite::Result<Memory> {
    let memory_type: String = row.get(2)?;
    let scope_type: String = row.get(4)?;
    let sensitivity: String = row.get(18)?;
    Ok(Memory {
        id: row.get(0)?,
        content: row.get(1)?,
        memory_type: memory_type
            .parse()
            .unwrap_or(crate::types::MemoryType::Context),
        slot: row.get(3)?,
        scope_type: scope_type.parse().unwrap_or(crate::types::ScopeType::User),
        scope_id: row.get(5)?,
        source_agent: row.get(6)?,
        source_agent_version: row.get(7)?,
        source_session_id: row.get(8)?,
        source_conversation_id: row.get(9)?,
        source_context: row.get(10)?,
        created_at: row.get(11)?,
        expires_at: row.get(12)?,
        superseded_by: row.get(13)?,
        superseded_at: row.get(14)?,
        retracted_at: row.get(15)?,
        retracted_by: row.get(16)?,
        retraction_reason: row.get(17)?,
        sensitivity: sensitivity.parse().unwrap_or(Sensitivity::Normal),
        tags: vec![],
        relations: vec![],
    })
}

pub(crate) fn load_tags(conn: &Connection, memory_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare_cached("SELECT tag FROM memory_tags WHERE memory_id = ?1 ORDER BY tag")?;
    let tags = stmt
        .query_map(params![memory_id], |row| row.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(tags)
}

fn load_relations(conn: &Connection, memory_id: &str) -> Result<Vec<MemoryRelation>> {
    let mut stmt = conn.prepare_cached(
        "SELECT related_uri, relation_type FROM memory_relations WHERE memory_id = ?1",
    )?;
    let relations = stmt
        .query_map(params![memory_id], |row| {
            Ok(MemoryRelation {
                related_uri: row.get(0)?,
                relation_type: row
                    .get::<_, Option<String>>(1)?
                    .unwrap_or_else(|| "related".to_string()),
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(relations)
}

/// Mark a memory retracted (one-way) and append the event
pub fn memory_retract(
    conn: &Connection,
    memory_id: &str,
    actor: &str,
    reason: Option<&str>,
) -> Result<bool> {
    let updated = conn.execute(
        "UPDATE memories
         SET retracted_at = ?1, retracted_by = ?2, retraction_reason = ?3
         WHERE id = ?4",
        params![now_iso(), actor, reason, memory_id],
    )?;
    if updated > 0 {
        let data = reason.map(|r| serde_json::json!({ "reason": r }));
        insert_event(conn, memory_id, "retracted", actor, data.as_ref())?;
    }
    Ok(updated > 0)
}

/// Mark a memory superseded by another (one-way) and append the event
pub fn memory_supersede(
    conn: &Connection,
    memory_id: &str,
    superseded_by: &str,
    actor: &str,
) -> Result<bool> {
    let updated = conn.execute(
        "UPDATE memories SET superseded_by = ?1, superseded_at = ?2 WHERE id = ?3",
        params![superseded_by, now_iso(), memory_id],
    )?;
    if updated > 0 {
        let data = serde_json::json!({ "superseded_by": superseded_by });
        insert_event(conn, memory_id, "superseded", actor, Some(&data))?;
    }
    Ok(updated > 0)
}

/// Insert a pending proposal, clamping the ttl to the configured cap
pub fn memory_propose(
    conn: &Connection,
    proposed_memory: &serde_json::Value,
    proposed_by: &str,
    ttl_days: Option<i64>,
    config: &Config,
) -> Result<Proposal> {
    let ttl = ttl_days
        .unwrap_or(config.write.proposals.default_ttl_days)
        .min(config.write.proposals.max_ttl_days)
        .max(1);
    let now = chrono::Utc::now();
    let proposed_at = now.format("%Y-%m-%dT%H:%M:%S").to_string();
    let expires_at = (now + chrono::Duration::days(ttl))
        .format("%Y-%m-%dT%H:%M:%S")
        .to_string();

    let proposal_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO memory_proposals
         (id, proposed_memory, proposed_by, proposed_at, expires_at, status)
         VALUES (?1, ?2, ?3, ?4, ?5, 'pending')",
        params![
            proposal_id,
            proposed_memory.to_string(),
            proposed_by,
            proposed_at,
            expires_at,
        ],
    )?;

    Ok(Proposal {
        id: proposal_id,
        proposed_memory: proposed_memory.clone(),
        proposed_by: proposed_by.to_string(),
        proposed_at,
        expires_at,
        status: ProposalStatus::Pending,
        reviewed_at: None,
        reviewed_by: None,
    })
}

/// Approve or reject a pending proposal. Approval materialises the
/// proposed memory through `memory_write`.
pub fn memory_review(
    conn: &Connection,
    proposal_id: &str,
    approved: bool,
    reviewer: &str,
    config: &Config,
) -> Result<ReviewOutcome> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT proposed_memory, status FROM memory_proposals WHERE id = ?1",
            params![proposal_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let (proposed_json, status) = row
        .ok_or_else(|| HoardError::NotFound(format!("proposal {}", proposal_id)))?;
    if status != "pending" {
        return Err(HoardError::Validation(format!(
            "Proposal is already {}",
            status
        )));
    }

    let now = now_iso();
    if !approved {
        conn.execute(
            "UPDATE memory_proposals
             SET status = 'rejected', reviewed_at = ?1, reviewed_by = ?2
             WHERE id = ?3",
            params![now, reviewer, proposal_id],
        )?;
        return Ok(ReviewOutcome {
            status: ProposalStatus::Rejected,
            memory: None,
        });
    }

    let input: MemoryInput = serde_json::from_str(&proposed_json)
        .map_err(|e| HoardError::Validation(format!("Malformed proposal payload: {}", e)))?;
    let memory = memory_write(conn, &input, reviewer, None, config)?;
    conn.execute(
        "UPDATE memory_proposals
         SET status = 'approved', reviewed_at = ?1, reviewed_by = ?2
         WHERE id = ?3",
        params![now, reviewer, proposal_id],
    )?;
    Ok(ReviewOutcome {
        status: ProposalStatus::Approved,
        memory: Some(memory),
    })
}

/// Flip timed-out pending proposals to expired; returns the count
pub fn prune_expired_proposals(conn: &Connection) -> Result<u64> {
    let count = conn.execute(
        "UPDATE memory_proposals SET status = 'expired'
         WHERE status = 'pending' AND expires_at <= ?1",
        params![now_iso()],
    )?;
    Ok(count as u64)
}

/// List conflict clusters, optionally only unresolved ones
pub fn conflicts_list(conn: &Connection, unresolved_only: bool) -> Result<Vec<ConflictCluster>> {
    let sql = if unresolved_only {
        "SELECT id, slot, scope_type, scope_id, detected_at, resolved_at, resolution, resolved_by
         FROM memory_conflicts WHERE resolved_at IS NULL ORDER BY detected_at DESC"
    } else {
        "SELECT id, slot, scope_type, scope_id, detected_at, resolved_at, resolution, resolved_by
         FROM memory_conflicts ORDER BY detected_at DESC"
    };
    let mut stmt = conn.prepare(sql)?;
    let mut clusters = stmt
        .query_map([], |row| {
            Ok(ConflictCluster {
                id: row.get(0)?,
                slot: row.get(1)?,
                scope_type: row.get(2)?,
                scope_id: row.get(3)?,
                detected_at: row.get(4)?,
                resolved_at: row.get(5)?,
                resolution: row.get(6)?,
                resolved_by: row.get(7)?,
                members: vec![],
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut member_stmt = conn.prepare_cached(
        "SELECT memory_id, nli_label, added_at FROM conflict_members
         WHERE conflict_id = ?1 ORDER BY added_at",
    )?;
    for cluster in &mut clusters {
        cluster.members = member_stmt
            .query_map(params![cluster.id], |row| {
                Ok(ConflictMember {
                    memory_id: row.get(0)?,
                    nli_label: row.get(1)?,
                    added_at: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
    }
    Ok(clusters)
}

pub fn conflict_resolve(
    conn: &Connection,
    conflict_id: &str,
    resolution: &str,
    resolved_by: &str,
) -> Result<bool> {
    let updated = conn.execute(
        "UPDATE memory_conflicts
         SET resolved_at = ?1, resolution = ?2, resolved_by = ?3
         WHERE id = ?4",
        params![now_iso(), resolution, resolved_by, conflict_id],
    )?;
    Ok(updated > 0)
}

/// List duplicate clusters, optionally only unresolved ones
pub fn duplicates_list(conn: &Connection, unresolved_only: bool) -> Result<Vec<DuplicateCluster>> {
    let sql = if unresolved_only {
        "SELECT id, detected_at, similarity, resolved_at, resolution
         FROM memory_duplicates WHERE resolved_at IS NULL ORDER BY detected_at DESC"
    } else {
        "SELECT id, detected_at, similarity, resolved_at, resolution
         FROM memory_duplicates ORDER BY detected_at DESC"
    };
    let mut stmt = conn.prepare(sql)?;
    let mut clusters = stmt
        .query_map([], |row| {
            Ok(DuplicateCluster {
                id: row.get(0)?,
                detected_at: row.get(1)?,
                similarity: row.get(2)?,
                resolved_at: row.get(3)?,
                resolution: row.get(4)?,
                members: vec![],
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut member_stmt = conn.prepare_cached(
        "SELECT memory_id, is_canonical FROM duplicate_members
         WHERE duplicate_id = ?1 ORDER BY is_canonical DESC",
    )?;
    for cluster in &mut clusters {
        cluster.members = member_stmt
            .query_map(params![cluster.id], |row| {
                Ok(DuplicateMember {
                    memory_id: row.get(0)?,
                    is_canonical: row.get::<_, i64>(1)? != 0,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
    }
    Ok(clusters)
}

pub fn duplicate_resolve(conn: &Connection, duplicate_id: &str, resolution: &str) -> Result<bool> {
    let updated = conn.execute(
        "UPDATE memory_duplicates SET resolved_at = ?1, resolution = ?2 WHERE id = ?3",
        params![now_iso(), resolution, duplicate_id],
    )?;
    Ok(updated > 0)
}
