//! Core types for Hoard

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Unique identifier for a memory (UUID v4)
pub type MemoryId = String;

/// Sensitivity tier gating row visibility.
///
/// Ordered: a caller may see rows at or below its maximum tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Sensitivity {
    #[default]
    Normal,
    Sensitive,
    Restricted,
}

impl Sensitivity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sensitivity::Normal => "normal",
            Sensitivity::Sensitive => "sensitive",
            Sensitivity::Restricted => "restricted",
        }
    }
}

impl std::fmt::Display for Sensitivity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Sensitivity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(Sensitivity::Normal),
            "sensitive" => Ok(Sensitivity::Sensitive),
            "restricted" => Ok(Sensitivity::Restricted),
            _ => Err(format!("Unknown sensitivity: {}", s)),
        }
    }
}

/// Connector-produced entity payload
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityInput {
    pub source: String,
    pub source_id: String,
    pub entity_type: String,
    pub title: Option<String>,
    pub uri: Option<String>,
    pub mime_type: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub sensitivity: Sensitivity,
    pub content_hash: Option<String>,
    pub connector_name: Option<String>,
    pub connector_version: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Connector-produced chunk payload (chunking is the connector's job)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkInput {
    pub content: String,
    pub char_offset_start: Option<i64>,
    pub char_offset_end: Option<i64>,
    #[serde(default = "default_chunk_type")]
    pub chunk_type: String,
}

fn default_chunk_type() -> String {
    "semantic".to_string()
}

impl ChunkInput {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            char_offset_start: None,
            char_offset_end: None,
            chunk_type: default_chunk_type(),
        }
    }
}

/// Memory type classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    Fact,
    Preference,
    Decision,
    Observation,
    Event,
    Context,
}

impl MemoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::Fact => "fact",
            MemoryType::Preference => "preference",
            MemoryType::Decision => "decision",
            MemoryType::Observation => "observation",
            MemoryType::Event => "event",
            MemoryType::Context => "context",
        }
    }
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MemoryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fact" => Ok(MemoryType::Fact),
            "preference" => Ok(MemoryType::Preference),
            "decision" => Ok(MemoryType::Decision),
            "observation" => Ok(MemoryType::Observation),
            "event" => Ok(MemoryType::Event),
            "context" => Ok(MemoryType::Context),
            _ => Err(format!("Unknown memory type: {}", s)),
        }
    }
}

/// Scope type for memory isolation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeType {
    User,
    Project,
    Entity,
    Domain,
}

impl ScopeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeType::User => "user",
            ScopeType::Project => "project",
            ScopeType::Entity => "entity",
            ScopeType::Domain => "domain",
        }
    }
}

impl std::fmt::Display for ScopeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ScopeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(ScopeType::User),
            "project" => Ok(ScopeType::Project),
            "entity" => Ok(ScopeType::Entity),
            "domain" => Ok(ScopeType::Domain),
            _ => Err(format!("Unknown scope type: {}", s)),
        }
    }
}

/// An agent-written record with explicit lifecycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: MemoryId,
    pub content: String,
    pub memory_type: MemoryType,
    pub slot: Option<String>,
    pub scope_type: ScopeType,
    pub scope_id: Option<String>,
    pub source_agent: String,
    pub source_agent_version: Option<String>,
    pub source_session_id: Option<String>,
    pub source_conversation_id: Option<String>,
    pub source_context: Option<String>,
    pub created_at: String,
    pub expires_at: Option<String>,
    pub superseded_by: Option<MemoryId>,
    pub superseded_at: Option<String>,
    pub retracted_at: Option<String>,
    pub retracted_by: Option<String>,
    pub retraction_reason: Option<String>,
    #[serde(default)]
    pub sensitivity: Sensitivity,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub relations: Vec<MemoryRelation>,
}

impl Memory {
    /// A memory is active iff not retracted, not superseded, and not expired.
    pub fn is_active(&self, now_iso: &str) -> bool {
        self.retracted_at.is_none()
            && self.superseded_at.is_none()
            && self
                .expires_at
                .as_deref()
                .map_or(true, |exp| exp > now_iso)
    }
}

/// A link from a memory to an external resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRelation {
    pub related_uri: String,
    #[serde(default = "default_relation_type")]
    pub relation_type: String,
}

fn default_relation_type() -> String {
    "related".to_string()
}

/// Fields accepted by `memory.write` and by proposal payloads
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MemoryInput {
    pub content: String,
    pub memory_type: MemoryType,
    pub scope_type: ScopeType,
    pub scope_id: Option<String>,
    pub slot: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub relations: Vec<MemoryRelation>,
    pub expires_at: Option<String>,
    #[serde(default)]
    pub sensitivity: Sensitivity,
    pub source_agent: Option<String>,
    pub source_agent_version: Option<String>,
    pub source_session_id: Option<String>,
    pub source_conversation_id: Option<String>,
    pub source_context: Option<String>,
}

/// Proposal status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl ProposalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalStatus::Pending => "pending",
            ProposalStatus::Approved => "approved",
            ProposalStatus::Rejected => "rejected",
            ProposalStatus::Expired => "expired",
        }
    }
}

/// A pending memory suggestion awaiting review
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub id: String,
    pub proposed_memory: serde_json::Value,
    pub proposed_by: String,
    pub proposed_at: String,
    pub expires_at: String,
    pub status: ProposalStatus,
    pub reviewed_at: Option<String>,
    pub reviewed_by: Option<String>,
}

/// Background job type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    EmbedMemory,
    DetectDuplicates,
    DetectConflicts,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::EmbedMemory => "embed_memory",
            JobType::DetectDuplicates => "detect_duplicates",
            JobType::DetectConflicts => "detect_conflicts",
        }
    }
}

impl std::str::FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "embed_memory" => Ok(JobType::EmbedMemory),
            "detect_duplicates" => Ok(JobType::DetectDuplicates),
            "detect_conflicts" => Ok(JobType::DetectConflicts),
            _ => Err(format!("Unknown job type: {}", s)),
        }
    }
}

/// Statistics for one connector sync pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStats {
    pub entities_seen: u64,
    pub chunks_written: u64,
    pub entities_tombstoned: u64,
    pub errors: u64,
}

/// Result of a connector `discover` probe
#[derive(Debug, Clone, Serialize)]
pub struct Discovery {
    pub success: bool,
    pub message: String,
    pub entity_count_estimate: Option<u64>,
}

impl Discovery {
    pub fn ok(message: impl Into<String>, estimate: Option<u64>) -> Self {
        Self {
            success: true,
            message: message.into(),
            entity_count_estimate: estimate,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            entity_count_estimate: None,
        }
    }
}

/// RFC3339 timestamp with second precision, the canonical stored form
pub fn now_iso() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string()
}
