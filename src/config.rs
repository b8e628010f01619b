//! Configuration loading and data-directory layout
//!
//! Configuration lives in `config.yaml` under the data directory
//! (`HOARD_DATA_DIR`, default `~/.hoard`). Every section has serde
//! defaults so a missing or empty file yields a working daemon.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{HoardError, Result};

/// Environment variable overriding the data directory
pub const DATA_DIR_ENV: &str = "HOARD_DATA_DIR";

/// Environment variable carrying the admin-equivalent server secret
/// (the name itself is configurable via `write.server_secret_env`)
pub const DEFAULT_SERVER_SECRET_ENV: &str = "HOARD_SERVER_SECRET";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageSection,
    pub search: SearchSection,
    pub vectors: VectorsSection,
    pub write: WriteSection,
    pub security: SecuritySection,
    pub memory: MemorySection,
    pub connectors: HashMap<String, ConnectorSettings>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// Override for the database path; defaults to `<data_dir>/hoard.db`
    pub db_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSection {
    pub rrf_k: u32,
    pub max_chunks_per_entity: usize,
}

impl Default for SearchSection {
    fn default() -> Self {
        Self {
            rrf_k: 60,
            max_chunks_per_entity: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorsSection {
    pub enabled: bool,
    pub model_name: String,
    pub model_version: String,
    pub dimensions: usize,
    /// BM25 prefilter size when the chunk corpus is large
    pub prefilter_limit: usize,
    /// Cap on candidates for an exact vector scan
    pub vector_candidate_limit: usize,
    pub ann: AnnSection,
}

impl Default for VectorsSection {
    fn default() -> Self {
        Self {
            enabled: false,
            model_name: "hash-embedder".to_string(),
            model_version: "1.0.0".to_string(),
            dimensions: 384,
            prefilter_limit: 1000,
            vector_candidate_limit: 5000,
            ann: AnnSection::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnSection {
    pub enabled: bool,
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
}

impl Default for AnnSection {
    fn default() -> Self {
        Self {
            enabled: false,
            m: 16,
            ef_construction: 200,
            ef_search: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteSection {
    pub enabled: bool,
    pub server_secret_env: String,
    pub database: DatabaseSection,
    pub slots: SlotsSection,
    pub proposals: ProposalsSection,
    pub worker: WorkerSection,
    pub duplicates: DuplicatesSection,
    pub query: QuerySection,
}

impl Default for WriteSection {
    fn default() -> Self {
        Self {
            enabled: true,
            server_secret_env: DEFAULT_SERVER_SECRET_ENV.to_string(),
            database: DatabaseSection::default(),
            slots: SlotsSection::default(),
            proposals: ProposalsSection::default(),
            worker: WorkerSection::default(),
            duplicates: DuplicatesSection::default(),
            query: QuerySection::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    pub busy_timeout_ms: u64,
    pub lock_timeout_ms: u64,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5000,
            lock_timeout_ms: 30_000,
        }
    }
}

/// Slot validation policy: `reject` refuses the write, `drop` stores
/// the memory without a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotPolicy {
    Reject,
    Drop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlotsSection {
    pub pattern: String,
    pub on_invalid: SlotPolicy,
}

impl Default for SlotsSection {
    fn default() -> Self {
        Self {
            pattern: r"^(pref|fact|ctx|decision|event):[a-z0-9_]+(\.[a-z0-9_]+){0,3}$".to_string(),
            on_invalid: SlotPolicy::Reject,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProposalsSection {
    pub default_ttl_days: i64,
    pub max_ttl_days: i64,
}

impl Default for ProposalsSection {
    fn default() -> Self {
        Self {
            default_ttl_days: 7,
            max_ttl_days: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    pub poll_interval_ms: u64,
    pub job_timeout_seconds: i64,
    pub lease_duration_seconds: i64,
    pub max_retries: i64,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            job_timeout_seconds: 60,
            lease_duration_seconds: 60,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DuplicatesSection {
    pub similarity_threshold: f32,
}

impl Default for DuplicatesSection {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.85,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuerySection {
    pub hybrid_weight_fts: f32,
    pub hybrid_weight_vector: f32,
    pub slot_match_bonus: f32,
    pub slot_only_baseline: f32,
    pub union_multiplier: f32,
}

impl Default for QuerySection {
    fn default() -> Self {
        Self {
            hybrid_weight_fts: 0.4,
            hybrid_weight_vector: 0.6,
            slot_match_bonus: 0.1,
            slot_only_baseline: 0.5,
            union_multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecuritySection {
    pub tokens: Vec<TokenEntry>,
    pub rate_limits: RateLimitsSection,
}

/// Statically configured agent token, registered at daemon start
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenEntry {
    pub name: String,
    pub token: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitsSection {
    pub search_requests_per_minute: u32,
    pub get_requests_per_minute: u32,
    pub chunks_returned_per_hour: u64,
    pub bytes_returned_per_hour: u64,
    pub max_writes_per_hour: u32,
}

impl Default for RateLimitsSection {
    fn default() -> Self {
        Self {
            search_requests_per_minute: 60,
            get_requests_per_minute: 120,
            chunks_returned_per_hour: 5000,
            bytes_returned_per_hour: 50_000_000,
            max_writes_per_hour: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    pub prune_on_sync: bool,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            prune_on_sync: true,
        }
    }
}

/// Per-connector settings; everything beyond `enabled` is connector-defined
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectorSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl ConnectorSettings {
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(|v| v.as_str())
    }

    pub fn get_str_list(&self, key: &str) -> Vec<String> {
        self.extra
            .get(key)
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Resolved filesystem layout under the data directory
#[derive(Debug, Clone)]
pub struct DataPaths {
    pub data_dir: PathBuf,
    pub config_path: PathBuf,
    pub db_path: PathBuf,
    pub sync_lock_path: PathBuf,
    pub server_key_path: PathBuf,
    pub artifacts_dir: PathBuf,
    pub pid_path: PathBuf,
    pub log_path: PathBuf,
}

impl DataPaths {
    /// Resolve the layout for a data directory, honouring the
    /// `storage.db_path` override.
    pub fn resolve(data_dir: &Path, config: &Config) -> Self {
        let db_path = match &config.storage.db_path {
            Some(raw) => PathBuf::from(shellexpand::tilde(raw).into_owned()),
            None => data_dir.join("hoard.db"),
        };
        Self {
            data_dir: data_dir.to_path_buf(),
            config_path: data_dir.join("config.yaml"),
            db_path,
            sync_lock_path: data_dir.join("sync.lock"),
            server_key_path: data_dir.join("server.key"),
            artifacts_dir: data_dir.join("artifacts"),
            pid_path: data_dir.join("hoard.pid"),
            log_path: data_dir.join("hoard.log"),
        }
    }
}

/// Determine the data directory from the environment
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        return PathBuf::from(shellexpand::tilde(&dir).into_owned());
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".hoard")
}

/// Load `config.yaml` from the data directory; a missing file yields
/// the default configuration.
pub fn load_config(data_dir: &Path) -> Result<Config> {
    let path = data_dir.join("config.yaml");
    if !path.exists() {
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(&path)?;
    serde_yaml::from_str(&raw)
        .map_err(|e| HoardError::Config(format!("{}: {}", path.display(), e)))
}

impl Config {
    /// Read the admin server secret from the configured environment variable
    pub fn server_secret(&self) -> Option<String> {
        std::env::var(&self.write.server_secret_env)
            .ok()
            .filter(|s| !s.is_empty())
    }
}
