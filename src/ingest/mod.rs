//! Ingest pipeline: connectors, entity/chunk store, sync engine
//!
//! Connectors are black boxes behind the [`Connector`] trait. Built-in
//! implementations are registered statically; the sync engine drives
//! whichever connectors the configuration enables.

pub mod chunking;
pub mod inbox;
pub mod local_files;
pub mod store;
pub mod sync;

use crate::config::{Config, ConnectorSettings};
use crate::error::Result;
use crate::types::{ChunkInput, Discovery, EntityInput};

/// One streamed scan item: an entity with its chunks, or a per-item error
pub type ScanItem = Result<(EntityInput, Vec<ChunkInput>)>;

/// Finite, single-pass, non-restartable scan stream
pub type ScanStream = Box<dyn Iterator<Item = ScanItem> + Send>;

/// A source of entities. Implementations must be cheap to construct;
/// the sync engine builds a fresh instance per pass.
pub trait Connector: Send {
    /// Unique connector identifier
    fn name(&self) -> &'static str;

    /// Semantic version string; a version change forces re-chunking
    fn version(&self) -> &'static str;

    /// Source label recorded on entity rows
    fn source_name(&self) -> &'static str;

    /// Validate configuration and source accessibility without reading data
    fn discover(&self, settings: &ConnectorSettings) -> Discovery;

    /// Stream all entities and their chunks. Producers may yield `Err`
    /// per item; a panic-free hard failure aborts the scan.
    fn scan(&self, settings: &ConnectorSettings) -> Result<ScanStream>;

    /// Called after every scan, success or failure
    fn cleanup(&self) {}
}

/// Instantiate a built-in connector by name
pub fn load_connector(name: &str) -> Option<Box<dyn Connector>> {
    match name {
        "local_files" => Some(Box::new(local_files::LocalFilesConnector)),
        "inbox" => Some(Box::new(inbox::InboxConnector)),
        _ => None,
    }
}

/// All enabled connectors from configuration, with their settings
pub fn enabled_connectors(config: &Config) -> Vec<(String, Box<dyn Connector>, ConnectorSettings)> {
    let mut connectors = Vec::new();
    for (name, settings) in &config.connectors {
        if !settings.enabled {
            continue;
        }
        match load_connector(name) {
            Some(connector) => connectors.push((name.clone(), connector, settings.clone())),
            None => tracing::warn!(connector = %name, "unknown connector enabled in config"),
        }
    }
    connectors.sort_by(|a, b| a.0.cmp(&b.0));
    connectors
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry() {
        assert!(load_connector("local_files").is_some());
        assert!(load_connector("inbox").is_some());
        assert!(load_connector("notion_export").is_none());
    }

    #[test]
    fn test_enabled_connectors_respects_flag() {
        let yaml = r#"
connectors:
  local_files:
    enabled: true
    roots: []
  inbox:
    enabled: false
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let enabled = enabled_connectors(&config);
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].0, "local_files");
    }
}
