//! Hoard - personal knowledge daemon
//!
//! Local-first document ingest, hybrid lexical/semantic search, and
//! durable agent memory over SQLite, exposed to AI agents through a
//! JSON-RPC tool protocol.

pub mod auth;
pub mod config;
pub mod embedding;
pub mod error;
pub mod ingest;
pub mod mcp;
pub mod memory;
pub mod search;
pub mod storage;
pub mod types;
pub mod worker;

pub use config::Config;
pub use error::{HoardError, Result};
pub use storage::Storage;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
