//! Error types for Hoard

use thiserror::Error;

/// Result type alias for Hoard operations
pub type Result<T> = std::result::Result<T, HoardError>;

/// Main error type for Hoard
#[derive(Error, Debug)]
pub enum HoardError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Authentication failed")]
    Auth,

    #[error("Missing scopes: {0}")]
    Scope(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Write tools are disabled on this transport")]
    WriteDisabled,

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Could not acquire lock on {path} within {timeout_ms}ms")]
    LockTimeout { path: String, timeout_ms: u64 },

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Connector error: {0}")]
    Connector(String),

    #[error("Job error: {0}")]
    Job(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HoardError {
    /// Check if the caller may usefully retry the operation
    pub fn is_retryable(&self) -> bool {
        match self {
            HoardError::LockTimeout { .. } | HoardError::RateLimit(_) => true,
            HoardError::Database(rusqlite::Error::SqliteFailure(err, _)) => {
                err.code == rusqlite::ErrorCode::DatabaseBusy
                    || err.code == rusqlite::ErrorCode::DatabaseLocked
            }
            _ => false,
        }
    }

    /// JSON-RPC error code for the tool protocol
    pub fn code(&self) -> i64 {
        match self {
            HoardError::Auth => -32001,
            HoardError::Scope(_) => -32002,
            HoardError::RateLimit(_) => -32003,
            HoardError::WriteDisabled => -32004,
            HoardError::UnknownTool(_) => -32601,
            HoardError::Validation(_) => -32602,
            _ => -32000,
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_codes() {
        assert_eq!(HoardError::Auth.code(), -32001);
        assert_eq!(HoardError::Scope("memory".into()).code(), -32002);
        assert_eq!(HoardError::RateLimit("search".into()).code(), -32003);
        assert_eq!(HoardError::WriteDisabled.code(), -32004);
        assert_eq!(HoardError::UnknownTool("x".into()).code(), -32601);
    }

    #[test]
    fn test_lock_timeout_is_retryable() {
        let err = HoardError::LockTimeout {
            path: "/tmp/hoard.db.lock".into(),
            timeout_ms: 30_000,
        };
        assert!(err.is_retryable());
        assert!(!HoardError::Auth.is_retryable());
    }
}
