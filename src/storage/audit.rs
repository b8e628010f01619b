//! Append-only audit log
//!
//! Every tool request logs one row with the caller, the tool, and the
//! quota-relevant counters. Writes go through the write coordinator so
//! they never block the read path.

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::now_iso;

/// One audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub token_name: Option<String>,
    pub tool: String,
    pub scope: Option<String>,
    pub request_at: String,
    pub success: bool,
    pub chunks_returned: i64,
    pub bytes_returned: i64,
    pub metadata: Option<serde_json::Value>,
}

/// Append one access record
pub fn log_access(
    conn: &Connection,
    token_name: Option<&str>,
    tool: &str,
    scope: Option<&str>,
    success: bool,
    chunks_returned: i64,
    bytes_returned: i64,
    metadata: Option<&serde_json::Value>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO audit_logs
         (token_name, tool, scope, request_at, success, chunks_returned, bytes_returned, metadata)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            token_name,
            tool,
            scope,
            now_iso(),
            success as i64,
            chunks_returned,
            bytes_returned,
            metadata.map(|m| m.to_string()),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Most recent entries, newest first
pub fn recent_entries(conn: &Connection, limit: i64) -> Result<Vec<AuditEntry>> {
    let mut stmt = conn.prepare(
        "SELECT id, token_name, tool, scope, request_at, success,
                chunks_returned, bytes_returned, metadata
         FROM audit_logs ORDER BY request_at DESC, id DESC LIMIT ?1",
    )?;
    let entries = stmt
        .query_map(params![limit], |row| {
            let metadata: Option<String> = row.get(8)?;
            Ok(AuditEntry {
                id: row.get(0)?,
                token_name: row.get(1)?,
                tool: row.get(2)?,
                scope: row.get(3)?,
                request_at: row.get(4)?,
                success: row.get::<_, i64>(5)? != 0,
                chunks_returned: row.get(6)?,
                bytes_returned: row.get(7)?,
                metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    #[test]
    fn test_log_and_read_back() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                log_access(conn, Some("claude"), "data.search", None, true, 3, 1024, None)?;
                log_access(conn, Some("claude"), "memory.write", None, false, 0, 0, None)?;
                let entries = recent_entries(conn, 10)?;
                assert_eq!(entries.len(), 2);
                assert!(entries.iter().any(|e| e.tool == "data.search" && e.success));
                assert!(entries.iter().any(|e| e.tool == "memory.write" && !e.success));
                Ok(())
            })
            .unwrap();
    }
}
