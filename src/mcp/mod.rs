//! Tool protocol surface: dispatcher state, JSON-RPC protocol, and the
//! HTTP and stdio transports

pub mod http;
pub mod protocol;
pub mod tools;
pub mod tools_admin;
pub mod tools_data;
pub mod tools_ingest;
pub mod tools_memory;

use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use crate::auth::limits::RateLimiter;
use crate::auth::Principal;
use crate::config::{Config, DataPaths};
use crate::embedding::EmbedderRegistry;
use crate::error::Result;
use crate::storage::writer::WriteCoordinator;
use crate::storage::StoragePool;

/// Shared state behind every transport
pub struct ServerState {
    pub config: Config,
    pub paths: DataPaths,
    pub readers: StoragePool,
    pub writer: Arc<WriteCoordinator>,
    pub limiter: RateLimiter,
    pub embedders: Arc<EmbedderRegistry>,
}

impl ServerState {
    pub fn authenticate(&self, token: &str) -> Result<Principal> {
        self.readers
            .with_connection(|conn| crate::auth::authenticate(conn, token, &self.config))
    }

    /// Dispatch one tool call: rate limit, execute, quota-check the
    /// response, record counters, and audit.
    pub fn call_tool(
        &self,
        tool_name: &str,
        arguments: &Value,
        principal: &Principal,
        writes_enabled: bool,
    ) -> Result<Value> {
        let tool = tools::resolve_tool(tool_name)?;
        if tool.is_write() && !writes_enabled {
            return Err(crate::error::HoardError::WriteDisabled);
        }

        self.limiter.check_request(&principal.name, tool_name)?;

        let outcome = tools::dispatch(self, tool, arguments, principal);
        match outcome {
            Ok(value) => {
                let chunks = tools::count_chunks(&value);
                let bytes = serde_json::to_string(&value).map(|s| s.len() as u64).unwrap_or(0);
                self.limiter.check_quota(&principal.name, chunks, bytes)?;
                self.limiter.record(&principal.name, tool_name, chunks, bytes);
                self.audit(principal, tool_name, true, chunks as i64, bytes as i64);
                Ok(value)
            }
            Err(e) => {
                self.limiter.record(&principal.name, tool_name, 0, 0);
                self.audit(principal, tool_name, false, 0, 0);
                Err(e)
            }
        }
    }

    /// Best-effort audit write; failures are logged, never surfaced
    fn audit(&self, principal: &Principal, tool: &str, success: bool, chunks: i64, bytes: i64) {
        let token_name = principal.name.clone();
        let tool = tool.to_string();
        let result = self.writer.submit(move |conn| {
            crate::storage::audit::log_access(
                conn,
                Some(&token_name),
                &tool,
                None,
                success,
                chunks,
                bytes,
                None,
            )
            .map(|_| ())
        });
        if let Err(e) = result {
            warn!(error = %e, "audit write failed");
        }
    }
}
