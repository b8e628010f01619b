//! Authentication, scopes, and sensitivity tiers

pub mod limits;
pub mod tokens;

use std::collections::HashSet;

use serde::Serialize;

use crate::config::Config;
use crate::error::{HoardError, Result};
use crate::types::Sensitivity;

/// Scopes granted to the synthetic admin principal
pub const ADMIN_SCOPES: &[&str] = &["admin", "sync", "memory", "search", "get", "ingest"];

/// An authenticated caller
#[derive(Debug, Clone, Serialize)]
pub struct Principal {
    pub name: String,
    pub scopes: HashSet<String>,
    pub capabilities: HashSet<String>,
    pub trust_level: f64,
    pub can_access_sensitive: bool,
    pub can_access_restricted: bool,
    pub requires_user_confirm: bool,
    pub proposal_ttl_days: Option<i64>,
    pub rate_limit_per_hour: i64,
}

impl Principal {
    /// The synthetic admin principal for the configured server secret
    pub fn admin() -> Self {
        let scopes: HashSet<String> = ADMIN_SCOPES.iter().map(|s| s.to_string()).collect();
        Self {
            name: "admin".to_string(),
            capabilities: scopes.clone(),
            scopes,
            trust_level: 1.0,
            can_access_sensitive: true,
            can_access_restricted: true,
            requires_user_confirm: false,
            proposal_ttl_days: None,
            rate_limit_per_hour: 0,
        }
    }

    /// `admin` implies every scope
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.contains("admin") || self.scopes.contains(scope)
    }

    pub fn has_any_scope<'a, I: IntoIterator<Item = &'a str>>(&self, scopes: I) -> bool {
        scopes.into_iter().any(|scope| self.has_scope(scope))
    }

    /// Highest sensitivity tier this caller may see
    pub fn max_sensitivity(&self) -> Sensitivity {
        if self.can_access_restricted {
            Sensitivity::Restricted
        } else if self.can_access_sensitive {
            Sensitivity::Sensitive
        } else {
            Sensitivity::Normal
        }
    }
}

/// Fail with a scope error naming the missing scope
pub fn require_scope(principal: &Principal, scope: &str) -> Result<()> {
    if principal.has_scope(scope) {
        return Ok(());
    }
    Err(HoardError::Scope(scope.to_string()))
}

pub fn require_any_scope(principal: &Principal, scopes: &[&str]) -> Result<()> {
    if principal.has_any_scope(scopes.iter().copied()) {
        return Ok(());
    }
    Err(HoardError::Scope(scopes.join(", ")))
}

/// Authenticate a bearer token.
///
/// The configured server secret short-circuits to an admin principal;
/// everything else goes through the agent token registry. Failures
/// never reveal whether the token existed.
pub fn authenticate(
    conn: &rusqlite::Connection,
    token: &str,
    config: &Config,
) -> Result<Principal> {
    if token.is_empty() {
        return Err(HoardError::Auth);
    }
    if let Some(secret) = config.server_secret() {
        if constant_time_eq(token.as_bytes(), secret.as_bytes()) {
            return Ok(Principal::admin());
        }
        return tokens::authenticate_agent(conn, token, &secret);
    }
    // Without a server secret the daemon cannot derive lookup hashes.
    Err(HoardError::Auth)
}

/// Constant-work byte comparison for the admin secret path
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admin_has_every_scope() {
        let admin = Principal::admin();
        assert!(admin.has_scope("memory"));
        assert!(admin.has_scope("anything-at-all"));
        assert_eq!(admin.max_sensitivity(), Sensitivity::Restricted);
    }

    #[test]
    fn test_scope_error_names_missing_scope() {
        let mut principal = Principal::admin();
        principal.scopes = ["search".to_string()].into_iter().collect();
        let err = require_scope(&principal, "memory").unwrap_err();
        match err {
            HoardError::Scope(scope) => assert_eq!(scope, "memory"),
            other => panic!("expected scope error, got {:?}", other),
        }
    }

    #[test]
    fn test_sensitivity_tiers() {
        let mut principal = Principal::admin();
        principal.can_access_restricted = false;
        assert_eq!(principal.max_sensitivity(), Sensitivity::Sensitive);
        principal.can_access_sensitive = false;
        assert_eq!(principal.max_sensitivity(), Sensitivity::Normal);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secrets"));
    }
}
