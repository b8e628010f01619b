//! Agent token registry
//!
//! Tokens are stored twice: an HMAC-SHA256 lookup hash keyed on the
//! server secret (constant-work equality on every request), and an
//! argon2 secure hash computed only at registration. The raw token is
//! returned once at registration and never stored.

use std::collections::HashSet;

use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, SaltString};
use argon2::{Argon2, PasswordVerifier};
use hmac::{Hmac, Mac};
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use sha2::Sha256;

use crate::auth::Principal;
use crate::error::{HoardError, Result};
use crate::types::now_iso;

type HmacSha256 = Hmac<Sha256>;

/// Registration options for a new agent
#[derive(Debug, Clone)]
pub struct AgentRegistration {
    pub agent_id: String,
    pub scopes: Vec<String>,
    pub capabilities: Option<Vec<String>>,
    pub trust_level: f64,
    pub requires_user_confirm: bool,
    pub proposal_ttl_days: Option<i64>,
    pub rate_limit_per_hour: i64,
    pub overwrite: bool,
}

impl AgentRegistration {
    pub fn new(agent_id: impl Into<String>, scopes: Vec<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            scopes,
            capabilities: None,
            trust_level: 0.5,
            requires_user_confirm: false,
            proposal_ttl_days: None,
            rate_limit_per_hour: 100,
            overwrite: false,
        }
    }
}

/// Registered agent summary (never includes hashes)
#[derive(Debug, Clone, Serialize)]
pub struct AgentSummary {
    pub agent_id: String,
    pub scopes: Vec<String>,
    pub capabilities: Vec<String>,
    pub trust_level: f64,
    pub rate_limit_per_hour: i64,
    pub created_at: String,
    pub last_used_at: Option<String>,
}

/// HMAC-SHA256 of the token keyed on the server secret
pub fn compute_lookup_hash(token: &str, server_secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(server_secret.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(token.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Slow password hash, computed on register only
pub fn compute_secure_hash(token: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(token.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| HoardError::Internal(format!("password hash: {}", e)))
}

pub fn verify_secure_hash(token: &str, hashed: &str) -> bool {
    PasswordHash::new(hashed)
        .map(|parsed| {
            Argon2::default()
                .verify_password(token.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

/// Generate a fresh bearer token
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("hoard_{}", hex::encode(bytes))
}

/// Register an agent with an explicit token. Fails when the agent
/// exists unless `overwrite` is set.
pub fn register_agent(
    conn: &Connection,
    registration: &AgentRegistration,
    token: &str,
    server_secret: &str,
) -> Result<()> {
    let scopes: Vec<String> = {
        let mut set: Vec<String> = registration
            .scopes
            .iter()
            .filter(|s| !s.is_empty())
            .cloned()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        set.sort();
        set
    };
    let capabilities = registration
        .capabilities
        .clone()
        .unwrap_or_else(|| scopes.clone());

    let lookup_hash = compute_lookup_hash(token, server_secret);
    let secure_hash = compute_secure_hash(token)?;
    let can_access_sensitive = scopes.iter().any(|s| s == "sensitive");
    let can_access_restricted = scopes.iter().any(|s| s == "restricted");

    let existing: Option<String> = conn
        .query_row(
            "SELECT agent_id FROM agent_tokens WHERE agent_id = ?1",
            params![registration.agent_id],
            |row| row.get(0),
        )
        .optional()?;

    if existing.is_some() {
        if !registration.overwrite {
            return Err(HoardError::Validation(format!(
                "Agent {} already exists",
                registration.agent_id
            )));
        }
        conn.execute(
            "UPDATE agent_tokens
             SET token_lookup_hash = ?1, token_secure_hash = ?2, trust_level = ?3,
                 capabilities = ?4, allowed_scopes = ?5, rate_limit_per_hour = ?6,
                 requires_user_confirm = ?7, proposal_ttl_days = ?8,
                 can_access_sensitive = ?9, can_access_restricted = ?10, last_used_at = NULL
             WHERE agent_id = ?11",
            params![
                lookup_hash,
                secure_hash,
                registration.trust_level,
                serde_json::to_string(&capabilities)?,
                serde_json::to_string(&scopes)?,
                registration.rate_limit_per_hour,
                registration.requires_user_confirm as i64,
                registration.proposal_ttl_days,
                can_access_sensitive as i64,
                can_access_restricted as i64,
                registration.agent_id,
            ],
        )?;
        return Ok(());
    }

    conn.execute(
        "INSERT INTO agent_tokens (
            agent_id, token_lookup_hash, token_secure_hash, trust_level,
            capabilities, allowed_scopes, rate_limit_per_hour,
            requires_user_confirm, proposal_ttl_days,
            can_access_sensitive, can_access_restricted, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            registration.agent_id,
            lookup_hash,
            secure_hash,
            registration.trust_level,
            serde_json::to_string(&capabilities)?,
            serde_json::to_string(&scopes)?,
            registration.rate_limit_per_hour,
            registration.requires_user_confirm as i64,
            registration.proposal_ttl_days,
            can_access_sensitive as i64,
            can_access_restricted as i64,
            now_iso(),
        ],
    )?;
    Ok(())
}

/// Register a statically configured token if its lookup hash is new
pub fn ensure_agent_from_config(
    conn: &Connection,
    name: &str,
    token: &str,
    scopes: &[String],
    rate_limit_per_hour: i64,
    server_secret: &str,
) -> Result<()> {
    if name.is_empty() || token.is_empty() {
        return Ok(());
    }
    let lookup_hash = compute_lookup_hash(token, server_secret);
    let existing: Option<String> = conn
        .query_row(
            "SELECT agent_id FROM agent_tokens WHERE token_lookup_hash = ?1",
            params![lookup_hash],
            |row| row.get(0),
        )
        .optional()?;
    if existing.is_some() {
        return Ok(());
    }
    let mut registration = AgentRegistration::new(name, scopes.to_vec());
    registration.rate_limit_per_hour = rate_limit_per_hour;
    register_agent(conn, &registration, token, server_secret)
}

/// Authenticate a bearer token by lookup hash.
pub fn authenticate_agent(
    conn: &Connection,
    token: &str,
    server_secret: &str,
) -> Result<Principal> {
    let lookup_hash = compute_lookup_hash(token, server_secret);
    let principal = conn
        .query_row(
            "SELECT agent_id, allowed_scopes, capabilities, trust_level,
                    can_access_sensitive, can_access_restricted,
                    requires_user_confirm, proposal_ttl_days, rate_limit_per_hour
             FROM agent_tokens WHERE token_lookup_hash = ?1",
            params![lookup_hash],
            principal_from_row,
        )
        .optional()?
        .ok_or(HoardError::Auth)?;

    conn.execute(
        "UPDATE agent_tokens SET last_used_at = ?1 WHERE agent_id = ?2",
        params![now_iso(), principal.name],
    )?;
    Ok(principal)
}

fn principal_from_row(row: &Row) -> rusqlite::Result<Principal> {
    let scopes_json: String = row.get(1)?;
    let capabilities_json: String = row.get(2)?;
    let scopes: HashSet<String> = serde_json::from_str(&scopes_json).unwrap_or_default();
    let capabilities: HashSet<String> =
        serde_json::from_str(&capabilities_json).unwrap_or_default();
    Ok(Principal {
        name: row.get(0)?,
        scopes,
        capabilities,
        trust_level: row.get(3)?,
        can_access_sensitive: row.get::<_, i64>(4)? != 0,
        can_access_restricted: row.get::<_, i64>(5)? != 0,
        requires_user_confirm: row.get::<_, i64>(6)? != 0,
        proposal_ttl_days: row.get(7)?,
        rate_limit_per_hour: row.get::<_, Option<i64>>(8)?.unwrap_or(0),
    })
}

pub fn list_agents(conn: &Connection) -> Result<Vec<AgentSummary>> {
    let mut stmt = conn.prepare(
        "SELECT agent_id, allowed_scopes, capabilities, trust_level,
                rate_limit_per_hour, created_at, last_used_at
         FROM agent_tokens ORDER BY agent_id",
    )?;
    let agents = stmt
        .query_map([], |row| {
            let scopes_json: String = row.get(1)?;
            let capabilities_json: String = row.get(2)?;
            Ok(AgentSummary {
                agent_id: row.get(0)?,
                scopes: serde_json::from_str(&scopes_json).unwrap_or_default(),
                capabilities: serde_json::from_str(&capabilities_json).unwrap_or_default(),
                trust_level: row.get(3)?,
                rate_limit_per_hour: row.get::<_, Option<i64>>(4)?.unwrap_or(0),
                created_at: row.get(5)?,
                last_used_at: row.get(6)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(agents)
}

pub fn delete_agent(conn: &Connection, agent_id: &str) -> Result<bool> {
    let deleted = conn.execute(
        "DELETE FROM agent_tokens WHERE agent_id = ?1",
        params![agent_id],
    )?;
    Ok(deleted > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    const SECRET: &str = "test-server-secret";

    #[test]
    fn test_register_and_authenticate() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                let token = generate_token();
                assert!(token.starts_with("hoard_"));

                let registration = AgentRegistration::new(
                    "claude",
                    vec!["memory".to_string(), "search".to_string()],
                );
                register_agent(conn, &registration, &token, SECRET)?;

                let principal = authenticate_agent(conn, &token, SECRET)?;
                assert_eq!(principal.name, "claude");
                assert!(principal.has_scope("memory"));
                assert!(!principal.has_scope("admin"));
                assert!(!principal.can_access_restricted);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_unknown_token_rejected() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                let err = authenticate_agent(conn, "hoard_nope", SECRET).unwrap_err();
                assert!(matches!(err, HoardError::Auth));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_duplicate_registration_requires_overwrite() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                let registration = AgentRegistration::new("claude", vec!["memory".to_string()]);
                register_agent(conn, &registration, "token-1", SECRET)?;
                assert!(register_agent(conn, &registration, "token-2", SECRET).is_err());

                let mut overwrite = registration.clone();
                overwrite.overwrite = true;
                register_agent(conn, &overwrite, "token-2", SECRET)?;

                // old token no longer authenticates
                assert!(authenticate_agent(conn, "token-1", SECRET).is_err());
                assert!(authenticate_agent(conn, "token-2", SECRET).is_ok());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_sensitive_scope_sets_tier_flags() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                let registration = AgentRegistration::new(
                    "trusted",
                    vec!["memory".to_string(), "sensitive".to_string()],
                );
                register_agent(conn, &registration, "tok", SECRET)?;
                let principal = authenticate_agent(conn, "tok", SECRET)?;
                assert!(principal.can_access_sensitive);
                assert!(!principal.can_access_restricted);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_secure_hash_verifies() {
        let hash = compute_secure_hash("my-token").unwrap();
        assert!(verify_secure_hash("my-token", &hash));
        assert!(!verify_secure_hash("other", &hash));
    }

    #[test]
    fn test_list_and_delete() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                register_agent(
                    conn,
                    &AgentRegistration::new("a", vec!["memory".to_string()]),
                    "t1",
                    SECRET,
                )?;
                register_agent(
                    conn,
                    &AgentRegistration::new("b", vec!["search".to_string()]),
                    "t2",
                    SECRET,
                )?;
                assert_eq!(list_agents(conn)?.len(), 2);
                assert!(delete_agent(conn, "a")?);
                assert!(!delete_agent(conn, "a")?);
                assert_eq!(list_agents(conn)?.len(), 1);
                Ok(())
            })
            .unwrap();
    }
}
