//! Per-tenant security policy -- documents plus the stateless checks.

pub mod lockout;
pub mod password;
pub mod retention;
pub mod session;

use crate::storage::Pool;
use anyhow::{Context, Result};
use rusqlite::params;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PasswordPolicy {
    pub min_length: usize,
    pub require_uppercase: bool,
    pub require_lowercase: bool,
    pub require_digit: bool,
    pub require_symbol: bool,
    /// Reuse is checked against this many previous digests.
    pub history_depth: usize,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            min_length: 12,
            require_uppercase: true,
            require_lowercase: true,
            require_digit: true,
            require_symbol: true,
            history_depth: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionPolicy {
    pub max_duration_minutes: i64,
    pub idle_timeout_minutes: i64,
    pub max_concurrent: i64,
    /// When non-empty, session IPs must be in this list.
    pub allowed_ips: Vec<String>,
    pub blocked_ips: Vec<String>,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            max_duration_minutes: 480,
            idle_timeout_minutes: 30,
            max_concurrent: 5,
            allowed_ips: Vec::new(),
            blocked_ips: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockoutPolicy {
    pub max_attempts: i64,
    pub window_minutes: i64,
    pub lockout_minutes: i64,
}

impl Default for LockoutPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            window_minutes: 30,
            lockout_minutes: 30,
        }
    }
}

/// Read-mostly policy document, one per tenant, default when absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityPolicy {
    pub password: PasswordPolicy,
    pub session: SessionPolicy,
    pub lockout: LockoutPolicy,
    pub retention_days: RetentionDays,
    pub require_encryption: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetentionDays(pub i64);

impl Default for RetentionDays {
    fn default() -> Self {
        RetentionDays(90)
    }
}

/// Load the tenant's policy, falling back to the defaults.
pub fn load_policy(pool: &Pool, tenant_id: &str) -> Result<SecurityPolicy> {
    let conn = pool.get()?;
    let raw: Option<String> = conn
        .query_row(
            "SELECT policy_json FROM tenant_policies WHERE tenant_id = ?1",
            params![tenant_id],
            |row| row.get(0),
        )
        .ok();
    match raw {
        Some(json) => serde_json::from_str(&json).context("corrupt policy document"),
        None => Ok(SecurityPolicy::default()),
    }
}

/// Persist a tenant policy. Changes are administrator actions and audited
/// by the caller as `policy_updated` events.
pub fn store_policy(pool: &Pool, tenant_id: &str, policy: &SecurityPolicy) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO tenant_policies (tenant_id, policy_json, updated_at)
         VALUES (?1, ?2, datetime('now'))
         ON CONFLICT(tenant_id) DO UPDATE SET
             policy_json = excluded.policy_json,
             updated_at = excluded.updated_at",
        params![tenant_id, serde_json::to_string(policy)?],
    )?;
    Ok(())
}
