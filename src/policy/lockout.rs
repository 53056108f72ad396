//! Login-attempt throttling and account lockout.
//!
//! Failed-login counts come from the durable event store, never process
//! memory, so every worker instance sees the same episode.

use crate::events::{insert_violation, Severity, SecurityViolation};
use crate::policy::LockoutPolicy;
use crate::storage::cache::Cache;
use crate::storage::Pool;
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rusqlite::params;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, serde::Serialize)]
pub struct LoginAttemptStatus {
    pub allowed: bool,
    pub remaining_attempts: Option<i64>,
    pub lockout_until: Option<DateTime<Utc>>,
}

/// Count recent failed logins for this principal and decide whether further
/// attempts are allowed. Once the policy threshold is reached, attempts stay
/// denied until `lockout_until`, and an `account_lockout` violation is
/// recorded exactly once per episode (via an atomic claim, not per attempt).
pub fn check_login_attempts(
    pool: &Pool,
    cache: &Cache,
    policy: &LockoutPolicy,
    email: &str,
    ip_address: Option<&str>,
    tenant_id: Option<&str>,
) -> Result<LoginAttemptStatus> {
    // An active episode pins the denial to its recorded end; the in-window
    // count is not re-consulted, so failures aging out of a shorter window
    // cannot end the lockout early.
    let fingerprint = format!("violation:account_lockout:{email}");
    if let Some(until) = cache.claim_expiry(&fingerprint)? {
        return Ok(LoginAttemptStatus {
            allowed: false,
            remaining_attempts: Some(0),
            lockout_until: Some(until),
        });
    }

    let conn = pool.get()?;
    // RFC3339 cutoff bound as a parameter; stored timestamps are RFC3339
    // and compare lexicographically.
    let cutoff = (Utc::now() - Duration::minutes(policy.window_minutes)).to_rfc3339();

    let (count, newest): (i64, Option<String>) = conn.query_row(
        "SELECT COUNT(*), MAX(created_at) FROM security_events
         WHERE kind = 'login_failed'
           AND json_extract(details_json, '$.email') = ?1
           AND created_at > ?2",
        params![email, cutoff],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    if count < policy.max_attempts {
        return Ok(LoginAttemptStatus {
            allowed: true,
            remaining_attempts: Some(policy.max_attempts - count),
            lockout_until: None,
        });
    }

    let newest = newest
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    let lockout_until = newest + Duration::minutes(policy.lockout_minutes);

    // One violation per episode: the claim expires exactly at lockout_until.
    if cache.claim(&fingerprint, lockout_until - Utc::now(), 0)? {
        warn!(email, failed = count, "account locked out");
        insert_violation(
            pool,
            &SecurityViolation {
                id: Uuid::new_v4(),
                kind: "account_lockout".into(),
                severity: Severity::High,
                user_id: None,
                tenant_id: tenant_id.map(str::to_string),
                ip_address: ip_address.map(str::to_string),
                details: serde_json::json!({
                    "email": email,
                    "failed_attempts": count,
                    "lockout_until": lockout_until.to_rfc3339(),
                }),
                created_at: Utc::now(),
            },
        )?;
    }

    Ok(LoginAttemptStatus {
        allowed: false,
        remaining_attempts: Some(0),
        lockout_until: Some(lockout_until),
    })
}
