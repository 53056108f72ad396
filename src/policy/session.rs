//! Session validity checks.

use crate::policy::SessionPolicy;
use crate::storage::Pool;
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rusqlite::params;

/// The session fields the policy engine inspects.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub ip_address: Option<String>,
}

#[derive(Debug, PartialEq, Eq, serde::Serialize)]
pub struct SessionCheck {
    pub valid: bool,
    pub reason: Option<String>,
}

impl SessionCheck {
    fn ok() -> Self {
        Self { valid: true, reason: None }
    }
    fn fail(reason: &str) -> Self {
        Self { valid: false, reason: Some(reason.into()) }
    }
}

/// Validate a session. Checks run in order of likelihood and return on the
/// first failure: wall-clock age, idle time, IP lists, concurrency cap.
pub fn validate_session(
    pool: &Pool,
    policy: &SessionPolicy,
    user_id: &str,
    tenant_id: &str,
    session: &SessionInfo,
) -> Result<SessionCheck> {
    let now = Utc::now();

    if now - session.created_at > Duration::minutes(policy.max_duration_minutes) {
        return Ok(SessionCheck::fail("session exceeded maximum duration"));
    }

    if now - session.last_activity > Duration::minutes(policy.idle_timeout_minutes) {
        return Ok(SessionCheck::fail("session idle timeout exceeded"));
    }

    if let Some(ip) = &session.ip_address {
        if policy.blocked_ips.iter().any(|b| b == ip) {
            return Ok(SessionCheck::fail("session IP is blocked"));
        }
        if !policy.allowed_ips.is_empty() && !policy.allowed_ips.iter().any(|a| a == ip) {
            return Ok(SessionCheck::fail("session IP not in allow list"));
        }
    }

    let concurrent = count_active_sessions(pool, user_id, tenant_id)?;
    if concurrent > policy.max_concurrent {
        return Ok(SessionCheck::fail("concurrent session limit exceeded"));
    }

    Ok(SessionCheck::ok())
}

/// Register or refresh a session in the shared registry.
pub fn touch_session(pool: &Pool, user_id: &str, tenant_id: &str, session: &SessionInfo) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO sessions (id, user_id, tenant_id, ip_address, created_at, last_activity)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(id) DO UPDATE SET last_activity = excluded.last_activity",
        params![
            session.id,
            user_id,
            tenant_id,
            session.ip_address,
            session.created_at.to_rfc3339(),
            session.last_activity.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn remove_session(pool: &Pool, session_id: &str) -> Result<()> {
    let conn = pool.get()?;
    conn.execute("DELETE FROM sessions WHERE id = ?1", params![session_id])?;
    Ok(())
}

fn count_active_sessions(pool: &Pool, user_id: &str, tenant_id: &str) -> Result<i64> {
    let conn = pool.get()?;
    let count = conn.query_row(
        "SELECT COUNT(*) FROM sessions WHERE user_id = ?1 AND tenant_id = ?2",
        params![user_id, tenant_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::open_pool_in_dir;

    fn fresh_session(id: &str) -> SessionInfo {
        SessionInfo {
            id: id.into(),
            created_at: Utc::now() - Duration::minutes(5),
            last_activity: Utc::now(),
            ip_address: Some("10.0.0.1".into()),
        }
    }

    #[test]
    fn test_expired_session_rejected_first() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool_in_dir(dir.path()).unwrap();
        let policy = SessionPolicy::default();

        let session = SessionInfo {
            created_at: Utc::now() - Duration::minutes(policy.max_duration_minutes + 1),
            // Idle timeout would also fail; max-duration must win (ordered checks)
            last_activity: Utc::now() - Duration::minutes(policy.idle_timeout_minutes + 1),
            ..fresh_session("s1")
        };
        let check = validate_session(&pool, &policy, "u1", "t1", &session).unwrap();
        assert!(!check.valid);
        assert_eq!(check.reason.as_deref(), Some("session exceeded maximum duration"));
    }

    #[test]
    fn test_idle_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool_in_dir(dir.path()).unwrap();
        let policy = SessionPolicy::default();

        let session = SessionInfo {
            last_activity: Utc::now() - Duration::minutes(policy.idle_timeout_minutes + 1),
            ..fresh_session("s1")
        };
        let check = validate_session(&pool, &policy, "u1", "t1", &session).unwrap();
        assert_eq!(check.reason.as_deref(), Some("session idle timeout exceeded"));
    }

    #[test]
    fn test_ip_lists() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool_in_dir(dir.path()).unwrap();

        let policy = SessionPolicy {
            blocked_ips: vec!["10.0.0.1".into()],
            ..Default::default()
        };
        let check = validate_session(&pool, &policy, "u1", "t1", &fresh_session("s1")).unwrap();
        assert_eq!(check.reason.as_deref(), Some("session IP is blocked"));

        let policy = SessionPolicy {
            allowed_ips: vec!["192.168.1.1".into()],
            ..Default::default()
        };
        let check = validate_session(&pool, &policy, "u1", "t1", &fresh_session("s1")).unwrap();
        assert_eq!(check.reason.as_deref(), Some("session IP not in allow list"));
    }

    #[test]
    fn test_concurrency_cap() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool_in_dir(dir.path()).unwrap();
        let policy = SessionPolicy { max_concurrent: 2, ..Default::default() };

        for i in 0..3 {
            touch_session(&pool, "u1", "t1", &fresh_session(&format!("s{i}"))).unwrap();
        }
        let check = validate_session(&pool, &policy, "u1", "t1", &fresh_session("s0")).unwrap();
        assert_eq!(check.reason.as_deref(), Some("concurrent session limit exceeded"));

        remove_session(&pool, "s2").unwrap();
        let check = validate_session(&pool, &policy, "u1", "t1", &fresh_session("s0")).unwrap();
        assert!(check.valid);
    }
}
