//! Password strength and reuse checks.

use crate::policy::PasswordPolicy;
use crate::storage::Pool;
use anyhow::Result;
use rusqlite::params;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// Outcome of a password validation. All violated rules are reported
/// together so the caller can show the complete list.
#[derive(Debug, serde::Serialize)]
pub struct PasswordCheck {
    pub valid: bool,
    pub errors: Vec<String>,
}

/// Validate a candidate password against the policy, and (when a user is
/// given) against their stored password history. Checks are independent;
/// none short-circuits.
pub fn validate_password(
    pool: &Pool,
    policy: &PasswordPolicy,
    password: &str,
    user_id: Option<&str>,
) -> Result<PasswordCheck> {
    let mut errors = Vec::new();

    if password.chars().count() < policy.min_length {
        errors.push(format!("must be at least {} characters", policy.min_length));
    }
    if policy.require_uppercase && !password.chars().any(|c| c.is_ascii_uppercase()) {
        errors.push("must contain an uppercase letter".into());
    }
    if policy.require_lowercase && !password.chars().any(|c| c.is_ascii_lowercase()) {
        errors.push("must contain a lowercase letter".into());
    }
    if policy.require_digit && !password.chars().any(|c| c.is_ascii_digit()) {
        errors.push("must contain a digit".into());
    }
    if policy.require_symbol && !password.chars().any(|c| !c.is_alphanumeric()) {
        errors.push("must contain a symbol".into());
    }

    if let Some(user_id) = user_id {
        let digest = digest_password(password);
        if is_reused(pool, user_id, &digest, policy.history_depth)? {
            errors.push(format!(
                "must not match any of the last {} passwords",
                policy.history_depth
            ));
        }
    }

    Ok(PasswordCheck { valid: errors.is_empty(), errors })
}

/// Record an accepted password digest and trim history to the policy depth.
pub fn record_password(pool: &Pool, policy: &PasswordPolicy, user_id: &str, password: &str) -> Result<()> {
    let digest = digest_password(password);
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO password_history (user_id, digest, created_at) VALUES (?1, ?2, datetime('now'))",
        params![user_id, digest.as_str()],
    )?;
    conn.execute(
        "DELETE FROM password_history WHERE user_id = ?1 AND id NOT IN (
             SELECT id FROM password_history WHERE user_id = ?1
             ORDER BY created_at DESC, id DESC LIMIT ?2)",
        params![user_id, policy.history_depth as i64],
    )?;
    Ok(())
}

fn is_reused(pool: &Pool, user_id: &str, digest: &str, depth: usize) -> Result<bool> {
    let conn = pool.get()?;
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM (
             SELECT digest FROM password_history WHERE user_id = ?1
             ORDER BY created_at DESC, id DESC LIMIT ?2
         ) WHERE digest = ?3",
        params![user_id, depth as i64, digest],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn digest_password(password: &str) -> Zeroizing<String> {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    Zeroizing::new(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::open_pool_in_dir;

    fn setup() -> (tempfile::TempDir, Pool) {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool_in_dir(dir.path()).unwrap();
        (dir, pool)
    }

    #[test]
    fn test_all_violations_reported_together() {
        let (_dir, pool) = setup();
        let policy = PasswordPolicy::default();

        let check = validate_password(&pool, &policy, "short", None).unwrap();
        assert!(!check.valid);
        // length, uppercase, digit, symbol all fail at once
        assert_eq!(check.errors.len(), 4);
    }

    #[test]
    fn test_strong_password_passes() {
        let (_dir, pool) = setup();
        let policy = PasswordPolicy::default();
        let check = validate_password(&pool, &policy, "Horse-Battery-42", None).unwrap();
        assert!(check.valid, "{:?}", check.errors);
    }

    #[test]
    fn test_reuse_within_history_depth_rejected() {
        let (_dir, pool) = setup();
        let policy = PasswordPolicy { history_depth: 2, ..Default::default() };

        record_password(&pool, &policy, "u1", "Old-Password-1!").unwrap();
        record_password(&pool, &policy, "u1", "Old-Password-2!").unwrap();

        let check = validate_password(&pool, &policy, "Old-Password-2!", Some("u1")).unwrap();
        assert!(!check.valid);
        assert!(check.errors.iter().any(|e| e.contains("last 2 passwords")));

        // Outside the depth after two more rotations
        record_password(&pool, &policy, "u1", "Old-Password-3!").unwrap();
        record_password(&pool, &policy, "u1", "Old-Password-4!").unwrap();
        let check = validate_password(&pool, &policy, "Old-Password-1!", Some("u1")).unwrap();
        assert!(check.valid, "{:?}", check.errors);
    }

    #[test]
    fn test_history_is_per_user() {
        let (_dir, pool) = setup();
        let policy = PasswordPolicy::default();
        record_password(&pool, &policy, "u1", "Shared-Secret-9!").unwrap();
        let check = validate_password(&pool, &policy, "Shared-Secret-9!", Some("u2")).unwrap();
        assert!(check.valid);
    }
}
