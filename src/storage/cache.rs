//! Shared TTL cache and atomic claim primitive.
//!
//! Both live in the SQLite store rather than process memory so that TTLs,
//! dedup cool-downs, and once-only episodes hold across worker instances.

use crate::storage::Pool;
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rusqlite::params;

/// Namespaced, tenant-scoped key/value cache with explicit expiry.
#[derive(Clone)]
pub struct Cache {
    pool: Pool,
}

impl Cache {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Fetch a value. Expired entries are never returned, regardless of
    /// whether the purge task has run.
    pub fn get(&self, namespace: &str, tenant_id: &str, key: &str) -> Result<Option<serde_json::Value>> {
        let conn = self.pool.get()?;
        let now = Utc::now().to_rfc3339();
        let mut stmt = conn.prepare(
            "SELECT value_json FROM cache_entries
             WHERE namespace = ?1 AND tenant_id = ?2 AND key = ?3 AND expires_at > ?4",
        )?;
        let mut rows = stmt.query(params![namespace, tenant_id, key, now])?;
        match rows.next()? {
            Some(row) => {
                let raw: String = row.get(0)?;
                Ok(Some(serde_json::from_str(&raw)?))
            }
            None => Ok(None),
        }
    }

    pub fn set(
        &self,
        namespace: &str,
        tenant_id: &str,
        key: &str,
        value: &serde_json::Value,
        ttl: Duration,
    ) -> Result<()> {
        let conn = self.pool.get()?;
        let expires_at = (Utc::now() + ttl).to_rfc3339();
        conn.execute(
            "INSERT INTO cache_entries (namespace, tenant_id, key, value_json, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(namespace, tenant_id, key) DO UPDATE SET
                 value_json = excluded.value_json,
                 expires_at = excluded.expires_at",
            params![namespace, tenant_id, key, value.to_string(), expires_at],
        )?;
        Ok(())
    }

    pub fn delete(&self, namespace: &str, tenant_id: &str, key: &str) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "DELETE FROM cache_entries WHERE namespace = ?1 AND tenant_id = ?2 AND key = ?3",
            params![namespace, tenant_id, key],
        )?;
        Ok(())
    }

    /// Try to claim a fingerprint for `ttl`.
    ///
    /// Exactly one caller wins for a given fingerprint until the claim
    /// expires; a later claim with a strictly higher severity rank takes
    /// over early (alert escalation). The whole decision is a single
    /// conditional upsert, so concurrent callers cannot both win.
    pub fn claim(&self, fingerprint: &str, ttl: Duration, severity_rank: i64) -> Result<bool> {
        let conn = self.pool.get()?;
        let now = Utc::now();
        let changed = conn.execute(
            "INSERT INTO claims (fingerprint, severity_rank, expires_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(fingerprint) DO UPDATE SET
                 severity_rank = excluded.severity_rank,
                 expires_at = excluded.expires_at
             WHERE claims.expires_at <= ?4
                OR excluded.severity_rank > claims.severity_rank",
            params![
                fingerprint,
                severity_rank,
                (now + ttl).to_rfc3339(),
                now.to_rfc3339()
            ],
        )?;
        Ok(changed > 0)
    }

    /// Expiry of an unexpired claim on `fingerprint`, if one is held.
    pub fn claim_expiry(&self, fingerprint: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.pool.get()?;
        let now = Utc::now().to_rfc3339();
        let mut stmt = conn.prepare(
            "SELECT expires_at FROM claims WHERE fingerprint = ?1 AND expires_at > ?2",
        )?;
        let mut rows = stmt.query(params![fingerprint, now])?;
        match rows.next()? {
            Some(row) => {
                let raw: String = row.get(0)?;
                Ok(DateTime::parse_from_rfc3339(&raw)
                    .ok()
                    .map(|t| t.with_timezone(&Utc)))
            }
            None => Ok(None),
        }
    }

    /// Drop expired cache entries and claims. Called from the maintenance loop.
    pub fn purge_expired(&self) -> Result<usize> {
        let conn = self.pool.get()?;
        let now = Utc::now().to_rfc3339();
        let mut purged = conn.execute("DELETE FROM cache_entries WHERE expires_at <= ?1", params![now])?;
        purged += conn.execute("DELETE FROM claims WHERE expires_at <= ?1", params![now])?;
        Ok(purged)
    }
}
