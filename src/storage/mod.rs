//! SQLite storage layer -- schema, queries, migrations.
//!
//! The same database backs the durable audit/event store, the namespaced
//! TTL cache, and the shared counters, so threshold counting stays correct
//! across horizontally scaled workers.

pub mod cache;
pub mod schema;

use anyhow::Result;
use chrono::{DateTime, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::time::Duration;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool> {
    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Open an on-disk pool for tests and tools without a daemon.
pub fn open_pool_in_dir(dir: &std::path::Path) -> Result<Pool> {
    let path = dir.join("tenantguard.db");
    open_pool(path.to_str().unwrap_or("tenantguard.db"))
}

/// A single audit record of a tenant-scoped request.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AccessRecord {
    pub tenant_id: String,
    pub user_id: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub resource: Option<String>,
    pub path: Option<String>,
    pub status_code: u16,
    pub timestamp: DateTime<Utc>,
}

/// Append an access record to the audit log.
pub fn save_access(pool: &Pool, rec: &AccessRecord) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO access_log (tenant_id, user_id, ip_address, user_agent, resource, path, status_code, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
            rec.tenant_id,
            rec.user_id,
            rec.ip_address,
            rec.user_agent,
            rec.resource,
            rec.path,
            rec.status_code,
            rec.timestamp.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Retry a read against the store with bounded, jittered backoff.
///
/// Only for idempotent reads. Decision logic is never retried; it must
/// stay deterministic for the same inputs.
pub fn with_read_retry<T>(mut f: impl FnMut() -> Result<T>) -> Result<T> {
    use rand::Rng;

    let mut last_err = None;
    for attempt in 0..3u32 {
        match f() {
            Ok(v) => return Ok(v),
            Err(e) => {
                let base = 20u64 * 2u64.pow(attempt);
                let jitter = rand::thread_rng().gen_range(0..base / 2 + 1);
                tracing::warn!(attempt, error = %e, "store read failed, retrying");
                std::thread::sleep(Duration::from_millis(base + jitter));
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("store read failed")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_access_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool_in_dir(dir.path()).unwrap();

        save_access(
            &pool,
            &AccessRecord {
                tenant_id: "t1".into(),
                user_id: "u1".into(),
                ip_address: Some("10.0.0.1".into()),
                user_agent: Some("curl/8".into()),
                resource: Some("projects".into()),
                path: Some("/api/projects/1".into()),
                status_code: 200,
                timestamp: Utc::now(),
            },
        )
        .unwrap();

        let conn = pool.get().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM access_log WHERE tenant_id = 't1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_read_retry_gives_up_after_attempts() {
        let mut calls = 0;
        let res: Result<()> = with_read_retry(|| {
            calls += 1;
            anyhow::bail!("down")
        });
        assert!(res.is_err());
        assert_eq!(calls, 3);
    }
}
