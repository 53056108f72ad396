//! Data retention enforcement.

use crate::storage::Pool;
use anyhow::Result;
use chrono::{Duration, Utc};
use rusqlite::params;
use tracing::info;

/// Outcome of a retention sweep. Per-table failures are collected rather
/// than aborting the sweep.
#[derive(Debug, Default, serde::Serialize)]
pub struct RetentionReport {
    pub deleted: usize,
    pub errors: Vec<String>,
}

const RETAINED_TABLES: &[(&str, &str)] = &[
    ("security_events", "created_at"),
    ("access_log", "created_at"),
    ("access_anomalies", "detected_at"),
    ("security_violations", "created_at"),
    ("security_alerts", "created_at"),
];

/// Delete tenant records older than the retention cutoff.
///
/// Idempotent and safe to run concurrently with the event pipeline: the
/// cutoff is computed once, so a back-to-back run deletes zero extra rows
/// and a record younger than the cutoff is never touched.
pub fn enforce_data_retention(pool: &Pool, tenant_id: &str, retention_days: i64) -> Result<RetentionReport> {
    let cutoff = (Utc::now() - Duration::days(retention_days)).to_rfc3339();
    let conn = pool.get()?;
    let mut report = RetentionReport::default();

    for (table, time_col) in RETAINED_TABLES {
        let sql = format!("DELETE FROM {table} WHERE tenant_id = ?1 AND {time_col} < ?2");
        match conn.execute(&sql, params![tenant_id, cutoff]) {
            Ok(n) => report.deleted += n,
            Err(e) => report.errors.push(format!("{table}: {e}")),
        }
    }

    info!(tenant = %tenant_id, deleted = report.deleted, "retention sweep complete");
    Ok(report)
}

/// Tenants eligible for a retention sweep: anyone with a policy row or with
/// stored events.
pub fn tenants_with_data(pool: &Pool) -> Result<Vec<String>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT tenant_id FROM tenant_policies
         UNION
         SELECT DISTINCT tenant_id FROM security_events WHERE tenant_id IS NOT NULL",
    )?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut tenants = Vec::new();
    for r in rows {
        tenants.push(r?);
    }
    Ok(tenants)
}
