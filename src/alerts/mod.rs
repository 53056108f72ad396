//! Alert lifecycle -- creation, acknowledgment, listing, derived metrics.

use crate::dispatch::Notifier;
use crate::events::{SecurityEvent, SecurityEventKind, Severity};
use crate::storage::Pool;
use crate::tenant::{ScopedQuery, TenantContext};
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rusqlite::params;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("alert not found: {0}")]
    NotFound(Uuid),
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SecurityAlert {
    pub id: Uuid,
    pub event_id: Uuid,
    pub kind: SecurityEventKind,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub recommendations: Vec<String>,
    pub tenant_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub acknowledged: bool,
    pub acknowledged_by: Option<String>,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct AlertFilter {
    pub severity: Option<Severity>,
    pub acknowledged: Option<bool>,
    pub limit: usize,
}

/// Static per-kind alert copy.
fn catalog(kind: SecurityEventKind) -> (&'static str, &'static str, &'static [&'static str]) {
    match kind {
        SecurityEventKind::LoginFailed => (
            "Repeated login failures",
            "Multiple failed login attempts were detected for an account in this tenant.",
            &["Verify the account owner attempted these logins", "Consider forcing a password reset"],
        ),
        SecurityEventKind::RateLimitExceeded => (
            "Rate limit exceeded",
            "A client exceeded the request rate limit.",
            &["Inspect the source IP", "Tighten rate limits if this recurs"],
        ),
        SecurityEventKind::DataExport => (
            "Large data export",
            "An export touched an unusually large number of records.",
            &["Confirm the export was authorized", "Review the exporting user's recent activity"],
        ),
        SecurityEventKind::SuspiciousActivity => (
            "Suspicious activity",
            "Access deviated from the user's established behavior profile.",
            &["Review the attached anomaly details", "Contact the user to confirm the activity"],
        ),
        SecurityEventKind::AccessDenied => (
            "Access denied pattern",
            "A caller was denied access to tenant-scoped resources.",
            &["Check whether the caller's permissions changed recently"],
        ),
        SecurityEventKind::AuditWriteFailed => (
            "Audit trail write failure",
            "A security event could not be persisted; the audit trail may be incomplete.",
            &["Check the event store immediately", "Treat the gap window as unaudited"],
        ),
        SecurityEventKind::LoginSuccess
        | SecurityEventKind::PasswordChanged
        | SecurityEventKind::PolicyUpdated
        | SecurityEventKind::SessionRevoked
        | SecurityEventKind::ProcessingError => (
            "Security event",
            "A security-relevant event crossed the alerting threshold.",
            &["Review the triggering event"],
        ),
    }
}

#[derive(Clone)]
pub struct AlertLifecycleManager {
    pool: Pool,
    notifier: Arc<dyn Notifier>,
    ttl_hours: i64,
}

impl AlertLifecycleManager {
    pub fn new(pool: Pool, notifier: Arc<dyn Notifier>, ttl_hours: i64) -> Self {
        Self { pool, notifier, ttl_hours }
    }

    /// Create and persist an alert for a triggering event. Dedup has already
    /// happened (the processor holds the fingerprint claim).
    pub fn create_alert(&self, event: &SecurityEvent) -> Result<SecurityAlert> {
        let (title, description, recommendations) = catalog(event.kind);
        let alert = SecurityAlert {
            id: Uuid::new_v4(),
            event_id: event.id,
            kind: event.kind,
            severity: event.severity,
            title: title.to_string(),
            description: description.to_string(),
            recommendations: recommendations.iter().map(|s| s.to_string()).collect(),
            tenant_id: event.tenant_id.clone(),
            created_at: Utc::now(),
            acknowledged: false,
            acknowledged_by: None,
            acknowledged_at: None,
        };

        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO security_alerts
                (id, event_id, kind, severity, title, description, recommendations_json,
                 tenant_id, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                alert.id.to_string(),
                alert.event_id.to_string(),
                alert.kind.to_string(),
                alert.severity.to_string(),
                alert.title,
                alert.description,
                serde_json::to_string(&alert.recommendations)?,
                alert.tenant_id,
                alert.created_at.to_rfc3339(),
                (alert.created_at + Duration::hours(self.ttl_hours)).to_rfc3339(),
            ],
        )?;

        info!(alert = %alert.id, kind = %alert.kind, severity = %alert.severity, "alert created");
        Ok(alert)
    }

    /// Dispatch the alert to the notifier, fire-and-forget. Delivery
    /// guarantees are the dispatcher's problem, not ours.
    pub fn notify(&self, alert: &SecurityAlert) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            // CLI one-shot paths have no runtime; the alert is already persisted.
            tracing::debug!(alert = %alert.id, "no runtime, skipping notification dispatch");
            return;
        };
        let notifier = Arc::clone(&self.notifier);
        let alert = alert.clone();
        handle.spawn(async move {
            if let Err(e) = notifier.send(&alert).await {
                tracing::warn!(alert = %alert.id, error = %e, "alert notification failed");
            }
        });
    }

    /// Acknowledge an alert. Idempotent: acknowledging twice leaves the
    /// first acknowledgment untouched and is not an error.
    pub fn acknowledge_alert(&self, alert_id: Uuid, user_id: &str, tenant_id: &str) -> Result<()> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE security_alerts
             SET acknowledged = 1, acknowledged_by = ?1, acknowledged_at = ?2
             WHERE id = ?3 AND tenant_id = ?4 AND acknowledged = 0",
            params![user_id, Utc::now().to_rfc3339(), alert_id.to_string(), tenant_id],
        )?;
        if changed == 0 {
            let exists: i64 = conn.query_row(
                "SELECT COUNT(*) FROM security_alerts WHERE id = ?1 AND tenant_id = ?2",
                params![alert_id.to_string(), tenant_id],
                |row| row.get(0),
            )?;
            if exists == 0 {
                return Err(AlertError::NotFound(alert_id).into());
            }
        }
        Ok(())
    }

    /// List unexpired alerts for the caller's tenant, newest first. The
    /// tenant predicate is injected by `ScopedQuery`, not by convention.
    pub fn list_alerts(&self, ctx: &TenantContext, filter: &AlertFilter) -> Result<Vec<SecurityAlert>> {
        let mut query = ScopedQuery::new(
            "security_alerts",
            "id, event_id, kind, severity, title, description, recommendations_json,
             tenant_id, created_at, acknowledged, acknowledged_by, acknowledged_at",
            ctx,
        )
        .and("expires_at >", Utc::now().to_rfc3339());
        if let Some(severity) = filter.severity {
            query = query.and("severity =", severity.to_string());
        }
        if let Some(ack) = filter.acknowledged {
            query = query.and("acknowledged =", if ack { "1" } else { "0" });
        }
        let (sql, params) = query.build();
        let limit = if filter.limit == 0 { 100 } else { filter.limit };
        let sql = format!("{sql} ORDER BY created_at DESC LIMIT {limit}");

        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
            let recommendations: String = row.get(6)?;
            let ack_at: Option<String> = row.get(11)?;
            Ok(SecurityAlert {
                id: Uuid::parse_str(&row.get::<_, String>(0)?).unwrap_or_default(),
                event_id: Uuid::parse_str(&row.get::<_, String>(1)?).unwrap_or_default(),
                kind: SecurityEventKind::parse(&row.get::<_, String>(2)?)
                    .unwrap_or(SecurityEventKind::SuspiciousActivity),
                severity: Severity::parse(&row.get::<_, String>(3)?),
                title: row.get(4)?,
                description: row.get(5)?,
                recommendations: serde_json::from_str(&recommendations).unwrap_or_default(),
                tenant_id: row.get(7)?,
                created_at: parse_ts(&row.get::<_, String>(8)?),
                acknowledged: row.get::<_, i64>(9)? != 0,
                acknowledged_by: row.get(10)?,
                acknowledged_at: ack_at.map(|s| parse_ts(&s)),
            })
        })?;

        let mut alerts = Vec::new();
        for r in rows {
            alerts.push(r?);
        }
        Ok(alerts)
    }

    /// Aggregate security metrics over the event store for a period.
    /// Events without a resolution are excluded from MTTR, never counted
    /// as zero.
    pub fn get_security_metrics(&self, tenant_id: &str, period_days: i64) -> Result<SecurityMetrics> {
        let conn = self.pool.get()?;
        // Cutoffs are computed here and bound as parameters; the stored
        // timestamps are RFC3339 and must be compared against the same format.
        let cutoff = (Utc::now() - Duration::days(period_days)).to_rfc3339();
        let day_cutoff = (Utc::now() - Duration::days(period_days))
            .format("%Y-%m-%d")
            .to_string();

        let total_events: i64 = conn.query_row(
            "SELECT COUNT(*) FROM security_events
             WHERE tenant_id = ?1 AND created_at > ?2",
            params![tenant_id, cutoff],
            |row| row.get(0),
        )?;

        let by_kind = count_grouped(
            &conn,
            "SELECT kind, COUNT(*) FROM security_events
             WHERE tenant_id = ?1 AND created_at > ?2
             GROUP BY kind ORDER BY COUNT(*) DESC",
            tenant_id,
            &cutoff,
        )?;
        let by_severity = count_grouped(
            &conn,
            "SELECT severity, COUNT(*) FROM security_events
             WHERE tenant_id = ?1 AND created_at > ?2
             GROUP BY severity ORDER BY COUNT(*) DESC",
            tenant_id,
            &cutoff,
        )?;
        let top_sources = count_grouped(
            &conn,
            "SELECT source, COUNT(*) FROM security_events
             WHERE tenant_id = ?1 AND created_at > ?2
             GROUP BY source ORDER BY COUNT(*) DESC LIMIT 10",
            tenant_id,
            &cutoff,
        )?;
        let top_users = count_grouped(
            &conn,
            "SELECT user_id, COUNT(*) FROM security_events
             WHERE tenant_id = ?1 AND user_id IS NOT NULL AND created_at > ?2
             GROUP BY user_id ORDER BY COUNT(*) DESC LIMIT 10",
            tenant_id,
            &cutoff,
        )?;

        // Daily trend comes from the shared upsert counters the processor
        // maintains, not a table scan.
        let daily_trend = count_grouped(
            &conn,
            "SELECT day, SUM(count) FROM metrics_daily
             WHERE tenant_id = ?1 AND day > ?2
             GROUP BY day ORDER BY day ASC",
            tenant_id,
            &day_cutoff,
        )?;

        let mttr_minutes: Option<f64> = conn
            .query_row(
                "SELECT AVG((julianday(resolved_at) - julianday(created_at)) * 1440.0)
                 FROM security_events
                 WHERE tenant_id = ?1 AND status = 'resolved' AND resolved_at IS NOT NULL
                   AND created_at > ?2",
                params![tenant_id, cutoff],
                |row| row.get(0),
            )
            .unwrap_or(None);

        let false_positives: i64 = conn.query_row(
            "SELECT COUNT(*) FROM security_events
             WHERE tenant_id = ?1 AND status = 'false_positive' AND created_at > ?2",
            params![tenant_id, cutoff],
            |row| row.get(0),
        )?;
        let false_positive_rate = if total_events > 0 {
            false_positives as f64 / total_events as f64
        } else {
            0.0
        };

        Ok(SecurityMetrics {
            period_days,
            total_events,
            by_kind,
            by_severity,
            top_sources,
            top_users,
            daily_trend,
            mttr_minutes,
            false_positive_rate,
        })
    }
}

fn count_grouped(
    conn: &rusqlite::Connection,
    sql: &str,
    tenant_id: &str,
    cutoff: &str,
) -> Result<Vec<(String, i64)>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params![tenant_id, cutoff], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_default()
}

#[derive(Debug, serde::Serialize)]
pub struct SecurityMetrics {
    pub period_days: i64,
    pub total_events: i64,
    pub by_kind: Vec<(String, i64)>,
    pub by_severity: Vec<(String, i64)>,
    pub top_sources: Vec<(String, i64)>,
    pub top_users: Vec<(String, i64)>,
    pub daily_trend: Vec<(String, i64)>,
    pub mttr_minutes: Option<f64>,
    pub false_positive_rate: f64,
}

/// Increment the shared per-tenant-per-day counter for an event.
pub fn bump_daily_counter(pool: &Pool, tenant_id: &str, kind: SecurityEventKind, severity: Severity) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO metrics_daily (tenant_id, day, kind, severity, count)
         VALUES (?1, date('now'), ?2, ?3, 1)
         ON CONFLICT(tenant_id, day, kind, severity) DO UPDATE SET count = count + 1",
        params![tenant_id, kind.to_string(), severity.to_string()],
    )?;
    Ok(())
}
