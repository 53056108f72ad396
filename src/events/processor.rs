//! Central security event pipeline.
//!
//! Every raw event runs the same sequence: classify severity, persist,
//! decide whether to alert (dedup via an atomic fingerprint claim), bump
//! shared counters, correlate recent events for attack patterns, and for
//! critical events fire the idempotent auto-response.

use crate::alerts::{bump_daily_counter, AlertLifecycleManager};
use crate::config::Config;
use crate::events::{
    insert_event, EventStatus, RawSecurityEvent, SecurityEvent, SecurityEventKind, Severity,
};
use crate::storage::cache::Cache;
use crate::storage::Pool;
use anyhow::Result;
use chrono::{Duration, Utc};
use rusqlite::params;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct SecurityEventProcessor {
    pool: Pool,
    cache: Cache,
    alerts: AlertLifecycleManager,
    config: Arc<Config>,
}

impl SecurityEventProcessor {
    pub fn new(pool: Pool, cache: Cache, alerts: AlertLifecycleManager, config: Arc<Config>) -> Self {
        Self { pool, cache, alerts, config }
    }

    /// Process one raw event end to end. Returns the persisted event.
    pub fn ingest(&self, raw: RawSecurityEvent) -> Result<SecurityEvent> {
        let severity = self.classify(&raw);
        let event = SecurityEvent {
            id: Uuid::new_v4(),
            kind: raw.kind,
            severity,
            source: raw.source,
            tenant_id: raw.tenant_id,
            user_id: raw.user_id,
            ip_address: raw.ip_address,
            user_agent: raw.user_agent,
            details: raw.details,
            status: EventStatus::New,
            created_at: Utc::now(),
            resolved_at: None,
        };

        if let Err(e) = insert_event(&self.pool, &event) {
            // Loss of audit trail is itself a security event.
            error!(kind = %event.kind, error = %e, "failed to persist security event");
            let marker = SecurityEvent {
                id: Uuid::new_v4(),
                kind: SecurityEventKind::AuditWriteFailed,
                severity: Severity::Critical,
                source: "event_processor".into(),
                tenant_id: event.tenant_id.clone(),
                user_id: None,
                ip_address: None,
                user_agent: None,
                details: serde_json::json!({ "dropped_kind": event.kind.to_string(), "error": e.to_string() }),
                status: EventStatus::New,
                created_at: Utc::now(),
                resolved_at: None,
            };
            if insert_event(&self.pool, &marker).is_ok() {
                self.raise_alert(&marker);
            }
            return Err(e);
        }

        if self.should_alert(&event)? {
            self.raise_alert(&event);
        }

        if let Some(tenant) = &event.tenant_id {
            bump_daily_counter(&self.pool, tenant, event.kind, event.severity)?;
        }

        self.detect_patterns(&event)?;

        if event.severity == Severity::Critical {
            self.auto_respond(&event)?;
        }

        Ok(event)
    }

    /// Fixed severity table keyed by kind, overridable upward when the
    /// details indicate higher impact. Never downgrades.
    fn classify(&self, raw: &RawSecurityEvent) -> Severity {
        let mut severity = raw.kind.base_severity();
        if raw.details.get("attempts").and_then(|v| v.as_i64()).unwrap_or(0) > 10 {
            severity = severity.max(Severity::High);
        }
        if raw.details.get("record_count").and_then(|v| v.as_i64()).unwrap_or(0)
            > self.config.data_export_alert_threshold
        {
            severity = severity.max(Severity::High);
        }
        // Collaborators that already graded the event (the anomaly detector's
        // mirrored events) can push severity up, never down.
        if let Some(s) = raw.details.get("severity").and_then(|v| v.as_str()) {
            severity = severity.max(Severity::parse(s));
        }
        severity
    }

    fn should_alert(&self, event: &SecurityEvent) -> Result<bool> {
        if event.severity == Severity::Critical {
            return Ok(true);
        }
        Ok(match event.kind {
            SecurityEventKind::LoginFailed => {
                self.count_recent(event, SecurityEventKind::LoginFailed, self.config.login_failed_window_minutes)?
                    >= self.config.login_failed_alert_threshold
            }
            SecurityEventKind::RateLimitExceeded => true,
            SecurityEventKind::DataExport => {
                event.details.get("record_count").and_then(|v| v.as_i64()).unwrap_or(0)
                    > self.config.data_export_alert_threshold
            }
            _ => event.severity >= Severity::High,
        })
    }

    /// Create-and-dispatch behind the dedup claim: one alert per
    /// `(kind, tenant)` fingerprint per cool-down, unless severity escalates.
    fn raise_alert(&self, event: &SecurityEvent) {
        let fingerprint = format!(
            "alert:{}:{}",
            event.kind,
            event.tenant_id.as_deref().unwrap_or("-")
        );
        let cooldown = Duration::minutes(self.config.alert_cooldown_minutes);
        match self.cache.claim(&fingerprint, cooldown, event.severity.rank()) {
            Ok(true) => match self.alerts.create_alert(event) {
                Ok(alert) => self.alerts.notify(&alert),
                Err(e) => error!(event = %event.id, error = %e, "failed to create alert"),
            },
            Ok(false) => {
                info!(fingerprint, "alert suppressed by dedup cool-down");
            }
            Err(e) => error!(fingerprint, error = %e, "alert claim failed"),
        }
    }

    /// Cross-event correlation over the trailing event window. A confirmed
    /// pattern is re-emitted as a fresh `suspicious_activity` event, which
    /// runs this pipeline itself (and may alert). Re-emitted events are
    /// excluded from the counts, so a pattern cannot re-confirm itself.
    fn detect_patterns(&self, event: &SecurityEvent) -> Result<()> {
        if event.kind == SecurityEventKind::SuspiciousActivity {
            return Ok(());
        }
        let Some(tenant) = event.tenant_id.clone() else {
            return Ok(());
        };

        let recent = self.recent_kinds(&tenant, self.config.pattern_window_events)?;
        let failed_logins = recent.iter().filter(|k| **k == SecurityEventKind::LoginFailed).count() as i64;
        let denials = recent.iter().filter(|k| **k == SecurityEventKind::AccessDenied).count() as i64;

        if failed_logins >= self.config.brute_force_threshold {
            self.reemit_pattern(&tenant, "brute_force", failed_logins)?;
        }
        if denials >= self.config.scan_threshold {
            self.reemit_pattern(&tenant, "scanning", denials)?;
        }
        Ok(())
    }

    fn reemit_pattern(&self, tenant: &str, pattern: &str, observed: i64) -> Result<()> {
        let fingerprint = format!("pattern:{pattern}:{tenant}");
        if !self.cache.claim(&fingerprint, Duration::minutes(self.config.alert_cooldown_minutes), 0)? {
            return Ok(());
        }
        warn!(tenant, pattern, observed, "attack pattern confirmed");
        self.ingest(RawSecurityEvent {
            kind: SecurityEventKind::SuspiciousActivity,
            source: "pattern_detector".into(),
            tenant_id: Some(tenant.to_string()),
            user_id: None,
            ip_address: None,
            user_agent: None,
            details: serde_json::json!({ "pattern": pattern, "observed": observed }),
        })?;
        Ok(())
    }

    /// Bounded auto-response for critical events: flag the subject for
    /// suspension. Idempotent by construction -- the ledger's primary key
    /// makes a repeat a no-op.
    fn auto_respond(&self, event: &SecurityEvent) -> Result<()> {
        let Some(tenant) = &event.tenant_id else {
            return Ok(());
        };
        let subject = event
            .user_id
            .clone()
            .or_else(|| event.ip_address.clone())
            .unwrap_or_else(|| "tenant".into());

        let conn = self.pool.get()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO response_actions (tenant_id, action, subject) VALUES (?1, ?2, ?3)",
            params![tenant, "flag_suspension", subject],
        )?;
        if inserted > 0 {
            warn!(tenant, subject, "auto-response: subject flagged for suspension");
        }
        Ok(())
    }

    fn count_recent(&self, event: &SecurityEvent, kind: SecurityEventKind, window_minutes: i64) -> Result<i64> {
        let conn = self.pool.get()?;
        // Stored timestamps are RFC3339; the cutoff must be bound in the
        // same format, not produced by datetime() (which renders with a
        // space separator and breaks lexicographic comparison).
        let cutoff = (Utc::now() - Duration::minutes(window_minutes)).to_rfc3339();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM security_events
             WHERE kind = ?1 AND tenant_id = ?2 AND created_at > ?3",
            params![kind.to_string(), event.tenant_id, cutoff],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn recent_kinds(&self, tenant: &str, limit: i64) -> Result<Vec<SecurityEventKind>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT kind FROM security_events WHERE tenant_id = ?1
             ORDER BY created_at DESC, rowid DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![tenant, limit], |row| row.get::<_, String>(0))?;
        let mut kinds = Vec::new();
        for r in rows {
            if let Some(kind) = SecurityEventKind::parse(&r?) {
                kinds.push(kind);
            }
        }
        Ok(kinds)
    }
}

/// Drain the ingest channel (enforcer denials and other in-process
/// collaborators) into the pipeline.
pub async fn run_ingest_loop(processor: SecurityEventProcessor, mut rx: mpsc::Receiver<RawSecurityEvent>) {
    info!("security event ingest loop started");
    while let Some(raw) = rx.recv().await {
        if let Err(e) = processor.ingest(raw) {
            error!(error = %e, "event ingestion failed");
        }
    }
    info!("security event ingest loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::LogNotifier;
    use crate::storage::open_pool_in_dir;

    fn processor(pool: &Pool) -> SecurityEventProcessor {
        let cache = Cache::new(pool.clone());
        let alerts = AlertLifecycleManager::new(pool.clone(), Arc::new(LogNotifier), 24);
        SecurityEventProcessor::new(pool.clone(), cache, alerts, Arc::new(Config::default()))
    }

    fn raw(kind: SecurityEventKind, tenant: &str) -> RawSecurityEvent {
        RawSecurityEvent {
            kind,
            source: "test".into(),
            tenant_id: Some(tenant.into()),
            user_id: Some("u1".into()),
            ip_address: Some("10.0.0.1".into()),
            user_agent: None,
            details: serde_json::json!({}),
        }
    }

    fn alert_count(pool: &Pool, tenant: &str) -> i64 {
        let conn = pool.get().unwrap();
        conn.query_row(
            "SELECT COUNT(*) FROM security_alerts WHERE tenant_id = ?1",
            params![tenant],
            |r| r.get(0),
        )
        .unwrap()
    }

    #[test]
    fn test_detail_driven_severity_upgrade() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool_in_dir(dir.path()).unwrap();
        let p = processor(&pool);

        let mut event = raw(SecurityEventKind::LoginFailed, "t1");
        event.details = serde_json::json!({ "attempts": 12 });
        let processed = p.ingest(event).unwrap();
        assert_eq!(processed.severity, Severity::High);

        // Base severity is untouched without the detail
        let processed = p.ingest(raw(SecurityEventKind::LoginFailed, "t1")).unwrap();
        assert_eq!(processed.severity, Severity::Low);
    }

    #[test]
    fn test_dedup_window_single_alert() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool_in_dir(dir.path()).unwrap();
        let p = processor(&pool);

        p.ingest(raw(SecurityEventKind::RateLimitExceeded, "t1")).unwrap();
        p.ingest(raw(SecurityEventKind::RateLimitExceeded, "t1")).unwrap();
        assert_eq!(alert_count(&pool, "t1"), 1);

        // A different tenant has its own fingerprint
        p.ingest(raw(SecurityEventKind::RateLimitExceeded, "t2")).unwrap();
        assert_eq!(alert_count(&pool, "t2"), 1);
    }

    #[test]
    fn test_dedup_escalation_breaks_through() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool_in_dir(dir.path()).unwrap();
        let p = processor(&pool);

        p.ingest(raw(SecurityEventKind::DataExport, "t1")).unwrap();
        let mut big = raw(SecurityEventKind::DataExport, "t1");
        big.details = serde_json::json!({ "record_count": 5000 });
        p.ingest(big.clone()).unwrap();
        assert_eq!(alert_count(&pool, "t1"), 1, "plain export stays below threshold");

        // Inside the cool-down, same severity: suppressed
        p.ingest(big).unwrap();
        assert_eq!(alert_count(&pool, "t1"), 1);
    }

    #[test]
    fn test_login_failed_alerts_only_at_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool_in_dir(dir.path()).unwrap();
        let p = processor(&pool);

        for _ in 0..4 {
            p.ingest(raw(SecurityEventKind::LoginFailed, "t1")).unwrap();
        }
        assert_eq!(alert_count(&pool, "t1"), 0);

        p.ingest(raw(SecurityEventKind::LoginFailed, "t1")).unwrap();
        // The 5th failure crosses the threshold and alerts once. (The
        // confirmed brute-force pattern raises its own, separate alert.)
        let conn = pool.get().unwrap();
        let login_alerts: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM security_alerts WHERE tenant_id = 't1' AND kind = 'login_failed'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(login_alerts, 1);
    }

    #[test]
    fn test_login_failed_window_excludes_same_day_stale_events() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool_in_dir(dir.path()).unwrap();
        let p = processor(&pool);

        // 4 failures two hours old: same UTC day, but outside the
        // 30-minute alert window.
        for _ in 0..4 {
            let processed = p.ingest(raw(SecurityEventKind::LoginFailed, "t1")).unwrap();
            let stale = (Utc::now() - Duration::hours(2)).to_rfc3339();
            let conn = pool.get().unwrap();
            conn.execute(
                "UPDATE security_events SET created_at = ?1 WHERE id = ?2",
                params![stale, processed.id.to_string()],
            )
            .unwrap();
        }

        p.ingest(raw(SecurityEventKind::LoginFailed, "t1")).unwrap();
        let conn = pool.get().unwrap();
        let login_alerts: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM security_alerts WHERE tenant_id = 't1' AND kind = 'login_failed'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(login_alerts, 0, "stale same-day failures must not count");
    }

    #[test]
    fn test_brute_force_pattern_reemitted_once() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool_in_dir(dir.path()).unwrap();
        let p = processor(&pool);

        for _ in 0..6 {
            p.ingest(raw(SecurityEventKind::LoginFailed, "t1")).unwrap();
        }

        let conn = pool.get().unwrap();
        let reemitted: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM security_events
                 WHERE kind = 'suspicious_activity'
                   AND json_extract(details_json, '$.pattern') = 'brute_force'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(reemitted, 1, "pattern claim bounds re-emission");
    }

    #[test]
    fn test_critical_auto_response_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool_in_dir(dir.path()).unwrap();
        let p = processor(&pool);

        p.ingest(raw(SecurityEventKind::AuditWriteFailed, "t1")).unwrap();
        p.ingest(raw(SecurityEventKind::AuditWriteFailed, "t1")).unwrap();

        let conn = pool.get().unwrap();
        let actions: i64 = conn
            .query_row("SELECT COUNT(*) FROM response_actions WHERE tenant_id = 't1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(actions, 1);
    }

    #[test]
    fn test_daily_counters_updated() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool_in_dir(dir.path()).unwrap();
        let p = processor(&pool);

        p.ingest(raw(SecurityEventKind::AccessDenied, "t1")).unwrap();
        p.ingest(raw(SecurityEventKind::AccessDenied, "t1")).unwrap();

        let conn = pool.get().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT count FROM metrics_daily WHERE tenant_id = 't1' AND kind = 'access_denied'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_ingest_loop_drains_channel() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool_in_dir(dir.path()).unwrap();
        let p = processor(&pool);

        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(run_ingest_loop(p, rx));
        tx.send(raw(SecurityEventKind::AccessDenied, "t1")).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        let conn = pool.get().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM security_events WHERE kind = 'access_denied'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(count, 1);
    }
}
