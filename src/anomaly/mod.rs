//! Real-time access anomaly detection.
//!
//! Every live access runs through six independent checks against the user's
//! baseline and trailing-window counters. Triggered anomalies are persisted
//! and mirrored as `suspicious_activity` events so they flow through the
//! same alert pipeline as everything else.

use crate::baseline::AccessPatternBaseliner;
use crate::config::Config;
use crate::events::processor::SecurityEventProcessor;
use crate::events::{RawSecurityEvent, SecurityEventKind, Severity};
use crate::storage::{save_access, AccessRecord, Pool};
use anyhow::Result;
use chrono::{DateTime, Datelike, Timelike, Utc};
use rusqlite::params;
use std::sync::Arc;
use tracing::{error, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    UnusualTime,
    UnusualLocation,
    UnusualDevice,
    HighVolume,
    SuspiciousPattern,
    PrivilegeEscalation,
}

impl std::fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AnomalyKind::UnusualTime => "unusual_time",
            AnomalyKind::UnusualLocation => "unusual_location",
            AnomalyKind::UnusualDevice => "unusual_device",
            AnomalyKind::HighVolume => "high_volume",
            AnomalyKind::SuspiciousPattern => "suspicious_pattern",
            AnomalyKind::PrivilegeEscalation => "privilege_escalation",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AccessAnomaly {
    pub id: Uuid,
    pub user_id: String,
    pub tenant_id: String,
    pub kind: AnomalyKind,
    pub severity: Severity,
    pub details: serde_json::Value,
    pub detected_at: DateTime<Utc>,
}

/// The live access under evaluation.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AccessEvent {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub resource: Option<String>,
    pub path: Option<String>,
    #[serde(default = "default_status")]
    pub status_code: u16,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

fn default_status() -> u16 {
    200
}

#[derive(Clone)]
pub struct AnomalyDetector {
    pool: Pool,
    baseliner: AccessPatternBaseliner,
    processor: SecurityEventProcessor,
    config: Arc<Config>,
}

impl AnomalyDetector {
    pub fn new(
        pool: Pool,
        baseliner: AccessPatternBaseliner,
        processor: SecurityEventProcessor,
        config: Arc<Config>,
    ) -> Self {
        Self { pool, baseliner, processor, config }
    }

    /// Evaluate a live access. Detection failures never surface to the
    /// caller silently: the failure is recorded as a `processing_error`
    /// event first, then the result degrades to "no anomaly".
    pub fn monitor_access(
        &self,
        user_id: &str,
        tenant_id: &str,
        event: &AccessEvent,
    ) -> Result<Vec<AccessAnomaly>> {
        match self.evaluate(user_id, tenant_id, event) {
            Ok(anomalies) => Ok(anomalies),
            Err(e) => {
                error!(user = %user_id, tenant = %tenant_id, error = %e, "anomaly evaluation failed");
                let marker = RawSecurityEvent {
                    kind: SecurityEventKind::ProcessingError,
                    source: "anomaly_detector".into(),
                    tenant_id: Some(tenant_id.into()),
                    user_id: Some(user_id.into()),
                    ip_address: event.ip_address.clone(),
                    user_agent: None,
                    details: serde_json::json!({ "error": e.to_string() }),
                };
                if let Err(write_err) = self.processor.ingest(marker) {
                    error!(error = %write_err, "failed to record processing_error event");
                }
                Ok(Vec::new())
            }
        }
    }

    fn evaluate(&self, user_id: &str, tenant_id: &str, event: &AccessEvent) -> Result<Vec<AccessAnomaly>> {
        let pattern = self.baseliner.get(user_id, tenant_id)?;
        let learning = pattern.samples < self.config.baseline_min_samples;
        let mut anomalies = Vec::new();

        if !learning {
            let hour = event.timestamp.hour() as u8;
            let (start, end) = pattern.normal_hours;
            let in_normal_hours = hour >= start && hour <= end;
            let in_off_hours_band = hour >= self.config.off_hours_start || hour < self.config.off_hours_end;
            if !in_normal_hours && !in_off_hours_band {
                anomalies.push(self.anomaly(
                    user_id,
                    tenant_id,
                    AnomalyKind::UnusualTime,
                    Severity::Medium,
                    serde_json::json!({ "hour": hour, "normal_hours": [start, end] }),
                    event.timestamp,
                ));
            }
            let day = event.timestamp.weekday().num_days_from_sunday() as u8;
            if !pattern.normal_days.contains(&day) {
                anomalies.push(self.anomaly(
                    user_id,
                    tenant_id,
                    AnomalyKind::UnusualTime,
                    Severity::Low,
                    serde_json::json!({ "day": day, "normal_days": pattern.normal_days }),
                    event.timestamp,
                ));
            }

            if let Some(ip) = &event.ip_address {
                // First-time-IP heuristic: a returning-but-uncommon IP is
                // not anomalous, only one with no successful history at all.
                if !pattern.typical_locations.contains(ip) && !self.ip_seen_before(user_id, tenant_id, ip)? {
                    anomalies.push(self.anomaly(
                        user_id,
                        tenant_id,
                        AnomalyKind::UnusualLocation,
                        Severity::High,
                        serde_json::json!({ "ip_address": ip }),
                        event.timestamp,
                    ));
                }
            }

            if let Some(ua) = &event.user_agent {
                if !pattern.typical_devices.contains(ua) {
                    anomalies.push(self.anomaly(
                        user_id,
                        tenant_id,
                        AnomalyKind::UnusualDevice,
                        Severity::Medium,
                        serde_json::json!({ "user_agent": ua }),
                        event.timestamp,
                    ));
                }
            }

            if pattern.average_requests_per_hour > 0.0 {
                let trailing = self.count_accesses_trailing_hour(user_id, tenant_id, event.timestamp)? + 1;
                let limit = pattern.average_requests_per_hour * self.config.volume_multiplier;
                if trailing as f64 > limit {
                    anomalies.push(self.anomaly(
                        user_id,
                        tenant_id,
                        AnomalyKind::HighVolume,
                        Severity::High,
                        serde_json::json!({
                            "requests_last_hour": trailing,
                            "baseline_per_hour": pattern.average_requests_per_hour,
                        }),
                        event.timestamp,
                    ));
                }
            }
        }

        // Sensitive paths are anomalous independent of any baseline.
        if let Some(path) = &event.path {
            if let Some(matched) = self.config.sensitive_paths.iter().find(|p| path.contains(p.as_str())) {
                anomalies.push(self.anomaly(
                    user_id,
                    tenant_id,
                    AnomalyKind::SuspiciousPattern,
                    Severity::High,
                    serde_json::json!({ "path": path, "pattern": matched }),
                    event.timestamp,
                ));
            }
        }

        let prior_denials = self.count_denials_trailing_window(user_id, tenant_id, event.timestamp)?;
        let denials = prior_denials + i64::from(event.status_code == 403);
        if denials >= self.config.denial_threshold {
            anomalies.push(self.anomaly(
                user_id,
                tenant_id,
                AnomalyKind::PrivilegeEscalation,
                Severity::Critical,
                serde_json::json!({
                    "denials": denials,
                    "window_minutes": self.config.denial_window_minutes,
                }),
                event.timestamp,
            ));
        }

        for anomaly in &anomalies {
            self.record(anomaly)?;
        }

        // Feedback loop: a confirmed-normal access refreshes the baseline
        // on the next lookup instead of through a retraining job.
        if anomalies.is_empty() && !learning {
            self.baseliner.invalidate(user_id, tenant_id)?;
        }

        save_access(
            &self.pool,
            &AccessRecord {
                tenant_id: tenant_id.into(),
                user_id: user_id.into(),
                ip_address: event.ip_address.clone(),
                user_agent: event.user_agent.clone(),
                resource: event.resource.clone(),
                path: event.path.clone(),
                status_code: event.status_code,
                timestamp: event.timestamp,
            },
        )?;

        Ok(anomalies)
    }

    fn anomaly(
        &self,
        user_id: &str,
        tenant_id: &str,
        kind: AnomalyKind,
        severity: Severity,
        details: serde_json::Value,
        detected_at: DateTime<Utc>,
    ) -> AccessAnomaly {
        AccessAnomaly {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            tenant_id: tenant_id.into(),
            kind,
            severity,
            details,
            detected_at,
        }
    }

    /// Persist the anomaly and mirror it through the full event pipeline,
    /// so a critical anomaly alerts, counts, and auto-responds like any
    /// other critical event.
    fn record(&self, anomaly: &AccessAnomaly) -> Result<()> {
        warn!(
            user = %anomaly.user_id,
            tenant = %anomaly.tenant_id,
            kind = %anomaly.kind,
            severity = %anomaly.severity,
            "access anomaly detected"
        );
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO access_anomalies (id, user_id, tenant_id, kind, severity, details_json, detected_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                anomaly.id.to_string(),
                anomaly.user_id,
                anomaly.tenant_id,
                anomaly.kind.to_string(),
                anomaly.severity.to_string(),
                anomaly.details.to_string(),
                anomaly.detected_at.to_rfc3339(),
            ],
        )?;
        drop(conn);

        self.processor.ingest(RawSecurityEvent {
            kind: SecurityEventKind::SuspiciousActivity,
            source: "anomaly_detector".into(),
            tenant_id: Some(anomaly.tenant_id.clone()),
            user_id: Some(anomaly.user_id.clone()),
            ip_address: None,
            user_agent: None,
            details: serde_json::json!({
                "anomaly_id": anomaly.id.to_string(),
                "anomaly_kind": anomaly.kind.to_string(),
                "severity": anomaly.severity.to_string(),
            }),
        })?;
        Ok(())
    }

    fn ip_seen_before(&self, user_id: &str, tenant_id: &str, ip: &str) -> Result<bool> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM access_log
             WHERE tenant_id = ?1 AND user_id = ?2 AND ip_address = ?3 AND status_code < 400",
            params![tenant_id, user_id, ip],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn count_accesses_trailing_hour(&self, user_id: &str, tenant_id: &str, at: DateTime<Utc>) -> Result<i64> {
        let conn = self.pool.get()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM access_log
             WHERE tenant_id = ?1 AND user_id = ?2 AND created_at > ?3 AND created_at <= ?4",
            params![
                tenant_id,
                user_id,
                (at - chrono::Duration::hours(1)).to_rfc3339(),
                at.to_rfc3339()
            ],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn count_denials_trailing_window(&self, user_id: &str, tenant_id: &str, at: DateTime<Utc>) -> Result<i64> {
        let conn = self.pool.get()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM access_log
             WHERE tenant_id = ?1 AND user_id = ?2 AND status_code = 403
               AND created_at > ?3 AND created_at <= ?4",
            params![
                tenant_id,
                user_id,
                (at - chrono::Duration::minutes(self.config.denial_window_minutes)).to_rfc3339(),
                at.to_rfc3339()
            ],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}
