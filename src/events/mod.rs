//! Security event types and the event processing pipeline.

pub mod processor;

use crate::storage::Pool;
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::params;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum EventError {
    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: EventStatus, to: EventStatus },
    #[error("event not found: {0}")]
    NotFound(Uuid),
}

/// Severity levels, ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn rank(self) -> i64 {
        match self {
            Severity::Low => 0,
            Severity::Medium => 1,
            Severity::High => 2,
            Severity::Critical => 3,
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "critical" => Severity::Critical,
            "high" => Severity::High,
            "medium" => Severity::Medium,
            _ => Severity::Low,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Closed set of security event kinds.
///
/// Adding a kind forces every `match` below (severity table, alert decision,
/// catalog) to be revisited at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventKind {
    LoginFailed,
    LoginSuccess,
    AccessDenied,
    RateLimitExceeded,
    DataExport,
    SuspiciousActivity,
    PasswordChanged,
    PolicyUpdated,
    SessionRevoked,
    AuditWriteFailed,
    ProcessingError,
}

impl SecurityEventKind {
    /// Baseline severity per kind; the processor may upgrade it from
    /// event details, never downgrade.
    pub fn base_severity(self) -> Severity {
        match self {
            SecurityEventKind::LoginFailed => Severity::Low,
            SecurityEventKind::LoginSuccess => Severity::Low,
            SecurityEventKind::AccessDenied => Severity::Medium,
            SecurityEventKind::RateLimitExceeded => Severity::Medium,
            SecurityEventKind::DataExport => Severity::Medium,
            SecurityEventKind::SuspiciousActivity => Severity::High,
            SecurityEventKind::PasswordChanged => Severity::Low,
            SecurityEventKind::PolicyUpdated => Severity::Low,
            SecurityEventKind::SessionRevoked => Severity::Medium,
            SecurityEventKind::AuditWriteFailed => Severity::Critical,
            SecurityEventKind::ProcessingError => Severity::High,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "login_failed" => SecurityEventKind::LoginFailed,
            "login_success" => SecurityEventKind::LoginSuccess,
            "access_denied" => SecurityEventKind::AccessDenied,
            "rate_limit_exceeded" => SecurityEventKind::RateLimitExceeded,
            "data_export" => SecurityEventKind::DataExport,
            "suspicious_activity" => SecurityEventKind::SuspiciousActivity,
            "password_changed" => SecurityEventKind::PasswordChanged,
            "policy_updated" => SecurityEventKind::PolicyUpdated,
            "session_revoked" => SecurityEventKind::SessionRevoked,
            "audit_write_failed" => SecurityEventKind::AuditWriteFailed,
            "processing_error" => SecurityEventKind::ProcessingError,
            _ => return None,
        })
    }
}

impl std::fmt::Display for SecurityEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SecurityEventKind::LoginFailed => "login_failed",
            SecurityEventKind::LoginSuccess => "login_success",
            SecurityEventKind::AccessDenied => "access_denied",
            SecurityEventKind::RateLimitExceeded => "rate_limit_exceeded",
            SecurityEventKind::DataExport => "data_export",
            SecurityEventKind::SuspiciousActivity => "suspicious_activity",
            SecurityEventKind::PasswordChanged => "password_changed",
            SecurityEventKind::PolicyUpdated => "policy_updated",
            SecurityEventKind::SessionRevoked => "session_revoked",
            SecurityEventKind::AuditWriteFailed => "audit_write_failed",
            SecurityEventKind::ProcessingError => "processing_error",
        };
        write!(f, "{s}")
    }
}

/// Lifecycle status. Transitions are monotonic:
/// new -> investigating -> {resolved, false_positive}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    New,
    Investigating,
    Resolved,
    FalsePositive,
}

impl EventStatus {
    fn can_transition_to(self, next: EventStatus) -> bool {
        matches!(
            (self, next),
            (EventStatus::New, EventStatus::Investigating)
                | (EventStatus::New, EventStatus::Resolved)
                | (EventStatus::New, EventStatus::FalsePositive)
                | (EventStatus::Investigating, EventStatus::Resolved)
                | (EventStatus::Investigating, EventStatus::FalsePositive)
        )
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "investigating" => EventStatus::Investigating,
            "resolved" => EventStatus::Resolved,
            "false_positive" => EventStatus::FalsePositive,
            _ => EventStatus::New,
        }
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventStatus::New => "new",
            EventStatus::Investigating => "investigating",
            EventStatus::Resolved => "resolved",
            EventStatus::FalsePositive => "false_positive",
        };
        write!(f, "{s}")
    }
}

/// A raw event as submitted by collaborators (auth layer, rate limiter,
/// the enforcer's denial signal, ...). Severity is assigned on ingestion.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RawSecurityEvent {
    pub kind: SecurityEventKind,
    pub source: String,
    pub tenant_id: Option<String>,
    pub user_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    #[serde(default)]
    pub details: serde_json::Value,
}

/// A processed, persisted security event.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SecurityEvent {
    pub id: Uuid,
    pub kind: SecurityEventKind,
    pub severity: Severity,
    pub source: String,
    pub tenant_id: Option<String>,
    pub user_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub details: serde_json::Value,
    pub status: EventStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Append a security event to the durable store.
pub fn insert_event(pool: &Pool, event: &SecurityEvent) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO security_events
            (id, kind, severity, source, tenant_id, user_id, ip_address, user_agent,
             details_json, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            event.id.to_string(),
            event.kind.to_string(),
            event.severity.to_string(),
            event.source,
            event.tenant_id,
            event.user_id,
            event.ip_address,
            event.user_agent,
            event.details.to_string(),
            event.status.to_string(),
            event.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Advance an event's status, enforcing monotonic transitions.
/// Sets `resolved_at` when entering a terminal state.
pub fn update_event_status(pool: &Pool, event_id: Uuid, next: EventStatus) -> Result<()> {
    let conn = pool.get()?;
    let current: Option<String> = conn
        .query_row(
            "SELECT status FROM security_events WHERE id = ?1",
            params![event_id.to_string()],
            |row| row.get(0),
        )
        .ok();

    let current = match current {
        Some(s) => EventStatus::parse(&s),
        None => return Err(EventError::NotFound(event_id).into()),
    };

    if !current.can_transition_to(next) {
        return Err(EventError::InvalidTransition { from: current, to: next }.into());
    }

    let resolved_at = match next {
        EventStatus::Resolved | EventStatus::FalsePositive => Some(Utc::now().to_rfc3339()),
        _ => None,
    };
    conn.execute(
        "UPDATE security_events SET status = ?1, resolved_at = COALESCE(?2, resolved_at) WHERE id = ?3",
        params![next.to_string(), resolved_at, event_id.to_string()],
    )?;
    Ok(())
}

/// A policy breach raised by the policy engine or enforcer, as opposed to a
/// statistical anomaly.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SecurityViolation {
    pub id: Uuid,
    pub kind: String,
    pub severity: Severity,
    pub user_id: Option<String>,
    pub tenant_id: Option<String>,
    pub ip_address: Option<String>,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

pub fn insert_violation(pool: &Pool, v: &SecurityViolation) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO security_violations
            (id, kind, severity, user_id, tenant_id, ip_address, details_json, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            v.id.to_string(),
            v.kind,
            v.severity.to_string(),
            v.user_id,
            v.tenant_id,
            v.ip_address,
            v.details.to_string(),
            v.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}
