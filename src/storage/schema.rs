//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS security_events (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            severity TEXT NOT NULL,
            source TEXT NOT NULL,
            tenant_id TEXT,
            user_id TEXT,
            ip_address TEXT,
            user_agent TEXT,
            details_json TEXT NOT NULL DEFAULT '{}',
            status TEXT NOT NULL DEFAULT 'new',
            created_at TEXT NOT NULL,
            resolved_at TEXT
        );

        CREATE TABLE IF NOT EXISTS access_log (
            id INTEGER PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            ip_address TEXT,
            user_agent TEXT,
            resource TEXT,
            path TEXT,
            status_code INTEGER NOT NULL DEFAULT 200,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS access_anomalies (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            tenant_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            severity TEXT NOT NULL,
            details_json TEXT NOT NULL DEFAULT '{}',
            detected_at TEXT NOT NULL,
            resolved INTEGER NOT NULL DEFAULT 0,
            false_positive INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS security_violations (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            severity TEXT NOT NULL,
            user_id TEXT,
            tenant_id TEXT,
            ip_address TEXT,
            details_json TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            resolved INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS security_alerts (
            id TEXT PRIMARY KEY,
            event_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            severity TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT NOT NULL,
            recommendations_json TEXT NOT NULL DEFAULT '[]',
            tenant_id TEXT,
            created_at TEXT NOT NULL,
            expires_at TEXT NOT NULL,
            acknowledged INTEGER NOT NULL DEFAULT 0,
            acknowledged_by TEXT,
            acknowledged_at TEXT
        );

        -- Atomic dedup / once-only claims, shared across worker instances.
        CREATE TABLE IF NOT EXISTS claims (
            fingerprint TEXT PRIMARY KEY,
            severity_rank INTEGER NOT NULL DEFAULT 0,
            expires_at TEXT NOT NULL
        );

        -- Resource ownership index consulted by the tenant scope enforcer.
        CREATE TABLE IF NOT EXISTS resources (
            resource_type TEXT NOT NULL,
            resource_id TEXT NOT NULL,
            tenant_id TEXT NOT NULL,
            user_id TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (resource_type, resource_id)
        );

        CREATE TABLE IF NOT EXISTS tenant_policies (
            tenant_id TEXT PRIMARY KEY,
            policy_json TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS password_history (
            id INTEGER PRIMARY KEY,
            user_id TEXT NOT NULL,
            digest TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            tenant_id TEXT NOT NULL,
            ip_address TEXT,
            created_at TEXT NOT NULL,
            last_activity TEXT NOT NULL
        );

        -- Shared per-tenant/per-day counters (upsert-incremented).
        CREATE TABLE IF NOT EXISTS metrics_daily (
            tenant_id TEXT NOT NULL,
            day TEXT NOT NULL,
            kind TEXT NOT NULL,
            severity TEXT NOT NULL,
            count INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (tenant_id, day, kind, severity)
        );

        -- Namespaced TTL cache shared by all worker instances.
        CREATE TABLE IF NOT EXISTS cache_entries (
            namespace TEXT NOT NULL,
            tenant_id TEXT NOT NULL,
            key TEXT NOT NULL,
            value_json TEXT NOT NULL,
            expires_at TEXT NOT NULL,
            PRIMARY KEY (namespace, tenant_id, key)
        );

        -- Idempotent auto-response ledger.
        CREATE TABLE IF NOT EXISTS response_actions (
            tenant_id TEXT NOT NULL,
            action TEXT NOT NULL,
            subject TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (tenant_id, action, subject)
        );

        CREATE INDEX IF NOT EXISTS idx_events_tenant_created ON security_events(tenant_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_events_user_created ON security_events(user_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_events_kind ON security_events(kind, created_at);
        CREATE INDEX IF NOT EXISTS idx_access_log_user ON access_log(tenant_id, user_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_anomalies_tenant ON access_anomalies(tenant_id, detected_at);
        CREATE INDEX IF NOT EXISTS idx_violations_tenant ON security_violations(tenant_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_alerts_tenant ON security_alerts(tenant_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_password_history_user ON password_history(user_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id, tenant_id);",
    )?;

    Ok(())
}
