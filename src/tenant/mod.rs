//! Tenant scoping -- the gate every data access passes through.

use crate::events::{RawSecurityEvent, SecurityEventKind};
use crate::storage::Pool;
use rusqlite::params;
use tokio::sync::mpsc;
use tracing::warn;

/// Per-request caller identity, derived from the authenticated principal.
/// Never persisted on its own.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TenantContext {
    pub tenant_id: String,
    pub user_id: String,
    pub role: Role,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Member,
    ReadOnly,
}

/// Resource types the enforcer knows how to scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Project,
    Document,
    ApiKey,
    AuditExport,
    /// User-scoped: matched on user_id, not tenant_id.
    UserProfile,
    /// User-scoped.
    Session,
}

impl ResourceKind {
    pub fn is_user_scoped(self) -> bool {
        matches!(self, ResourceKind::UserProfile | ResourceKind::Session)
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "project" => ResourceKind::Project,
            "document" => ResourceKind::Document,
            "api_key" => ResourceKind::ApiKey,
            "audit_export" => ResourceKind::AuditExport,
            "user_profile" => ResourceKind::UserProfile,
            "session" => ResourceKind::Session,
            _ => return None,
        })
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResourceKind::Project => "project",
            ResourceKind::Document => "document",
            ResourceKind::ApiKey => "api_key",
            ResourceKind::AuditExport => "audit_export",
            ResourceKind::UserProfile => "user_profile",
            ResourceKind::Session => "session",
        };
        write!(f, "{s}")
    }
}

/// Validates that a requested resource belongs to the caller's tenant
/// (or user, for user-scoped kinds) before any read/write proceeds.
///
/// Pure predicate: denials and lookup failures both come back as `false`,
/// so callers cannot distinguish "not yours" from "does not exist".
#[derive(Clone)]
pub struct TenantScopeEnforcer {
    pool: Pool,
    signals: mpsc::Sender<RawSecurityEvent>,
}

impl TenantScopeEnforcer {
    pub fn new(pool: Pool, signals: mpsc::Sender<RawSecurityEvent>) -> Self {
        Self { pool, signals }
    }

    pub async fn validate_resource_access(
        &self,
        kind: ResourceKind,
        resource_id: &str,
        ctx: &TenantContext,
    ) -> bool {
        let owner = self.lookup_owner(kind, resource_id);

        let allowed = match owner {
            Ok(Some((tenant_id, user_id))) => {
                if kind.is_user_scoped() {
                    user_id.as_deref() == Some(ctx.user_id.as_str())
                } else {
                    tenant_id == ctx.tenant_id
                }
            }
            Ok(None) => false,
            Err(e) => {
                warn!(%kind, resource_id, error = %e, "ownership lookup failed, denying");
                false
            }
        };

        if !allowed {
            self.signal_denial(kind, resource_id, ctx).await;
        }
        allowed
    }

    fn lookup_owner(
        &self,
        kind: ResourceKind,
        resource_id: &str,
    ) -> anyhow::Result<Option<(String, Option<String>)>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT tenant_id, user_id FROM resources WHERE resource_type = ?1 AND resource_id = ?2",
        )?;
        let mut rows = stmt.query(params![kind.to_string(), resource_id])?;
        match rows.next()? {
            Some(row) => Ok(Some((row.get(0)?, row.get(1)?))),
            None => Ok(None),
        }
    }

    /// Every denial feeds pattern detection (repeated denials drive the
    /// privilege-escalation and scanning checks).
    async fn signal_denial(&self, kind: ResourceKind, resource_id: &str, ctx: &TenantContext) {
        let event = RawSecurityEvent {
            kind: SecurityEventKind::AccessDenied,
            source: "tenant_scope_enforcer".into(),
            tenant_id: Some(ctx.tenant_id.clone()),
            user_id: Some(ctx.user_id.clone()),
            ip_address: None,
            user_agent: None,
            details: serde_json::json!({
                "resource_type": kind.to_string(),
                "resource_id": resource_id,
            }),
        };
        if let Err(e) = self.signals.send(event).await {
            // The denial itself still stands; only observability is lost.
            tracing::error!(error = %e, "failed to emit access_denied signal");
        }
    }
}

/// Register resource ownership. Called by the surrounding application when
/// tenant-owned records are created.
pub fn register_resource(
    pool: &Pool,
    kind: ResourceKind,
    resource_id: &str,
    tenant_id: &str,
    user_id: Option<&str>,
) -> anyhow::Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO resources (resource_type, resource_id, tenant_id, user_id)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(resource_type, resource_id) DO UPDATE SET
             tenant_id = excluded.tenant_id,
             user_id = excluded.user_id",
        params![kind.to_string(), resource_id, tenant_id, user_id],
    )?;
    Ok(())
}

/// A list-style query that cannot be built without a tenant predicate.
///
/// The tenant filter is injected by construction, not by convention: the only
/// way to obtain the SQL is through `build()`, which always renders
/// `tenant_id = ?1` first.
pub struct ScopedQuery {
    select: String,
    conditions: Vec<String>,
    params: Vec<String>,
}

impl ScopedQuery {
    pub fn new(table: &str, columns: &str, ctx: &TenantContext) -> Self {
        Self {
            select: format!("SELECT {columns} FROM {table}"),
            conditions: vec!["tenant_id = ?1".into()],
            params: vec![ctx.tenant_id.clone()],
        }
    }

    pub fn and(mut self, condition: &str, param: impl Into<String>) -> Self {
        let idx = self.params.len() + 1;
        self.conditions.push(format!("{condition} ?{idx}"));
        self.params.push(param.into());
        self
    }

    pub fn build(self) -> (String, Vec<String>) {
        let sql = format!("{} WHERE {}", self.select, self.conditions.join(" AND "));
        (sql, self.params)
    }
}
