//! API route definitions.

use super::state::AppState;
use crate::alerts::AlertFilter;
use crate::anomaly::AccessEvent;
use crate::events::{RawSecurityEvent, Severity};
use crate::tenant::{ResourceKind, TenantContext};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::error;
use uuid::Uuid;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/events", post(ingest_event))
        .route("/access/validate", post(validate_access))
        .route("/access/monitor", post(monitor_access))
        .route("/alerts", get(list_alerts))
        .route("/alerts/{id}/acknowledge", post(acknowledge_alert))
        .route("/metrics", get(security_metrics))
}

fn meta() -> Value {
    json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

fn internal(e: anyhow::Error) -> (StatusCode, Json<Value>) {
    error!(error = %e, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": e.to_string(), "meta": meta() })),
    )
}

fn bad_request(msg: &str) -> (StatusCode, Json<Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": msg, "meta": meta() })),
    )
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": meta()
    }))
}

async fn ingest_event(
    State(state): State<AppState>,
    Json(raw): Json<RawSecurityEvent>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let event = state.processor.ingest(raw).map_err(internal)?;
    Ok(Json(json!({ "data": event, "meta": meta() })))
}

#[derive(Deserialize)]
struct ValidateRequest {
    resource_type: String,
    resource_id: String,
    context: TenantContext,
}

async fn validate_access(
    State(state): State<AppState>,
    Json(req): Json<ValidateRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let kind = ResourceKind::parse(&req.resource_type)
        .ok_or_else(|| bad_request("unknown resource type"))?;
    let allowed = state
        .enforcer
        .validate_resource_access(kind, &req.resource_id, &req.context)
        .await;
    Ok(Json(json!({ "data": { "allowed": allowed }, "meta": meta() })))
}

#[derive(Deserialize)]
struct MonitorRequest {
    user_id: String,
    tenant_id: String,
    access: AccessEvent,
}

async fn monitor_access(
    State(state): State<AppState>,
    Json(req): Json<MonitorRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let anomalies = state
        .detector
        .monitor_access(&req.user_id, &req.tenant_id, &req.access)
        .map_err(internal)?;
    let total = anomalies.len();
    Ok(Json(json!({
        "data": anomalies,
        "meta": { "total": total, "timestamp": chrono::Utc::now().to_rfc3339() }
    })))
}

#[derive(Deserialize)]
struct AlertQuery {
    tenant_id: String,
    #[serde(default = "operator")]
    user_id: String,
    severity: Option<String>,
    acknowledged: Option<bool>,
    limit: Option<usize>,
}

fn operator() -> String {
    "operator".into()
}

async fn list_alerts(
    State(state): State<AppState>,
    Query(q): Query<AlertQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let ctx = TenantContext {
        tenant_id: q.tenant_id,
        user_id: q.user_id,
        role: crate::tenant::Role::ReadOnly,
    };
    let filter = AlertFilter {
        severity: q.severity.as_deref().map(Severity::parse),
        acknowledged: q.acknowledged,
        limit: q.limit.unwrap_or(50),
    };
    let alerts = state.alerts.list_alerts(&ctx, &filter).map_err(internal)?;
    let total = alerts.len();
    Ok(Json(json!({
        "data": alerts,
        "meta": { "total": total, "timestamp": chrono::Utc::now().to_rfc3339() }
    })))
}

#[derive(Deserialize)]
struct AckRequest {
    tenant_id: String,
    user_id: String,
}

async fn acknowledge_alert(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<AckRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.alerts.acknowledge_alert(id, &req.user_id, &req.tenant_id) {
        Ok(()) => Ok(Json(json!({ "data": { "acknowledged": true }, "meta": meta() }))),
        Err(e) if e.downcast_ref::<crate::alerts::AlertError>().is_some() => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": e.to_string(), "meta": meta() })),
        )),
        Err(e) => Err(internal(e)),
    }
}

#[derive(Deserialize)]
struct MetricsQuery {
    tenant_id: String,
    days: Option<i64>,
}

async fn security_metrics(
    State(state): State<AppState>,
    Query(q): Query<MetricsQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let metrics = state
        .alerts
        .get_security_metrics(&q.tenant_id, q.days.unwrap_or(30))
        .map_err(internal)?;
    Ok(Json(json!({ "data": metrics, "meta": meta() })))
}
