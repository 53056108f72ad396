//! TenantGuard -- tenant isolation enforcement and security anomaly monitoring.
//!
//! This crate provides the core library for tenant-scoped access control,
//! security event processing, behavioral baselining, anomaly detection,
//! alert lifecycle management, and policy enforcement.

pub mod alerts;
pub mod anomaly;
pub mod api;
pub mod baseline;
pub mod config;
pub mod dispatch;
pub mod events;
pub mod policy;
pub mod storage;
pub mod tenant;

use anyhow::Result;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Start the TenantGuard daemon: API server, event processor, and
/// retention sweeper.
pub async fn serve(bind: &str, db_path: &str, config: config::Config) -> Result<()> {
    info!(%db_path, "Initializing database");
    let pool = storage::open_pool(db_path)?;
    let config = Arc::new(config);
    let cache = storage::cache::Cache::new(pool.clone());

    // Denial signals and external submissions share one ingest channel.
    let (tx, rx) = tokio::sync::mpsc::channel(256);

    let enforcer = tenant::TenantScopeEnforcer::new(pool.clone(), tx.clone());
    let baseliner = baseline::AccessPatternBaseliner::new(
        pool.clone(),
        cache.clone(),
        config.baseline_window_days,
        config.baseline_ttl_secs,
        config.baseline_top_n,
    );

    let notifier: Arc<dyn dispatch::Notifier> = match &config.notify_webhook {
        Some(url) => Arc::new(dispatch::WebhookNotifier::new(url.clone())),
        None => Arc::new(dispatch::LogNotifier),
    };
    let alerts = alerts::AlertLifecycleManager::new(pool.clone(), notifier, config.alert_ttl_hours);
    let processor = events::processor::SecurityEventProcessor::new(
        pool.clone(),
        cache.clone(),
        alerts.clone(),
        config.clone(),
    );
    let detector =
        anomaly::AnomalyDetector::new(pool.clone(), baseliner, processor.clone(), config.clone());

    tokio::spawn(events::processor::run_ingest_loop(processor.clone(), rx));

    let retention_pool = pool.clone();
    let schedule = config.retention_schedule.clone();
    tokio::spawn(async move {
        run_retention_loop(retention_pool, &schedule).await;
    });

    let maintenance_cache = cache.clone();
    tokio::spawn(async move {
        run_cache_maintenance(maintenance_cache).await;
    });

    let state = api::state::AppState {
        enforcer,
        processor,
        detector,
        alerts,
    };

    let addr: std::net::SocketAddr = bind.parse()?;
    let app = api::router(state);

    info!(%addr, "TenantGuard listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Periodic retention sweep. Each tenant's own policy decides how far
/// back its data is kept.
pub async fn run_retention_loop(pool: storage::Pool, schedule: &str) {
    let schedule = match cron::Schedule::from_str(schedule) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "invalid retention schedule, sweeper disabled");
            return;
        }
    };
    info!("Retention sweeper started");

    loop {
        let Some(next) = schedule.upcoming(chrono::Utc).next() else {
            warn!("retention schedule has no upcoming runs, sweeper stopped");
            return;
        };
        let wait = (next - chrono::Utc::now()).to_std().unwrap_or_default();
        tokio::time::sleep(wait).await;

        if let Err(e) = sweep_all_tenants(&pool) {
            error!(error = %e, "retention sweep failed");
        }
    }
}

/// Run one retention pass over every tenant with stored data.
pub fn sweep_all_tenants(pool: &storage::Pool) -> Result<Vec<(String, policy::retention::RetentionReport)>> {
    let mut reports = Vec::new();
    for tenant_id in policy::retention::tenants_with_data(pool)? {
        let policy = policy::load_policy(pool, &tenant_id)?;
        let report =
            policy::retention::enforce_data_retention(pool, &tenant_id, policy.retention_days.0)?;
        info!(
            tenant = %tenant_id,
            deleted = report.deleted,
            errors = report.errors.len(),
            "retention sweep completed"
        );
        reports.push((tenant_id, report));
    }
    Ok(reports)
}

async fn run_cache_maintenance(cache: storage::cache::Cache) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(3600));
    loop {
        interval.tick().await;
        match cache.purge_expired() {
            Ok(purged) if purged > 0 => info!(purged, "purged expired cache entries"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "cache purge failed"),
        }
    }
}
