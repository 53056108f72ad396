use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Parser)]
#[command(
    name = "tenantguard",
    about = "Tenant isolation enforcement and security anomaly monitoring",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the SQLite database
    #[arg(long, default_value = "data/tenantguard.db", global = true)]
    db: String,

    /// Path to a TOML config file
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + event processor + retention sweeper)
    Serve {
        /// Bind address
        #[arg(long, default_value = "0.0.0.0:8080")]
        bind: String,
    },

    /// Run a retention sweep immediately
    Retention {
        /// Sweep a single tenant instead of all
        #[arg(long)]
        tenant: Option<String>,
    },

    /// Inspect and acknowledge security alerts
    Alerts {
        #[command(subcommand)]
        action: AlertAction,
    },

    /// Show per-tenant security metrics
    Metrics {
        /// Tenant to report on
        #[arg(long)]
        tenant: String,

        /// Reporting period in days
        #[arg(long, default_value = "30")]
        days: i64,
    },
}

#[derive(Subcommand)]
enum AlertAction {
    /// List active alerts for a tenant
    List {
        /// Tenant to list alerts for
        #[arg(long)]
        tenant: String,
    },

    /// Acknowledge an alert
    Ack {
        /// Alert id
        #[arg(long)]
        id: Uuid,

        /// Tenant the alert belongs to
        #[arg(long)]
        tenant: String,

        /// User acknowledging the alert
        #[arg(long)]
        user: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => tenantguard::config::Config::load(path)?,
        None => tenantguard::config::Config::default(),
    };

    match cli.command {
        Commands::Serve { bind } => {
            tracing::info!(%bind, "Starting TenantGuard daemon");
            tenantguard::serve(&bind, &cli.db, config).await?;
        }
        Commands::Retention { tenant } => {
            let pool = tenantguard::storage::open_pool(&cli.db)?;
            let reports = match tenant {
                Some(tenant_id) => {
                    let policy = tenantguard::policy::load_policy(&pool, &tenant_id)?;
                    let report = tenantguard::policy::retention::enforce_data_retention(
                        &pool,
                        &tenant_id,
                        policy.retention_days.0,
                    )?;
                    vec![(tenant_id, report)]
                }
                None => tenantguard::sweep_all_tenants(&pool)?,
            };
            if reports.is_empty() {
                println!("No tenants with stored data.");
            } else {
                println!("{:<20} | {:<10} | Errors", "Tenant", "Deleted");
                println!("{:-<20}-|-{:-<10}-|-{:-<30}", "", "", "");
                for (tenant_id, report) in reports {
                    let errors = if report.errors.is_empty() {
                        "-".to_string()
                    } else {
                        report.errors.join("; ")
                    };
                    println!("{:<20} | {:<10} | {}", tenant_id, report.deleted, errors);
                }
            }
        }
        Commands::Alerts { action } => {
            let pool = tenantguard::storage::open_pool(&cli.db)?;
            let manager = tenantguard::alerts::AlertLifecycleManager::new(
                pool,
                Arc::new(tenantguard::dispatch::LogNotifier),
                config.alert_ttl_hours,
            );

            match action {
                AlertAction::List { tenant } => {
                    let ctx = tenantguard::tenant::TenantContext {
                        tenant_id: tenant,
                        user_id: "operator".into(),
                        role: tenantguard::tenant::Role::ReadOnly,
                    };
                    let filter = tenantguard::alerts::AlertFilter {
                        limit: 50,
                        ..Default::default()
                    };
                    let alerts = manager.list_alerts(&ctx, &filter)?;
                    if alerts.is_empty() {
                        println!("No active alerts.");
                    } else {
                        println!(
                            "{:<36} | {:<8} | {:<20} | {:<5} | Title",
                            "Id", "Severity", "Created", "Ack"
                        );
                        println!(
                            "{:-<36}-|-{:-<8}-|-{:-<20}-|-{:-<5}-|-{:-<40}",
                            "", "", "", "", ""
                        );
                        for alert in alerts {
                            println!(
                                "{:<36} | {:<8} | {:<20} | {:<5} | {}",
                                alert.id,
                                alert.severity.to_string(),
                                alert.created_at.format("%Y-%m-%d %H:%M:%S"),
                                if alert.acknowledged { "yes" } else { "no" },
                                alert.title
                            );
                        }
                    }
                }
                AlertAction::Ack { id, tenant, user } => {
                    manager.acknowledge_alert(id, &user, &tenant)?;
                    println!("Alert {} acknowledged.", id);
                }
            }
        }
        Commands::Metrics { tenant, days } => {
            let pool = tenantguard::storage::open_pool(&cli.db)?;
            let manager = tenantguard::alerts::AlertLifecycleManager::new(
                pool,
                Arc::new(tenantguard::dispatch::LogNotifier),
                config.alert_ttl_hours,
            );
            let metrics = manager.get_security_metrics(&tenant, days)?;

            println!("\nSecurity metrics for '{}' (last {} days)", tenant, days);
            println!("Total events: {}", metrics.total_events);
            match metrics.mttr_minutes {
                Some(mttr) => println!("Mean time to resolve: {:.1} min", mttr),
                None => println!("Mean time to resolve: n/a"),
            }
            println!(
                "False positive rate: {:.1}%",
                metrics.false_positive_rate * 100.0
            );
            if !metrics.by_kind.is_empty() {
                println!("\n{:<25} | Count", "Kind");
                println!("{:-<25}-|-{:-<10}", "", "");
                for (kind, count) in &metrics.by_kind {
                    println!("{:<25} | {}", kind, count);
                }
            }
            if !metrics.by_severity.is_empty() {
                println!("\n{:<25} | Count", "Severity");
                println!("{:-<25}-|-{:-<10}", "", "");
                for (severity, count) in &metrics.by_severity {
                    println!("{:<25} | {}", severity, count);
                }
            }
            if !metrics.daily_trend.is_empty() {
                println!("\n{:<12} | Events", "Day");
                println!("{:-<12}-|-{:-<10}", "", "");
                for (day, count) in &metrics.daily_trend {
                    println!("{:<12} | {}", day, count);
                }
            }
            println!();
        }
    }

    Ok(())
}
