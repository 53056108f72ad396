//! Runtime configuration -- thresholds, windows, and TTLs.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Rolling history window the baseliner scans, in days.
    pub baseline_window_days: i64,
    /// Baseline cache TTL, in seconds.
    pub baseline_ttl_secs: i64,
    /// Accesses required before baseline-driven checks engage.
    pub baseline_min_samples: i64,
    /// Bound on stored typical IPs / devices per profile.
    pub baseline_top_n: usize,

    /// Off-hours band treated as expected low-activity time (inclusive start,
    /// exclusive end, wrapping midnight).
    pub off_hours_start: u8,
    pub off_hours_end: u8,
    /// Trailing-hour request count must exceed baseline mean times this.
    pub volume_multiplier: f64,
    /// Denials within the escalation window that trip the critical anomaly.
    pub denial_threshold: i64,
    /// Privilege-escalation trailing window, in minutes.
    pub denial_window_minutes: i64,
    /// Request paths that are anomalous regardless of baseline.
    pub sensitive_paths: Vec<String>,

    /// Alert dedup cool-down, in minutes.
    pub alert_cooldown_minutes: i64,
    /// Alert retention TTL, in hours.
    pub alert_ttl_hours: i64,
    /// Failed logins within the pattern window that confirm brute force.
    pub brute_force_threshold: i64,
    /// Denials within the pattern window that confirm scanning.
    pub scan_threshold: i64,
    /// Recent events considered by cross-event pattern detection.
    pub pattern_window_events: i64,
    /// Failed-login count that triggers a login_failed alert.
    pub login_failed_alert_threshold: i64,
    /// Trailing window for the login_failed alert count, in minutes.
    pub login_failed_window_minutes: i64,
    /// Exported record count above which data_export alerts.
    pub data_export_alert_threshold: i64,

    /// Cron expression for the retention sweep.
    pub retention_schedule: String,
    /// Webhook URL for alert notifications; log-only when unset.
    pub notify_webhook: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            baseline_window_days: 30,
            baseline_ttl_secs: 3600,
            baseline_min_samples: 20,
            baseline_top_n: 10,
            off_hours_start: 22,
            off_hours_end: 6,
            volume_multiplier: 3.0,
            denial_threshold: 5,
            denial_window_minutes: 5,
            sensitive_paths: vec![
                "/admin/users".into(),
                "/billing".into(),
                "/audit/export".into(),
            ],
            alert_cooldown_minutes: 5,
            alert_ttl_hours: 24,
            brute_force_threshold: 5,
            scan_threshold: 10,
            pattern_window_events: 50,
            login_failed_alert_threshold: 5,
            login_failed_window_minutes: 30,
            data_export_alert_threshold: 1000,
            retention_schedule: "0 0 3 * * *".into(),
            notify_webhook: None,
        }
    }
}

impl Config {
    /// Load from a TOML file; missing keys fall back to defaults.
    pub fn load(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {path}"))?;
        let cfg: Config = toml::from_str(&raw).context("failed to parse config")?;
        Ok(cfg)
    }
}
