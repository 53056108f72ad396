//! Outbound alert notification.

use crate::alerts::SecurityAlert;
use anyhow::{Context, Result};
use rand::Rng;
use std::time::Duration;
use tracing::info;

/// Seam to the notification dispatcher. Delivery guarantees beyond a
/// bounded retry are the implementation's responsibility.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, alert: &SecurityAlert) -> Result<()>;
}

/// Logs alerts instead of delivering them. Default for deployments
/// without a webhook configured.
pub struct LogNotifier;

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, alert: &SecurityAlert) -> Result<()> {
        info!(
            alert = %alert.id,
            kind = %alert.kind,
            severity = %alert.severity,
            title = %alert.title,
            "alert notification (log only)"
        );
        Ok(())
    }
}

/// POSTs the alert as JSON to a configured webhook.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: String) -> Self {
        Self { client: reqwest::Client::new(), url }
    }
}

#[async_trait::async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, alert: &SecurityAlert) -> Result<()> {
        let mut last_err = None;
        for attempt in 0..3u32 {
            if attempt > 0 {
                let base = 200u64 * 2u64.pow(attempt);
                let jitter = rand::thread_rng().gen_range(0..base / 2 + 1);
                tokio::time::sleep(Duration::from_millis(base + jitter)).await;
            }
            match self.client.post(&self.url).json(alert).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => last_err = Some(anyhow::anyhow!("webhook returned {}", resp.status())),
                Err(e) => last_err = Some(anyhow::Error::new(e)),
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("webhook delivery failed")))
            .context("alert webhook")
    }
}
