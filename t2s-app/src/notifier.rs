use anyhow::Context;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use t2s_core::{AlertEvent, AlertKind, AlertNotifier, Severity};

/// Writes every alert to the log. Always configured.
pub struct LogNotifier {
    recipients: Vec<String>,
}

impl LogNotifier {
    pub fn new(recipients: Vec<String>) -> Self {
        Self { recipients }
    }
}

#[async_trait]
impl AlertNotifier for LogNotifier {
    async fn notify(&self, event: &AlertEvent) -> anyhow::Result<()> {
        match (event.kind, event.severity) {
            (AlertKind::Fired, Severity::Critical) => tracing::error!(
                rule = %event.rule,
                value = event.value,
                threshold = event.threshold,
                recipients = ?self.recipients,
                "{}",
                event.message
            ),
            (AlertKind::Fired, Severity::Warning) => tracing::warn!(
                rule = %event.rule,
                value = event.value,
                threshold = event.threshold,
                recipients = ?self.recipients,
                "{}",
                event.message
            ),
            (AlertKind::Resolved, _) => tracing::info!(
                rule = %event.rule,
                value = event.value,
                recipients = ?self.recipients,
                "{}",
                event.message
            ),
        }
        Ok(())
    }
}

/// POSTs each alert as JSON to a webhook.
pub struct WebhookNotifier {
    http: reqwest::Client,
    url: String,
    recipients: Vec<String>,
}

impl WebhookNotifier {
    pub fn new(url: &str, recipients: Vec<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("build webhook client")?;
        Ok(Self {
            http,
            url: url.trim().to_string(),
            recipients,
        })
    }
}

#[async_trait]
impl AlertNotifier for WebhookNotifier {
    #[tracing::instrument(level = "debug", skip_all, fields(rule = %event.rule))]
    async fn notify(&self, event: &AlertEvent) -> anyhow::Result<()> {
        let response = self
            .http
            .post(&self.url)
            .json(&serde_json::json!({
                "event": event,
                "recipients": self.recipients,
            }))
            .send()
            .await
            .with_context(|| format!("post alert to {}", self.url))?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("webhook {} returned {status}", self.url);
        }
        Ok(())
    }
}

/// Delivers to every inner notifier; one failing target does not stop the rest.
pub struct FanoutNotifier {
    targets: Vec<Arc<dyn AlertNotifier>>,
}

impl FanoutNotifier {
    pub fn new(targets: Vec<Arc<dyn AlertNotifier>>) -> Self {
        Self { targets }
    }
}

#[async_trait]
impl AlertNotifier for FanoutNotifier {
    async fn notify(&self, event: &AlertEvent) -> anyhow::Result<()> {
        let mut failures = Vec::new();
        for target in &self.targets {
            if let Err(e) = target.notify(event).await {
                failures.push(format!("{e:#}"));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow::anyhow!(
                "{} of {} notifiers failed: {}",
                failures.len(),
                self.targets.len(),
                failures.join("; ")
            ))
        }
    }
}
