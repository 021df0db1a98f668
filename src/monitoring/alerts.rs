use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
    Emergency,
}

impl Default for Severity {
    fn default() -> Self {
        Severity::Warning
    }
}

/// Operator-facing alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub severity: Severity,
    pub message: String,
    pub context: serde_json::Value,
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(severity: Severity, message: impl Into<String>, context: serde_json::Value) -> Self {
        Self {
            severity,
            message: message.into(),
            context,
            raised_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    /// POST target for alerts; unset means alerts only go to the log
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// Upper bound on how long an alert may hold up the caller
    #[serde(default = "default_alert_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_alert_timeout_ms() -> u64 {
    2000
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_ms: default_alert_timeout_ms(),
        }
    }
}

/// Notification sink accepting `(severity, message, context)`.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, alert: &Alert) -> Result<()>;
}

/// Writes alerts to the log only.
#[derive(Debug, Clone, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, alert: &Alert) -> Result<()> {
        match alert.severity {
            Severity::Info => info!(target: "alert", severity = ?alert.severity, context = %alert.context, "{}", alert.message),
            Severity::Warning => warn!(target: "alert", severity = ?alert.severity, context = %alert.context, "{}", alert.message),
            Severity::Critical | Severity::Emergency => {
                error!(target: "alert", severity = ?alert.severity, context = %alert.context, "{}", alert.message)
            }
        }
        Ok(())
    }
}

/// Posts alerts as JSON to an operator webhook.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    url: String,
    http: Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("creating HTTP client")?;
        Ok(Self {
            url: url.into(),
            http,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, alert: &Alert) -> Result<()> {
        let response = self
            .http
            .post(&self.url)
            .json(alert)
            .send()
            .await
            .context("sending alert webhook")?;
        response
            .error_for_status()
            .context("alert webhook rejected")?;
        Ok(())
    }
}

/// Keeps alerts in memory; used by tests and embedders that poll.
#[derive(Debug, Clone, Default)]
pub struct MemoryNotifier {
    alerts: Arc<Mutex<Vec<Alert>>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        match self.alerts.lock() {
            Ok(g) => g.clone(),
            Err(e) => e.into_inner().clone(),
        }
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn notify(&self, alert: &Alert) -> Result<()> {
        match self.alerts.lock() {
            Ok(mut g) => g.push(alert.clone()),
            Err(e) => e.into_inner().push(alert.clone()),
        }
        Ok(())
    }
}

/// Delivers alerts with a bounded wait. Delivery problems are logged and
/// never returned to the code path that raised the alert.
#[derive(Clone)]
pub struct AlertDispatcher {
    notifier: Arc<dyn Notifier>,
    timeout: Duration,
}

impl std::fmt::Debug for AlertDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertDispatcher")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl AlertDispatcher {
    pub fn new(notifier: Arc<dyn Notifier>, timeout: Duration) -> Self {
        Self { notifier, timeout }
    }

    /// Webhook notifier when configured, log-only otherwise.
    pub fn from_config(config: &AlertConfig) -> Result<Self> {
        let timeout = Duration::from_millis(config.timeout_ms);
        let notifier: Arc<dyn Notifier> = match &config.webhook_url {
            Some(url) => Arc::new(WebhookNotifier::new(url.clone(), timeout)?),
            None => Arc::new(TracingNotifier),
        };
        Ok(Self::new(notifier, timeout))
    }

    pub async fn dispatch(&self, alert: Alert) {
        match tokio::time::timeout(self.timeout, self.notifier.notify(&alert)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(target: "audit_fallback", severity = ?alert.severity, message = %alert.message, error = %e, "alert delivery failed");
            }
            Err(_) => {
                error!(target: "audit_fallback", severity = ?alert.severity, message = %alert.message, timeout_ms = self.timeout.as_millis() as u64, "alert delivery timed out");
            }
        }
    }
}
