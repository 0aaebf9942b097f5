//! Alert delivery
//!
//! Alerts always go to the structured log. When a webhook is configured they
//! are also POSTed as JSON, signed with HMAC-SHA256 if a secret is set.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use tracing::{error, info, warn};

use crate::config::AlertConfig;
use crate::errors::{Result, RotationError};
use crate::secrets::SecretString;
use crate::utils::RetryConfig;

/// Header carrying `sha256=<hex hmac of the body>`
pub const SIGNATURE_HEADER: &str = "X-Rotation-Signature";

type HmacSha256 = Hmac<Sha256>;

/// Alert severity. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single alert about one descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub descriptor: String,
    pub severity: Severity,
    pub message: String,
    /// Rotation cycle (the descriptor's rotation count) the alert belongs to
    pub cycle: u64,
    pub timestamp: DateTime<Utc>,
}

/// Destination for alerts.
#[async_trait]
pub trait AlertSink: Send + Sync + fmt::Debug {
    async fn send(&self, alert: &Alert) -> Result<()>;

    fn name(&self) -> &'static str;
}

/// Writes alerts to the log at a level matching their severity.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn send(&self, alert: &Alert) -> Result<()> {
        match alert.severity {
            Severity::Critical => error!(
                descriptor = %alert.descriptor,
                severity = %alert.severity,
                cycle = alert.cycle,
                "ALERT: {}",
                alert.message
            ),
            Severity::Warning => warn!(
                descriptor = %alert.descriptor,
                severity = %alert.severity,
                cycle = alert.cycle,
                "ALERT: {}",
                alert.message
            ),
            Severity::Info => info!(
                descriptor = %alert.descriptor,
                severity = %alert.severity,
                cycle = alert.cycle,
                "ALERT: {}",
                alert.message
            ),
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

/// POSTs alerts to an HTTP endpoint.
#[derive(Debug, Clone)]
pub struct WebhookAlertSink {
    client: reqwest::Client,
    url: String,
    secret: Option<SecretString>,
    retry: RetryConfig,
}

impl WebhookAlertSink {
    pub fn new(url: impl Into<String>, secret: Option<SecretString>, config: &AlertConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| RotationError::config(format!("Failed to build webhook client: {}", e)))?;

        Ok(Self {
            client,
            url: url.into(),
            secret,
            retry: RetryConfig { max_attempts: config.max_attempts, ..RetryConfig::default() },
        })
    }

    /// Sink for the configured webhook, if there is one.
    pub fn from_config(config: &AlertConfig) -> Result<Option<Self>> {
        match &config.webhook_url {
            Some(url) => Self::new(url.clone(), config.webhook_secret.clone(), config).map(Some),
            None => Ok(None),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// `sha256=<hex>` signature of `body`.
    pub fn sign(secret: &SecretString, body: &[u8]) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(secret.expose_secret().as_bytes())
            .map_err(|e| RotationError::config(format!("Invalid webhook secret: {}", e)))?;
        mac.update(body);
        Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
    }

    async fn post(&self, body: &[u8]) -> std::result::Result<reqwest::StatusCode, DeliveryError> {
        let mut request = self.client.post(&self.url).header("Content-Type", "application/json");
        if let Some(secret) = &self.secret {
            let signature = Self::sign(secret, body)
                .map_err(|e| DeliveryError { message: e.to_string(), retryable: false })?;
            request = request.header(SIGNATURE_HEADER, signature);
        }

        let response = request
            .body(body.to_vec())
            .send()
            .await
            .map_err(|e| DeliveryError { message: format!("request failed: {}", e), retryable: true })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError {
                message: format!("endpoint returned {}", status),
                retryable: status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS,
            });
        }
        Ok(status)
    }
}

#[derive(Debug)]
struct DeliveryError {
    message: String,
    retryable: bool,
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn send(&self, alert: &Alert) -> Result<()> {
        let body = serde_json::to_vec(alert)?;

        match self.retry.run(|_| self.post(&body), |e: &DeliveryError| e.retryable).await {
            Ok(status) => {
                info!(
                    descriptor = %alert.descriptor,
                    severity = %alert.severity,
                    status_code = status.as_u16(),
                    "Alert webhook delivered"
                );
                Ok(())
            }
            Err((e, attempts)) => {
                error!(
                    descriptor = %alert.descriptor,
                    error = %e.message,
                    attempts,
                    "Alert webhook delivery failed"
                );
                Err(RotationError::internal(format!(
                    "Alert webhook delivery failed after {} attempt(s): {}",
                    attempts, e.message
                )))
            }
        }
    }

    fn name(&self) -> &'static str {
        "webhook"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn alert(severity: Severity) -> Alert {
        Alert {
            descriptor: "consul_tls".to_string(),
            severity,
            message: "overdue".to_string(),
            cycle: 4,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_severity_order() {
        assert!(Severity::Critical > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
    }

    #[test]
    fn test_alert_json_shape() {
        let json = serde_json::to_value(alert(Severity::Critical)).unwrap();
        assert_eq!(json["severity"], "critical");
        assert_eq!(json["descriptor"], "consul_tls");
        assert_eq!(json["cycle"], 4);
    }

    #[test]
    fn test_signature_is_stable() {
        let secret = SecretString::new("topsecret");
        let a = WebhookAlertSink::sign(&secret, b"{}").unwrap();
        let b = WebhookAlertSink::sign(&secret, b"{}").unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("sha256="));
        assert_eq!(a.len(), "sha256=".len() + 64);
        assert_ne!(a, WebhookAlertSink::sign(&SecretString::new("other"), b"{}").unwrap());
    }

    #[test]
    fn test_no_webhook_without_url() {
        assert!(WebhookAlertSink::from_config(&AlertConfig::default()).unwrap().is_none());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_log_sink_writes_alert() {
        LogAlertSink.send(&alert(Severity::Critical)).await.unwrap();
        assert!(logs_contain("ALERT: overdue"));
        assert!(logs_contain("consul_tls"));
    }
}
