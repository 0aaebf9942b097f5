//! # Health / Alert Reporter
//!
//! Tracks per-descriptor delivery state between ticks, builds
//! [`HealthRecord`]s for `check`/`report`, and emits alerts with rate
//! limiting: at most one alert per (descriptor, severity, rotation cycle).
//! The engine saves each descriptor's [`DeliveryState`] to the store after
//! it changes and restores it with [`HealthReporter::restore`].

pub mod alert;

pub use alert::{Alert, AlertSink, LogAlertSink, Severity, WebhookAlertSink, SIGNATURE_HEADER};

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::warn;

use crate::errors::RotationError;
use crate::observability::MetricsRecorder;
use crate::registry::{SecretDescriptor, SecretKind};
use crate::scheduler::ScheduleState;
pub use crate::secrets::PendingStage;
use crate::secrets::{DeliveryState, RotationMetadata};

/// Consecutive failures at which alerts become critical.
pub const CRITICAL_FAILURE_THRESHOLD: u32 = 3;

/// Reported status of one descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Due,
    Overdue,
    Failed,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Due => "due",
            Self::Overdue => "overdue",
            Self::Failed => "failed",
        }
    }

    pub const ALL: [HealthStatus; 4] = [Self::Ok, Self::Due, Self::Overdue, Self::Failed];
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health of one descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthRecord {
    pub name: String,
    pub kind: SecretKind,
    pub metadata: Option<RotationMetadata>,
    pub status: HealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingStage>,
    /// Stale artifacts and services that have not reloaded the current content
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub drift: Vec<String>,
}

impl HealthRecord {
    /// True when the descriptor needs operator attention.
    pub fn is_unhealthy(&self) -> bool {
        matches!(self.status, HealthStatus::Overdue | HealthStatus::Failed) || !self.drift.is_empty()
    }
}

/// Severity for the given number of consecutive failures.
pub fn severity_for_failures(consecutive: u32) -> Severity {
    match consecutive {
        0 => Severity::Info,
        n if n >= CRITICAL_FAILURE_THRESHOLD => Severity::Critical,
        _ => Severity::Warning,
    }
}

/// Failure tracking and alert fan-out.
#[derive(Debug)]
pub struct HealthReporter {
    states: DashMap<String, DeliveryState>,
    sinks: Vec<Arc<dyn AlertSink>>,
    metrics: MetricsRecorder,
}

impl Default for HealthReporter {
    fn default() -> Self {
        Self::new(vec![Arc::new(LogAlertSink)])
    }
}

impl HealthReporter {
    pub fn new(sinks: Vec<Arc<dyn AlertSink>>) -> Self {
        Self { states: DashMap::new(), sinks, metrics: MetricsRecorder::new() }
    }

    /// Replace what is known about `descriptor` with a saved state.
    pub fn restore(&self, descriptor: &str, state: DeliveryState) {
        self.states.insert(descriptor.to_string(), state);
    }

    /// Current state of `descriptor`, as it would be saved.
    pub fn delivery_state(&self, descriptor: &str) -> DeliveryState {
        self.states.get(descriptor).map(|s| s.value().clone()).unwrap_or_default()
    }

    /// Forget failures and pending work after a fully successful rotation.
    /// Alert history is kept.
    pub fn record_success(&self, descriptor: &str) {
        if let Some(mut state) = self.states.get_mut(descriptor) {
            state.consecutive_failures = 0;
            state.last_error = None;
            state.pending = None;
        }
    }

    /// Count a failure; returns the consecutive failure count.
    pub fn record_failure(&self, descriptor: &str, error: &RotationError) -> u32 {
        let mut state = self.states.entry(descriptor.to_string()).or_default();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.last_error = Some(error.to_string());
        state.consecutive_failures
    }

    pub fn consecutive_failures(&self, descriptor: &str) -> u32 {
        self.states.get(descriptor).map_or(0, |s| s.consecutive_failures)
    }

    pub fn last_error(&self, descriptor: &str) -> Option<String> {
        self.states.get(descriptor).and_then(|s| s.last_error.clone())
    }

    pub fn mark_pending(&self, descriptor: &str, stage: PendingStage) {
        self.states.entry(descriptor.to_string()).or_default().pending = Some(stage);
    }

    pub fn clear_pending(&self, descriptor: &str) {
        if let Some(mut state) = self.states.get_mut(descriptor) {
            state.pending = None;
        }
    }

    pub fn pending(&self, descriptor: &str) -> Option<PendingStage> {
        self.states.get(descriptor).and_then(|s| s.pending)
    }

    /// Emit an alert unless one with the same severity was already sent for
    /// this descriptor in `cycle`. Returns whether the alert was emitted.
    pub async fn alert(&self, descriptor: &str, severity: Severity, message: impl Into<String>, cycle: u64) -> bool {
        {
            let mut state = self.states.entry(descriptor.to_string()).or_default();
            if state.alerted.get(&severity) == Some(&cycle) {
                return false;
            }
            state.alerted.insert(severity, cycle);
        }

        let alert = Alert {
            descriptor: descriptor.to_string(),
            severity,
            message: message.into(),
            cycle,
            timestamp: Utc::now(),
        };
        self.metrics.record_alert(severity.as_str());

        for sink in &self.sinks {
            if let Err(e) = sink.send(&alert).await {
                warn!(sink = sink.name(), descriptor = %descriptor, error = %e, "Alert sink failed");
            }
        }
        true
    }

    /// Build the record for `descriptor`.
    ///
    /// Status precedence: overdue, then failed (failures, pending work or
    /// drift), then due, then ok.
    pub fn record(
        &self,
        descriptor: &SecretDescriptor,
        metadata: Option<RotationMetadata>,
        state: ScheduleState,
        drift: Vec<String>,
    ) -> HealthRecord {
        let delivery = self.delivery_state(&descriptor.name);
        let pending = delivery.pending;

        let status = if state == ScheduleState::OverdueCritical {
            HealthStatus::Overdue
        } else if delivery.consecutive_failures > 0 || pending.is_some() || !drift.is_empty() {
            HealthStatus::Failed
        } else if state == ScheduleState::Due {
            HealthStatus::Due
        } else {
            HealthStatus::Ok
        };

        HealthRecord {
            name: descriptor.name.clone(),
            kind: descriptor.kind,
            metadata,
            status,
            last_error: delivery.last_error,
            consecutive_failures: delivery.consecutive_failures,
            pending,
            drift,
        }
    }

    /// Publish the per-status gauge for `records`.
    pub fn publish_status_gauges(&self, records: &[HealthRecord]) {
        for status in HealthStatus::ALL {
            let count = records.iter().filter(|r| r.status == status).count();
            self.metrics.set_descriptors_by_status(status.as_str(), count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Result;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct CollectingSink {
        alerts: Mutex<Vec<Alert>>,
    }

    #[async_trait]
    impl AlertSink for CollectingSink {
        async fn send(&self, alert: &Alert) -> Result<()> {
            self.alerts.lock().unwrap().push(alert.clone());
            Ok(())
        }

        fn name(&self) -> &'static str {
            "collect"
        }
    }

    fn reporter() -> (HealthReporter, Arc<CollectingSink>) {
        let sink = Arc::new(CollectingSink::default());
        (HealthReporter::new(vec![sink.clone()]), sink)
    }

    #[test]
    fn test_severity_escalation() {
        assert_eq!(severity_for_failures(1), Severity::Warning);
        assert_eq!(severity_for_failures(2), Severity::Warning);
        assert_eq!(severity_for_failures(3), Severity::Critical);
        assert_eq!(severity_for_failures(10), Severity::Critical);
    }

    #[tokio::test]
    async fn test_alert_rate_limited_per_cycle_and_severity() {
        let (reporter, sink) = reporter();

        assert!(reporter.alert("consul_tls", Severity::Critical, "overdue", 4).await);
        assert!(!reporter.alert("consul_tls", Severity::Critical, "overdue", 4).await);
        assert!(reporter.alert("consul_tls", Severity::Warning, "failed", 4).await);
        assert!(reporter.alert("other", Severity::Critical, "overdue", 4).await);
        assert!(reporter.alert("consul_tls", Severity::Critical, "overdue", 5).await);

        assert_eq!(sink.alerts.lock().unwrap().len(), 4);
    }

    #[test]
    fn test_failure_tracking() {
        let (reporter, _) = reporter();
        let err = RotationError::store_unavailable("down");

        assert_eq!(reporter.record_failure("db", &err), 1);
        assert_eq!(reporter.record_failure("db", &err), 2);
        assert_eq!(reporter.consecutive_failures("db"), 2);
        assert!(reporter.last_error("db").unwrap().contains("down"));

        reporter.record_success("db");
        assert_eq!(reporter.consecutive_failures("db"), 0);
        assert!(reporter.last_error("db").is_none());
    }

    #[tokio::test]
    async fn test_restored_state_keeps_rate_limit_and_failures() {
        let (first, _) = reporter();
        first.mark_pending("grafana_admin", PendingStage::Reload);
        first.record_failure("grafana_admin", &RotationError::reload_failed("grafana", 3, "exit 1"));
        assert!(first.alert("grafana_admin", Severity::Warning, "reload failed", 2).await);
        let saved = first.delivery_state("grafana_admin");
        assert_eq!(saved.alerted.get(&Severity::Warning), Some(&2));

        let (second, sink) = reporter();
        second.restore("grafana_admin", saved.clone());
        assert_eq!(second.delivery_state("grafana_admin"), saved);
        assert_eq!(second.pending("grafana_admin"), Some(PendingStage::Reload));
        assert_eq!(second.consecutive_failures("grafana_admin"), 1);
        assert!(!second.alert("grafana_admin", Severity::Warning, "reload failed", 2).await);
        assert!(sink.alerts.lock().unwrap().is_empty());

        second.record_success("grafana_admin");
        let settled = second.delivery_state("grafana_admin");
        assert!(settled.pending.is_none());
        assert!(settled.last_error.is_none());
        assert_eq!(settled.alerted.get(&Severity::Warning), Some(&2));
    }

    #[test]
    fn test_record_status_precedence() {
        let (reporter, _) = reporter();
        let hour = Duration::from_secs(3600);
        let descriptor = SecretDescriptor::new("db", SecretKind::Password, hour, hour);

        assert_eq!(reporter.record(&descriptor, None, ScheduleState::Healthy, vec![]).status, HealthStatus::Ok);
        assert_eq!(reporter.record(&descriptor, None, ScheduleState::Due, vec![]).status, HealthStatus::Due);

        let drifted = reporter.record(&descriptor, None, ScheduleState::Healthy, vec!["/srv/db.env".into()]);
        assert_eq!(drifted.status, HealthStatus::Failed);
        assert!(drifted.is_unhealthy());

        reporter.mark_pending("db", PendingStage::Reload);
        let pending = reporter.record(&descriptor, None, ScheduleState::Due, vec![]);
        assert_eq!(pending.status, HealthStatus::Failed);
        assert_eq!(pending.pending, Some(PendingStage::Reload));

        reporter.record_failure("db", &RotationError::store_unavailable("down"));
        let overdue = reporter.record(&descriptor, None, ScheduleState::OverdueCritical, vec![]);
        assert_eq!(overdue.status, HealthStatus::Overdue);
        assert_eq!(overdue.consecutive_failures, 1);
    }
}
