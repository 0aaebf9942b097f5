//! # Metrics Collection
//!
//! Prometheus metrics for rotations, reloads and alerts.

use crate::config::ObservabilityConfig;
use crate::errors::{Result, RotationError};
use ::tracing::{info, warn};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Metrics recorder that tracks engine metrics
#[derive(Debug, Clone, Default)]
pub struct MetricsRecorder;

impl MetricsRecorder {
    /// Create a new metrics recorder instance
    pub fn new() -> Self {
        Self
    }

    /// Register metric descriptions with the installed exporter
    pub fn register_metrics(&self) {
        describe_counter!("rotations_total", Unit::Count, "Completed secret rotations");
        describe_counter!("rotation_failures_total", Unit::Count, "Rotation attempts that failed");
        describe_histogram!(
            "rotation_duration_seconds",
            Unit::Seconds,
            "Wall-clock time of a rotation attempt, generation through reload"
        );
        describe_counter!("reload_attempts_total", Unit::Count, "Reload action invocations");
        describe_counter!("reload_failures_total", Unit::Count, "Reloads that exhausted their retries");
        describe_counter!("alerts_total", Unit::Count, "Alerts emitted by severity");
        describe_gauge!("descriptors_by_status", Unit::Count, "Descriptors per health status");
        describe_counter!("ticks_total", Unit::Count, "Scheduler ticks evaluated");
    }

    /// Record a completed rotation
    pub fn record_rotation(&self, descriptor: &str, kind: &str, duration: f64) {
        let labels = [("descriptor", descriptor.to_string()), ("kind", kind.to_string())];
        counter!("rotations_total", &labels).increment(1);
        histogram!("rotation_duration_seconds", &labels).record(duration);
    }

    /// Record a failed rotation attempt, labelled by the error kind
    pub fn record_rotation_failure(&self, descriptor: &str, error_kind: &str, duration: f64) {
        let labels = [("descriptor", descriptor.to_string()), ("error", error_kind.to_string())];
        counter!("rotation_failures_total", &labels).increment(1);
        histogram!("rotation_duration_seconds", "descriptor" => descriptor.to_string()).record(duration);
    }

    /// Record one reload attempt and its outcome
    pub fn record_reload_attempt(&self, service: &str, success: bool) {
        let status = if success { "success" } else { "error" };
        let labels = [("service", service.to_string()), ("status", status.to_string())];
        counter!("reload_attempts_total", &labels).increment(1);
    }

    /// Record a reload that exhausted its retry budget
    pub fn record_reload_failure(&self, service: &str) {
        counter!("reload_failures_total", "service" => service.to_string()).increment(1);
    }

    /// Record an emitted alert
    pub fn record_alert(&self, severity: &str) {
        counter!("alerts_total", "severity" => severity.to_string()).increment(1);
    }

    /// Update the per-status descriptor gauge
    pub fn set_descriptors_by_status(&self, status: &str, count: usize) {
        gauge!("descriptors_by_status", "status" => status.to_string()).set(count as f64);
    }

    /// Record a scheduler tick
    pub fn record_tick(&self, due: usize) {
        counter!("ticks_total").increment(1);
        gauge!("descriptors_due").set(due as f64);
    }
}

/// Install the Prometheus exporter when a metrics port is configured.
pub fn init_metrics(config: &ObservabilityConfig) -> Result<()> {
    let metrics_addr = match config.metrics_bind_address() {
        Some(addr) => addr,
        None => {
            warn!("Metrics exporter disabled: metrics_port is 0");
            return Ok(());
        }
    };

    let socket_addr: SocketAddr = metrics_addr.parse().map_err(|e| {
        RotationError::config(format!("Invalid metrics bind address '{}': {}", metrics_addr, e))
    })?;

    PrometheusBuilder::new()
        .with_http_listener(socket_addr)
        .add_global_label("service", "secret-rotator")
        .install()
        .map_err(|e| RotationError::config(format!("Failed to initialize metrics exporter: {}", e)))?;

    MetricsRecorder::new().register_metrics();

    info!(metrics_addr = %metrics_addr, "Metrics collection initialized");
    Ok(())
}
