//! # Observability Infrastructure
//!
//! Structured logging (stderr, optional rolling file) and Prometheus metrics.

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, log_config_info};
pub use metrics::{init_metrics, MetricsRecorder};

use crate::config::ObservabilityConfig;
use crate::errors::Result;
use tracing_appender::non_blocking::WorkerGuard;

/// Initialize logging and metrics. Keep the returned guard alive until exit.
pub fn init_observability(config: &ObservabilityConfig, verbose: bool) -> Result<Option<WorkerGuard>> {
    let guard = init_logging(config, verbose)?;
    init_metrics(config)?;
    tracing::debug!(
        log_level = %config.log_level,
        json_logging = config.json_logging,
        metrics_port = config.metrics_port,
        "Observability initialized"
    );
    Ok(guard)
}
