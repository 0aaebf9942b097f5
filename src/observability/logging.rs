//! # Structured Logging
//!
//! Subscriber setup and span macros built on the tracing ecosystem.

use crate::config::ObservabilityConfig;
use crate::errors::{Result, RotationError};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

/// File name prefix for the rolling log file
pub const LOG_FILE_PREFIX: &str = "secret-rotator.log";

/// Create a tracing span for one rotation attempt.
///
/// Pass the descriptor name, its kind and the attempt id; extra fields follow:
///
/// ```rust,ignore
/// let span = rotation_span!("grafana_admin", "bcrypt-auth-pair", task.attempt_id);
/// let span = rotation_span!("grafana_admin", "password", task.attempt_id, priority = "critical");
/// ```
#[macro_export]
macro_rules! rotation_span {
    ($descriptor:expr, $kind:expr, $attempt_id:expr) => {
        tracing::info_span!(
            "rotation",
            descriptor = %$descriptor,
            kind = %$kind,
            attempt_id = %$attempt_id
        )
    };
    ($descriptor:expr, $kind:expr, $attempt_id:expr, $($field:tt)*) => {
        tracing::info_span!(
            "rotation",
            descriptor = %$descriptor,
            kind = %$kind,
            attempt_id = %$attempt_id,
            $($field)*
        )
    };
}

/// Create a tracing span for a reload of one consumer service
#[macro_export]
macro_rules! reload_span {
    ($service:expr) => {
        tracing::debug_span!("reload", service = %$service)
    };
    ($service:expr, $($field:tt)*) => {
        tracing::debug_span!("reload", service = %$service, $($field)*)
    };
}

/// Build the log filter: `RUST_LOG` wins, then `verbose`, then the configured level.
pub fn build_filter(config: &ObservabilityConfig, verbose: bool) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let directive = if verbose { "debug" } else { config.log_level.as_str() };
    EnvFilter::try_new(directive)
        .map_err(|e| RotationError::config(format!("Invalid log level '{}': {}", directive, e)))
}

/// Install the global subscriber.
///
/// Logs go to stderr (JSON when `json_logging` is set). With `log_dir`, a
/// daily-rolling JSON file is written as well; keep the returned guard alive
/// until exit so buffered lines are flushed.
pub fn init_logging(config: &ObservabilityConfig, verbose: bool) -> Result<Option<WorkerGuard>> {
    let filter = build_filter(config, verbose)?;

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    if config.json_logging {
        layers.push(fmt::layer().json().with_writer(std::io::stderr).boxed());
    } else {
        layers.push(fmt::layer().with_target(false).with_writer(std::io::stderr).boxed());
    }

    let guard = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .map_err(|e| RotationError::io(e, format!("Failed to create log directory {}", dir.display())))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            layers.push(fmt::layer().json().with_ansi(false).with_writer(writer).boxed());
            Some(guard)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| RotationError::config(format!("Failed to install log subscriber: {}", e)))?;

    Ok(guard)
}

/// Log configuration at startup
pub fn log_config_info(config: &crate::config::EngineConfig) {
    tracing::info!(
        catalog = %config.catalog_path.display(),
        backend = ?config.store.backend,
        tick_interval = %humantime_serde::re::humantime::format_duration(config.scheduler.tick_interval),
        max_concurrency = config.scheduler.max_concurrency,
        webhook_alerts = config.alerts.webhook_url.is_some(),
        metrics_port = config.observability.metrics_port,
        "Rotation engine configuration"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_macros_compile() {
        let attempt_id = uuid::Uuid::new_v4();
        let _span = rotation_span!("grafana_admin", "bcrypt-auth-pair", attempt_id);
        let _span = rotation_span!("consul_tls", "tls-cert", attempt_id, priority = "critical");
        let _span = reload_span!("traefik");
        let _span = reload_span!("traefik", attempt = 2);
    }

    #[test]
    fn test_build_filter_uses_configured_level() {
        let config = ObservabilityConfig { log_level: "warn".to_string(), ..Default::default() };
        assert!(build_filter(&config, false).is_ok());
        assert!(build_filter(&config, true).is_ok());
    }

    #[test]
    fn test_log_config_info() {
        log_config_info(&crate::config::EngineConfig::default());
    }
}
