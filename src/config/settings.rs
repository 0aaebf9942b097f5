//! # Configuration Settings
//!
//! Defines the configuration structure for the rotation engine.

use crate::errors::{Result, RotationError};
use crate::secrets::{SecretString, VaultConfig};
use crate::utils::RetryConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use validator::Validate;

/// Main engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct EngineConfig {
    /// Path of the descriptor catalog (secrets, services, templates)
    pub catalog_path: PathBuf,

    #[validate(nested)]
    pub scheduler: SchedulerConfig,

    #[validate(nested)]
    pub generator: GeneratorConfig,

    #[validate(nested)]
    pub reload: ReloadConfig,

    #[validate(nested)]
    pub store: StoreConfig,

    #[validate(nested)]
    pub alerts: AlertConfig,

    #[validate(nested)]
    pub observability: ObservabilityConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            catalog_path: PathBuf::from("rotation.yaml"),
            scheduler: SchedulerConfig::default(),
            generator: GeneratorConfig::default(),
            reload: ReloadConfig::default(),
            store: StoreConfig::default(),
            alerts: AlertConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Validate the entire configuration
    pub fn validate(&self) -> Result<()> {
        Validate::validate(self).map_err(RotationError::from)?;
        self.validate_custom()?;
        Ok(())
    }

    /// Checks the validator derive cannot express
    fn validate_custom(&self) -> Result<()> {
        if self.catalog_path.as_os_str().is_empty() {
            return Err(RotationError::config("catalog_path cannot be empty"));
        }

        if self.scheduler.tick_interval < Duration::from_secs(1) {
            return Err(RotationError::config("scheduler.tick_interval must be at least 1s"));
        }

        if self.reload.attempt_timeout.is_zero() {
            return Err(RotationError::config("reload.attempt_timeout must be greater than zero"));
        }

        if self.reload.max_backoff < self.reload.initial_backoff {
            return Err(RotationError::config(
                "reload.max_backoff must not be smaller than reload.initial_backoff",
            ));
        }

        if self.alerts.webhook_secret.is_some() && self.alerts.webhook_url.is_none() {
            return Err(RotationError::config("alerts.webhook_secret is set but alerts.webhook_url is not"));
        }

        Ok(())
    }
}

/// Tick driver configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Interval between evaluation ticks
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,

    /// Maximum rotations executing at the same time
    #[validate(range(min = 1, max = 64, message = "max_concurrency must be between 1 and 64"))]
    pub max_concurrency: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { tick_interval: Duration::from_secs(4 * 3600), max_concurrency: 4 }
    }
}

/// Credential generation policy
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct GeneratorConfig {
    /// bcrypt work factor for `bcrypt-auth-pair` descriptors
    #[validate(range(min = 4, max = 31, message = "bcrypt_cost must be between 4 and 31"))]
    pub bcrypt_cost: u32,

    /// Password length when a descriptor does not set one
    #[validate(range(min = 8, max = 512, message = "password_length must be between 8 and 512"))]
    pub password_length: usize,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self { bcrypt_cost: 12, password_length: 32 }
    }
}

/// Reload dispatch policy
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ReloadConfig {
    #[validate(range(min = 1, max = 10, message = "max_attempts must be between 1 and 10"))]
    pub max_attempts: u32,

    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,

    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,

    /// Timeout applied to each individual reload attempt
    #[serde(with = "humantime_serde")]
    pub attempt_timeout: Duration,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

impl ReloadConfig {
    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            initial_backoff: self.initial_backoff,
            max_backoff: self.max_backoff,
            backoff_multiplier: 2.0,
        }
    }
}

/// Which secret store backend to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Vault,
    /// Process-local store; state is lost on exit
    Memory,
}

/// Secret store configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,

    #[validate(nested)]
    pub vault: VaultConfig,
}

/// Alert delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct AlertConfig {
    /// Webhook receiving alert JSON; alerts are only logged when unset
    #[validate(url(message = "webhook_url must be a valid URL"))]
    pub webhook_url: Option<String>,

    /// HMAC-SHA256 signing secret for the webhook
    pub webhook_secret: Option<SecretString>,

    #[validate(range(min = 1, max = 10, message = "webhook max_attempts must be between 1 and 10"))]
    pub max_attempts: u32,

    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self { webhook_url: None, webhook_secret: None, max_attempts: 3, timeout: Duration::from_secs(10) }
    }
}

/// Observability configuration for logging and metrics
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error) or a full filter directive
    #[validate(length(min = 1, message = "Log level cannot be empty"))]
    pub log_level: String,

    /// Enable JSON structured logging
    pub json_logging: bool,

    /// Metrics server port (0 = disabled)
    pub metrics_port: u16,

    /// Directory for a daily-rolling log file in addition to stderr
    pub log_dir: Option<PathBuf>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { log_level: "info".to_string(), json_logging: false, metrics_port: 0, log_dir: None }
    }
}

impl ObservabilityConfig {
    /// Get metrics bind address (None if disabled)
    pub fn metrics_bind_address(&self) -> Option<String> {
        if self.metrics_port == 0 {
            None
        } else {
            Some(format!("0.0.0.0:{}", self.metrics_port))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> EngineConfig {
        EngineConfig::default()
    }

    #[test]
    fn test_default_config_validation() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_defaults() {
        let config = valid();
        assert_eq!(config.scheduler.tick_interval, Duration::from_secs(4 * 3600));
        assert_eq!(config.scheduler.max_concurrency, 4);
        assert_eq!(config.generator.bcrypt_cost, 12);
        assert_eq!(config.generator.password_length, 32);
        assert_eq!(config.reload.max_attempts, 3);
        assert_eq!(config.store.backend, StoreBackend::Vault);
    }

    #[test]
    fn test_reload_retry_config() {
        let retry = ReloadConfig::default().retry();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.backoff_for_attempt(1), Duration::from_millis(500));
        assert_eq!(retry.backoff_for_attempt(2), Duration::from_secs(1));
    }

    #[test]
    fn test_config_validation_ranges() {
        let mut config = valid();
        config.scheduler.max_concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.generator.bcrypt_cost = 3;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.alerts.webhook_url = Some("not a url".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_custom() {
        let mut config = valid();
        config.reload.initial_backoff = Duration::from_secs(20);
        config.reload.max_backoff = Duration::from_secs(1);
        assert!(config.validate().is_err());

        let mut config = valid();
        config.alerts.webhook_secret = Some(SecretString::new("k"));
        assert!(config.validate().is_err());

        let mut config = valid();
        config.catalog_path = PathBuf::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_with_humantime_durations() {
        let yaml = r#"
catalog_path: /etc/rotation/catalog.yaml
scheduler:
  tick_interval: 30m
reload:
  attempt_timeout: 5s
store:
  backend: memory
"#;
        let config: EngineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.scheduler.tick_interval, Duration::from_secs(1800));
        assert_eq!(config.scheduler.max_concurrency, 4);
        assert_eq!(config.reload.attempt_timeout, Duration::from_secs(5));
        assert_eq!(config.store.backend, StoreBackend::Memory);
    }

    #[test]
    fn test_observability_config_metrics_address() {
        let config = ObservabilityConfig { metrics_port: 9090, ..Default::default() };
        assert_eq!(config.metrics_bind_address(), Some("0.0.0.0:9090".to_string()));
        assert_eq!(ObservabilityConfig::default().metrics_bind_address(), None);
    }
}
