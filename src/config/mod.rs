//! # Configuration Management
//!
//! Engine configuration is layered, lowest precedence first:
//!
//! 1. built-in defaults
//! 2. an optional YAML file
//! 3. `ROTATION_*` environment variables, nested with `__`
//!    (e.g. `ROTATION_SCHEDULER__MAX_CONCURRENCY=8`)
//! 4. the standard `VAULT_*` variables for the Vault store
//!
//! The descriptor catalog is a separate document, see [`crate::registry`].

pub mod settings;

pub use settings::{
    AlertConfig, EngineConfig, GeneratorConfig, ObservabilityConfig, ReloadConfig, SchedulerConfig,
    StoreBackend, StoreConfig,
};

use crate::errors::{Result, RotationError};
use config::{Config, Environment, File, FileFormat};
use std::path::Path;

/// Environment prefix for engine settings
pub const ENV_PREFIX: &str = "ROTATION";

impl EngineConfig {
    /// Load configuration from an optional YAML file plus the environment, then validate it.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            if !path.exists() {
                return Err(RotationError::config(format!(
                    "Configuration file '{}' does not exist",
                    path.display()
                )));
            }
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: EngineConfig = builder.build()?.try_deserialize()?;
        config.store.vault.apply_env();
        config.validate()?;

        tracing::debug!(
            catalog = %config.catalog_path.display(),
            backend = ?config.store.backend,
            "Loaded engine configuration"
        );
        Ok(config)
    }
}
