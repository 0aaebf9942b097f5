//! # secret-rotator
//!
//! A secret and certificate rotation engine. It keeps a catalog of secret
//! descriptors, rotates each one when its TTL elapses, commits the new
//! material to a secret store (HashiCorp Vault, or an in-memory store for
//! development), re-renders the configuration artifacts that embed it and
//! reloads the services that consume them.
//!
//! ## Architecture
//!
//! ```text
//! Scheduler → Generator → SecretStore → Renderer → AtomicWriter → ReloadDispatcher
//!     ↑                                                                   ↓
//! DescriptorRegistry                                          HealthReporter / alerts
//! ```
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use secret_rotator::{EngineConfig, Result, RotationEngine, TickOptions};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = EngineConfig::load(None)?;
//!     let engine = RotationEngine::from_config(&config, None).await?;
//!     let summary = engine.tick(&TickOptions::default(), &CancellationToken::new()).await?;
//!     println!("rotated {} secret(s)", summary.rotated());
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod config;
pub mod engine;
pub mod errors;
pub mod generator;
pub mod health;
pub mod observability;
pub mod registry;
pub mod reload;
pub mod render;
pub mod scheduler;
pub mod secrets;
pub mod utils;

pub use config::EngineConfig;
pub use engine::{HealthReport, RotationEngine, TickSummary};
pub use errors::{Result, RotationError};
pub use registry::{DescriptorRegistry, SecretDescriptor, SecretKind};
pub use scheduler::TickOptions;
pub use secrets::{InMemorySecretStore, SecretStore, VaultSecretStore};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name from Cargo.toml
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
