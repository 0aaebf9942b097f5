//! # Error Types
//!
//! Error taxonomy for the rotation engine using `thiserror`.

use std::path::PathBuf;

/// Custom result type for rotation operations
pub type Result<T> = std::result::Result<T, RotationError>;

/// Main error type for the rotation engine
#[derive(thiserror::Error, Debug)]
pub enum RotationError {
    /// Invalid configuration or descriptor catalog. Fatal at startup.
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Resource not found errors
    #[error("Resource not found: {resource_type} with ID '{id}'")]
    NotFound { resource_type: String, id: String },

    /// Credential material could not be produced
    #[error("Generation failed for '{descriptor}': {message}")]
    Generation { descriptor: String, message: String },

    /// The secret store could not be reached or rejected our credentials
    #[error("Secret store unavailable: {message}")]
    StoreUnavailable { message: String },

    /// A write lost a check-and-set race against another writer
    #[error("Resource conflict: {message}")]
    Conflict { message: String, resource_type: String },

    /// The secret store answered, but the request or the stored data was invalid
    #[error("Secret store error: {message}")]
    Store { message: String },

    /// A template could not be rendered or the artifact could not be written
    #[error("Render failed for '{}': {message}", destination.display())]
    Render { destination: PathBuf, message: String },

    /// A consumer reload did not succeed within its retry budget
    #[error("Reload of service '{service}' failed after {attempts} attempt(s): {message}")]
    ReloadFailed {
        service: String,
        attempts: u32,
        message: String,
    },

    /// The rotation task observed cancellation between steps
    #[error("Rotation of '{descriptor}' cancelled")]
    Cancelled { descriptor: String },

    /// I/O errors with additional context
    #[error("I/O error: {context}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },

    /// Serialization/deserialization errors
    #[error("Serialization error: {context}")]
    Serialization {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
        context: String,
    },

    /// Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl RotationError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config { message: message.into(), source: None }
    }

    /// Create a configuration error with source
    pub fn config_with_source<S: Into<String>>(
        message: S,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self::Config { message: message.into(), source: Some(source) }
    }

    /// Create a not found error
    pub fn not_found<R: Into<String>, I: Into<String>>(resource_type: R, id: I) -> Self {
        Self::NotFound { resource_type: resource_type.into(), id: id.into() }
    }

    /// Create a generation error
    pub fn generation<D: Into<String>, M: Into<String>>(descriptor: D, message: M) -> Self {
        Self::Generation { descriptor: descriptor.into(), message: message.into() }
    }

    /// Create a store-unavailable error
    pub fn store_unavailable<S: Into<String>>(message: S) -> Self {
        Self::StoreUnavailable { message: message.into() }
    }

    /// Create a conflict error
    pub fn conflict<M: Into<String>, R: Into<String>>(message: M, resource_type: R) -> Self {
        Self::Conflict { message: message.into(), resource_type: resource_type.into() }
    }

    /// Create a store error
    pub fn store<S: Into<String>>(message: S) -> Self {
        Self::Store { message: message.into() }
    }

    /// Create a render error
    pub fn render<P: Into<PathBuf>, M: Into<String>>(destination: P, message: M) -> Self {
        Self::Render { destination: destination.into(), message: message.into() }
    }

    /// Create a reload failure
    pub fn reload_failed<S: Into<String>, M: Into<String>>(
        service: S,
        attempts: u32,
        message: M,
    ) -> Self {
        Self::ReloadFailed { service: service.into(), attempts, message: message.into() }
    }

    /// Create a cancellation error
    pub fn cancelled<S: Into<String>>(descriptor: S) -> Self {
        Self::Cancelled { descriptor: descriptor.into() }
    }

    /// Create an I/O error with context
    pub fn io<S: Into<String>>(source: std::io::Error, context: S) -> Self {
        Self::Io { source, context: context.into() }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Whether a retry of the same call can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RotationError::StoreUnavailable { .. }
                | RotationError::Io { .. }
                | RotationError::ReloadFailed { .. }
        )
    }

    /// Whether the error belongs to the configuration class (CLI exit code 2).
    pub fn is_config(&self) -> bool {
        matches!(self, RotationError::Config { .. })
    }

    /// Short stable label used for metrics and health records.
    pub fn kind(&self) -> &'static str {
        match self {
            RotationError::Config { .. } => "config",
            RotationError::NotFound { .. } => "not_found",
            RotationError::Generation { .. } => "generation",
            RotationError::StoreUnavailable { .. } => "store_unavailable",
            RotationError::Conflict { .. } => "conflict",
            RotationError::Store { .. } => "store",
            RotationError::Render { .. } => "render",
            RotationError::ReloadFailed { .. } => "reload_failed",
            RotationError::Cancelled { .. } => "cancelled",
            RotationError::Io { .. } => "io",
            RotationError::Serialization { .. } => "serialization",
            RotationError::Internal { .. } => "internal",
        }
    }
}

impl From<std::io::Error> for RotationError {
    fn from(error: std::io::Error) -> Self {
        Self::Io { source: error, context: "I/O operation failed".to_string() }
    }
}

impl From<serde_json::Error> for RotationError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization {
            source: Box::new(error),
            context: "JSON serialization failed".to_string(),
        }
    }
}

impl From<serde_yaml::Error> for RotationError {
    fn from(error: serde_yaml::Error) -> Self {
        Self::Serialization {
            source: Box::new(error),
            context: "YAML serialization failed".to_string(),
        }
    }
}

impl From<config::ConfigError> for RotationError {
    fn from(error: config::ConfigError) -> Self {
        Self::config_with_source("Configuration loading failed", Box::new(error))
    }
}

impl From<validator::ValidationErrors> for RotationError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let message = errors
            .field_errors()
            .iter()
            .map(|(field, field_errors)| {
                let error_messages: Vec<String> = field_errors
                    .iter()
                    .map(|e| e.message.as_ref().map_or("Invalid value".to_string(), |m| m.to_string()))
                    .collect();
                format!("{}: {}", field, error_messages.join(", "))
            })
            .collect::<Vec<_>>()
            .join("; ");

        Self::config(format!("Validation failed: {}", message))
    }
}
