//! # Reload Dispatcher
//!
//! Tells consumer services to pick up rewritten artifacts. Changes are
//! deduplicated by service, each service is reloaded with bounded retry and a
//! per-attempt timeout, and the digest of every artifact a service last
//! reloaded successfully is remembered so that [`ReloadDispatcher::out_of_sync`]
//! can find services that still run stale content. An artifact a service has
//! never been seen to reload counts as stale.

pub mod action;

pub use action::{CommandAction, ReloadAction, ReloadActionSpec, ServiceSpec, SignalAction, SUPPORTED_SIGNALS};

use dashmap::DashMap;
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn, Instrument};

use crate::config::ReloadConfig;
use crate::errors::RotationError;
use crate::observability::MetricsRecorder;
use crate::reload_span;
use crate::secrets::ServiceSync;
use crate::utils::RetryConfig;

/// A rewritten (or re-checked) artifact and the service that consumes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactChange {
    pub service: String,
    pub destination: PathBuf,
    /// SHA-256 of the artifact content now on disk
    pub digest: String,
}

/// A service whose reload exhausted its retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadFailure {
    pub service: String,
    pub attempts: u32,
    /// Cause reported by the last attempt
    pub message: String,
}

impl From<ReloadFailure> for RotationError {
    fn from(failure: ReloadFailure) -> Self {
        RotationError::reload_failed(failure.service, failure.attempts, failure.message)
    }
}

/// Outcome of one dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadResult {
    pub reloaded: Vec<String>,
    pub failed: Vec<ReloadFailure>,
}

impl ReloadResult {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// First failure as an error, if any.
    pub fn first_error(&self) -> Option<RotationError> {
        self.failed.first().cloned().map(RotationError::from)
    }
}

#[derive(Debug, Clone)]
struct ServiceAction {
    action: Arc<dyn ReloadAction>,
    timeout: Duration,
}

/// Dispatches reloads and tracks what each service last loaded.
#[derive(Debug)]
pub struct ReloadDispatcher {
    services: HashMap<String, ServiceAction>,
    retry: RetryConfig,
    /// Per (service, artifact): digest last reloaded successfully
    synced: DashMap<(String, PathBuf), String>,
    metrics: MetricsRecorder,
}

impl ReloadDispatcher {
    pub fn new(retry: RetryConfig) -> Self {
        Self { services: HashMap::new(), retry, synced: DashMap::new(), metrics: MetricsRecorder::new() }
    }

    /// Build a dispatcher for every service declared in the catalog.
    pub fn from_services(services: &BTreeMap<String, ServiceSpec>, config: &ReloadConfig) -> Self {
        let mut dispatcher = Self::new(config.retry());
        for (name, spec) in services {
            let timeout = spec.timeout.unwrap_or(config.attempt_timeout);
            dispatcher.register(name, spec.build(name), timeout);
        }
        dispatcher
    }

    /// Register (or replace) the action for `service`.
    pub fn register(&mut self, service: impl Into<String>, action: Arc<dyn ReloadAction>, timeout: Duration) {
        self.services.insert(service.into(), ServiceAction { action, timeout });
    }

    pub fn has_service(&self, service: &str) -> bool {
        self.services.contains_key(service)
    }

    /// Reload every service named in `changes`, once per service.
    ///
    /// On success the digests in `changes` become the service's synced
    /// state. On failure the previous synced state is kept, so
    /// [`out_of_sync`](Self::out_of_sync) keeps reporting the service.
    pub async fn reload(&self, changes: &[ArtifactChange]) -> ReloadResult {
        let mut by_service: BTreeMap<&str, Vec<&ArtifactChange>> = BTreeMap::new();
        for change in changes {
            by_service.entry(change.service.as_str()).or_default().push(change);
        }

        let outcomes = join_all(by_service.into_iter().map(|(service, changes)| async move {
            let outcome = self.reload_service(service).instrument(reload_span!(service)).await;
            (service, changes, outcome)
        }))
        .await;

        let mut result = ReloadResult::default();
        for (service, changes, outcome) in outcomes {
            match outcome {
                Ok(()) => {
                    for change in changes {
                        self.synced.insert((change.service.clone(), change.destination.clone()), change.digest.clone());
                    }
                    result.reloaded.push(service.to_string());
                }
                Err(failure) => result.failed.push(failure),
            }
        }
        result
    }

    async fn reload_service(&self, service: &str) -> std::result::Result<(), ReloadFailure> {
        let Some(entry) = self.services.get(service) else {
            return Err(ReloadFailure {
                service: service.to_string(),
                attempts: 0,
                message: "no reload action registered".to_string(),
            });
        };

        let outcome = self
            .retry
            .run(
                |attempt| {
                    let entry = entry.clone();
                    let attempt = attempt + 1;
                    async move {
                        debug!(attempt, action = %entry.action.describe(), "Invoking reload action");
                        let result = match tokio::time::timeout(entry.timeout, entry.action.invoke()).await {
                            Ok(result) => result,
                            Err(_) => Err(RotationError::reload_failed(
                                service,
                                attempt,
                                format!("attempt timed out after {:?}", entry.timeout),
                            )),
                        };
                        self.metrics.record_reload_attempt(service, result.is_ok());
                        if let Err(e) = &result {
                            warn!(attempt, error = %e, "Reload attempt failed");
                        }
                        result
                    }
                },
                |_: &RotationError| true,
            )
            .await;

        match outcome {
            Ok(()) => {
                info!("Service reloaded");
                Ok(())
            }
            Err((error, attempts)) => {
                self.metrics.record_reload_failure(service);
                let message = match error {
                    RotationError::ReloadFailed { message, .. } => message,
                    other => other.to_string(),
                };
                Err(ReloadFailure { service: service.to_string(), attempts, message })
            }
        }
    }

    /// Changes whose digest differs from what the service last reloaded,
    /// including artifacts the service was never seen to reload.
    pub fn out_of_sync(&self, current: &[ArtifactChange]) -> Vec<ArtifactChange> {
        current.iter().filter(|change| self.is_out_of_sync(change)).cloned().collect()
    }

    pub fn is_out_of_sync(&self, change: &ArtifactChange) -> bool {
        self.synced_digest(&change.service, &change.destination).as_deref() != Some(change.digest.as_str())
    }

    /// Digest last reloaded by `service` for `destination`.
    pub fn synced_digest(&self, service: &str, destination: &Path) -> Option<String> {
        self.synced.get(&(service.to_string(), destination.to_path_buf())).map(|d| d.clone())
    }

    /// Everything `service` is known to have reloaded, as it would be saved.
    pub fn service_sync(&self, service: &str) -> ServiceSync {
        let artifacts = self
            .synced
            .iter()
            .filter(|entry| entry.key().0 == service)
            .map(|entry| (entry.key().1.clone(), entry.value().clone()))
            .collect();
        ServiceSync { artifacts }
    }

    /// Seed what `service` last reloaded from a saved state.
    pub fn restore(&self, service: &str, sync: &ServiceSync) {
        for (destination, digest) in &sync.artifacts {
            self.synced.insert((service.to_string(), destination.clone()), digest.clone());
        }
    }
}
