//! Artifact composition, reconciliation and drift detection.
//!
//! An artifact is always rebuilt from the current material of every
//! descriptor bound to it. Composition and the write happen under a
//! per-destination lock, after all contributing commits, so the last writer
//! always sees the newest material of every contributor.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::{ReconcileReport, RotationEngine};
use crate::errors::{Result, RotationError};
use crate::health::severity_for_failures;
use crate::registry::{SecretDescriptor, DEFAULT_FILE_MODE};
use crate::reload::ArtifactChange;
use crate::render::{render_artifact, ArtifactPart, RenderContext, RenderedArtifact, WriteOutcome};
use crate::secrets::StoredSecret;
use crate::utils::sha256_hex;

pub(super) enum Composition {
    Rendered(RenderedArtifact),
    /// Contributors without material yet
    Incomplete(Vec<String>),
}

pub(super) enum Refresh {
    Deferred(Vec<String>),
    /// Artifact is current on disk; `changes` covers every service bound to it
    Updated { outcome: WriteOutcome, changes: Vec<ArtifactChange> },
}

impl RotationEngine {
    fn destination_lock(&self, destination: &Path) -> Arc<Mutex<()>> {
        Arc::clone(&self.inner.destination_locks.entry(destination.to_path_buf()).or_default())
    }

    /// Render `destination` from the materials `lookup` returns.
    pub(super) fn compose<'s>(
        &self,
        destination: &Path,
        lookup: impl Fn(&str) -> Option<&'s StoredSecret>,
    ) -> Result<Composition> {
        let bindings = self.inner.registry.bindings_for(destination);
        let mut missing: Vec<String> = Vec::new();
        let mut parts = Vec::with_capacity(bindings.len());

        for (descriptor, binding) in &bindings {
            let Some(secret) = lookup(&descriptor.name) else {
                if !missing.contains(&descriptor.name) {
                    missing.push(descriptor.name.clone());
                }
                continue;
            };
            let template = self
                .inner
                .registry
                .template(&binding.template)
                .ok_or_else(|| RotationError::internal(format!("template '{}' is not loaded", binding.template)))?;
            parts.push(ArtifactPart {
                template,
                context: RenderContext {
                    descriptor: &descriptor.name,
                    material: &secret.material,
                    metadata: &secret.metadata,
                },
            });
        }

        if !missing.is_empty() {
            return Ok(Composition::Incomplete(missing));
        }
        let mode = bindings.first().map_or(DEFAULT_FILE_MODE, |(_, binding)| binding.mode);
        render_artifact(destination, mode, &parts).map(Composition::Rendered)
    }

    /// One change per distinct service bound to `destination`.
    fn changes_for(&self, destination: &Path, digest: &str) -> Vec<ArtifactChange> {
        let mut changes: Vec<ArtifactChange> = Vec::new();
        for (_, binding) in self.inner.registry.bindings_for(destination) {
            if changes.iter().any(|c| c.service == binding.reload) {
                continue;
            }
            changes.push(ArtifactChange {
                service: binding.reload.clone(),
                destination: destination.to_path_buf(),
                digest: digest.to_string(),
            });
        }
        changes
    }

    /// Re-render `destination` and write it if its content changed.
    ///
    /// Materials in `known` take precedence; other contributors are read from
    /// the store while the destination lock is held.
    pub(super) async fn refresh_destination(
        &self,
        destination: &Path,
        known: &HashMap<String, StoredSecret>,
    ) -> Result<Refresh> {
        let lock = self.destination_lock(destination);
        let _held = lock.lock().await;

        let mut contributors: Vec<&str> = Vec::new();
        for (descriptor, _) in self.inner.registry.bindings_for(destination) {
            if !known.contains_key(&descriptor.name) && !contributors.contains(&descriptor.name.as_str()) {
                contributors.push(&descriptor.name);
            }
        }
        let mut fetched = HashMap::new();
        for name in contributors {
            if let Some(secret) = self.get_secret(name).await? {
                fetched.insert(name.to_string(), secret);
            }
        }

        let artifact = match self.compose(destination, |name| known.get(name).or_else(|| fetched.get(name)))? {
            Composition::Rendered(artifact) => artifact,
            Composition::Incomplete(missing) => return Ok(Refresh::Deferred(missing)),
        };

        let digest = artifact.digest.clone();
        let writer = self.inner.writer;
        let outcome = tokio::task::spawn_blocking(move || artifact.write(&writer))
            .await
            .map_err(|e| RotationError::internal(format!("artifact writer task failed: {}", e)))??;

        match outcome {
            WriteOutcome::Written => info!(destination = %destination.display(), digest = %digest, "Artifact written"),
            WriteOutcome::Unchanged => debug!(destination = %destination.display(), "Artifact unchanged"),
        }
        Ok(Refresh::Updated { outcome, changes: self.changes_for(destination, &digest) })
    }

    /// Bring every artifact up to date and reload services still running
    /// stale content.
    ///
    /// Services in `busy` already exhausted their retries during this tick and
    /// are left for the next one, as are services of descriptors still in
    /// flight. Descriptors in `failed` had their failure
    /// recorded by their own task; descriptors still in flight (rotated by an
    /// overlapping tick) settle their own pending state.
    pub(super) async fn reconcile(&self, busy: &HashSet<String>, failed: &HashSet<String>) -> ReconcileReport {
        let inner = &self.inner;
        let mut report = ReconcileReport::default();

        let secrets = match self.load_secrets().await {
            Ok(secrets) => secrets,
            Err(e) => {
                warn!(error = %e, "Artifact reconciliation skipped");
                report.errors.push(e.to_string());
                return report;
            }
        };

        let mut written = Vec::new();
        let mut candidates = Vec::new();
        // destinations that are not current, with the error if there was one
        let mut stale: HashMap<PathBuf, Option<String>> = HashMap::new();

        // contributors are re-read under each destination lock; `secrets` may
        // already be older than a commit made by an overlapping tick
        let fresh = HashMap::new();
        for destination in inner.registry.destinations() {
            match self.refresh_destination(destination, &fresh).await {
                Ok(Refresh::Deferred(_)) => {
                    report.incomplete.push(destination.to_path_buf());
                    stale.insert(destination.to_path_buf(), None);
                }
                Ok(Refresh::Updated { outcome: WriteOutcome::Written, changes }) => {
                    warn!(destination = %destination.display(), "Stale artifact rewritten");
                    report.rewritten.push(destination.to_path_buf());
                    written.extend(changes);
                }
                Ok(Refresh::Updated { outcome: WriteOutcome::Unchanged, changes }) => candidates.extend(changes),
                Err(e) => {
                    error!(destination = %destination.display(), error = %e, "Artifact reconciliation failed");
                    report.errors.push(e.to_string());
                    stale.insert(destination.to_path_buf(), Some(e.to_string()));
                }
            }
        }

        // services of descriptors an overlapping tick is rotating are
        // reloaded by that rotation
        let mut held: HashSet<String> = busy.clone();
        for descriptor in inner.registry.list() {
            if inner.in_flight.is_in_flight(&descriptor.name) {
                held.extend(self.services_at(&inner.registry.destinations_of(&descriptor.name)));
            }
        }

        let mut to_reload = written;
        to_reload.extend(inner.dispatcher.out_of_sync(&candidates));
        to_reload.retain(|change| !held.contains(&change.service));
        if !to_reload.is_empty() {
            let result = self.reload_services(&to_reload).await;
            report.reloaded = result.reloaded;
            report.failed = result.failed;
        }

        for descriptor in inner.registry.list() {
            if inner.reporter.pending(&descriptor.name).is_none()
                || failed.contains(&descriptor.name)
                || inner.in_flight.is_in_flight(&descriptor.name)
            {
                continue;
            }
            let cycle = secrets.get(&descriptor.name).map_or(0, |s| s.metadata.rotation_count);
            let destinations = inner.registry.destinations_of(&descriptor.name);
            let services = self.services_at(&destinations);

            if let Some(failure) = report.failed.iter().find(|f| services.contains(&f.service)) {
                let error = RotationError::from(failure.clone());
                self.escalate(descriptor, &error, cycle).await;
            } else if let Some((destination, message)) =
                destinations.iter().find_map(|d| match stale.get_key_value(*d) {
                    Some((path, Some(message))) => Some((path, message)),
                    _ => None,
                })
            {
                let error = RotationError::render(destination, message.clone());
                self.escalate(descriptor, &error, cycle).await;
            } else if destinations.iter().any(|d| stale.contains_key(*d))
                || services.iter().any(|s| held.contains(s))
            {
                debug!(descriptor = %descriptor.name, "Pending artifacts still waiting");
            } else {
                info!(descriptor = %descriptor.name, "Pending artifacts caught up");
                inner.reporter.record_success(&descriptor.name);
                self.save_delivery(&descriptor.name).await;
            }
        }

        report
    }

    async fn escalate(&self, descriptor: &SecretDescriptor, error: &RotationError, cycle: u64) {
        let failures = self.inner.reporter.record_failure(&descriptor.name, error);
        warn!(descriptor = %descriptor.name, consecutive_failures = failures, error = %error, "Pending artifacts still failing");
        self.inner
            .reporter
            .alert(
                &descriptor.name,
                severity_for_failures(failures),
                format!("'{}' was rotated but its consumers are not up to date: {}", descriptor.name, error),
                cycle,
            )
            .await;
        self.save_delivery(&descriptor.name).await;
    }

    fn services_at(&self, destinations: &[&Path]) -> HashSet<String> {
        destinations
            .iter()
            .flat_map(|d| self.inner.registry.bindings_for(d))
            .map(|(_, binding)| binding.reload.clone())
            .collect()
    }

    /// Drift of the artifacts `descriptor` contributes to.
    pub(super) fn drift(
        &self,
        descriptor: &SecretDescriptor,
        secrets: &HashMap<String, StoredSecret>,
    ) -> Result<Vec<String>> {
        let mut drift = Vec::new();
        for destination in self.inner.registry.destinations_of(&descriptor.name) {
            let artifact = match self.compose(destination, |name| secrets.get(name)) {
                Ok(Composition::Rendered(artifact)) => artifact,
                Ok(Composition::Incomplete(_)) => continue,
                Err(e) => {
                    drift.push(format!("artifact {} cannot be rendered: {}", destination.display(), e));
                    continue;
                }
            };

            let Some(on_disk) = self.inner.writer.read_current(destination)? else {
                drift.push(format!("artifact {} is missing", destination.display()));
                continue;
            };
            if on_disk != artifact.content.as_bytes() {
                drift.push(format!("artifact {} differs from rendered content", destination.display()));
                continue;
            }

            for change in self.changes_for(destination, &sha256_hex(&on_disk)) {
                if self.inner.dispatcher.is_out_of_sync(&change) {
                    drift.push(format!("service {} has not reloaded {}", change.service, destination.display()));
                }
            }
        }
        Ok(drift)
    }
}
