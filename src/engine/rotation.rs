//! Execution of a single rotation task.

use std::collections::HashMap;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::artifacts::Refresh;
use super::{RotationEngine, TaskReport};
use crate::errors::{Result, RotationError};
use crate::health::{severity_for_failures, PendingStage};
use crate::render::WriteOutcome;
use crate::scheduler::RotationTask;
use crate::secrets::{CredentialMaterial, RotationMetadata, StoredSecret};

fn ensure_active(cancel: &CancellationToken, descriptor: &str) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(RotationError::cancelled(descriptor));
    }
    Ok(())
}

impl RotationEngine {
    /// Run `task` to completion and record its outcome.
    pub(super) async fn execute(&self, task: RotationTask, cancel: &CancellationToken) -> TaskReport {
        let inner = &self.inner;
        let descriptor = &task.descriptor;
        let started = Instant::now();
        info!(state = %task.state, bootstrap = task.previous.is_none(), "Rotation started");

        let mut report = TaskReport::new(&task);
        let result = self.rotate(&task, cancel, &mut report).await;
        let elapsed = started.elapsed().as_secs_f64();

        match result {
            Ok(()) if report.superseded => {
                inner.reporter.record_success(&descriptor.name);
            }
            Ok(()) => {
                inner.reporter.record_success(&descriptor.name);
                inner.metrics.record_rotation(&descriptor.name, descriptor.kind.as_str(), elapsed);
                info!(
                    version = report.committed.as_ref().map(|m| m.current_version),
                    reloaded = ?report.reloaded,
                    "Rotation completed"
                );
            }
            Err(e) => {
                inner.metrics.record_rotation_failure(&descriptor.name, e.kind(), elapsed);
                if matches!(e, RotationError::Cancelled { .. }) {
                    warn!(committed = report.committed.is_some(), "Rotation cancelled");
                } else {
                    let failures = inner.reporter.record_failure(&descriptor.name, &e);
                    let cycle = report.committed.as_ref().or(task.previous.as_ref()).map_or(0, |m| m.rotation_count);
                    error!(
                        error = %e,
                        committed = report.committed.is_some(),
                        consecutive_failures = failures,
                        "Rotation failed"
                    );
                    inner
                        .reporter
                        .alert(
                            &descriptor.name,
                            severity_for_failures(failures),
                            format!("rotation of '{}' failed: {}", descriptor.name, e),
                            cycle,
                        )
                        .await;
                }
                report.error = Some(e);
            }
        }
        self.save_delivery(&descriptor.name).await;
        report
    }

    async fn rotate(&self, task: &RotationTask, cancel: &CancellationToken, report: &mut TaskReport) -> Result<()> {
        let inner = &self.inner;
        let descriptor = &task.descriptor;

        ensure_active(cancel, &descriptor.name)?;
        let material = inner.generator.generate(descriptor).await?;

        ensure_active(cancel, &descriptor.name)?;
        let metadata = RotationMetadata::next(
            task.previous.as_ref(),
            &descriptor.name,
            inner.clock.now(),
            descriptor.default_ttl,
            task.attempt_id,
        );
        let committed = match self.commit(&descriptor.name, &material, &metadata).await {
            Ok(committed) => committed,
            Err(RotationError::Conflict { message, .. }) => {
                let current = self.get_secret(&descriptor.name).await?;
                info!(
                    reason = %message,
                    version = current.as_ref().map(|s| s.metadata.current_version),
                    "Secret was rotated by another writer; keeping its version"
                );
                report.superseded = true;
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        info!(
            version = committed.current_version,
            next_rotation_at = %committed.next_rotation_at,
            "Secret committed"
        );
        report.committed = Some(committed.clone());
        inner.reporter.mark_pending(&descriptor.name, PendingStage::Render);
        self.save_delivery(&descriptor.name).await;

        ensure_active(cancel, &descriptor.name)?;
        let own = HashMap::from([(descriptor.name.clone(), StoredSecret { material, metadata: committed })]);

        let mut changes = Vec::new();
        let mut render_error = None;
        for destination in inner.registry.destinations_of(&descriptor.name) {
            match self.refresh_destination(destination, &own).await {
                Ok(Refresh::Deferred(missing)) => {
                    info!(
                        destination = %destination.display(),
                        waiting_for = ?missing,
                        "Artifact deferred until every contributor has material"
                    );
                    report.deferred.push(destination.to_path_buf());
                }
                Ok(Refresh::Updated { outcome, changes: affected }) => {
                    changes.extend(affected.into_iter().filter(|change| {
                        outcome == WriteOutcome::Written || inner.dispatcher.is_out_of_sync(change)
                    }));
                }
                Err(e) => {
                    error!(destination = %destination.display(), error = %e, "Artifact render failed");
                    render_error.get_or_insert(e);
                }
            }
        }

        if render_error.is_none() {
            inner.reporter.mark_pending(&descriptor.name, PendingStage::Reload);
            self.save_delivery(&descriptor.name).await;
        }
        ensure_active(cancel, &descriptor.name)?;

        if !changes.is_empty() {
            let result = self.reload_services(&changes).await;
            report.reloaded = result.reloaded.clone();
            report.failed_services = result.failed.iter().map(|f| f.service.clone()).collect();
            if let Some(e) = render_error {
                return Err(e);
            }
            if let Some(e) = result.first_error() {
                return Err(e);
            }
        }

        match render_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Write material and metadata, retrying with the same attempt id so a
    /// retried write that had already landed is not applied twice. A
    /// conflict is not retried: the stored version moved on since planning.
    async fn commit(
        &self,
        name: &str,
        material: &CredentialMaterial,
        metadata: &RotationMetadata,
    ) -> Result<RotationMetadata> {
        self.inner
            .store_retry
            .run(
                |attempt| {
                    if attempt > 0 {
                        warn!(attempt = attempt + 1, "Retrying secret commit");
                    }
                    self.inner.store.put(name, material, metadata)
                },
                RotationError::is_retryable,
            )
            .await
            .map_err(|(e, attempts)| {
                error!(attempts, error = %e, "Secret commit failed");
                e
            })
    }
}
