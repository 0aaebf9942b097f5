//! Outcome types returned by the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::errors::RotationError;
use crate::health::{HealthRecord, HealthStatus};
use crate::reload::ReloadFailure;
use crate::scheduler::{Priority, RotationTask};
use crate::secrets::{RotationMetadata, StoreBackendType};

/// What happened to one rotation task.
#[derive(Debug)]
pub struct TaskReport {
    pub descriptor: String,
    pub priority: Priority,
    /// Metadata committed to the store; `None` when the task failed before commit
    pub committed: Option<RotationMetadata>,
    /// Destinations left for a later tick because a contributor has no material yet
    pub deferred: Vec<PathBuf>,
    pub reloaded: Vec<String>,
    pub failed_services: Vec<String>,
    /// Another writer rotated the descriptor first; nothing was committed
    pub superseded: bool,
    pub error: Option<RotationError>,
}

impl TaskReport {
    pub(crate) fn new(task: &RotationTask) -> Self {
        Self {
            descriptor: task.descriptor.name.clone(),
            priority: task.priority,
            committed: None,
            deferred: Vec::new(),
            reloaded: Vec::new(),
            failed_services: Vec::new(),
            superseded: false,
            error: None,
        }
    }

    pub(crate) fn aborted(descriptor: String, priority: Priority, error: RotationError) -> Self {
        Self {
            descriptor,
            priority,
            committed: None,
            deferred: Vec::new(),
            reloaded: Vec::new(),
            failed_services: Vec::new(),
            superseded: false,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Artifact reconciliation run at the end of a tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Artifacts whose content on disk was stale and got rewritten
    pub rewritten: Vec<PathBuf>,
    /// Artifacts not rendered because a contributor has no material yet
    pub incomplete: Vec<PathBuf>,
    pub reloaded: Vec<String>,
    pub failed: Vec<ReloadFailure>,
    pub errors: Vec<String>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.errors.is_empty()
    }
}

/// Everything one tick did.
#[derive(Debug, Default)]
pub struct TickSummary {
    pub tasks: Vec<TaskReport>,
    pub skipped_in_flight: Vec<String>,
    pub overdue: Vec<String>,
    pub reconcile: ReconcileReport,
}

impl TickSummary {
    /// Number of tasks that committed and completed every step.
    pub fn rotated(&self) -> usize {
        self.tasks.iter().filter(|t| t.is_success() && !t.superseded).count()
    }

    pub fn superseded(&self) -> usize {
        self.tasks.iter().filter(|t| t.superseded).count()
    }

    pub fn failed(&self) -> usize {
        self.tasks.iter().filter(|t| !t.is_success()).count()
    }

    pub fn task(&self, descriptor: &str) -> Option<&TaskReport> {
        self.tasks.iter().find(|t| t.descriptor == descriptor)
    }

    pub fn is_clean(&self) -> bool {
        self.failed() == 0 && self.reconcile.is_clean()
    }
}

/// Per-status counts of a [`HealthReport`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub total: usize,
    pub ok: usize,
    pub due: usize,
    pub overdue: usize,
    pub failed: usize,
    pub drifted: usize,
}

/// Document produced by `report`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub generated_at: DateTime<Utc>,
    pub backend: String,
    pub summary: HealthSummary,
    pub descriptors: Vec<HealthRecord>,
}

impl HealthReport {
    pub fn new(generated_at: DateTime<Utc>, backend: StoreBackendType, descriptors: Vec<HealthRecord>) -> Self {
        let count = |status: HealthStatus| descriptors.iter().filter(|r| r.status == status).count();
        let summary = HealthSummary {
            total: descriptors.len(),
            ok: count(HealthStatus::Ok),
            due: count(HealthStatus::Due),
            overdue: count(HealthStatus::Overdue),
            failed: count(HealthStatus::Failed),
            drifted: descriptors.iter().filter(|r| !r.drift.is_empty()).count(),
        };
        Self { generated_at, backend: backend.to_string(), summary, descriptors }
    }

    /// No descriptor is overdue, failed or drifted.
    pub fn is_healthy(&self) -> bool {
        !self.descriptors.iter().any(HealthRecord::is_unhealthy)
    }
}
