//! # Rotation Scheduler
//!
//! Classifies every descriptor on each tick and turns the ones that need
//! work into [`RotationTask`]s. Per-descriptor mutual exclusion is provided by
//! [`InFlightRegistry`]: a task only runs while it holds the descriptor's
//! [`InFlightGuard`], and the guard is released on drop however the task ends.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::registry::{DescriptorRegistry, SecretDescriptor};
use crate::secrets::metadata::add_ttl;
use crate::secrets::RotationMetadata;

/// Where a descriptor stands relative to its rotation window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScheduleState {
    /// `now < next_rotation_at`
    Healthy,
    /// `next_rotation_at <= now < next_rotation_at + max_ttl`, or never rotated
    Due,
    /// `now >= next_rotation_at + max_ttl`
    OverdueCritical,
}

impl fmt::Display for ScheduleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Healthy => "healthy",
            Self::Due => "due",
            Self::OverdueCritical => "overdue-critical",
        })
    }
}

/// Dispatch priority. `Critical` sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    Normal,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Normal => "normal",
        }
    }
}

/// Classify `descriptor` at `now` given its stored metadata.
pub fn classify(metadata: Option<&RotationMetadata>, descriptor: &SecretDescriptor, now: DateTime<Utc>) -> ScheduleState {
    let Some(metadata) = metadata else {
        return ScheduleState::Due;
    };
    if now < metadata.next_rotation_at {
        ScheduleState::Healthy
    } else if now < add_ttl(metadata.next_rotation_at, descriptor.max_ttl) {
        ScheduleState::Due
    } else {
        ScheduleState::OverdueCritical
    }
}

/// One descriptor to rotate during this tick.
#[derive(Debug, Clone)]
pub struct RotationTask {
    pub descriptor: SecretDescriptor,
    pub priority: Priority,
    pub state: ScheduleState,
    /// Metadata read at planning time; `None` means bootstrap
    pub previous: Option<RotationMetadata>,
    /// Identifies this attempt; reused for every retry of its store write
    pub attempt_id: Uuid,
}

/// Which descriptors a tick considers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickOptions {
    /// Rotate every selected descriptor, even healthy ones
    pub force: bool,
    /// Restrict the tick to these descriptor names
    pub only: Option<Vec<String>>,
}

impl TickOptions {
    pub fn forced() -> Self {
        Self { force: true, only: None }
    }

    pub fn only(names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self { force: false, only: Some(names.into_iter().map(Into::into).collect()) }
    }

    pub fn selects(&self, name: &str) -> bool {
        self.only.as_ref().map_or(true, |names| names.iter().any(|n| n == name))
    }
}

/// Result of planning one tick.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    /// Tasks in dispatch order: critical first, then declaration order
    pub tasks: Vec<RotationTask>,
    /// Descriptors that needed work but already had a task in flight
    pub skipped_in_flight: Vec<String>,
    /// Descriptors found overdue-critical
    pub overdue: Vec<String>,
}

/// Plan the tasks for one tick.
pub fn plan(
    registry: &DescriptorRegistry,
    metadata: &HashMap<String, RotationMetadata>,
    in_flight: &InFlightRegistry,
    options: &TickOptions,
    now: DateTime<Utc>,
) -> Plan {
    let mut plan = Plan::default();

    for descriptor in registry.list().iter().filter(|d| options.selects(&d.name)) {
        let previous = metadata.get(&descriptor.name);
        let state = classify(previous, descriptor, now);
        if state == ScheduleState::OverdueCritical {
            plan.overdue.push(descriptor.name.clone());
        }
        if state == ScheduleState::Healthy && !options.force {
            continue;
        }
        if in_flight.is_in_flight(&descriptor.name) {
            plan.skipped_in_flight.push(descriptor.name.clone());
            continue;
        }

        plan.tasks.push(RotationTask {
            descriptor: descriptor.clone(),
            priority: if state == ScheduleState::OverdueCritical { Priority::Critical } else { Priority::Normal },
            state,
            previous: previous.cloned(),
            attempt_id: Uuid::new_v4(),
        });
    }

    // stable: declaration order is kept within a priority
    plan.tasks.sort_by_key(|task| task.priority);
    plan
}

/// Set of descriptor names with a rotation in progress.
#[derive(Debug, Clone, Default)]
pub struct InFlightRegistry {
    inner: Arc<DashMap<String, Uuid>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `name` for `attempt_id`; `None` if another attempt holds it.
    pub fn try_acquire(&self, name: &str, attempt_id: Uuid) -> Option<InFlightGuard> {
        match self.inner.entry(name.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(vacant) => {
                vacant.insert(attempt_id);
                Some(InFlightGuard { inner: self.inner.clone(), name: name.to_string(), attempt_id })
            }
        }
    }

    pub fn is_in_flight(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Releases the descriptor when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    inner: Arc<DashMap<String, Uuid>>,
    name: String,
    attempt_id: Uuid,
}

impl InFlightGuard {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attempt_id(&self) -> Uuid {
        self.attempt_id
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.remove_if(&self.name, |_, holder| *holder == self.attempt_id);
    }
}
