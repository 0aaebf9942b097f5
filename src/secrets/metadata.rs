//! Rotation metadata persisted next to each secret in the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Rotation bookkeeping for one descriptor.
///
/// `next_rotation_at` is `last_rotated_at + default_ttl`, recomputed on every
/// successful rotation, and never moves backwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationMetadata {
    pub descriptor: String,
    pub last_rotated_at: DateTime<Utc>,
    pub next_rotation_at: DateTime<Utc>,
    pub rotation_count: u64,
    pub current_version: u64,
    /// Attempt id of the rotation that produced this version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_id: Option<Uuid>,
}

impl RotationMetadata {
    /// Metadata for the first rotation of a descriptor.
    pub fn bootstrap(
        descriptor: impl Into<String>,
        rotated_at: DateTime<Utc>,
        default_ttl: Duration,
        attempt_id: Uuid,
    ) -> Self {
        Self {
            descriptor: descriptor.into(),
            last_rotated_at: rotated_at,
            next_rotation_at: add_ttl(rotated_at, default_ttl),
            rotation_count: 1,
            current_version: 1,
            last_attempt_id: Some(attempt_id),
        }
    }

    /// Metadata after a successful rotation at `rotated_at`.
    ///
    /// `current_version` here is the version the commit creates; the store
    /// rejects the commit if the version before it is no longer current.
    pub fn advance(&self, rotated_at: DateTime<Utc>, default_ttl: Duration, attempt_id: Uuid) -> Self {
        let computed = add_ttl(rotated_at, default_ttl);
        Self {
            descriptor: self.descriptor.clone(),
            last_rotated_at: rotated_at,
            next_rotation_at: computed.max(self.next_rotation_at),
            rotation_count: self.rotation_count.saturating_add(1),
            current_version: self.current_version.saturating_add(1),
            last_attempt_id: Some(attempt_id),
        }
    }

    /// `advance` from `previous`, or `bootstrap` when there is no history.
    pub fn next(
        previous: Option<&RotationMetadata>,
        descriptor: &str,
        rotated_at: DateTime<Utc>,
        default_ttl: Duration,
        attempt_id: Uuid,
    ) -> Self {
        match previous {
            Some(prev) => prev.advance(rotated_at, default_ttl, attempt_id),
            None => Self::bootstrap(descriptor, rotated_at, default_ttl, attempt_id),
        }
    }
}

/// `at + ttl`, saturating at the maximum representable instant.
pub fn add_ttl(at: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
