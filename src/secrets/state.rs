//! Engine state kept next to the secrets.
//!
//! What the engine knows beyond the secrets themselves (pending post-commit
//! work, failure counts, alert rate limits and the artifact digests each
//! service last reloaded) is written back to the store so that a restarted
//! engine, or a one-shot CLI run against the same store, sees it.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::health::Severity;

/// Post-commit step still outstanding for a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingStage {
    Render,
    Reload,
}

/// Delivery state of one descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingStage>,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Last rotation cycle alerted per severity
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub alerted: BTreeMap<Severity, u64>,
}

impl DeliveryState {
    pub fn is_clear(&self) -> bool {
        self == &Self::default()
    }
}

/// Digest of every artifact a service last reloaded successfully.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSync {
    #[serde(default)]
    pub artifacts: BTreeMap<PathBuf, String>,
}

impl ServiceSync {
    pub fn digest(&self, destination: &Path) -> Option<&str> {
        self.artifacts.get(destination).map(String::as_str)
    }
}

/// Everything [`SecretStore::load_state`](super::SecretStore::load_state) returns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineState {
    pub delivery: HashMap<String, DeliveryState>,
    pub services: HashMap<String, ServiceSync>,
}
