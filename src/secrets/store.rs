//! Secret store abstraction.
//!
//! The engine talks to its backing store only through [`SecretStore`]:
//! versioned reads and writes of credential material plus rotation metadata,
//! PKI issuance, dynamic database credentials, token self-renewal and the
//! engine's own delivery state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use super::metadata::RotationMetadata;
use super::state::{DeliveryState, EngineState, ServiceSync};
use super::types::{CredentialMaterial, Lease, SecretString};
use crate::errors::{Result, RotationError};

/// Reserved field holding the JSON-encoded [`RotationMetadata`] in a stored secret.
pub const METADATA_FIELD: &str = "_rotation";

/// Reserved field holding the JSON-encoded [`Lease`] of dynamic credentials.
pub const LEASE_FIELD: &str = "_lease";

/// Backend identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackendType {
    Vault,
    Memory,
}

impl StoreBackendType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vault => "vault",
            Self::Memory => "memory",
        }
    }
}

impl fmt::Display for StoreBackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Current material and metadata of one secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSecret {
    pub material: CredentialMaterial,
    pub metadata: RotationMetadata,
}

/// Certificate issuance parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRequest {
    pub common_name: String,
    pub alt_names: Vec<String>,
    pub ttl: Duration,
    /// PKI role override; the store's configured role is used when `None`
    pub role: Option<String>,
}

/// Certificate, key and chain issued as one unit.
#[derive(Clone)]
pub struct IssuedCertificate {
    pub certificate: String,
    pub private_key: SecretString,
    pub ca_chain: String,
    pub serial_number: String,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("certificate", &format!("[{} bytes PEM]", self.certificate.len()))
            .field("private_key", &self.private_key)
            .field("ca_chain", &format!("[{} bytes PEM]", self.ca_chain.len()))
            .field("serial_number", &self.serial_number)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Dynamic credential request against a database secrets engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicCredentialRequest {
    pub role: String,
    /// Mount override; the store's configured database mount is used when `None`
    pub mount: Option<String>,
}

/// Username/password pair with its lease.
#[derive(Debug, Clone)]
pub struct DynamicCredential {
    pub username: String,
    pub password: SecretString,
    pub lease: Lease,
}

/// Secret store operations used by the rotation engine.
///
/// Implementations must be `Send + Sync` so they can be shared across rotation
/// tasks. Connectivity and authentication failures are reported as
/// [`RotationError::StoreUnavailable`].
#[async_trait]
pub trait SecretStore: Send + Sync + fmt::Debug {
    /// Current material and metadata for `name`, `None` if never written.
    async fn get(&self, name: &str) -> Result<Option<StoredSecret>>;

    /// Commit new material and metadata in one write and return the committed
    /// metadata (with the version assigned by the store).
    ///
    /// `metadata.current_version` is the version this write creates: the
    /// write is a check-and-set against version `current_version - 1` (0 for
    /// a secret that does not exist yet) and fails with
    /// [`RotationError::Conflict`] when another writer got there first.
    ///
    /// Idempotent: when the stored `last_attempt_id` equals the one in
    /// `metadata`, nothing is written and the stored metadata is returned.
    async fn put(
        &self,
        name: &str,
        material: &CredentialMaterial,
        metadata: &RotationMetadata,
    ) -> Result<RotationMetadata>;

    /// Metadata of every secret managed by the engine.
    async fn list_metadata(&self) -> Result<Vec<RotationMetadata>>;

    /// Issue a certificate through the store's PKI capability.
    async fn issue_certificate(&self, request: &CertificateRequest) -> Result<IssuedCertificate>;

    /// Request dynamic credentials from the store's database capability.
    async fn dynamic_credentials(&self, request: &DynamicCredentialRequest) -> Result<DynamicCredential>;

    /// Renew the store's own access token. Returns the new token TTL, or
    /// `None` when the backend has nothing to renew.
    async fn renew_token(&self) -> Result<Option<Duration>> {
        Ok(None)
    }

    /// Delivery state of every descriptor and sync state of every service
    /// saved by earlier runs.
    async fn load_state(&self) -> Result<EngineState>;

    async fn save_delivery_state(&self, descriptor: &str, state: &DeliveryState) -> Result<()>;

    async fn save_service_sync(&self, service: &str, sync: &ServiceSync) -> Result<()>;

    /// Check the store is reachable and usable.
    async fn health_check(&self) -> Result<()>;

    fn backend_type(&self) -> StoreBackendType;
}

/// Flatten material plus metadata into the single string map written to the store.
pub fn encode_secret(material: &CredentialMaterial, metadata: &RotationMetadata) -> Result<HashMap<String, String>> {
    let mut data: HashMap<String, String> = material
        .fields()
        .map(|(name, value)| (name.to_string(), value.expose_secret().to_string()))
        .collect();
    data.insert(METADATA_FIELD.to_string(), serde_json::to_string(metadata)?);
    if let Some(lease) = material.lease() {
        data.insert(LEASE_FIELD.to_string(), serde_json::to_string(lease)?);
    }
    Ok(data)
}

/// Inverse of [`encode_secret`]. Returns `None` for entries written by
/// something other than the engine (no metadata field).
pub fn decode_secret(name: &str, mut data: HashMap<String, String>) -> Result<Option<StoredSecret>> {
    let Some(raw_metadata) = data.remove(METADATA_FIELD) else {
        return Ok(None);
    };
    let metadata: RotationMetadata = serde_json::from_str(&raw_metadata).map_err(|e| {
        RotationError::store(format!("Secret '{}' has malformed rotation metadata: {}", name, e))
    })?;

    let lease = match data.remove(LEASE_FIELD) {
        Some(raw) => Some(serde_json::from_str::<Lease>(&raw).map_err(|e| {
            RotationError::store(format!("Secret '{}' has malformed lease: {}", name, e))
        })?),
        None => None,
    };

    let mut material = CredentialMaterial::new();
    for (field, value) in data {
        material.insert(field, value);
    }
    if let Some(lease) = lease {
        material = material.with_lease(lease);
    }

    Ok(Some(StoredSecret { material, metadata }))
}
