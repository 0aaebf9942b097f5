//! Secret store client.
//!
//! The [`SecretStore`] trait is the only way the engine reaches its backing
//! store. Two implementations ship with the crate:
//!
//! - [`VaultSecretStore`]: HashiCorp Vault (KV v2, PKI, database engine)
//! - [`InMemorySecretStore`]: process-local store for development and tests
//!
//! Credential values travel as [`SecretString`] and are never logged.

pub mod memory;
pub mod metadata;
pub mod state;
pub mod store;
pub mod types;
pub mod vault;

pub use memory::InMemorySecretStore;
pub use metadata::RotationMetadata;
pub use state::{DeliveryState, EngineState, PendingStage, ServiceSync};
pub use store::{
    CertificateRequest, DynamicCredential, DynamicCredentialRequest, IssuedCertificate, SecretStore,
    StoreBackendType, StoredSecret,
};
pub use types::{fields, CredentialMaterial, Lease, SecretString};
pub use vault::{VaultConfig, VaultSecretStore};
