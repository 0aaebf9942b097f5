//! HashiCorp Vault secret store.
//!
//! Secrets live in a KV v2 mount under `{path_prefix}/{descriptor}`. Each
//! version holds the material fields plus two reserved JSON fields
//! (`_rotation`, `_lease`) so that value and rotation metadata
//! are always written together in a single check-and-set write.
//!
//! Engine state lives next to the secrets under `{path_prefix}/.state/`,
//! one entry per descriptor (`delivery/`) and per service (`services/`).
//!
//! Certificates come from the PKI engine (`pki_mount`/`pki_role`), dynamic
//! credentials from the database engine (`database_mount`), and the engine's
//! own token is renewed with `renew-self`.
//!
//! # Configuration
//!
//! - `VAULT_ADDR`: Vault server address
//! - `VAULT_TOKEN`: Authentication token
//! - `VAULT_NAMESPACE`: Optional namespace
//! - `VAULT_KV_MOUNT`, `VAULT_PKI_MOUNT`, `VAULT_PKI_ROLE`, `VAULT_DATABASE_MOUNT`

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use validator::Validate;
use vaultrs::api::kv2::requests::SetSecretRequestOptions;
use vaultrs::client::{VaultClient, VaultClientSettingsBuilder};
use vaultrs::error::ClientError;
use vaultrs::kv2;

use super::metadata::RotationMetadata;
use super::state::{DeliveryState, EngineState, ServiceSync};
use super::store::{
    decode_secret, encode_secret, CertificateRequest, DynamicCredential, DynamicCredentialRequest,
    IssuedCertificate, SecretStore, StoreBackendType, StoredSecret,
};
use super::types::{CredentialMaterial, Lease, SecretString};
use crate::errors::{Result, RotationError};
use crate::utils::RetryConfig;

/// Configuration for the Vault store.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct VaultConfig {
    /// Vault server address (e.g., "https://vault.example.com:8200")
    #[validate(length(min = 1, message = "Vault address cannot be empty"))]
    pub address: String,

    /// Vault authentication token
    pub token: Option<SecretString>,

    /// Vault namespace (for Enterprise multi-tenancy)
    pub namespace: Option<String>,

    /// KV v2 mount path
    #[validate(length(min = 1, message = "KV mount cannot be empty"))]
    pub kv_mount: String,

    /// Key prefix under the KV mount
    #[validate(length(min = 1, message = "Path prefix cannot be empty"))]
    pub path_prefix: String,

    /// PKI engine mount; certificate issuance is disabled when unset
    pub pki_mount: Option<String>,

    /// Default PKI role
    pub pki_role: String,

    /// Database secrets engine mount
    pub database_mount: String,

    /// Retry policy for reads and certificate issuance
    pub retry: RetryConfig,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            address: "http://127.0.0.1:8200".to_string(),
            token: None,
            namespace: None,
            kv_mount: "secret".to_string(),
            path_prefix: "rotation".to_string(),
            pki_mount: None,
            pki_role: "rotator".to_string(),
            database_mount: "database".to_string(),
            retry: RetryConfig::default(),
        }
    }
}

impl VaultConfig {
    /// Overlay `VAULT_*` environment variables on top of this configuration.
    pub fn apply_env(&mut self) {
        if let Ok(address) = std::env::var("VAULT_ADDR") {
            self.address = address;
        }
        if let Ok(token) = std::env::var("VAULT_TOKEN") {
            self.token = Some(SecretString::new(token));
        }
        if let Ok(namespace) = std::env::var("VAULT_NAMESPACE") {
            self.namespace = Some(namespace);
        }
        if let Ok(mount) = std::env::var("VAULT_KV_MOUNT") {
            self.kv_mount = mount;
        }
        if let Ok(mount) = std::env::var("VAULT_PKI_MOUNT") {
            self.pki_mount = Some(mount);
        }
        if let Ok(role) = std::env::var("VAULT_PKI_ROLE") {
            self.pki_role = role;
        }
        if let Ok(mount) = std::env::var("VAULT_DATABASE_MOUNT") {
            self.database_mount = mount;
        }
    }
}

const STATE_DIR: &str = ".state";
const DELIVERY_DIR: &str = "delivery";
const SERVICES_DIR: &str = "services";
/// Single field holding the JSON document of a state entry
const STATE_FIELD: &str = "state";

const TOKEN_HEADER: &str = "X-Vault-Token";
const NAMESPACE_HEADER: &str = "X-Vault-Namespace";

/// Response envelope of secrets engines that hand out leases.
#[derive(Debug, Deserialize)]
struct LeasedResponse<T> {
    #[serde(default)]
    lease_id: String,
    #[serde(default)]
    lease_duration: u64,
    #[serde(default)]
    renewable: bool,
    data: T,
}

#[derive(Debug, Deserialize)]
struct DatabaseCredentials {
    username: String,
    password: String,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<String>,
}

/// Vault-backed [`SecretStore`].
pub struct VaultSecretStore {
    client: VaultClient,
    /// Raw HTTP for endpoints whose lease details vaultrs does not return
    http: reqwest::Client,
    config: VaultConfig,
}

impl fmt::Debug for VaultSecretStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultSecretStore")
            .field("address", &self.config.address)
            .field("kv_mount", &self.config.kv_mount)
            .field("path_prefix", &self.config.path_prefix)
            .finish()
    }
}

impl VaultSecretStore {
    /// Connect to Vault and verify it is reachable.
    ///
    /// # Errors
    ///
    /// - [`RotationError::Config`] if the settings are invalid
    /// - [`RotationError::StoreUnavailable`] if Vault cannot be reached
    pub async fn new(config: VaultConfig) -> Result<Self> {
        if config.address.is_empty() {
            return Err(RotationError::config("Vault address cannot be empty"));
        }

        let mut settings_builder = VaultClientSettingsBuilder::default();
        settings_builder.address(&config.address);

        if let Some(ref token) = config.token {
            settings_builder.token(token.expose_secret());
        }

        if let Some(ref namespace) = config.namespace {
            settings_builder.namespace(Some(namespace.clone()));
        }

        let settings = settings_builder
            .build()
            .map_err(|e| RotationError::config(format!("Invalid Vault configuration: {}", e)))?;

        let client = VaultClient::new(settings).map_err(|e| {
            RotationError::store_unavailable(format!("Failed to create Vault client: {}", e))
        })?;
        let http = reqwest::Client::builder().build().map_err(|e| {
            RotationError::store_unavailable(format!("Failed to create HTTP client: {}", e))
        })?;

        match vaultrs::sys::health(&client).await {
            Ok(_) => {
                tracing::info!(address = %config.address, "Successfully connected to Vault");
            }
            Err(e) => {
                tracing::error!(error = %e, address = %config.address, "Failed to connect to Vault");
                return Err(RotationError::store_unavailable(format!("Vault health check failed: {}", e)));
            }
        }

        Ok(Self { client, http, config })
    }

    fn path(&self, name: &str) -> String {
        format!("{}/{}", self.config.path_prefix.trim_end_matches('/'), name)
    }

    fn state_path(&self, dir: &str, name: &str) -> String {
        self.path(&format!("{}/{}/{}", STATE_DIR, dir, name))
    }

    async fn list_keys(&self, path: &str) -> Result<Vec<String>> {
        match kv2::list(&self.client, &self.config.kv_mount, path).await {
            Ok(keys) => Ok(keys.into_iter().filter(|k| !k.ends_with('/')).collect()),
            Err(ClientError::APIError { code: 404, .. }) => Ok(Vec::new()),
            Err(e) => {
                tracing::error!(error = %e, mount = %self.config.kv_mount, path = %path, "Failed to list Vault keys");
                Err(map_client_error("list", e))
            }
        }
    }

    /// Every state document under `dir`, by key.
    async fn read_state_dir<T: serde::de::DeserializeOwned>(&self, dir: &str) -> Result<HashMap<String, T>> {
        let base = self.path(&format!("{}/{}", STATE_DIR, dir));
        let mut entries = HashMap::new();
        for key in self.list_keys(&base).await? {
            let path = self.state_path(dir, &key);
            let mut data = match kv2::read::<HashMap<String, String>>(&self.client, &self.config.kv_mount, &path).await {
                Ok(data) => data,
                Err(ClientError::APIError { code: 404, .. }) => continue,
                Err(e) => return Err(map_client_error("read state", e)),
            };
            let Some(raw) = data.remove(STATE_FIELD) else {
                tracing::warn!(path = %path, "Vault state entry has no state field, ignoring");
                continue;
            };
            match serde_json::from_str(&raw) {
                Ok(value) => {
                    entries.insert(key, value);
                }
                Err(e) => tracing::warn!(path = %path, error = %e, "Malformed engine state in Vault, ignoring"),
            }
        }
        Ok(entries)
    }

    async fn write_state<T: Serialize>(&self, dir: &str, name: &str, value: &T) -> Result<()> {
        let path = self.state_path(dir, name);
        let data = HashMap::from([(STATE_FIELD.to_string(), serde_json::to_string(value)?)]);
        kv2::set(&self.client, &self.config.kv_mount, &path, &data)
            .await
            .map(|_| ())
            .map_err(|e| map_client_error("write state", e))
    }

    /// Explain a lost check-and-set: either our own earlier attempt already
    /// landed, or someone else wrote the secret.
    async fn resolve_cas_mismatch(
        &self,
        name: &str,
        metadata: &RotationMetadata,
        expected: u64,
    ) -> Result<RotationMetadata> {
        let path = self.path(name);
        match self.get(name).await? {
            Some(existing)
                if metadata.last_attempt_id.is_some()
                    && existing.metadata.last_attempt_id == metadata.last_attempt_id =>
            {
                tracing::debug!(secret = %name, "Attempt already committed, skipping write");
                Ok(existing.metadata)
            }
            Some(existing) => {
                tracing::warn!(
                    secret = %name,
                    expected_version = expected,
                    stored_version = existing.metadata.current_version,
                    "Secret was written by another writer"
                );
                Err(RotationError::conflict(
                    format!(
                        "secret '{}' is at version {}, expected {}",
                        name, existing.metadata.current_version, expected
                    ),
                    "secret",
                ))
            }
            None => match self.read_version(&path).await? {
                Some(version) => Err(RotationError::store(format!(
                    "Vault path '{}' holds version {} written without rotation metadata",
                    path, version
                ))),
                None => Err(RotationError::conflict(
                    format!("secret '{}' changed while it was being written", name),
                    "secret",
                )),
            },
        }
    }

    async fn read_version(&self, path: &str) -> Result<Option<u64>> {
        match kv2::read_metadata(&self.client, &self.config.kv_mount, path).await {
            Ok(metadata) => Ok(Some(metadata.current_version)),
            Err(ClientError::APIError { code: 404, .. }) => Ok(None),
            Err(e) => Err(map_client_error("read metadata", e)),
        }
    }

    /// GET `url` with the store's token and namespace and decode the JSON body.
    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str, operation: &str) -> Result<T> {
        let mut request = self.http.get(url);
        if let Some(token) = &self.config.token {
            request = request.header(TOKEN_HEADER, token.expose_secret());
        }
        if let Some(namespace) = &self.config.namespace {
            request = request.header(NAMESPACE_HEADER, namespace);
        }

        let response = request
            .send()
            .await
            .map_err(|e| RotationError::store_unavailable(format!("Vault {} failed: {}", operation, e)))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let errors = serde_json::from_str::<ErrorBody>(&body).unwrap_or_default().errors;
            return Err(map_client_error(operation, ClientError::APIError { code: status.as_u16(), errors }));
        }
        response
            .json()
            .await
            .map_err(|e| RotationError::store(format!("Vault {} returned an unexpected body: {}", operation, e)))
    }
}

#[async_trait]
impl SecretStore for VaultSecretStore {
    async fn get(&self, name: &str) -> Result<Option<StoredSecret>> {
        let path = self.path(name);
        let read = self
            .config
            .retry
            .run(
                |_| kv2::read::<HashMap<String, String>>(&self.client, &self.config.kv_mount, &path),
                |e| is_retryable_vault_error(&e.to_string()),
            )
            .await;

        let data = match read {
            Ok(data) => data,
            Err((ClientError::APIError { code: 404, .. }, _)) => return Ok(None),
            Err((e, attempts)) => {
                tracing::error!(error = %e, secret = %name, attempts, "Failed to read secret from Vault");
                return Err(map_client_error("read", e));
            }
        };

        let Some(mut stored) = decode_secret(name, data)? else {
            tracing::warn!(secret = %name, "Vault entry has no rotation metadata, ignoring");
            return Ok(None);
        };
        if let Some(version) = self.read_version(&path).await? {
            stored.metadata.current_version = version;
        }
        Ok(Some(stored))
    }

    async fn put(
        &self,
        name: &str,
        material: &CredentialMaterial,
        metadata: &RotationMetadata,
    ) -> Result<RotationMetadata> {
        let path = self.path(name);
        let data = encode_secret(material, metadata)?;
        let expected = metadata.current_version.saturating_sub(1);
        let cas = u32::try_from(expected).map_err(|_| {
            RotationError::store(format!("Version {} of '{}' is out of check-and-set range", expected, name))
        })?;

        let written = kv2::set_with_options(
            &self.client,
            &self.config.kv_mount,
            &path,
            &data,
            SetSecretRequestOptions { cas },
        )
        .await;
        let response = match written {
            Ok(response) => response,
            Err(e) if is_cas_mismatch(&e) => return self.resolve_cas_mismatch(name, metadata, expected).await,
            Err(e) => {
                tracing::error!(error = %e, secret = %name, "Failed to write secret to Vault");
                return Err(map_client_error("write", e));
            }
        };

        let mut committed = metadata.clone();
        committed.current_version = response.version;

        tracing::info!(
            secret = %name,
            version = response.version,
            mount = %self.config.kv_mount,
            "Committed secret version to Vault"
        );
        Ok(committed)
    }

    async fn list_metadata(&self) -> Result<Vec<RotationMetadata>> {
        let keys = self.list_keys(&self.config.path_prefix).await?;

        let mut all = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(stored) = self.get(&key).await? {
                all.push(stored.metadata);
            }
        }
        all.sort_by(|a, b| a.descriptor.cmp(&b.descriptor));
        Ok(all)
    }

    async fn issue_certificate(&self, request: &CertificateRequest) -> Result<IssuedCertificate> {
        use vaultrs::pki::cert;

        let mount = self.config.pki_mount.as_deref().ok_or_else(|| {
            RotationError::config("Certificate issuance requires a Vault PKI mount (VAULT_PKI_MOUNT)")
        })?;
        let role = request.role.as_deref().unwrap_or(&self.config.pki_role);
        let ttl = format!("{}s", request.ttl.as_secs());
        let alt_names = request.alt_names.join(",");

        tracing::info!(
            common_name = %request.common_name,
            pki_mount = %mount,
            role = %role,
            ttl = %ttl,
            "Issuing certificate via Vault PKI"
        );

        let response = self
            .config
            .retry
            .run(
                |attempt| {
                    if attempt > 0 {
                        tracing::warn!(attempt = attempt + 1, "Retrying certificate issuance");
                    }
                    let mut opts = vaultrs::api::pki::requests::GenerateCertificateRequestBuilder::default();
                    opts.common_name(request.common_name.clone());
                    if !alt_names.is_empty() {
                        opts.alt_names(alt_names.clone());
                    }
                    opts.ttl(ttl.clone());
                    async move { cert::generate(&self.client, mount, role, Some(&mut opts)).await }
                },
                |e| is_retryable_vault_error(&e.to_string()),
            )
            .await
            .map_err(|(e, attempts)| {
                tracing::error!(error = %e, attempts, "Failed to issue certificate via Vault PKI");
                map_client_error("issue certificate", e)
            })?;

        let expires_at = match response.expiration {
            Some(ts) => DateTime::<Utc>::from_timestamp(ts as i64, 0).ok_or_else(|| {
                RotationError::store(format!("Invalid expiration timestamp from Vault PKI: {}", ts))
            })?,
            None => return Err(RotationError::store("Vault PKI response missing expiration timestamp")),
        };

        let ca_chain = response
            .ca_chain
            .filter(|chain| !chain.is_empty())
            .map(|chain| chain.join("\n"))
            .unwrap_or_else(|| response.issuing_ca.clone());

        tracing::info!(
            common_name = %request.common_name,
            serial_number = %response.serial_number,
            expires_at = %expires_at,
            "Issued certificate via Vault PKI"
        );

        Ok(IssuedCertificate {
            certificate: response.certificate,
            private_key: SecretString::new(response.private_key),
            ca_chain,
            serial_number: response.serial_number,
            expires_at,
        })
    }

    async fn dynamic_credentials(&self, request: &DynamicCredentialRequest) -> Result<DynamicCredential> {
        let mount = request.mount.as_deref().unwrap_or(&self.config.database_mount);
        let url = format!(
            "{}/v1/{}/creds/{}",
            self.config.address.trim_end_matches('/'),
            mount.trim_matches('/'),
            request.role
        );

        let leased: LeasedResponse<DatabaseCredentials> = self
            .config
            .retry
            .run(
                |attempt| {
                    if attempt > 0 {
                        tracing::warn!(attempt = attempt + 1, "Retrying database credential request");
                    }
                    self.get_json(&url, "database credentials")
                },
                RotationError::is_retryable,
            )
            .await
            .map_err(|(e, attempts)| {
                tracing::error!(error = %e, attempts, role = %request.role, mount = %mount, "Failed to obtain database credentials");
                e
            })?;

        let lease = Lease {
            lease_id: Some(leased.lease_id).filter(|id| !id.is_empty()),
            lease_duration: Duration::from_secs(leased.lease_duration),
            renewable: leased.renewable,
        };
        tracing::info!(
            role = %request.role,
            lease_id = lease.lease_id.as_deref().unwrap_or(""),
            lease_secs = leased.lease_duration,
            renewable = lease.renewable,
            "Obtained database credentials"
        );

        Ok(DynamicCredential {
            username: leased.data.username,
            password: SecretString::new(leased.data.password),
            lease,
        })
    }

    async fn renew_token(&self) -> Result<Option<Duration>> {
        if self.config.token.is_none() {
            return Ok(None);
        }
        let auth = vaultrs::token::renew_self(&self.client, None)
            .await
            .map_err(|e| map_client_error("renew token", e))?;
        if !auth.renewable {
            tracing::warn!("Vault token is not renewable");
        }
        Ok(Some(Duration::from_secs(auth.lease_duration)))
    }

    async fn load_state(&self) -> Result<EngineState> {
        Ok(EngineState {
            delivery: self.read_state_dir(DELIVERY_DIR).await?,
            services: self.read_state_dir(SERVICES_DIR).await?,
        })
    }

    async fn save_delivery_state(&self, descriptor: &str, state: &DeliveryState) -> Result<()> {
        if !state.is_clear() {
            return self.write_state(DELIVERY_DIR, descriptor, state).await;
        }
        let path = self.state_path(DELIVERY_DIR, descriptor);
        match kv2::delete_metadata(&self.client, &self.config.kv_mount, &path).await {
            Ok(()) | Err(ClientError::APIError { code: 404, .. }) => Ok(()),
            Err(e) => Err(map_client_error("delete state", e)),
        }
    }

    async fn save_service_sync(&self, service: &str, sync: &ServiceSync) -> Result<()> {
        self.write_state(SERVICES_DIR, service, sync).await
    }

    async fn health_check(&self) -> Result<()> {
        vaultrs::sys::health(&self.client)
            .await
            .map(|_| ())
            .map_err(|e| RotationError::store_unavailable(format!("Vault health check failed: {}", e)))
    }

    fn backend_type(&self) -> StoreBackendType {
        StoreBackendType::Vault
    }
}

/// Classify a vaultrs error: connectivity, auth, throttling and server
/// failures are `StoreUnavailable`; everything else is a store error.
fn map_client_error(operation: &str, error: ClientError) -> RotationError {
    let message = format!("Vault {} failed: {}", operation, error);
    let unavailable = match &error {
        ClientError::APIError { code, .. } => matches!(code, 401 | 403 | 429) || *code >= 500,
        other => is_retryable_vault_error(&other.to_string()),
    };
    if unavailable {
        RotationError::store_unavailable(message)
    } else {
        RotationError::store(message)
    }
}

/// KV v2 answers a failed check-and-set with 400 and a "check-and-set" error.
fn is_cas_mismatch(error: &ClientError) -> bool {
    matches!(error, ClientError::APIError { code: 400, errors }
        if errors.iter().any(|e| e.contains("check-and-set")))
}

/// Check if a Vault error is transient.
fn is_retryable_vault_error(error: &str) -> bool {
    let error_lower = error.to_lowercase();

    if error_lower.contains("connection refused")
        || error_lower.contains("connection reset")
        || error_lower.contains("connection closed")
        || error_lower.contains("error sending request")
        || error_lower.contains("timed out")
        || error_lower.contains("timeout")
    {
        return true;
    }

    if error_lower.contains("429") || error_lower.contains("too many requests") {
        return true;
    }

    ["500", "502", "503", "504"].iter().any(|code| error_lower.contains(code))
}
