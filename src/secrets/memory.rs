//! In-process secret store for development and tests.
//!
//! Keeps every secret in a `DashMap`, issues certificates from a throwaway
//! ECDSA P-256 CA generated on first use, and fabricates dynamic database
//! credentials. Faults can be injected to exercise the engine's failure paths.
//! Nothing survives the process, but every engine built over the same
//! instance shares its secrets and saved state.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use rcgen::{
    BasicConstraints, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose, SerialNumber,
};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::OnceCell;

use super::metadata::RotationMetadata;
use super::state::{DeliveryState, EngineState, ServiceSync};
use super::store::{
    CertificateRequest, DynamicCredential, DynamicCredentialRequest, IssuedCertificate, SecretStore,
    StoreBackendType, StoredSecret,
};
use super::types::{CredentialMaterial, Lease, SecretString};
use crate::errors::{Result, RotationError};

struct DevCa {
    cert: rcgen::Certificate,
    key: KeyPair,
}

impl DevCa {
    fn generate() -> Result<Self> {
        let key = KeyPair::generate().map_err(pki_error)?;
        let mut params = CertificateParams::new(Vec::<String>::new()).map_err(pki_error)?;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.distinguished_name.push(DnType::CommonName, "secret-rotator development CA");
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        let cert = params.self_signed(&key).map_err(pki_error)?;
        Ok(Self { cert, key })
    }
}

fn pki_error(e: rcgen::Error) -> RotationError {
    RotationError::store(format!("Development CA failed: {}", e))
}

#[derive(Default)]
struct Faults {
    offline: AtomicBool,
    failing_puts: AtomicU32,
    lost_put_responses: AtomicU32,
    fail_issuance: AtomicBool,
    fail_dynamic: AtomicBool,
}

/// In-memory [`SecretStore`].
#[derive(Default)]
pub struct InMemorySecretStore {
    secrets: DashMap<String, StoredSecret>,
    delivery: DashMap<String, DeliveryState>,
    services: DashMap<String, ServiceSync>,
    ca: OnceCell<DevCa>,
    faults: Faults,
    writes: AtomicU64,
    issued: AtomicU64,
}

impl fmt::Debug for InMemorySecretStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemorySecretStore")
            .field("secrets", &self.secrets.len())
            .field("writes", &self.writes.load(Ordering::Relaxed))
            .finish()
    }
}

impl InMemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place a secret directly, bypassing idempotency and fault injection.
    pub fn seed(&self, name: &str, material: CredentialMaterial, metadata: RotationMetadata) {
        self.secrets.insert(name.to_string(), StoredSecret { material, metadata });
    }

    /// Make every call fail with `StoreUnavailable` until cleared.
    pub fn set_offline(&self, offline: bool) {
        self.faults.offline.store(offline, Ordering::SeqCst);
    }

    /// Reject the next `count` puts with `StoreUnavailable` without writing.
    pub fn fail_next_puts(&self, count: u32) {
        self.faults.failing_puts.store(count, Ordering::SeqCst);
    }

    /// Commit the next `count` puts but report `StoreUnavailable` to the caller.
    pub fn lose_next_put_responses(&self, count: u32) {
        self.faults.lost_put_responses.store(count, Ordering::SeqCst);
    }

    pub fn fail_certificate_issuance(&self, fail: bool) {
        self.faults.fail_issuance.store(fail, Ordering::SeqCst);
    }

    pub fn fail_dynamic_credentials(&self, fail: bool) {
        self.faults.fail_dynamic.store(fail, Ordering::SeqCst);
    }

    /// Number of puts that actually wrote a new version.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of certificates issued by the development CA.
    pub fn issued_count(&self) -> u64 {
        self.issued.load(Ordering::SeqCst)
    }

    fn ensure_online(&self) -> Result<()> {
        if self.faults.offline.load(Ordering::SeqCst) {
            return Err(RotationError::store_unavailable("in-memory store is offline"));
        }
        Ok(())
    }

    fn take_fault(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn issue_leaf(&self, ca: &DevCa, request: &CertificateRequest) -> Result<IssuedCertificate> {
        let mut sans = vec![request.common_name.clone()];
        for name in &request.alt_names {
            if !sans.contains(name) {
                sans.push(name.clone());
            }
        }

        let mut params = CertificateParams::new(sans).map_err(pki_error)?;
        params.distinguished_name.push(DnType::CommonName, request.common_name.clone());

        let ttl = time::Duration::try_from(request.ttl)
            .map_err(|e| RotationError::store(format!("Certificate TTL out of range: {}", e)))?;
        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::minutes(1);
        params.not_after = now + ttl;

        let mut serial = [0u8; 16];
        OsRng.fill_bytes(&mut serial);
        serial[0] &= 0x7f;
        params.serial_number = Some(SerialNumber::from_slice(&serial));

        let key = KeyPair::generate().map_err(pki_error)?;
        let cert = params.signed_by(&key, &ca.cert, &ca.key).map_err(pki_error)?;

        let serial_number = serial.iter().map(|b| format!("{:02x}", b)).collect::<Vec<_>>().join(":");

        Ok(IssuedCertificate {
            certificate: cert.pem(),
            private_key: SecretString::new(key.serialize_pem()),
            ca_chain: ca.cert.pem(),
            serial_number,
            expires_at: crate::secrets::metadata::add_ttl(Utc::now(), request.ttl),
        })
    }
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    async fn get(&self, name: &str) -> Result<Option<StoredSecret>> {
        self.ensure_online()?;
        Ok(self.secrets.get(name).map(|entry| entry.value().clone()))
    }

    async fn put(
        &self,
        name: &str,
        material: &CredentialMaterial,
        metadata: &RotationMetadata,
    ) -> Result<RotationMetadata> {
        self.ensure_online()?;
        if Self::take_fault(&self.faults.failing_puts) {
            return Err(RotationError::store_unavailable("injected put failure"));
        }

        let committed = {
            let entry = self.secrets.entry(name.to_string());
            let stored_version = match &entry {
                dashmap::mapref::entry::Entry::Occupied(existing) => {
                    let stored = existing.get();
                    if metadata.last_attempt_id.is_some()
                        && stored.metadata.last_attempt_id == metadata.last_attempt_id
                    {
                        tracing::debug!(secret = %name, "Duplicate put for attempt, returning stored metadata");
                        return Ok(stored.metadata.clone());
                    }
                    stored.metadata.current_version
                }
                dashmap::mapref::entry::Entry::Vacant(_) => 0,
            };

            let expected = metadata.current_version.saturating_sub(1);
            if stored_version != expected {
                return Err(RotationError::conflict(
                    format!(
                        "secret '{}' is at version {}, expected {}",
                        name, stored_version, expected
                    ),
                    "secret",
                ));
            }

            let mut committed = metadata.clone();
            committed.current_version = stored_version + 1;
            entry.insert(StoredSecret { material: material.clone(), metadata: committed.clone() });
            committed
        };
        self.writes.fetch_add(1, Ordering::SeqCst);

        if Self::take_fault(&self.faults.lost_put_responses) {
            return Err(RotationError::store_unavailable("injected lost put response"));
        }
        Ok(committed)
    }

    async fn list_metadata(&self) -> Result<Vec<RotationMetadata>> {
        self.ensure_online()?;
        let mut all: Vec<RotationMetadata> =
            self.secrets.iter().map(|entry| entry.value().metadata.clone()).collect();
        all.sort_by(|a, b| a.descriptor.cmp(&b.descriptor));
        Ok(all)
    }

    async fn issue_certificate(&self, request: &CertificateRequest) -> Result<IssuedCertificate> {
        self.ensure_online()?;
        if self.faults.fail_issuance.load(Ordering::SeqCst) {
            return Err(RotationError::store("injected certificate issuance failure"));
        }

        let ca = self.ca.get_or_try_init(|| async { DevCa::generate() }).await?;
        let issued = self.issue_leaf(ca, request)?;
        self.issued.fetch_add(1, Ordering::SeqCst);
        Ok(issued)
    }

    async fn dynamic_credentials(&self, request: &DynamicCredentialRequest) -> Result<DynamicCredential> {
        self.ensure_online()?;
        if self.faults.fail_dynamic.load(Ordering::SeqCst) {
            return Err(RotationError::store("injected dynamic credential failure"));
        }

        let mount = request.mount.as_deref().unwrap_or("database");
        let suffix: String = OsRng.sample_iter(&Alphanumeric).take(8).map(char::from).collect();
        let password: String = OsRng.sample_iter(&Alphanumeric).take(32).map(char::from).collect();

        Ok(DynamicCredential {
            username: format!("v-{}-{}", request.role, suffix.to_lowercase()),
            password: SecretString::new(password),
            lease: Lease {
                lease_id: Some(format!("{}/creds/{}/{}", mount, request.role, uuid::Uuid::new_v4())),
                lease_duration: Duration::from_secs(3600),
                renewable: true,
            },
        })
    }

    async fn load_state(&self) -> Result<EngineState> {
        self.ensure_online()?;
        Ok(EngineState {
            delivery: self.delivery.iter().map(|e| (e.key().clone(), e.value().clone())).collect(),
            services: self.services.iter().map(|e| (e.key().clone(), e.value().clone())).collect(),
        })
    }

    async fn save_delivery_state(&self, descriptor: &str, state: &DeliveryState) -> Result<()> {
        self.ensure_online()?;
        if state.is_clear() {
            self.delivery.remove(descriptor);
        } else {
            self.delivery.insert(descriptor.to_string(), state.clone());
        }
        Ok(())
    }

    async fn save_service_sync(&self, service: &str, sync: &ServiceSync) -> Result<()> {
        self.ensure_online()?;
        self.services.insert(service.to_string(), sync.clone());
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        self.ensure_online()
    }

    fn backend_type(&self) -> StoreBackendType {
        StoreBackendType::Memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::types::fields;
    use uuid::Uuid;

    fn material(value: &str) -> CredentialMaterial {
        CredentialMaterial::new().with_field(fields::PASSWORD, value)
    }

    fn meta(name: &str) -> RotationMetadata {
        RotationMetadata::bootstrap(name, Utc::now(), Duration::from_secs(3600), Uuid::new_v4())
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let store = InMemorySecretStore::new();
        let committed = store.put("db", &material("one"), &meta("db")).await.unwrap();
        assert_eq!(committed.current_version, 1);

        let stored = store.get("db").await.unwrap().unwrap();
        assert_eq!(stored.material.get(fields::PASSWORD).unwrap().expose_secret(), "one");
        assert_eq!(stored.metadata, committed);
    }

    #[tokio::test]
    async fn test_versions_increase() {
        let store = InMemorySecretStore::new();
        let first = store.put("db", &material("one"), &meta("db")).await.unwrap();
        let second = first.advance(Utc::now(), Duration::from_secs(3600), Uuid::new_v4());
        let committed = store.put("db", &material("two"), &second).await.unwrap();
        assert_eq!(committed.current_version, 2);
        assert_eq!(store.write_count(), 2);
    }

    #[tokio::test]
    async fn test_put_is_idempotent_per_attempt() {
        let store = InMemorySecretStore::new();
        let metadata = meta("db");
        let first = store.put("db", &material("one"), &metadata).await.unwrap();
        let again = store.put("db", &material("other"), &metadata).await.unwrap();

        assert_eq!(first, again);
        assert_eq!(store.write_count(), 1);
        let stored = store.get("db").await.unwrap().unwrap();
        assert_eq!(stored.material.get(fields::PASSWORD).unwrap().expose_secret(), "one");
    }

    #[tokio::test]
    async fn test_lost_response_then_retry_writes_once() {
        let store = InMemorySecretStore::new();
        store.lose_next_put_responses(1);
        let metadata = meta("db");

        let err = store.put("db", &material("one"), &metadata).await.unwrap_err();
        assert!(err.is_retryable());
        let committed = store.put("db", &material("one"), &metadata).await.unwrap();

        assert_eq!(committed.current_version, 1);
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_stale_version_is_a_conflict() {
        let store = InMemorySecretStore::new();
        let first = store.put("db", &material("one"), &meta("db")).await.unwrap();

        // two writers both planned from version 1
        let ours = first.advance(Utc::now(), Duration::from_secs(3600), Uuid::new_v4());
        let theirs = first.advance(Utc::now(), Duration::from_secs(3600), Uuid::new_v4());
        store.put("db", &material("theirs"), &theirs).await.unwrap();

        let err = store.put("db", &material("ours"), &ours).await.unwrap_err();
        assert!(matches!(err, RotationError::Conflict { .. }));
        assert!(!err.is_retryable());
        let stored = store.get("db").await.unwrap().unwrap();
        assert_eq!(stored.material.get(fields::PASSWORD).unwrap().expose_secret(), "theirs");
        assert_eq!(stored.metadata.current_version, 2);
        assert_eq!(store.write_count(), 2);

        // a second bootstrap of an existing secret loses too
        let err = store.put("db", &material("fresh"), &meta("db")).await.unwrap_err();
        assert!(matches!(err, RotationError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_state_is_shared_and_not_counted_as_writes() {
        let store = InMemorySecretStore::new();
        let failing = DeliveryState {
            pending: Some(crate::secrets::PendingStage::Reload),
            consecutive_failures: 1,
            last_error: Some("refused".to_string()),
            ..Default::default()
        };
        store.save_delivery_state("db", &failing).await.unwrap();
        let mut sync = ServiceSync::default();
        sync.artifacts.insert("/srv/db.env".into(), "d1".to_string());
        store.save_service_sync("app", &sync).await.unwrap();

        let state = store.load_state().await.unwrap();
        assert_eq!(state.delivery.get("db"), Some(&failing));
        assert_eq!(state.services.get("app"), Some(&sync));
        assert_eq!(store.write_count(), 0);

        store.save_delivery_state("db", &DeliveryState::default()).await.unwrap();
        assert!(store.load_state().await.unwrap().delivery.is_empty());

        store.set_offline(true);
        assert!(matches!(store.load_state().await, Err(RotationError::StoreUnavailable { .. })));
    }

    #[tokio::test]
    async fn test_offline_store_is_unavailable() {
        let store = InMemorySecretStore::new();
        store.set_offline(true);
        assert!(matches!(store.get("x").await, Err(RotationError::StoreUnavailable { .. })));
        assert!(matches!(store.health_check().await, Err(RotationError::StoreUnavailable { .. })));
    }

    #[tokio::test]
    async fn test_issue_certificate_returns_full_triple() {
        let store = InMemorySecretStore::new();
        let request = CertificateRequest {
            common_name: "consul.service.local".to_string(),
            alt_names: vec!["localhost".to_string(), "127.0.0.1".to_string()],
            ttl: Duration::from_secs(720 * 3600),
            role: None,
        };

        let cert = store.issue_certificate(&request).await.unwrap();
        assert!(cert.certificate.starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(cert.private_key.expose_secret().contains("PRIVATE KEY"));
        assert!(cert.ca_chain.starts_with("-----BEGIN CERTIFICATE-----"));
        assert_ne!(cert.certificate, cert.ca_chain);
        assert_eq!(cert.serial_number.split(':').count(), 16);
        assert!(cert.expires_at > Utc::now() + chrono::Duration::days(29));
        assert_eq!(store.issued_count(), 1);
    }

    #[tokio::test]
    async fn test_dynamic_credentials_carry_lease() {
        let store = InMemorySecretStore::new();
        let creds = store
            .dynamic_credentials(&DynamicCredentialRequest { role: "app".to_string(), mount: None })
            .await
            .unwrap();

        assert!(creds.username.starts_with("v-app-"));
        assert_eq!(creds.password.len(), 32);
        assert!(creds.lease.lease_id.unwrap().starts_with("database/creds/app/"));
    }
}
