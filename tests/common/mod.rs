//! Shared fixtures for engine integration tests.
//!
//! A [`Fixture`] writes a catalog and its templates into a temporary
//! directory and builds an engine over an [`InMemorySecretStore`], a
//! [`ManualClock`] and recording reload actions, so tests can drive ticks
//! through time and inspect artifacts, reloads and alerts.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use secret_rotator::config::ReloadConfig;
use secret_rotator::engine::{ManualClock, RotationEngine, TickSummary};
use secret_rotator::errors::{Result, RotationError};
use secret_rotator::health::{Alert, AlertSink, Severity};
use secret_rotator::registry::DescriptorRegistry;
use secret_rotator::reload::ReloadAction;
use secret_rotator::scheduler::TickOptions;
use secret_rotator::secrets::{
    CertificateRequest, CredentialMaterial, DeliveryState, DynamicCredential, DynamicCredentialRequest, EngineState,
    InMemorySecretStore, IssuedCertificate, RotationMetadata, SecretStore, ServiceSync, StoreBackendType,
    StoredSecret,
};
use secret_rotator::utils::RetryConfig;

pub const HOUR: Duration = Duration::from_secs(3600);

/// Fixed starting instant for the manual clock.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap()
}

pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        backoff_multiplier: 2.0,
    }
}

pub fn fast_reload() -> ReloadConfig {
    ReloadConfig {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        attempt_timeout: Duration::from_secs(5),
    }
}

/// One default tick of `engine`.
pub async fn tick(engine: &RotationEngine) -> TickSummary {
    engine.tick(&TickOptions::default(), &CancellationToken::new()).await.unwrap()
}

/// Reload action that counts calls and fails on demand.
#[derive(Debug, Default)]
pub struct RecordingAction {
    calls: AtomicU32,
    failing: AtomicBool,
}

impl RecordingAction {
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl ReloadAction for RecordingAction {
    async fn invoke(&self) -> Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.failing.load(Ordering::SeqCst) {
            return Err(RotationError::reload_failed("recorded", call, "service refused to reload"));
        }
        Ok(())
    }

    fn describe(&self) -> String {
        "recording".to_string()
    }
}

/// Reload action that blocks until released, to hold a rotation in flight.
#[derive(Debug)]
pub struct GatedAction {
    pub entered: Notify,
    release: Semaphore,
    calls: AtomicU32,
}

impl GatedAction {
    pub fn new() -> Self {
        Self { entered: Notify::new(), release: Semaphore::new(0), calls: AtomicU32::new(0) }
    }

    pub fn release(&self) {
        self.release.add_permits(1);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReloadAction for GatedAction {
    async fn invoke(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        let permit = self.release.acquire().await.map_err(|e| RotationError::internal(e.to_string()))?;
        permit.forget();
        Ok(())
    }

    fn describe(&self) -> String {
        "gated".to_string()
    }
}

/// Alert sink keeping every alert it receives.
#[derive(Debug, Default)]
pub struct CollectingSink {
    alerts: Mutex<Vec<Alert>>,
}

impl CollectingSink {
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().unwrap().clone()
    }

    pub fn count(&self, descriptor: &str, severity: Severity) -> usize {
        self.alerts().iter().filter(|a| a.descriptor == descriptor && a.severity == severity).count()
    }
}

#[async_trait]
impl AlertSink for CollectingSink {
    async fn send(&self, alert: &Alert) -> Result<()> {
        self.alerts.lock().unwrap().push(alert.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "collect"
    }
}

/// Alert sink that holds every alert of one severity until released.
#[derive(Debug)]
pub struct GatedSink {
    severity: Severity,
    pub entered: Notify,
    release: Semaphore,
}

impl GatedSink {
    pub fn new(severity: Severity) -> Self {
        Self { severity, entered: Notify::new(), release: Semaphore::new(0) }
    }

    pub fn release(&self) {
        self.release.add_permits(1);
    }
}

#[async_trait]
impl AlertSink for GatedSink {
    async fn send(&self, alert: &Alert) -> Result<()> {
        if alert.severity != self.severity {
            return Ok(());
        }
        self.entered.notify_one();
        let permit = self.release.acquire().await.map_err(|e| RotationError::internal(e.to_string()))?;
        permit.forget();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "gated"
    }
}

/// In-memory store where another writer commits `name` just before the
/// engine's next commit of it lands.
#[derive(Debug)]
pub struct RacingStore {
    inner: Arc<InMemorySecretStore>,
    name: String,
    material: CredentialMaterial,
    armed: AtomicBool,
}

impl RacingStore {
    pub fn new(inner: Arc<InMemorySecretStore>, name: &str, material: CredentialMaterial) -> Self {
        Self { inner, name: name.to_string(), material, armed: AtomicBool::new(true) }
    }
}

#[async_trait]
impl SecretStore for RacingStore {
    async fn get(&self, name: &str) -> Result<Option<StoredSecret>> {
        self.inner.get(name).await
    }

    async fn put(
        &self,
        name: &str,
        material: &CredentialMaterial,
        metadata: &RotationMetadata,
    ) -> Result<RotationMetadata> {
        if name == self.name && self.armed.swap(false, Ordering::SeqCst) {
            let theirs = RotationMetadata { last_attempt_id: Some(Uuid::new_v4()), ..metadata.clone() };
            self.inner.put(name, &self.material, &theirs).await?;
        }
        self.inner.put(name, material, metadata).await
    }

    async fn list_metadata(&self) -> Result<Vec<RotationMetadata>> {
        self.inner.list_metadata().await
    }

    async fn issue_certificate(&self, request: &CertificateRequest) -> Result<IssuedCertificate> {
        self.inner.issue_certificate(request).await
    }

    async fn dynamic_credentials(&self, request: &DynamicCredentialRequest) -> Result<DynamicCredential> {
        self.inner.dynamic_credentials(request).await
    }

    async fn load_state(&self) -> Result<EngineState> {
        self.inner.load_state().await
    }

    async fn save_delivery_state(&self, descriptor: &str, state: &DeliveryState) -> Result<()> {
        self.inner.save_delivery_state(descriptor, state).await
    }

    async fn save_service_sync(&self, service: &str, sync: &ServiceSync) -> Result<()> {
        self.inner.save_service_sync(service, sync).await
    }

    async fn health_check(&self) -> Result<()> {
        self.inner.health_check().await
    }

    fn backend_type(&self) -> StoreBackendType {
        self.inner.backend_type()
    }
}

pub struct Fixture {
    pub dir: TempDir,
    pub store: Arc<InMemorySecretStore>,
    pub clock: Arc<ManualClock>,
    pub alerts: Arc<CollectingSink>,
    pub actions: HashMap<String, Arc<RecordingAction>>,
    pub gated: HashMap<String, Arc<GatedAction>>,
    sinks: Vec<Arc<dyn AlertSink>>,
    pub engine: RotationEngine,
}

pub struct FixtureBuilder {
    catalog: String,
    templates: Vec<(String, String)>,
    store: Arc<InMemorySecretStore>,
    gated: Vec<(String, Arc<GatedAction>)>,
    sinks: Vec<Arc<dyn AlertSink>>,
}

impl FixtureBuilder {
    pub fn template(mut self, name: &str, source: &str) -> Self {
        self.templates.push((name.to_string(), source.to_string()));
        self
    }

    /// Use `action` for `service` instead of a [`RecordingAction`].
    pub fn gated(mut self, service: &str, action: Arc<GatedAction>) -> Self {
        self.gated.push((service.to_string(), action));
        self
    }

    /// Deliver alerts to `sink` as well as the collecting sink.
    pub fn alert_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn build(self) -> Fixture {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("templates")).unwrap();
        for (name, source) in &self.templates {
            std::fs::write(dir.path().join("templates").join(name), source).unwrap();
        }
        let catalog_path = dir.path().join("rotation.yaml");
        std::fs::write(&catalog_path, &self.catalog).unwrap();

        let registry = DescriptorRegistry::load(&catalog_path).unwrap();
        let mut actions = HashMap::new();
        let mut gated = HashMap::new();
        for service in registry.services().keys() {
            if let Some((_, action)) = self.gated.iter().find(|(name, _)| name == service) {
                gated.insert(service.clone(), action.clone());
            } else {
                actions.insert(service.clone(), Arc::new(RecordingAction::default()));
            }
        }

        let mut fixture = Fixture {
            dir,
            store: self.store,
            clock: Arc::new(ManualClock::new(t0())),
            alerts: Arc::new(CollectingSink::default()),
            actions,
            gated,
            sinks: self.sinks,
            engine: RotationEngine::builder(registry, Arc::new(InMemorySecretStore::new())).build(),
        };
        fixture.engine = fixture.restart();
        fixture
    }
}

impl Fixture {
    pub fn builder(catalog: &str) -> FixtureBuilder {
        FixtureBuilder {
            catalog: catalog.to_string(),
            templates: Vec::new(),
            store: Arc::new(InMemorySecretStore::new()),
            gated: Vec::new(),
            sinks: Vec::new(),
        }
    }

    /// A fresh engine over the same catalog, store, clock, alert sink and
    /// reload actions, as a restarted process would build it.
    pub fn restart(&self) -> RotationEngine {
        self.engine_over(self.store.clone())
    }

    /// An engine like [`restart`](Self::restart) but talking to `store`.
    pub fn engine_over(&self, store: Arc<dyn SecretStore>) -> RotationEngine {
        let registry = DescriptorRegistry::load(&self.path("rotation.yaml")).unwrap();
        let mut builder = RotationEngine::builder(registry, store)
            .reload(fast_reload())
            .store_retry(fast_retry())
            .clock(self.clock.clone())
            .alert_sink(self.alerts.clone());
        for sink in &self.sinks {
            builder = builder.alert_sink(sink.clone());
        }
        for (service, action) in &self.actions {
            builder = builder.reload_action(service.clone(), action.clone());
        }
        for (service, action) in &self.gated {
            builder = builder.reload_action(service.clone(), action.clone());
        }
        builder.build()
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.dir.path().join(relative)
    }

    pub fn read(&self, relative: &str) -> String {
        std::fs::read_to_string(self.path(relative)).unwrap()
    }

    pub fn action(&self, service: &str) -> &RecordingAction {
        self.actions.get(service).unwrap()
    }

    /// Store `material` for `name` as if it had been rotated at `rotated_at`.
    pub fn seed(&self, name: &str, material: CredentialMaterial, rotated_at: DateTime<Utc>) -> RotationMetadata {
        let default_ttl = self.engine.registry().get(name).unwrap().default_ttl;
        let metadata = RotationMetadata::bootstrap(name, rotated_at, default_ttl, Uuid::new_v4());
        self.store.seed(name, material, metadata.clone());
        metadata
    }

    pub async fn metadata(&self, name: &str) -> Option<RotationMetadata> {
        self.store.get(name).await.unwrap().map(|s| s.metadata)
    }

    pub async fn field(&self, name: &str, field: &str) -> Option<String> {
        let secret = self.store.get(name).await.unwrap()?;
        secret.material.get(field).map(|v| v.expose_secret().to_string())
    }

    pub async fn tick(&self) -> TickSummary {
        self.tick_with(TickOptions::default()).await
    }

    pub async fn tick_with(&self, options: TickOptions) -> TickSummary {
        self.engine.tick(&options, &CancellationToken::new()).await.unwrap()
    }
}
