//! # Rotation Engine
//!
//! Ties the registry, generator, store, renderer, reload dispatcher and health
//! reporter together. One [`tick`](RotationEngine::tick):
//!
//! 1. renews the store token and reads every descriptor's metadata
//! 2. plans tasks, critical first
//! 3. runs each task in its own spawned task, bounded by `max_concurrency`,
//!    and alerts on overdue descriptors while they run
//! 4. reconciles artifacts and reloads services that are still out of sync
//!
//! A task runs generate, commit, render and reload strictly in that order.
//! Nothing before the commit touches the secret; anything after it is retried
//! by later ticks through reconciliation rather than by re-rotating. The
//! commit is a check-and-set, so a descriptor rotated concurrently by another
//! engine sharing the store is left at the other engine's version.
//!
//! Delivery state (pending steps, failures, alert history) and what each
//! service last reloaded are kept in the store, see [`state`].

mod artifacts;
pub mod clock;
mod rotation;
mod state;
mod summary;

pub use clock::{Clock, ManualClock, SystemClock};
pub use summary::{HealthReport, HealthSummary, ReconcileReport, TaskReport, TickSummary};

use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell, Semaphore};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::config::{EngineConfig, GeneratorConfig, ReloadConfig, SchedulerConfig, StoreBackend};
use crate::errors::{Result, RotationError};
use crate::generator::CredentialGenerator;
use crate::health::{AlertSink, HealthRecord, HealthReporter, LogAlertSink, Severity, WebhookAlertSink};
use crate::observability::MetricsRecorder;
use crate::registry::DescriptorRegistry;
use crate::reload::{ReloadAction, ReloadDispatcher};
use crate::render::AtomicWriter;
use crate::rotation_span;
use crate::scheduler::{self, InFlightRegistry, TickOptions};
use crate::secrets::{
    DeliveryState, InMemorySecretStore, RotationMetadata, SecretStore, StoredSecret, VaultSecretStore,
};
use crate::utils::RetryConfig;

/// The rotation engine. Cheap to clone; clones share all state.
#[derive(Debug, Clone)]
pub struct RotationEngine {
    inner: Arc<EngineInner>,
}

#[derive(Debug)]
struct EngineInner {
    registry: Arc<DescriptorRegistry>,
    store: Arc<dyn SecretStore>,
    generator: CredentialGenerator,
    dispatcher: ReloadDispatcher,
    reporter: HealthReporter,
    writer: AtomicWriter,
    in_flight: InFlightRegistry,
    /// Serializes compose-and-write per artifact
    destination_locks: DashMap<PathBuf, Arc<Mutex<()>>>,
    state_loaded: OnceCell<()>,
    /// Serializes state saves so the newest snapshot is written last
    state_lock: Mutex<()>,
    /// Delivery state as last written to the store
    saved_delivery: DashMap<String, DeliveryState>,
    permits: Arc<Semaphore>,
    store_retry: RetryConfig,
    tick_interval: Duration,
    clock: Arc<dyn Clock>,
    metrics: MetricsRecorder,
}

/// Builder for [`RotationEngine`].
#[derive(Debug)]
pub struct EngineBuilder {
    registry: DescriptorRegistry,
    store: Arc<dyn SecretStore>,
    scheduler: SchedulerConfig,
    generator: GeneratorConfig,
    reload: ReloadConfig,
    reload_overrides: Vec<(String, Arc<dyn ReloadAction>)>,
    sinks: Vec<Arc<dyn AlertSink>>,
    clock: Arc<dyn Clock>,
    store_retry: RetryConfig,
}

impl EngineBuilder {
    pub fn scheduler(mut self, config: SchedulerConfig) -> Self {
        self.scheduler = config;
        self
    }

    pub fn generator(mut self, config: GeneratorConfig) -> Self {
        self.generator = config;
        self
    }

    pub fn reload(mut self, config: ReloadConfig) -> Self {
        self.reload = config;
        self
    }

    /// Replace the action the catalog declares for `service`.
    pub fn reload_action(mut self, service: impl Into<String>, action: Arc<dyn ReloadAction>) -> Self {
        self.reload_overrides.push((service.into(), action));
        self
    }

    /// Add an alert sink. The log sink is always installed.
    pub fn alert_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Retry policy for store reads and commits.
    pub fn store_retry(mut self, retry: RetryConfig) -> Self {
        self.store_retry = retry;
        self
    }

    pub fn build(self) -> RotationEngine {
        let mut dispatcher = ReloadDispatcher::from_services(self.registry.services(), &self.reload);
        for (service, action) in self.reload_overrides {
            dispatcher.register(service, action, self.reload.attempt_timeout);
        }

        let mut sinks: Vec<Arc<dyn AlertSink>> = vec![Arc::new(LogAlertSink)];
        sinks.extend(self.sinks);

        let generator = CredentialGenerator::new(self.store.clone(), self.generator);
        RotationEngine {
            inner: Arc::new(EngineInner {
                registry: Arc::new(self.registry),
                store: self.store,
                generator,
                dispatcher,
                reporter: HealthReporter::new(sinks),
                writer: AtomicWriter::new(),
                in_flight: InFlightRegistry::new(),
                destination_locks: DashMap::new(),
                state_loaded: OnceCell::new(),
                state_lock: Mutex::new(()),
                saved_delivery: DashMap::new(),
                permits: Arc::new(Semaphore::new(self.scheduler.max_concurrency.max(1))),
                store_retry: self.store_retry,
                tick_interval: self.scheduler.tick_interval,
                clock: self.clock,
                metrics: MetricsRecorder::new(),
            }),
        }
    }
}

impl RotationEngine {
    pub fn builder(registry: DescriptorRegistry, store: Arc<dyn SecretStore>) -> EngineBuilder {
        EngineBuilder {
            registry,
            store,
            scheduler: SchedulerConfig::default(),
            generator: GeneratorConfig::default(),
            reload: ReloadConfig::default(),
            reload_overrides: Vec::new(),
            sinks: Vec::new(),
            clock: Arc::new(SystemClock),
            store_retry: RetryConfig::default(),
        }
    }

    /// Load the catalog, connect the configured store and build the engine.
    pub async fn from_config(config: &EngineConfig, catalog: Option<&Path>) -> Result<Self> {
        let catalog = catalog.unwrap_or(&config.catalog_path);
        let registry = DescriptorRegistry::load(catalog)?;

        let store: Arc<dyn SecretStore> = match config.store.backend {
            StoreBackend::Vault => Arc::new(VaultSecretStore::new(config.store.vault.clone()).await?),
            StoreBackend::Memory => {
                warn!("Using the in-memory secret store; rotated secrets are lost on exit");
                Arc::new(InMemorySecretStore::new())
            }
        };

        let mut builder = Self::builder(registry, store)
            .scheduler(config.scheduler.clone())
            .generator(config.generator.clone())
            .reload(config.reload.clone())
            .store_retry(config.store.vault.retry.clone());
        if let Some(webhook) = WebhookAlertSink::from_config(&config.alerts)? {
            builder = builder.alert_sink(Arc::new(webhook));
        }
        Ok(builder.build())
    }

    pub fn registry(&self) -> &DescriptorRegistry {
        &self.inner.registry
    }

    pub fn store(&self) -> &Arc<dyn SecretStore> {
        &self.inner.store
    }

    pub fn reporter(&self) -> &HealthReporter {
        &self.inner.reporter
    }

    pub fn dispatcher(&self) -> &ReloadDispatcher {
        &self.inner.dispatcher
    }

    pub fn in_flight(&self) -> &InFlightRegistry {
        &self.inner.in_flight
    }

    /// Evaluate every descriptor once and rotate the ones that need it.
    pub async fn tick(&self, options: &TickOptions, cancel: &CancellationToken) -> Result<TickSummary> {
        let inner = &self.inner;
        if let Some(only) = &options.only {
            for name in only {
                inner.registry.get(name)?;
            }
        }

        match inner.store.renew_token().await {
            Ok(Some(ttl)) => debug!(ttl_secs = ttl.as_secs(), "Store token renewed"),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Store token renewal failed"),
        }
        self.restore_state().await?;

        let metadata: HashMap<String, RotationMetadata> = self
            .list_metadata()
            .await?
            .into_iter()
            .map(|m| (m.descriptor.clone(), m))
            .collect();

        let plan = scheduler::plan(&inner.registry, &metadata, &inner.in_flight, options, inner.clock.now());
        inner.metrics.record_tick(plan.tasks.len());
        info!(
            tasks = plan.tasks.len(),
            overdue = plan.overdue.len(),
            skipped_in_flight = plan.skipped_in_flight.len(),
            force = options.force,
            "Tick planned"
        );

        let mut summary =
            TickSummary { overdue: plan.overdue, skipped_in_flight: plan.skipped_in_flight, ..Default::default() };

        let mut handles = Vec::with_capacity(plan.tasks.len());
        for task in plan.tasks {
            let Some(guard) = inner.in_flight.try_acquire(&task.descriptor.name, task.attempt_id) else {
                summary.skipped_in_flight.push(task.descriptor.name.clone());
                continue;
            };
            // acquired here so that tasks start in plan order
            let permit = inner
                .permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| RotationError::internal("rotation semaphore closed"))?;

            let span = rotation_span!(
                task.descriptor.name,
                task.descriptor.kind,
                task.attempt_id,
                priority = task.priority.as_str()
            );
            let name = task.descriptor.name.clone();
            let priority = task.priority;
            let engine = self.clone();
            let cancel = cancel.clone();
            let handle = tokio::spawn(
                async move {
                    let _permit = permit;
                    let _guard = guard;
                    engine.execute(task, &cancel).await
                }
                .instrument(span),
            );
            handles.push((name, priority, handle));
        }

        // rotations are already running; alert delivery does not hold them up
        for name in &summary.overdue {
            let cycle = metadata.get(name).map_or(0, |m| m.rotation_count);
            inner
                .reporter
                .alert(name, Severity::Critical, format!("secret '{}' is past its maximum TTL, rotating now", name), cycle)
                .await;
            self.save_delivery(name).await;
        }

        for (name, priority, handle) in handles {
            match handle.await {
                Ok(report) => summary.tasks.push(report),
                Err(e) => {
                    error!(descriptor = %name, error = %e, "Rotation task aborted");
                    summary.tasks.push(TaskReport::aborted(
                        name,
                        priority,
                        RotationError::internal(format!("rotation task aborted: {}", e)),
                    ));
                }
            }
        }

        if !cancel.is_cancelled() {
            let busy: HashSet<String> = summary.tasks.iter().flat_map(|t| t.failed_services.iter().cloned()).collect();
            let failed: HashSet<String> =
                summary.tasks.iter().filter(|t| !t.is_success()).map(|t| t.descriptor.clone()).collect();
            summary.reconcile = self.reconcile(&busy, &failed).await;
        }

        Ok(summary)
    }

    /// Status of every descriptor. Reads only; nothing is written or reloaded.
    /// Includes state saved by earlier runs against the same store.
    pub async fn check(&self) -> Result<Vec<HealthRecord>> {
        self.restore_state().await?;
        let secrets = self.load_secrets().await?;
        let now = self.inner.clock.now();

        let mut records = Vec::with_capacity(self.inner.registry.len());
        for descriptor in self.inner.registry.list() {
            let metadata = secrets.get(&descriptor.name).map(|s| s.metadata.clone());
            let state = scheduler::classify(metadata.as_ref(), descriptor, now);
            let drift = match metadata {
                Some(_) => self.drift(descriptor, &secrets)?,
                None => Vec::new(),
            };
            records.push(self.inner.reporter.record(descriptor, metadata, state, drift));
        }
        Ok(records)
    }

    /// [`check`](Self::check) as a report document; also refreshes the status gauges.
    pub async fn report(&self) -> Result<HealthReport> {
        let records = self.check().await?;
        self.inner.reporter.publish_status_gauges(&records);
        Ok(HealthReport::new(self.inner.clock.now(), self.inner.store.backend_type(), records))
    }

    /// Tick on the configured interval until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut interval = tokio::time::interval(self.inner.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            tick_interval = ?self.inner.tick_interval,
            descriptors = self.inner.registry.len(),
            backend = %self.inner.store.backend_type(),
            "Rotation engine started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            match self.tick(&TickOptions::default(), &cancel).await {
                Ok(summary) => info!(
                    rotated = summary.rotated(),
                    failed = summary.failed(),
                    reloaded = summary.reconcile.reloaded.len(),
                    "Tick completed"
                ),
                Err(e) if e.is_config() => return Err(e),
                Err(e) => error!(error = %e, "Tick failed"),
            }
        }

        info!("Rotation engine stopped");
        Ok(())
    }

    async fn list_metadata(&self) -> Result<Vec<RotationMetadata>> {
        self.inner
            .store_retry
            .run(|_| self.inner.store.list_metadata(), RotationError::is_retryable)
            .await
            .map_err(|(e, _)| e)
    }

    async fn get_secret(&self, name: &str) -> Result<Option<StoredSecret>> {
        self.inner
            .store_retry
            .run(|_| self.inner.store.get(name), RotationError::is_retryable)
            .await
            .map_err(|(e, _)| e)
    }

    /// Current material of every descriptor that has any.
    async fn load_secrets(&self) -> Result<HashMap<String, StoredSecret>> {
        let mut secrets = HashMap::new();
        for descriptor in self.inner.registry.list() {
            if let Some(secret) = self.get_secret(&descriptor.name).await? {
                secrets.insert(descriptor.name.clone(), secret);
            }
        }
        Ok(secrets)
    }
}
