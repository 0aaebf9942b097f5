//! Restoring and saving the engine's delivery and sync state.
//!
//! The reporter and dispatcher are seeded from the store once, before the
//! first tick or check. Afterwards every change to a descriptor's delivery
//! state and every successful reload is written back, so that a later
//! process picks up pending work, failure counts, alert rate limits and what
//! each service last reloaded.

use tracing::{debug, info, warn};

use super::RotationEngine;
use crate::errors::{Result, RotationError};
use crate::reload::{ArtifactChange, ReloadResult};

impl RotationEngine {
    /// Seed reporter and dispatcher from the store. Runs once per engine;
    /// a failed load is retried by the next caller.
    pub(super) async fn restore_state(&self) -> Result<()> {
        let inner = &self.inner;
        inner
            .state_loaded
            .get_or_try_init(|| async {
                let state = inner
                    .store_retry
                    .run(|_| inner.store.load_state(), RotationError::is_retryable)
                    .await
                    .map_err(|(e, _)| e)?;

                let mut descriptors = 0;
                for (name, delivery) in state.delivery {
                    if inner.registry.get(&name).is_err() {
                        debug!(descriptor = %name, "Ignoring saved state of a descriptor no longer in the catalog");
                        continue;
                    }
                    inner.saved_delivery.insert(name.clone(), delivery.clone());
                    inner.reporter.restore(&name, delivery);
                    descriptors += 1;
                }

                let mut services = 0;
                for (service, sync) in state.services {
                    if !inner.dispatcher.has_service(&service) {
                        debug!(service = %service, "Ignoring saved state of a service no longer in the catalog");
                        continue;
                    }
                    inner.dispatcher.restore(&service, &sync);
                    services += 1;
                }

                info!(descriptors, services, "Engine state restored");
                Ok::<(), RotationError>(())
            })
            .await?;
        Ok(())
    }

    /// Write `descriptor`'s delivery state back if it changed since the last save.
    ///
    /// A failed save is logged and retried with the next change; this
    /// process keeps working from its own copy.
    pub(super) async fn save_delivery(&self, descriptor: &str) {
        let inner = &self.inner;
        let _held = inner.state_lock.lock().await;

        let state = inner.reporter.delivery_state(descriptor);
        let unchanged = match inner.saved_delivery.get(descriptor) {
            Some(saved) => *saved == state,
            None => state.is_clear(),
        };
        if unchanged {
            return;
        }

        let saved = inner
            .store_retry
            .run(|_| inner.store.save_delivery_state(descriptor, &state), RotationError::is_retryable)
            .await;
        match saved {
            Ok(()) => {
                debug!(descriptor = %descriptor, pending = ?state.pending, "Delivery state saved");
                inner.saved_delivery.insert(descriptor.to_string(), state);
            }
            Err((e, attempts)) => {
                warn!(descriptor = %descriptor, attempts, error = %e, "Saving delivery state failed");
            }
        }
    }

    /// Reload the services in `changes` and save what each successful one
    /// has now loaded.
    pub(super) async fn reload_services(&self, changes: &[ArtifactChange]) -> ReloadResult {
        let inner = &self.inner;
        let result = inner.dispatcher.reload(changes).await;

        let _held = inner.state_lock.lock().await;
        for service in &result.reloaded {
            let sync = inner.dispatcher.service_sync(service);
            let saved = inner
                .store_retry
                .run(|_| inner.store.save_service_sync(service, &sync), RotationError::is_retryable)
                .await;
            if let Err((e, attempts)) = saved {
                warn!(service = %service, attempts, error = %e, "Saving reload state failed");
            }
        }
        result
    }
}
