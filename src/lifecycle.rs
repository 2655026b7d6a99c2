//! Orchestrates provider operations and publishes their outcome.
//!
//! [`Lifecycle`] is the entry point callers use for job-scoped work: it runs
//! the provider call to completion (including readiness waits) and only then
//! announces the result on the [`EventBus`]. Publishing is fire-and-forget;
//! a closed bus is logged and never turns a finished operation into a
//! failure.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::ProviderError;
use crate::events::{Event, EventBus, JobRef};
use crate::provider::{InstanceConfig, InstanceInfo, Provider};

/// Provider plus event bus for one deployment.
#[derive(Clone)]
pub struct Lifecycle {
    provider: Arc<dyn Provider>,
    bus: EventBus,
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle")
            .field("provider", &self.provider.name())
            .finish_non_exhaustive()
    }
}

impl Lifecycle {
    /// Creates an orchestrator.
    #[must_use]
    pub fn new(provider: Arc<dyn Provider>, bus: EventBus) -> Self {
        Self { provider, bus }
    }

    /// Returns the underlying provider.
    #[must_use]
    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    /// Returns the event bus.
    #[must_use]
    pub const fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Creates the instances for `job` and publishes a `Created` event.
    ///
    /// A shortfall against `config.number_of_instances` is logged; the
    /// event and the return value carry only the instances that became
    /// ready. Nothing is published when none did.
    ///
    /// # Errors
    ///
    /// Propagates the provider's error; no event is published in that case.
    pub async fn create(
        &self,
        cancel: &CancellationToken,
        job: &JobRef,
        name: &str,
        config: &InstanceConfig,
    ) -> Result<Vec<InstanceInfo>, ProviderError> {
        let instances = self.provider.create_instance(cancel, name, config).await?;
        let requested = usize::try_from(config.number_of_instances).unwrap_or(usize::MAX);
        if instances.len() < requested {
            warn!(
                provider = self.provider.name(),
                job_id = job.id,
                requested,
                ready = instances.len(),
                "fewer instances than requested became ready"
            );
        }
        if instances.is_empty() {
            return Ok(instances);
        }

        info!(
            provider = self.provider.name(),
            job_id = job.id,
            ready = instances.len(),
            "instances ready"
        );
        self.announce(Event::created(job, instances.clone(), vec![config.clone()]))
            .await;
        Ok(instances)
    }

    /// Deletes `instances` and publishes a `Deleted` event for those removed.
    ///
    /// Deletion continues past per-instance failures unless the failure
    /// aborts the whole request (cancellation, authentication). The event
    /// is published for the removed subset even when an error is returned.
    ///
    /// # Errors
    ///
    /// Returns the first provider error encountered.
    pub async fn delete(
        &self,
        cancel: &CancellationToken,
        job: &JobRef,
        instances: &[InstanceInfo],
    ) -> Result<Vec<InstanceInfo>, ProviderError> {
        let mut removed = Vec::with_capacity(instances.len());
        let mut first_error = None;

        for instance in instances {
            match self
                .provider
                .delete_instance(cancel, &instance.name, &instance.region)
                .await
            {
                Ok(()) => removed.push(instance.clone()),
                Err(err) => {
                    warn!(
                        provider = self.provider.name(),
                        job_id = job.id,
                        instance = %instance.name,
                        region = %instance.region,
                        error = %err,
                        "instance deletion failed"
                    );
                    let aborts = err.aborts_request();
                    first_error.get_or_insert(err);
                    if aborts {
                        break;
                    }
                }
            }
        }

        if !removed.is_empty() {
            self.announce(Event::deleted(job, removed.clone())).await;
        }
        first_error.map_or(Ok(removed), Err)
    }

    async fn announce(&self, event: Event) {
        let kind = event.kind;
        let job_id = event.job_id;
        if let Err(err) = self.bus.publish(event).await {
            warn!(kind = kind.as_str(), job_id, error = %err, "event not published");
        }
    }
}
