//! Post-creation provisioning driven by `Created` events.
//!
//! [`ProvisioningSubscriber`] ties three seams together: a
//! [`JobRepository`] that knows which instances a job already owns, an
//! [`InventoryWriter`] that renders them for configuration management, and a
//! [`ProvisioningRunner`] that applies the configuration.

mod inventory;
mod runner;

use std::collections::BTreeMap;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::events::{Event, EventHandler, EventKind, HandlerError, HandlerFuture, JobRef};
use crate::provider::InstanceInfo;

pub use inventory::{AnsibleInventoryWriter, render_inventory};
pub use runner::{AnsiblePlaybookRunner, CommandOutput};

/// Errors raised while provisioning a job's instances.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProvisioningError {
    /// Raised when the job's persisted instances cannot be loaded.
    #[error("failed to load job instances: {0}")]
    Repository(String),
    /// Raised when the inventory cannot be written.
    #[error("failed to write inventory {path}: {message}")]
    Inventory {
        /// Inventory path.
        path: Utf8PathBuf,
        /// Underlying error message.
        message: String,
    },
    /// Raised when the provisioning run fails.
    #[error("provisioning run failed: {0}")]
    Runner(String),
    /// Raised when the run was cancelled.
    #[error("provisioning cancelled")]
    Cancelled,
}

impl From<ProvisioningError> for HandlerError {
    fn from(value: ProvisioningError) -> Self {
        Self::new(value.to_string())
    }
}

/// Future returned by provisioning seams.
pub type ProvisioningFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, ProvisioningError>> + Send + 'a>>;

/// Read access to the instances persisted for a job.
pub trait JobRepository: Send + Sync {
    /// Returns every instance recorded for `job_id`.
    fn get_by_job_id(&self, job_id: u64) -> ProvisioningFuture<'_, Vec<InstanceInfo>>;
}

/// Renders hosts into an inventory consumed by a [`ProvisioningRunner`].
pub trait InventoryWriter: Send + Sync {
    /// Writes the inventory for `job_id` and returns its path.
    fn write<'a>(
        &'a self,
        job_id: u64,
        hosts: &'a BTreeMap<String, IpAddr>,
    ) -> ProvisioningFuture<'a, Utf8PathBuf>;
}

/// Applies configuration to the hosts listed in an inventory.
pub trait ProvisioningRunner: Send + Sync {
    /// Runs provisioning for `job` against `inventory`.
    fn run<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        job: &'a JobRef,
        inventory: &'a Utf8Path,
    ) -> ProvisioningFuture<'a, ()>;
}

/// Merges persisted and freshly created instances by name; the fresh
/// address wins when both know a host.
#[must_use]
pub fn merge_hosts(persisted: &[InstanceInfo], created: &[InstanceInfo]) -> BTreeMap<String, IpAddr> {
    persisted
        .iter()
        .chain(created)
        .map(|instance| (instance.name.clone(), instance.public_ip))
        .collect()
}

/// Event handler that provisions the hosts of a job after creation.
#[derive(Clone)]
pub struct ProvisioningSubscriber {
    repository: Arc<dyn JobRepository>,
    writer: Arc<dyn InventoryWriter>,
    runner: Arc<dyn ProvisioningRunner>,
}

impl std::fmt::Debug for ProvisioningSubscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisioningSubscriber").finish_non_exhaustive()
    }
}

impl ProvisioningSubscriber {
    /// Creates a subscriber from its three collaborators.
    #[must_use]
    pub fn new(
        repository: Arc<dyn JobRepository>,
        writer: Arc<dyn InventoryWriter>,
        runner: Arc<dyn ProvisioningRunner>,
    ) -> Self {
        Self {
            repository,
            writer,
            runner,
        }
    }

    async fn provision(
        &self,
        cancel: &CancellationToken,
        event: &Event,
    ) -> Result<(), ProvisioningError> {
        let persisted = self.repository.get_by_job_id(event.job_id).await?;
        let hosts = merge_hosts(&persisted, &event.instances);
        if hosts.is_empty() {
            debug!(job_id = event.job_id, "no hosts to provision");
            return Ok(());
        }

        let inventory = self.writer.write(event.job_id, &hosts).await?;
        let job = JobRef::new(event.job_id, event.job_name.clone(), event.owner_id);
        self.runner.run(cancel, &job, &inventory).await?;
        info!(
            job_id = event.job_id,
            hosts = hosts.len(),
            inventory = %inventory,
            "job provisioned"
        );
        Ok(())
    }
}

impl EventHandler for ProvisioningSubscriber {
    fn name(&self) -> &str {
        "provisioning"
    }

    fn handle<'a>(&'a self, cancel: &'a CancellationToken, event: Event) -> HandlerFuture<'a> {
        Box::pin(async move {
            if event.kind != EventKind::Created {
                return Ok(());
            }
            self.provision(cancel, &event)
                .await
                .map_err(HandlerError::from)
        })
    }
}
