//! Provider abstraction for provisioning and tearing down compute instances.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ProviderError;
use crate::wait::Probe;

const DEFAULT_FILESYSTEM: &str = "ext4";

/// Attached-storage intent for an instance.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct VolumeConfig {
    /// Volume name, unique within the instance.
    pub name: String,
    /// Requested size in gigabytes.
    pub size_gb: u64,
    /// Region the volume lives in. Empty means "same as the instance".
    pub region: String,
    /// Absolute path the volume is mounted at.
    pub mount_point: String,
    /// Filesystem to format the volume with.
    pub filesystem: String,
}

impl VolumeConfig {
    /// Creates a volume intent in the instance's region with the default
    /// filesystem.
    #[must_use]
    pub fn new(name: impl Into<String>, size_gb: u64, mount_point: impl Into<String>) -> Self {
        Self {
            name: name.into().trim().to_owned(),
            size_gb,
            region: String::new(),
            mount_point: mount_point.into().trim().to_owned(),
            filesystem: String::from(DEFAULT_FILESYSTEM),
        }
    }

    /// Pins the volume to an explicit region.
    #[must_use]
    pub fn region(mut self, value: impl Into<String>) -> Self {
        self.region = value.into().trim().to_owned();
        self
    }

    /// Overrides the filesystem.
    #[must_use]
    pub fn filesystem(mut self, value: impl Into<String>) -> Self {
        self.filesystem = value.into().trim().to_owned();
        self
    }

    /// Region the volume resolves to for an instance in `instance_region`.
    #[must_use]
    pub fn effective_region<'a>(&'a self, instance_region: &'a str) -> &'a str {
        if self.region.is_empty() {
            instance_region
        } else {
            &self.region
        }
    }

    fn validate(&self, index: usize) -> Result<(), ProviderError> {
        if self.name.is_empty() {
            return Err(ProviderError::Validation(format!("volumes[{index}].name")));
        }
        if self.size_gb == 0 {
            return Err(ProviderError::Validation(format!(
                "volumes[{index}].size_gb"
            )));
        }
        if self.mount_point.is_empty() {
            return Err(ProviderError::Validation(format!(
                "volumes[{index}].mount_point"
            )));
        }
        Ok(())
    }
}

/// Attached-storage fact reported once an instance is ready.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct VolumeDetails {
    /// Provider specific volume identifier.
    pub id: String,
    /// Volume name.
    pub name: String,
    /// Size in gigabytes.
    pub size_gb: u64,
    /// Region the volume lives in.
    pub region: String,
    /// Mount point carried over from the intent.
    pub mount_point: String,
    /// Filesystem carried over from the intent.
    pub filesystem: String,
}

/// Desired state for one creation request.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct InstanceConfig {
    /// Target region or zone (for example `nyc1` or `fr-par-1`).
    pub region: String,
    /// Provider size, plan or package. Optional when `memory_mb` and
    /// `cpu_cores` are both set.
    pub size: Option<String>,
    /// Memory in megabytes, used with `cpu_cores` instead of `size`.
    pub memory_mb: Option<u64>,
    /// Virtual CPU count, used with `memory_mb` instead of `size`.
    pub cpu_cores: Option<u32>,
    /// Image or operating-system template reference.
    pub image: String,
    /// Name of the SSH key registered with the provider.
    pub ssh_key_name: String,
    /// Tags applied to every created instance.
    pub tags: Vec<String>,
    /// Number of instances to create.
    pub number_of_instances: u32,
    /// Attached storage intents.
    pub volumes: Vec<VolumeConfig>,
}

impl InstanceConfig {
    /// Starts a builder for an [`InstanceConfig`].
    #[must_use]
    pub fn builder() -> InstanceConfigBuilder {
        InstanceConfigBuilder::new()
    }

    /// Validates the configuration, naming the first offending field.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Validation`] when a required field is missing
    /// or a volume intent is malformed.
    pub fn validate(&self) -> Result<(), ProviderError> {
        if self.region.is_empty() {
            return Err(ProviderError::Validation(String::from("region")));
        }
        let has_size = self.size.as_deref().is_some_and(|size| !size.is_empty());
        let has_shape = matches!(
            (self.memory_mb, self.cpu_cores),
            (Some(memory), Some(cpu)) if memory > 0 && cpu > 0
        );
        if !has_size && !has_shape {
            return Err(ProviderError::Validation(String::from(
                "size (or memory_mb with cpu_cores)",
            )));
        }
        if self.image.is_empty() {
            return Err(ProviderError::Validation(String::from("image")));
        }
        if self.ssh_key_name.is_empty() {
            return Err(ProviderError::Validation(String::from("ssh_key_name")));
        }
        if self.number_of_instances == 0 {
            return Err(ProviderError::Validation(String::from(
                "number_of_instances",
            )));
        }
        for (index, volume) in self.volumes.iter().enumerate() {
            volume.validate(index)?;
        }
        Ok(())
    }

    /// Names assigned to the requested instances: `{base}-0`, `{base}-1`, …
    #[must_use]
    pub fn instance_names(&self, base: &str) -> Vec<String> {
        (0..self.number_of_instances)
            .map(|index| format!("{base}-{index}"))
            .collect()
    }

    /// Total requested volume size in gigabytes.
    #[must_use]
    pub fn total_volume_gb(&self) -> u64 {
        self.volumes.iter().map(|volume| volume.size_gb).sum()
    }
}

/// Builder for [`InstanceConfig`] that trims inputs and validates on build.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceConfigBuilder {
    region: String,
    size: Option<String>,
    memory_mb: Option<u64>,
    cpu_cores: Option<u32>,
    image: String,
    ssh_key_name: String,
    tags: Vec<String>,
    number_of_instances: u32,
    volumes: Vec<VolumeConfig>,
}

impl Default for InstanceConfigBuilder {
    fn default() -> Self {
        Self {
            region: String::new(),
            size: None,
            memory_mb: None,
            cpu_cores: None,
            image: String::new(),
            ssh_key_name: String::new(),
            tags: Vec::new(),
            number_of_instances: 1,
            volumes: Vec::new(),
        }
    }
}

impl InstanceConfigBuilder {
    /// Creates an empty builder requesting a single instance.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the region.
    #[must_use]
    pub fn region(mut self, value: impl Into<String>) -> Self {
        self.region = value.into();
        self
    }

    /// Sets the size, plan or package.
    #[must_use]
    pub fn size(mut self, value: impl Into<String>) -> Self {
        self.size = Some(value.into());
        self
    }

    /// Sets the memory/CPU pair used when no size is given.
    #[must_use]
    pub const fn shape(mut self, memory_mb: u64, cpu_cores: u32) -> Self {
        self.memory_mb = Some(memory_mb);
        self.cpu_cores = Some(cpu_cores);
        self
    }

    /// Sets the image.
    #[must_use]
    pub fn image(mut self, value: impl Into<String>) -> Self {
        self.image = value.into();
        self
    }

    /// Sets the SSH key name.
    #[must_use]
    pub fn ssh_key_name(mut self, value: impl Into<String>) -> Self {
        self.ssh_key_name = value.into();
        self
    }

    /// Adds a tag.
    #[must_use]
    pub fn tag(mut self, value: impl Into<String>) -> Self {
        self.tags.push(value.into());
        self
    }

    /// Sets the number of instances.
    #[must_use]
    pub const fn number_of_instances(mut self, value: u32) -> Self {
        self.number_of_instances = value;
        self
    }

    /// Adds a volume intent.
    #[must_use]
    pub fn volume(mut self, value: VolumeConfig) -> Self {
        self.volumes.push(value);
        self
    }

    /// Builds and validates the [`InstanceConfig`], trimming string inputs
    /// and dropping blank tags.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Validation`] when a required field is empty.
    pub fn build(self) -> Result<InstanceConfig, ProviderError> {
        let config = InstanceConfig {
            region: self.region.trim().to_owned(),
            size: self
                .size
                .map(|size| size.trim().to_owned())
                .filter(|size| !size.is_empty()),
            memory_mb: self.memory_mb,
            cpu_cores: self.cpu_cores,
            image: self.image.trim().to_owned(),
            ssh_key_name: self.ssh_key_name.trim().to_owned(),
            tags: self
                .tags
                .into_iter()
                .map(|tag| tag.trim().to_owned())
                .filter(|tag| !tag.is_empty())
                .collect(),
            number_of_instances: self.number_of_instances,
            volumes: self.volumes,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Provider-assigned identity and network facts of a ready instance.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct InstanceInfo {
    /// Provider specific identifier.
    pub id: String,
    /// Instance name.
    pub name: String,
    /// Public IPv4 address.
    pub public_ip: IpAddr,
    /// Region or zone.
    pub region: String,
    /// Size, plan or package.
    pub size: String,
    /// Separately attached volumes.
    pub volumes: Vec<VolumeDetails>,
    /// Total disk size when the backend folds volumes into the instance
    /// package instead of attaching them.
    pub disk_size_gb: Option<u64>,
}

/// Position of a single instance in its lifecycle.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum InstanceState {
    /// Accepted by the caller, nothing sent yet.
    Requested,
    /// Creation call in flight.
    Creating,
    /// Created but without a public address yet.
    AwaitingNetwork,
    /// Reachable over its public address.
    Ready,
    /// Deletion call in flight.
    DeleteRequested,
    /// Deleted but still listed by the provider.
    AwaitingAbsence,
    /// No longer listed.
    Gone,
}

impl InstanceState {
    /// Moves to `next`, rejecting transitions the lifecycle does not allow.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Api`] describing the illegal transition; this
    /// only happens when a provider reports facts out of order.
    pub fn transition(self, next: Self) -> Result<Self, ProviderError> {
        let allowed = matches!(
            (self, next),
            (Self::Requested, Self::Creating)
                | (Self::Creating, Self::AwaitingNetwork | Self::Ready)
                | (Self::AwaitingNetwork, Self::Ready)
                | (Self::Ready, Self::DeleteRequested)
                | (Self::DeleteRequested, Self::AwaitingAbsence | Self::Gone)
                | (Self::AwaitingAbsence, Self::Gone)
        );
        if allowed {
            Ok(next)
        } else {
            Err(ProviderError::Api {
                status: 0,
                message: format!("illegal lifecycle transition {self} -> {next}"),
            })
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Requested => "requested",
            Self::Creating => "creating",
            Self::AwaitingNetwork => "awaiting-network",
            Self::Ready => "ready",
            Self::DeleteRequested => "delete-requested",
            Self::AwaitingAbsence => "awaiting-absence",
            Self::Gone => "gone",
        };
        f.write_str(label)
    }
}

#[derive(Debug)]
struct Tracked<K> {
    key: K,
    name: String,
    state: InstanceState,
    address: Option<IpAddr>,
    last_seen: String,
}

/// Lifecycle state of every instance launched in one creation batch.
///
/// Observations come from provider listings and move each instance through
/// [`InstanceState::transition`]; an observation the state machine rejects,
/// such as a ready instance losing its address, is ignored.
#[derive(Debug)]
pub(crate) struct ReadinessTracker<K> {
    entries: Vec<Tracked<K>>,
}

impl<K: PartialEq> ReadinessTracker<K> {
    pub(crate) const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Records an instance whose creation call was accepted.
    pub(crate) fn launched(&mut self, key: K, name: &str) {
        self.entries.push(Tracked {
            key,
            name: name.to_owned(),
            state: InstanceState::Creating,
            address: None,
            last_seen: String::from("not listed"),
        });
    }

    /// Applies what the provider reported for `key`: `address` is set once
    /// the instance is reachable.
    pub(crate) fn observe(&mut self, key: &K, address: Option<IpAddr>, provider_state: &str) {
        let Some(entry) = self.entries.iter_mut().find(|entry| &entry.key == key) else {
            return;
        };
        provider_state.clone_into(&mut entry.last_seen);
        let observed = if address.is_some() {
            InstanceState::Ready
        } else {
            InstanceState::AwaitingNetwork
        };
        if entry.state == observed {
            return;
        }
        match entry.state.transition(observed) {
            Ok(next) => {
                debug!(instance = %entry.name, from = %entry.state, to = %next, "instance state changed");
                entry.state = next;
                entry.address = address;
            }
            Err(err) => {
                debug!(instance = %entry.name, error = %err, "ignoring out-of-order observation");
            }
        }
    }

    /// Keys of instances that are not ready yet.
    pub(crate) fn pending(&self) -> impl Iterator<Item = &K> {
        self.entries
            .iter()
            .filter(|entry| entry.state != InstanceState::Ready)
            .map(|entry| &entry.key)
    }

    /// `Ready` once every instance is, otherwise the waiting instances with
    /// their last reported state.
    pub(crate) fn probe(&self) -> Probe<()> {
        let waiting: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.state != InstanceState::Ready)
            .map(|entry| format!("{}={}", entry.name, entry.last_seen))
            .collect();
        if waiting.is_empty() {
            Probe::Ready(())
        } else {
            Probe::Pending(waiting.join(", "))
        }
    }

    /// Ready instances with their addresses, in launch order. Every other
    /// instance is dropped with a warning.
    pub(crate) fn into_ready(self) -> Vec<(K, IpAddr)> {
        self.entries
            .into_iter()
            .filter_map(|entry| match (entry.state, entry.address) {
                (InstanceState::Ready, Some(address)) => Some((entry.key, address)),
                (state, _) => {
                    warn!(
                        instance = %entry.name,
                        state = %state,
                        last_state = %entry.last_seen,
                        "dropping instance that never became ready"
                    );
                    None
                }
            })
            .collect()
    }
}

/// Future returned by provider operations.
pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ProviderError>> + Send + 'a>>;

/// Lifecycle contract implemented once per backend family.
///
/// Implementations compose [`crate::http::RequestExecutor`],
/// [`crate::wait::PollingWaiter`] and [`crate::cache::TtlCache`] rather than
/// sharing a base type.
pub trait Provider: Send + Sync {
    /// Short backend name used in logs and events.
    fn name(&self) -> &'static str;

    /// Creates `config.number_of_instances` instances named `{name}-{index}`
    /// and waits until each is ready.
    ///
    /// Instances that never become ready within the polling budget are
    /// dropped from the result with a warning; the caller reconciles the
    /// shortfall.
    fn create_instance<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        name: &'a str,
        config: &'a InstanceConfig,
    ) -> ProviderFuture<'a, Vec<InstanceInfo>>;

    /// Deletes the instance matching `(name, region)` and waits until the
    /// provider no longer lists it.
    fn delete_instance<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        name: &'a str,
        region: &'a str,
    ) -> ProviderFuture<'a, ()>;

    /// Performs a cheap read-only call proving the credentials work.
    fn validate_credentials(&self) -> ProviderFuture<'_, ()>;

    /// Environment variables downstream tooling needs to talk to the same
    /// backend.
    fn environment_vars(&self) -> HashMap<String, String>;
}
