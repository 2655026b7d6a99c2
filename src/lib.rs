//! Core library for provisioning compute instances across cloud backends.
//!
//! The crate exposes a [`Provider`] abstraction with Scaleway and VirtFusion
//! implementations, the shared machinery they are built from (a retrying
//! HTTP executor, a bounded polling waiter and a TTL read cache), and an
//! in-process [`EventBus`] that announces lifecycle outcomes to subscribers
//! such as the Ansible [`ProvisioningSubscriber`].

pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod factory;
pub mod http;
pub mod lifecycle;
pub mod provider;
pub mod provisioning;
pub mod scaleway;
pub mod test_support;
pub mod virtfusion;
pub mod wait;

pub use cache::TtlCache;
pub use config::{ConfigError, ScalewayConfig, VirtFusionConfig};
pub use error::ProviderError;
pub use events::{
    Event, EventBus, EventBusConfig, EventBusError, EventHandler, EventKind, HandlerError, JobRef,
    handler_fn,
};
pub use factory::{ProviderKind, ProviderSettings, build_provider, provider_from_env};
pub use http::{HttpTransport, RequestExecutor, RetryPolicy};
pub use lifecycle::Lifecycle;
pub use provider::{
    InstanceConfig, InstanceConfigBuilder, InstanceInfo, InstanceState, Provider, VolumeConfig,
    VolumeDetails,
};
pub use provisioning::{
    AnsibleInventoryWriter, AnsiblePlaybookRunner, InventoryWriter, JobRepository,
    ProvisioningError, ProvisioningRunner, ProvisioningSubscriber,
};
pub use scaleway::{ScalewayProvider, ScalewayTiming};
pub use virtfusion::{VirtFusionProvider, VirtFusionTiming};
pub use wait::{PollPolicy, PollingWaiter, Probe};
