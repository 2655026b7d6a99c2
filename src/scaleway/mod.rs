//! Scaleway backend implementation of the instance lifecycle.
//!
//! Servers are created one call per instance, powered on, then polled until
//! they report `running` with a public IPv4 address. Large requests are
//! split into fixed-size batches with a pause between them.

mod api;
mod error;
mod lifecycle;
mod types;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cache::TtlCache;
use crate::config::ScalewayConfig;
use crate::error::ProviderError;
use crate::http::{HttpTransport, ReqwestTransport, RetryPolicy};
use crate::provider::{InstanceConfig, InstanceInfo, Provider, ProviderFuture};
use crate::wait::PollPolicy;

pub use api::{AttachedVolume, ScalewayServers, ServerApi, ServerDraft, ServerSnapshot};
pub use types::{Action, ServerId, ServerState, Zone};

const PROVIDER_NAME: &str = "scaleway";
const DEFAULT_BATCH_SIZE: usize = 10;
const DEFAULT_BATCH_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_secs(5);
const READY_POLLS: u32 = 60;
const ABSENCE_POLLS: u32 = 60;

/// Batching, polling and caching knobs for [`ScalewayProvider`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ScalewayTiming {
    /// Servers created per batch.
    pub batch_size: usize,
    /// Pause between two batches.
    pub batch_delay: Duration,
    /// Budget for a server to report a public address.
    pub ready: PollPolicy,
    /// Budget for a deleted server to disappear from listings.
    pub absence: PollPolicy,
    /// Lifetime of cached server listings.
    pub cache_ttl: Duration,
}

impl Default for ScalewayTiming {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            batch_delay: DEFAULT_BATCH_DELAY,
            ready: PollPolicy::new(POLL_INTERVAL, READY_POLLS),
            absence: PollPolicy::new(POLL_INTERVAL, ABSENCE_POLLS),
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }
}

type ServerCache = TtlCache<Vec<ServerSnapshot>>;

/// Provider that manages servers through the Scaleway Instances API.
pub struct ScalewayProvider<A = ScalewayServers> {
    api: A,
    config: ScalewayConfig,
    timing: ScalewayTiming,
    caches: Mutex<HashMap<Zone, Arc<ServerCache>>>,
}

impl<A> std::fmt::Debug for ScalewayProvider<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScalewayProvider")
            .field("project", &self.config.default_project_id)
            .field("timing", &self.timing)
            .finish_non_exhaustive()
    }
}

impl ScalewayProvider<ScalewayServers> {
    /// Constructs a provider from configuration using the production
    /// transport and default timings.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Config`] when the configuration fails
    /// validation.
    pub fn new(config: ScalewayConfig) -> Result<Self, ProviderError> {
        Self::with_transport(
            config,
            Arc::new(ReqwestTransport::new()),
            RetryPolicy::default(),
            ScalewayTiming::default(),
        )
    }

    /// Constructs a provider with explicit transport and timings.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Config`] when the configuration fails
    /// validation.
    pub fn with_transport(
        config: ScalewayConfig,
        transport: Arc<dyn HttpTransport>,
        retry: RetryPolicy,
        timing: ScalewayTiming,
    ) -> Result<Self, ProviderError> {
        config.validate()?;
        let api = ScalewayServers::new(config.clone(), transport, retry);
        Ok(Self::with_api(api, config, timing))
    }

    /// Loads `SCW_*` configuration and constructs a provider.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Config`] when a required variable is missing.
    pub fn from_env() -> Result<Self, ProviderError> {
        Self::new(ScalewayConfig::load_from_env()?)
    }
}

impl<A: ServerApi> ScalewayProvider<A> {
    /// Constructs a provider over an arbitrary [`ServerApi`].
    #[must_use]
    pub fn with_api(api: A, config: ScalewayConfig, timing: ScalewayTiming) -> Self {
        Self {
            api,
            config,
            timing,
            caches: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the provider's timings.
    #[must_use]
    pub const fn timing(&self) -> ScalewayTiming {
        self.timing
    }

    fn cache_for(&self, zone: &Zone) -> Arc<ServerCache> {
        let mut caches = self.caches.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            caches
                .entry(zone.clone())
                .or_insert_with(|| Arc::new(TtlCache::new(self.timing.cache_ttl))),
        )
    }

    async fn invalidate_caches(&self) {
        let caches: Vec<Arc<ServerCache>> = self
            .caches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for cache in caches {
            cache.invalidate().await;
        }
    }

    async fn cached_servers(
        &self,
        cancel: &CancellationToken,
        zone: &Zone,
    ) -> Result<Vec<ServerSnapshot>, ProviderError> {
        self.cache_for(zone)
            .get_or_fetch(|| self.api.list_servers(cancel, zone))
            .await
    }
}

impl<A: ServerApi> Provider for ScalewayProvider<A> {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    fn create_instance<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        name: &'a str,
        config: &'a InstanceConfig,
    ) -> ProviderFuture<'a, Vec<InstanceInfo>> {
        Box::pin(async move {
            let instances = self.create_servers(cancel, name, config).await?;
            info!(
                provider = PROVIDER_NAME,
                zone = %config.region,
                requested = config.number_of_instances,
                ready = instances.len(),
                "instances created"
            );
            Ok(instances)
        })
    }

    fn delete_instance<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        name: &'a str,
        region: &'a str,
    ) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.remove_server(cancel, name, region).await?;
            info!(provider = PROVIDER_NAME, zone = region, instance = name, "instance deleted");
            Ok(())
        })
    }

    fn validate_credentials(&self) -> ProviderFuture<'_, ()> {
        Box::pin(async move {
            let cancel = CancellationToken::new();
            self.api.check_credentials(&cancel).await
        })
    }

    fn environment_vars(&self) -> HashMap<String, String> {
        let mut vars = HashMap::from([
            (String::from("SCW_SECRET_KEY"), self.config.secret_key.clone()),
            (
                String::from("SCW_DEFAULT_PROJECT_ID"),
                self.config.default_project_id.clone(),
            ),
        ]);
        if let Some(organization) = &self.config.default_organization_id {
            vars.insert(
                String::from("SCW_DEFAULT_ORGANIZATION_ID"),
                organization.clone(),
            );
        }
        vars
    }
}
