//! VirtFusion backend implementation of the instance lifecycle.
//!
//! VirtFusion separates allocation from installation: a server is first
//! created against a hypervisor and package, then built with an operating
//! system template. The build runs asynchronously and the server is ready
//! once its state reads `complete` and an IPv4 address is attached.
//!
//! Identifiers are numeric throughout: the instance region is the hypervisor
//! id, the size the package id and the image the operating-system template
//! id.

mod api;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use reqwest::Method;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::TtlCache;
use crate::config::VirtFusionConfig;
use crate::error::ProviderError;
use crate::http::{AuthHeader, HttpTransport, ReqwestTransport, RequestExecutor, RetryPolicy};
use crate::provider::{
    InstanceConfig, InstanceInfo, InstanceState, Provider, ProviderFuture, ReadinessTracker,
};
use crate::wait::{PollPolicy, PollingWaiter, Probe, sleep_or_cancel};

use api::{BuildServerRequest, CreateServerRequest, Envelope, Page, ServerRecord, SshKey};

const PROVIDER_NAME: &str = "virtfusion";
const DEFAULT_BATCH_SIZE: usize = 10;
const DEFAULT_BATCH_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);
const BUILD_POLL_INTERVAL: Duration = Duration::from_secs(10);
const BUILD_POLLS: u32 = 60;
const ABSENCE_POLL_INTERVAL: Duration = Duration::from_secs(5);
const ABSENCE_POLLS: u32 = 60;
const LISTING_PAGE_SIZE: u32 = 200;

/// Batching, polling and caching knobs for [`VirtFusionProvider`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VirtFusionTiming {
    /// Servers created per batch.
    pub batch_size: usize,
    /// Pause between two batches.
    pub batch_delay: Duration,
    /// Budget for a build to complete with an address.
    pub ready: PollPolicy,
    /// Budget for a deleted server to disappear.
    pub absence: PollPolicy,
    /// Lifetime of the cached server listing.
    pub cache_ttl: Duration,
}

impl Default for VirtFusionTiming {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            batch_delay: DEFAULT_BATCH_DELAY,
            ready: PollPolicy::new(BUILD_POLL_INTERVAL, BUILD_POLLS),
            absence: PollPolicy::new(ABSENCE_POLL_INTERVAL, ABSENCE_POLLS),
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }
}

/// Numeric placement derived from an [`InstanceConfig`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct Placement {
    hypervisor_id: u64,
    package_id: Option<u64>,
    operating_system_id: u64,
    memory_mb: Option<u64>,
    cpu_cores: Option<u32>,
    storage_gb: u64,
}

fn numeric_id(field: &str, value: &str) -> Result<u64, ProviderError> {
    value.trim().parse::<u64>().map_err(|_| {
        ProviderError::Validation(format!(
            "{field}: expected a numeric VirtFusion id, got {value:?}"
        ))
    })
}

fn placement(config: &InstanceConfig) -> Result<Placement, ProviderError> {
    config.validate()?;
    if config.volumes.is_empty() {
        return Err(ProviderError::Validation(String::from(
            "volumes: virtfusion requires at least one volume",
        )));
    }
    let package_id = config
        .size
        .as_deref()
        .filter(|size| !size.trim().is_empty())
        .map(|size| numeric_id("size", size))
        .transpose()?;
    Ok(Placement {
        hypervisor_id: numeric_id("region", &config.region)?,
        package_id,
        operating_system_id: numeric_id("image", &config.image)?,
        memory_mb: config.memory_mb,
        cpu_cores: config.cpu_cores,
        storage_gb: config.total_volume_gb(),
    })
}

fn size_label(config: &InstanceConfig) -> String {
    match (&config.size, config.memory_mb, config.cpu_cores) {
        (Some(size), _, _) if !size.is_empty() => size.clone(),
        (_, Some(memory), Some(cores)) => format!("{memory}mb-{cores}vcpu"),
        _ => String::new(),
    }
}

/// Server launched and awaiting its build.
#[derive(Clone, Debug, Eq, PartialEq)]
struct Launched {
    id: u64,
    name: String,
}

/// Provider that manages servers through the VirtFusion REST API.
pub struct VirtFusionProvider {
    executor: RequestExecutor,
    config: VirtFusionConfig,
    timing: VirtFusionTiming,
    servers: TtlCache<Vec<ServerRecord>>,
}

impl std::fmt::Debug for VirtFusionProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtFusionProvider")
            .field("api_url", &self.config.api_url)
            .field("user_id", &self.config.user_id)
            .field("timing", &self.timing)
            .finish_non_exhaustive()
    }
}

impl VirtFusionProvider {
    /// Constructs a provider using the production transport and default
    /// timings.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Config`] when the configuration fails
    /// validation.
    pub fn new(config: VirtFusionConfig) -> Result<Self, ProviderError> {
        Self::with_transport(
            config,
            Arc::new(ReqwestTransport::new()),
            RetryPolicy::default(),
            VirtFusionTiming::default(),
        )
    }

    /// Constructs a provider with explicit transport and timings.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Config`] when the configuration fails
    /// validation.
    pub fn with_transport(
        config: VirtFusionConfig,
        transport: Arc<dyn HttpTransport>,
        retry: RetryPolicy,
        timing: VirtFusionTiming,
    ) -> Result<Self, ProviderError> {
        config.validate()?;
        let executor = RequestExecutor::new(
            transport,
            &config.api_url,
            AuthHeader::bearer(&config.api_token),
            retry,
        );
        Ok(Self {
            executor,
            config,
            timing,
            servers: TtlCache::new(timing.cache_ttl),
        })
    }

    /// Loads `VIRTFUSION_*` configuration and constructs a provider.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Config`] when a required variable is missing.
    pub fn from_env() -> Result<Self, ProviderError> {
        Self::new(VirtFusionConfig::load_from_env()?)
    }

    /// Returns the provider's timings.
    #[must_use]
    pub const fn timing(&self) -> VirtFusionTiming {
        self.timing
    }

    async fn find_ssh_key(
        &self,
        cancel: &CancellationToken,
        name: &str,
    ) -> Result<Option<u64>, ProviderError> {
        let keys: Envelope<Vec<SshKey>> = self
            .executor
            .execute_json(
                cancel,
                Method::GET,
                &format!("ssh_keys/user/{}", self.config.user_id),
                None,
                "ssh keys",
            )
            .await?;
        Ok(keys
            .data
            .into_iter()
            .find(|key| key.name == name)
            .map(|key| key.id))
    }

    async fn list_servers(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<ServerRecord>, ProviderError> {
        let mut servers = Vec::new();
        for page in 1_u32.. {
            let listing: Page<Vec<ServerRecord>> = self
                .executor
                .execute_json(
                    cancel,
                    Method::GET,
                    &format!(
                        "servers/user/{}?results={LISTING_PAGE_SIZE}&page={page}",
                        self.config.user_id
                    ),
                    None,
                    "servers",
                )
                .await?;
            let more = listing.has_more();
            servers.extend(listing.data);
            if !more {
                break;
            }
        }
        Ok(servers)
    }

    /// Fetches one server; `None` when VirtFusion no longer knows it.
    async fn fetch_server(
        &self,
        cancel: &CancellationToken,
        id: u64,
    ) -> Result<Option<ServerRecord>, ProviderError> {
        let response = self
            .executor
            .execute(cancel, Method::GET, &format!("servers/{id}"), None)
            .await?;
        if response.status == 404 {
            return Ok(None);
        }
        let server: Envelope<ServerRecord> = response
            .error_for_status(&format!("server {id}"))?
            .json("server")?;
        Ok(Some(server.data))
    }

    async fn create_servers(
        &self,
        cancel: &CancellationToken,
        name: &str,
        config: &InstanceConfig,
    ) -> Result<Vec<InstanceInfo>, ProviderError> {
        let target = placement(config)?;
        let ssh_key = self
            .find_ssh_key(cancel, &config.ssh_key_name)
            .await?
            .ok_or_else(|| ProviderError::not_found(format!("ssh key {}", config.ssh_key_name)))?;

        let outcome = self
            .create_batches(cancel, name, config, target, ssh_key)
            .await;
        self.servers.invalidate().await;
        outcome
    }

    async fn create_batches(
        &self,
        cancel: &CancellationToken,
        name: &str,
        config: &InstanceConfig,
        target: Placement,
        ssh_key: u64,
    ) -> Result<Vec<InstanceInfo>, ProviderError> {
        let names = config.instance_names(name);
        let size = size_label(config);
        let mut instances = Vec::with_capacity(names.len());

        for (index, batch) in names.chunks(self.timing.batch_size.max(1)).enumerate() {
            if index > 0 {
                debug!(batch = index, delay = ?self.timing.batch_delay, "pausing between batches");
                sleep_or_cancel(cancel, self.timing.batch_delay).await?;
            }

            let mut launched = Vec::with_capacity(batch.len());
            for server_name in batch {
                match self.launch(cancel, target, ssh_key, server_name).await {
                    Ok(server) => launched.push(server),
                    Err(err) if err.aborts_request() => return Err(err),
                    Err(err) => {
                        warn!(instance = %server_name, error = %err, "dropping instance that failed to launch");
                    }
                }
            }

            let ready = self.await_builds(cancel, &launched).await?;
            instances.extend(ready.into_iter().map(|(server, public_ip)| InstanceInfo {
                id: server.id.to_string(),
                name: server.name,
                public_ip,
                region: config.region.clone(),
                size: size.clone(),
                volumes: Vec::new(),
                disk_size_gb: Some(target.storage_gb),
            }));
        }

        if instances.len() < names.len() {
            warn!(
                requested = names.len(),
                ready = instances.len(),
                "returning partial batch"
            );
        }
        Ok(instances)
    }

    async fn launch(
        &self,
        cancel: &CancellationToken,
        target: Placement,
        ssh_key: u64,
        name: &str,
    ) -> Result<Launched, ProviderError> {
        let request = CreateServerRequest {
            package_id: target.package_id,
            user_id: self.config.user_id,
            hypervisor_id: target.hypervisor_id,
            ipv4: 1,
            storage: target.storage_gb,
            memory: target.memory_mb,
            cores: target.cpu_cores,
        };
        let body = serde_json::to_value(&request)
            .map_err(|err| ProviderError::decode("server request", err))?;
        let created: Envelope<ServerRecord> = self
            .executor
            .execute_json(
                cancel,
                Method::POST,
                "servers",
                Some(body),
                &format!("server {name}"),
            )
            .await?;
        let id = created.data.id;

        let build = BuildServerRequest {
            operating_system_id: target.operating_system_id,
            name,
            hostname: name,
            ssh_keys: vec![ssh_key],
            email: false,
        };
        let build_body = serde_json::to_value(&build)
            .map_err(|err| ProviderError::decode("build request", err))?;
        self.executor
            .execute(
                cancel,
                Method::POST,
                &format!("servers/{id}/build"),
                Some(build_body),
            )
            .await?
            .error_for_status(&format!("server {id}"))?;

        debug!(instance = name, id, "server build started");
        Ok(Launched {
            id,
            name: name.to_owned(),
        })
    }

    /// Polls the builds of one batch together until each has completed with
    /// an address.
    ///
    /// Every poll looks up the servers still pending; a lookup failure that
    /// does not abort the request leaves that server pending. Servers not
    /// ready when the budget runs out are dropped.
    async fn await_builds(
        &self,
        cancel: &CancellationToken,
        launched: &[Launched],
    ) -> Result<Vec<(Launched, IpAddr)>, ProviderError> {
        if launched.is_empty() {
            return Ok(Vec::new());
        }
        let mut initial = ReadinessTracker::new();
        for server in launched {
            initial.launched(server.clone(), &server.name);
        }
        let progress = Mutex::new(initial);
        let progress_ref = &progress;

        let outcome = PollingWaiter::new(self.timing.ready)
            .wait_until(cancel, "server builds", move || async move {
                let pending: Vec<Launched> = progress_ref
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .pending()
                    .cloned()
                    .collect();
                for server in pending {
                    let (address, state) = match self.fetch_server(cancel, server.id).await {
                        Ok(Some(record)) => (record.ready_address(), record.describe_state()),
                        Ok(None) => (None, String::from("not found")),
                        Err(err) if err.aborts_request() => return Err(err),
                        Err(err) => {
                            warn!(instance = %server.name, id = server.id, error = %err, "server lookup failed while awaiting build");
                            (None, format!("lookup failed: {err}"))
                        }
                    };
                    progress_ref
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .observe(&server, address, &state);
                }
                let round = progress_ref
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .probe();
                Ok(round)
            })
            .await;

        let tracker = progress.into_inner().unwrap_or_else(PoisonError::into_inner);
        match outcome {
            Ok(()) | Err(ProviderError::Timeout { .. }) => Ok(tracker.into_ready()),
            Err(err) => Err(err),
        }
    }

    async fn remove_server(
        &self,
        cancel: &CancellationToken,
        name: &str,
        region: &str,
    ) -> Result<(), ProviderError> {
        let instance = name.trim();
        if instance.is_empty() {
            return Err(ProviderError::Validation(String::from("name")));
        }
        let hypervisor = region.trim();
        if hypervisor.is_empty() {
            return Err(ProviderError::Validation(String::from("region")));
        }
        let hypervisor_id = numeric_id("region", hypervisor)?;

        let server = self
            .servers
            .get_or_fetch(|| self.list_servers(cancel))
            .await?
            .into_iter()
            .find(|server| server.name == instance && server.hypervisor_id == Some(hypervisor_id))
            .ok_or_else(|| {
                ProviderError::not_found(format!(
                    "instance {instance} on hypervisor {hypervisor_id}"
                ))
            })?;

        debug!(instance, id = server.id, state = %InstanceState::DeleteRequested, "deleting server");
        self.executor
            .execute(
                cancel,
                Method::DELETE,
                &format!("servers/{}?delay=0", server.id),
                None,
            )
            .await?
            .error_for_status(&format!("server {}", server.id))?;
        self.servers.invalidate().await;
        debug!(instance, id = server.id, state = %InstanceState::AwaitingAbsence, "server deletion accepted");

        self.wait_until_gone(cancel, server.id, instance, hypervisor)
            .await?;
        self.servers.invalidate().await;
        Ok(())
    }

    async fn wait_until_gone(
        &self,
        cancel: &CancellationToken,
        id: u64,
        name: &str,
        region: &str,
    ) -> Result<(), ProviderError> {
        let action = format!("removal of {name}");
        let outcome = PollingWaiter::new(self.timing.absence)
            .wait_until(cancel, &action, move || async move {
                let probe = self
                    .fetch_server(cancel, id)
                    .await?
                    .map_or(Probe::Ready(()), |record| {
                        Probe::Pending(record.describe_state())
                    });
                Ok::<_, ProviderError>(probe)
            })
            .await;

        match outcome {
            Err(ProviderError::Timeout { attempts, .. }) => Err(ProviderError::StillExists {
                name: name.to_owned(),
                region: region.to_owned(),
                attempts,
            }),
            other => other,
        }
    }
}

impl Provider for VirtFusionProvider {
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
                hypervisor = %config.region,
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
            info!(provider = PROVIDER_NAME, hypervisor = region, instance = name, "instance deleted");
            Ok(())
        })
    }

    fn validate_credentials(&self) -> ProviderFuture<'_, ()> {
        Box::pin(async move {
            let cancel = CancellationToken::new();
            self.executor
                .execute(
                    &cancel,
                    Method::GET,
                    &format!("ssh_keys/user/{}", self.config.user_id),
                    None,
                )
                .await?
                .error_for_status("ssh keys")?;
            Ok(())
        })
    }

    fn environment_vars(&self) -> HashMap<String, String> {
        HashMap::from([
            (String::from("VIRTFUSION_API_URL"), self.config.api_url.clone()),
            (
                String::from("VIRTFUSION_API_TOKEN"),
                self.config.api_token.clone(),
            ),
            (
                String::from("VIRTFUSION_USER_ID"),
                self.config.user_id.to_string(),
            ),
        ])
    }
}

#[cfg(test)]
mod tests;
