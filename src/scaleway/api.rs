//! Server operations the Scaleway provider relies on.
//!
//! [`ServerApi`] is the seam between lifecycle logic and the network.
//! [`ScalewayServers`] sends every call through the shared
//! [`RequestExecutor`], so throttling and gateway failures are retried the
//! same way for listings, actions, image lookup and creation.

use std::collections::BTreeMap;
use std::sync::Arc;

use reqwest::Method;
use scaleway_rs::ScalewayImage;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ScalewayConfig;
use crate::error::ProviderError;
use crate::http::{AuthHeader, HttpResponse, HttpTransport, RequestExecutor, RetryPolicy};
use crate::provider::{ProviderFuture, VolumeConfig};

use super::error::classify;
use super::lifecycle::select_image_id;
use super::types::{Action, ServerId, ServerState, Zone};

const BYTES_PER_GB: u64 = 1_000_000_000;
const SSH_KEY_PAGE_SIZE: u32 = 100;
const SERVER_PAGE_SIZE: usize = 100;
const EXTRA_VOLUME_TYPE: &str = "b_ssd";

/// Volume attached to a server, as reported by the create response.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AttachedVolume {
    /// Scaleway volume identifier.
    pub id: String,
    /// Volume name.
    pub name: String,
}

/// Point-in-time view of a server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServerSnapshot {
    /// Server identifier.
    pub id: ServerId,
    /// Server name.
    pub name: String,
    /// Reported state.
    pub state: ServerState,
    /// Actions the API currently allows.
    pub allowed_actions: Vec<Action>,
    /// Public IPv4 address, when assigned.
    pub public_ip: Option<String>,
    /// Extra volumes in attachment order. Listings leave this empty.
    pub volumes: Vec<AttachedVolume>,
}

impl ServerSnapshot {
    /// Returns `true` when `action` is currently allowed.
    #[must_use]
    pub fn allows(&self, action: &Action) -> bool {
        self.allowed_actions.contains(action)
    }
}

/// Creation request for a single server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServerDraft {
    /// Server name.
    pub name: String,
    /// Commercial type such as `DEV1-S`.
    pub commercial_type: String,
    /// Resolved image UUID.
    pub image: String,
    /// Owning project.
    pub project: String,
    /// Optional organisation.
    pub organization: Option<String>,
    /// Tags applied to the server.
    pub tags: Vec<String>,
    /// Extra volumes created alongside the server.
    pub volumes: Vec<VolumeConfig>,
}

/// Server, SSH key and image operations used by the Scaleway provider.
pub trait ServerApi: Send + Sync {
    /// Lists every server in `zone`.
    fn list_servers<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        zone: &'a Zone,
    ) -> ProviderFuture<'a, Vec<ServerSnapshot>>;

    /// Creates one server.
    fn create_server<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        zone: &'a Zone,
        draft: &'a ServerDraft,
    ) -> ProviderFuture<'a, ServerSnapshot>;

    /// Performs a server action such as `poweron` or `terminate`.
    fn perform_action<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        zone: &'a Zone,
        id: &'a ServerId,
        action: &'a Action,
    ) -> ProviderFuture<'a, ()>;

    /// Deletes a server that is not running.
    fn delete_server<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        zone: &'a Zone,
        id: &'a ServerId,
    ) -> ProviderFuture<'a, ()>;

    /// Looks up an SSH key by exact name, returning its identifier.
    fn find_ssh_key<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        name: &'a str,
    ) -> ProviderFuture<'a, Option<String>>;

    /// Resolves an image UUID or label to an image UUID.
    fn resolve_image<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        zone: &'a Zone,
        image: &'a str,
    ) -> ProviderFuture<'a, String>;

    /// Performs a cheap read-only call with the configured credentials.
    fn check_credentials<'a>(&'a self, cancel: &'a CancellationToken) -> ProviderFuture<'a, ()>;
}

/// Production [`ServerApi`] backed by the Scaleway REST APIs.
#[derive(Clone)]
pub struct ScalewayServers {
    executor: RequestExecutor,
    config: ScalewayConfig,
}

impl std::fmt::Debug for ScalewayServers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScalewayServers")
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

impl ScalewayServers {
    /// Builds the API client from validated configuration.
    #[must_use]
    pub fn new(
        config: ScalewayConfig,
        transport: Arc<dyn HttpTransport>,
        retry: RetryPolicy,
    ) -> Self {
        let executor = RequestExecutor::new(
            transport,
            &config.api_url,
            AuthHeader::token(&config.secret_key),
            retry,
        );
        Self { executor, config }
    }

    async fn send(
        &self,
        cancel: &CancellationToken,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
        resource: &str,
    ) -> Result<HttpResponse, ProviderError> {
        let response = self.executor.execute(cancel, method, path, body).await?;
        classify(resource, response)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        cancel: &CancellationToken,
        path: &str,
        resource: &str,
    ) -> Result<T, ProviderError> {
        self.send(cancel, Method::GET, path, None, resource)
            .await?
            .json(resource)
    }
}

#[derive(Serialize)]
struct CreateServerRequest<'a> {
    name: &'a str,
    commercial_type: &'a str,
    image: &'a str,
    project: &'a str,
    routed_ip_enabled: bool,
    dynamic_ip_required: bool,
    tags: &'a [String],
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    volumes: BTreeMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    organization: Option<&'a str>,
}

#[derive(Deserialize)]
struct CreateServerResponse {
    server: ServerRecord,
}

#[derive(Deserialize)]
struct ServerList {
    servers: Vec<ServerRecord>,
}

#[derive(Deserialize)]
struct ImageList {
    images: Vec<ScalewayImage>,
}

/// Server as returned by the create and list endpoints. Only the fields the
/// lifecycle reads are decoded.
#[derive(Deserialize)]
struct ServerRecord {
    id: String,
    name: String,
    state: String,
    #[serde(default)]
    allowed_actions: Vec<String>,
    public_ip: Option<PublicIp>,
    #[serde(default)]
    volumes: BTreeMap<String, RecordVolume>,
}

#[derive(Deserialize)]
struct PublicIp {
    address: String,
}

#[derive(Deserialize)]
struct RecordVolume {
    id: String,
    name: String,
}

#[derive(Deserialize)]
struct SshKeyList {
    ssh_keys: Vec<SshKey>,
}

#[derive(Deserialize)]
struct SshKey {
    id: String,
    name: String,
}

fn volume_payload(volumes: &[VolumeConfig]) -> BTreeMap<String, serde_json::Value> {
    volumes
        .iter()
        .zip(1_usize..)
        .map(|(volume, slot)| {
            (
                slot.to_string(),
                json!({
                    "name": volume.name,
                    "size": volume.size_gb.saturating_mul(BYTES_PER_GB),
                    "volume_type": EXTRA_VOLUME_TYPE,
                }),
            )
        })
        .collect()
}

impl ServerRecord {
    fn into_snapshot(self) -> ServerSnapshot {
        let mut extra: Vec<(u32, RecordVolume)> = self
            .volumes
            .into_iter()
            .filter_map(|(slot, volume)| {
                slot.parse::<u32>()
                    .ok()
                    .filter(|index| *index > 0)
                    .map(|index| (index, volume))
            })
            .collect();
        extra.sort_by_key(|(index, _)| *index);
        ServerSnapshot {
            id: self.id.into(),
            name: self.name,
            state: self.state.into(),
            allowed_actions: self.allowed_actions.into_iter().map(Action::from).collect(),
            public_ip: self.public_ip.map(|ip| ip.address),
            volumes: extra
                .into_iter()
                .map(|(_, volume)| AttachedVolume {
                    id: volume.id,
                    name: volume.name,
                })
                .collect(),
        }
    }
}

fn is_commercial_type_error(status: u16, body: &str) -> bool {
    status == 400 && body.to_ascii_lowercase().contains("commercial_type")
}

impl ServerApi for ScalewayServers {
    fn list_servers<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        zone: &'a Zone,
    ) -> ProviderFuture<'a, Vec<ServerSnapshot>> {
        Box::pin(async move {
            let mut servers = Vec::new();
            for page in 1_u32.. {
                let listing: ServerList = self
                    .get_json(
                        cancel,
                        &format!(
                            "instance/v1/zones/{zone}/servers?per_page={SERVER_PAGE_SIZE}&page={page}"
                        ),
                        "servers",
                    )
                    .await?;
                let fetched = listing.servers.len();
                servers.extend(listing.servers.into_iter().map(ServerRecord::into_snapshot));
                if fetched < SERVER_PAGE_SIZE {
                    break;
                }
            }
            Ok(servers)
        })
    }

    fn create_server<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        zone: &'a Zone,
        draft: &'a ServerDraft,
    ) -> ProviderFuture<'a, ServerSnapshot> {
        Box::pin(async move {
            let payload = CreateServerRequest {
                name: &draft.name,
                commercial_type: &draft.commercial_type,
                image: &draft.image,
                project: &draft.project,
                routed_ip_enabled: true,
                dynamic_ip_required: true,
                tags: &draft.tags,
                volumes: volume_payload(&draft.volumes),
                organization: draft.organization.as_deref(),
            };
            let body =
                serde_json::to_value(&payload).map_err(|err| ProviderError::decode("server request", err))?;
            let response = self
                .executor
                .execute(
                    cancel,
                    Method::POST,
                    &format!("instance/v1/zones/{zone}/servers"),
                    Some(body),
                )
                .await?;
            if is_commercial_type_error(response.status, &response.text_snippet()) {
                return Err(ProviderError::Validation(format!(
                    "size: {} not available in {zone}",
                    draft.commercial_type
                )));
            }
            let parsed: CreateServerResponse = classify(&format!("server {}", draft.name), response)?
                .json("server create response")?;
            Ok(parsed.server.into_snapshot())
        })
    }

    fn perform_action<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        zone: &'a Zone,
        id: &'a ServerId,
        action: &'a Action,
    ) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.send(
                cancel,
                Method::POST,
                &format!("instance/v1/zones/{zone}/servers/{id}/action"),
                Some(json!({ "action": action.as_str() })),
                &format!("server {id}"),
            )
            .await?;
            Ok(())
        })
    }

    fn delete_server<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        zone: &'a Zone,
        id: &'a ServerId,
    ) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.send(
                cancel,
                Method::DELETE,
                &format!("instance/v1/zones/{zone}/servers/{id}"),
                None,
                &format!("server {id}"),
            )
            .await?;
            Ok(())
        })
    }

    fn find_ssh_key<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        name: &'a str,
    ) -> ProviderFuture<'a, Option<String>> {
        Box::pin(async move {
            let keys: SshKeyList = self
                .get_json(
                    cancel,
                    &format!(
                        "iam/v1alpha1/ssh-keys?project_id={}&page_size={SSH_KEY_PAGE_SIZE}",
                        urlencoding::encode(&self.config.default_project_id)
                    ),
                    "ssh keys",
                )
                .await?;
            Ok(keys
                .ssh_keys
                .into_iter()
                .find(|key| key.name == name)
                .map(|key| key.id))
        })
    }

    fn resolve_image<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        zone: &'a Zone,
        image: &'a str,
    ) -> ProviderFuture<'a, String> {
        Box::pin(async move {
            if Uuid::parse_str(image).is_ok() {
                return Ok(image.to_owned());
            }
            let architecture = self.config.default_architecture.as_str();
            let listing: ImageList = self
                .get_json(
                    cancel,
                    &format!(
                        "instance/v1/zones/{zone}/images?public=true&name={}&arch={}",
                        urlencoding::encode(image),
                        urlencoding::encode(architecture)
                    ),
                    &format!("image {image}"),
                )
                .await?;
            select_image_id(listing.images, architecture).ok_or_else(|| {
                ProviderError::not_found(format!("image {image} ({architecture}) in {zone}"))
            })
        })
    }

    fn check_credentials<'a>(&'a self, cancel: &'a CancellationToken) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.send(
                cancel,
                Method::GET,
                "iam/v1alpha1/ssh-keys?page_size=1",
                None,
                "ssh keys",
            )
            .await?;
            Ok(())
        })
    }
}
