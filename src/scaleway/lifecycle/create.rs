//! Batched server creation for the Scaleway backend.
//!
//! Each server is created and powered on individually; the batch is then
//! awaited as a whole so one listing per poll covers every pending server.

use std::net::IpAddr;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ProviderError;
use crate::provider::{InstanceConfig, InstanceInfo, VolumeDetails};
use crate::scaleway::{Action, ScalewayProvider, ServerApi, ServerDraft, ServerSnapshot, Zone};
use crate::wait::sleep_or_cancel;

fn check_volume_regions(config: &InstanceConfig) -> Result<(), ProviderError> {
    for (index, volume) in config.volumes.iter().enumerate() {
        if volume.effective_region(&config.region) != config.region {
            return Err(ProviderError::Validation(format!(
                "volumes[{index}].region must match instance zone {}",
                config.region
            )));
        }
    }
    Ok(())
}

fn instance_info(
    server: &ServerSnapshot,
    public_ip: IpAddr,
    config: &InstanceConfig,
    size: &str,
) -> InstanceInfo {
    let volumes = config
        .volumes
        .iter()
        .enumerate()
        .map(|(index, volume)| VolumeDetails {
            id: server
                .volumes
                .get(index)
                .map(|attached| attached.id.clone())
                .unwrap_or_default(),
            name: volume.name.clone(),
            size_gb: volume.size_gb,
            region: config.region.clone(),
            mount_point: volume.mount_point.clone(),
            filesystem: volume.filesystem.clone(),
        })
        .collect();
    InstanceInfo {
        id: server.id.as_str().to_owned(),
        name: server.name.clone(),
        public_ip,
        region: config.region.clone(),
        size: size.to_owned(),
        volumes,
        disk_size_gb: None,
    }
}

impl<A: ServerApi> ScalewayProvider<A> {
    pub(in crate::scaleway) async fn create_servers(
        &self,
        cancel: &CancellationToken,
        name: &str,
        config: &InstanceConfig,
    ) -> Result<Vec<InstanceInfo>, ProviderError> {
        config.validate()?;
        let size = config.size.as_deref().ok_or_else(|| {
            ProviderError::Validation(String::from("size: scaleway requires a commercial type"))
        })?;
        check_volume_regions(config)?;
        let zone = Zone::from(config.region.as_str());

        if self
            .api
            .find_ssh_key(cancel, &config.ssh_key_name)
            .await?
            .is_none()
        {
            return Err(ProviderError::not_found(format!(
                "ssh key {}",
                config.ssh_key_name
            )));
        }
        let image = self.api.resolve_image(cancel, &zone, &config.image).await?;

        let outcome = self
            .create_batches(cancel, name, config, &zone, size, &image)
            .await;
        self.invalidate_caches().await;
        outcome
    }

    async fn create_batches(
        &self,
        cancel: &CancellationToken,
        name: &str,
        config: &InstanceConfig,
        zone: &Zone,
        size: &str,
        image: &str,
    ) -> Result<Vec<InstanceInfo>, ProviderError> {
        let names = config.instance_names(name);
        let mut instances = Vec::with_capacity(names.len());

        for (index, batch) in names.chunks(self.timing.batch_size.max(1)).enumerate() {
            if index > 0 {
                debug!(batch = index, delay = ?self.timing.batch_delay, "pausing between batches");
                sleep_or_cancel(cancel, self.timing.batch_delay).await?;
            }

            let mut launched = Vec::with_capacity(batch.len());
            for server_name in batch {
                let draft = ServerDraft {
                    name: server_name.clone(),
                    commercial_type: size.to_owned(),
                    image: image.to_owned(),
                    project: self.config.default_project_id.clone(),
                    organization: self.config.default_organization_id.clone(),
                    tags: config.tags.clone(),
                    volumes: config.volumes.clone(),
                };
                match self.launch(cancel, zone, &draft).await {
                    Ok(server) => launched.push(server),
                    Err(err) if err.aborts_request() => return Err(err),
                    Err(err) => {
                        warn!(instance = %server_name, error = %err, "dropping instance that failed to launch");
                    }
                }
            }

            let addresses = self.await_public_ips(cancel, zone, &launched).await?;
            instances.extend(launched.iter().filter_map(|server| {
                addresses
                    .get(&server.id)
                    .map(|ip| instance_info(server, *ip, config, size))
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
        zone: &Zone,
        draft: &ServerDraft,
    ) -> Result<ServerSnapshot, ProviderError> {
        let server = self.api.create_server(cancel, zone, draft).await?;
        debug!(instance = %server.name, id = %server.id, state = %server.state, "server created");

        if server.state.is_running() || server.state.as_str() == "starting" {
            return Ok(server);
        }
        if server.allows(&Action::power_on()) {
            self.api
                .perform_action(cancel, zone, &server.id, &Action::power_on())
                .await?;
            return Ok(server);
        }
        Err(ProviderError::Api {
            status: 0,
            message: format!(
                "server {} in state {} cannot be powered on",
                server.name, server.state
            ),
        })
    }
}
