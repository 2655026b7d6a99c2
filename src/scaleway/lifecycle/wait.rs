//! Readiness and teardown wait helpers for the Scaleway backend.

use std::collections::HashMap;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ProviderError;
use crate::provider::{InstanceState, ReadinessTracker};
use crate::scaleway::{Action, ScalewayProvider, ServerApi, ServerId, ServerSnapshot, Zone};
use crate::wait::{PollingWaiter, Probe};

/// Public IPv4 address of a running server.
fn ready_address(server: &ServerSnapshot) -> Option<IpAddr> {
    if !server.state.is_running() {
        return None;
    }
    server
        .public_ip
        .as_deref()
        .and_then(|ip| IpAddr::from_str(ip).ok())
        .filter(IpAddr::is_ipv4)
}

impl<A: ServerApi> ScalewayProvider<A> {
    /// Polls until every launched server reports a public IPv4 address.
    ///
    /// One listing per poll covers the whole batch. Listing failures that do
    /// not abort the request count as a pending poll. Servers still without
    /// an address when the budget runs out are left out of the returned map.
    pub(in crate::scaleway) async fn await_public_ips(
        &self,
        cancel: &CancellationToken,
        zone: &Zone,
        launched: &[ServerSnapshot],
    ) -> Result<HashMap<ServerId, IpAddr>, ProviderError> {
        let mut initial = ReadinessTracker::new();
        for server in launched {
            initial.launched(server.id.clone(), &server.name);
            initial.observe(&server.id, ready_address(server), server.state.as_str());
        }
        let progress = Mutex::new(initial);
        let progress_ref = &progress;

        let outcome = PollingWaiter::new(self.timing.ready)
            .wait_until(cancel, "public ip", move || async move {
                let settled = matches!(
                    progress_ref.lock().unwrap_or_else(PoisonError::into_inner).probe(),
                    Probe::Ready(())
                );
                if settled {
                    return Ok(Probe::Ready(()));
                }
                match self.api.list_servers(cancel, zone).await {
                    Ok(listing) => {
                        let mut batch = progress_ref.lock().unwrap_or_else(PoisonError::into_inner);
                        for server in &listing {
                            batch.observe(&server.id, ready_address(server), server.state.as_str());
                        }
                        Ok(batch.probe())
                    }
                    Err(err) if err.aborts_request() => Err(err),
                    Err(err) => {
                        warn!(zone = %zone, error = %err, "server listing failed while awaiting addresses");
                        Ok(Probe::Pending(format!("listing failed: {err}")))
                    }
                }
            })
            .await;

        let tracker = progress.into_inner().unwrap_or_else(PoisonError::into_inner);
        match outcome {
            Ok(()) | Err(ProviderError::Timeout { .. }) => {
                Ok(tracker.into_ready().into_iter().collect())
            }
            Err(err) => Err(err),
        }
    }

    pub(in crate::scaleway) async fn remove_server(
        &self,
        cancel: &CancellationToken,
        name: &str,
        region: &str,
    ) -> Result<(), ProviderError> {
        let instance = name.trim();
        if instance.is_empty() {
            return Err(ProviderError::Validation(String::from("name")));
        }
        if region.trim().is_empty() {
            return Err(ProviderError::Validation(String::from("region")));
        }
        let zone = Zone::from(region.trim());

        let server = self
            .cached_servers(cancel, &zone)
            .await?
            .into_iter()
            .find(|server| server.name == instance)
            .ok_or_else(|| ProviderError::not_found(format!("instance {instance} in {zone}")))?;

        debug!(instance, id = %server.id, state = %InstanceState::DeleteRequested, "deleting server");
        if server.allows(&Action::terminate()) {
            self.api
                .perform_action(cancel, &zone, &server.id, &Action::terminate())
                .await?;
        } else {
            self.api.delete_server(cancel, &zone, &server.id).await?;
        }
        self.invalidate_caches().await;
        debug!(instance, id = %server.id, state = %InstanceState::AwaitingAbsence, "server deletion accepted");

        self.wait_until_gone(cancel, &zone, &server.id, instance)
            .await?;
        self.invalidate_caches().await;
        Ok(())
    }

    async fn wait_until_gone(
        &self,
        cancel: &CancellationToken,
        zone: &Zone,
        id: &ServerId,
        name: &str,
    ) -> Result<(), ProviderError> {
        let action = format!("removal of {name}");
        let outcome = PollingWaiter::new(self.timing.absence)
            .wait_until(cancel, &action, move || async move {
                let listing = self.api.list_servers(cancel, zone).await?;
                let probe = listing
                    .iter()
                    .find(|server| &server.id == id)
                    .map_or(Probe::Ready(()), |server| {
                        Probe::pending(server.state.as_str())
                    });
                Ok::<_, ProviderError>(probe)
            })
            .await;

        match outcome {
            Err(ProviderError::Timeout { attempts, .. }) => Err(ProviderError::StillExists {
                name: name.to_owned(),
                region: zone.as_str().to_owned(),
                attempts,
            }),
            other => other,
        }
    }
}
