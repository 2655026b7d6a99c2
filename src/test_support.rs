//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::env;
use std::ffi::OsString;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use reqwest::Method;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;
use crate::events::{Event, EventHandler, HandlerError, HandlerFuture, JobRef};
use crate::http::{HttpRequest, HttpResponse, HttpTransport, TransportError, TransportFuture};
use crate::provider::{InstanceInfo, ProviderFuture};
use crate::provisioning::{JobRepository, ProvisioningError, ProvisioningFuture, ProvisioningRunner};
use crate::scaleway::{Action, AttachedVolume, ServerApi, ServerDraft, ServerId, ServerSnapshot, Zone};

fn locked<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// -----------------------------------------------------------------------------
// HTTP
// -----------------------------------------------------------------------------

#[derive(Clone, Debug)]
enum Scripted {
    Respond(HttpResponse),
    Fail(TransportError),
}

#[derive(Debug)]
struct Route {
    method: Method,
    path: String,
    queue: VecDeque<Scripted>,
}

impl Route {
    fn matches(&self, request: &HttpRequest) -> bool {
        let path = request.url.split('?').next().unwrap_or_default();
        self.method == request.method && path.ends_with(&self.path)
    }

    fn next(&mut self) -> Option<Scripted> {
        if self.queue.len() > 1 {
            self.queue.pop_front()
        } else {
            self.queue.front().cloned()
        }
    }
}

#[derive(Debug, Default)]
struct TransportState {
    routes: Vec<Route>,
    requests: Vec<HttpRequest>,
}

/// Transport returning pre-seeded responses per `(method, path)` route.
///
/// Responses for a route are served in FIFO order; the last one repeats
/// indefinitely. Unrouted requests receive a 404.
#[derive(Clone, Debug, Default)]
pub struct ScriptedTransport {
    state: Arc<Mutex<TransportState>>,
}

impl ScriptedTransport {
    /// Creates a transport with no routes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, method: Method, path: &str, scripted: Scripted) {
        let mut state = locked(&self.state);
        if let Some(route) = state
            .routes
            .iter_mut()
            .find(|route| route.method == method && route.path == path)
        {
            route.queue.push_back(scripted);
            return;
        }
        state.routes.push(Route {
            method,
            path: path.to_owned(),
            queue: VecDeque::from([scripted]),
        });
    }

    /// Queues a JSON response for the route.
    pub fn respond(&self, method: Method, path: &str, status: u16, body: serde_json::Value) {
        self.push(
            method,
            path,
            Scripted::Respond(HttpResponse::new(status, body.to_string())),
        );
    }

    /// Queues a transport failure for the route.
    pub fn fail(&self, method: Method, path: &str, message: &str) {
        self.push(method, path, Scripted::Fail(TransportError::new(message)));
    }

    /// Returns every request received so far.
    #[must_use]
    pub fn requests(&self) -> Vec<HttpRequest> {
        locked(&self.state).requests.clone()
    }

    /// Counts requests received for the route.
    #[must_use]
    pub fn count(&self, method: &Method, path: &str) -> usize {
        let state = locked(&self.state);
        state
            .requests
            .iter()
            .filter(|request| {
                &request.method == method
                    && request
                        .url
                        .split('?')
                        .next()
                        .unwrap_or_default()
                        .ends_with(path)
            })
            .count()
    }
}

impl HttpTransport for ScriptedTransport {
    fn send<'a>(&'a self, request: &'a HttpRequest) -> TransportFuture<'a> {
        let scripted = {
            let mut state = locked(&self.state);
            state.requests.push(request.clone());
            state
                .routes
                .iter_mut()
                .find(|route| route.matches(request))
                .and_then(Route::next)
        };
        Box::pin(async move {
            match scripted {
                Some(Scripted::Respond(response)) => Ok(response),
                Some(Scripted::Fail(error)) => Err(error),
                None => Ok(HttpResponse::new(
                    404,
                    format!("no scripted response for {} {}", request.method, request.url),
                )),
            }
        })
    }
}

// -----------------------------------------------------------------------------
// Scaleway
// -----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Removal {
    Pending,
    After(u32),
    Never,
}

#[derive(Debug)]
struct FakeServer {
    zone: String,
    snapshot: ServerSnapshot,
    address: String,
    powered: bool,
    never_ready: bool,
    listings_until_ip: u32,
    removal: Removal,
}

#[derive(Debug, Default)]
struct FakeServers {
    ssh_keys: BTreeSet<String>,
    never_ready: BTreeSet<String>,
    servers: Vec<FakeServer>,
    next_id: u8,
    ip_after_listings: u32,
    removed_after_listings: Option<u32>,
    failing_listings: u32,
    reject_credentials: bool,
    calls: Vec<String>,
    drafts: Vec<ServerDraft>,
}

impl FakeServers {
    fn check(&mut self, call: String) -> Result<(), ProviderError> {
        self.calls.push(call);
        if self.reject_credentials {
            return Err(ProviderError::Authentication {
                status: 401,
                message: String::from("denied_authentication"),
            });
        }
        Ok(())
    }

    fn server_mut(&mut self, zone: &Zone, id: &ServerId) -> Result<&mut FakeServer, ProviderError> {
        self.servers
            .iter_mut()
            .find(|server| server.zone == zone.as_str() && &server.snapshot.id == id)
            .ok_or_else(|| ProviderError::NotFound {
                resource: format!("server {id}"),
            })
    }

    fn begin_removal(&mut self, zone: &Zone, id: &ServerId) -> Result<(), ProviderError> {
        let removal = self
            .removed_after_listings
            .map_or(Removal::Never, Removal::After);
        let server = self.server_mut(zone, id)?;
        server.removal = removal;
        server.snapshot.state = "stopping".into();
        server.snapshot.allowed_actions.clear();
        Ok(())
    }

    fn list(&mut self, zone: &Zone) -> Vec<ServerSnapshot> {
        self.servers.retain(|server| server.removal != Removal::After(0));
        let mut listing = Vec::new();
        for server in self
            .servers
            .iter_mut()
            .filter(|server| server.zone == zone.as_str())
        {
            match server.removal {
                Removal::After(remaining) => {
                    server.removal = Removal::After(remaining.saturating_sub(1));
                }
                Removal::Pending if server.powered && !server.never_ready => {
                    if server.listings_until_ip == 0 {
                        server.snapshot.state = "running".into();
                        server.snapshot.public_ip = Some(server.address.clone());
                        server.snapshot.allowed_actions =
                            vec![Action::from("poweroff"), Action::terminate()];
                    } else {
                        server.listings_until_ip -= 1;
                    }
                }
                Removal::Pending if server.powered => {
                    server.snapshot.state = "running".into();
                    server.snapshot.allowed_actions = vec![Action::terminate()];
                }
                Removal::Pending | Removal::Never => {}
            }
            listing.push(ServerSnapshot {
                volumes: Vec::new(),
                ..server.snapshot.clone()
            });
        }
        listing
    }
}

/// In-memory [`ServerApi`] simulating Scaleway's asynchronous behaviour.
///
/// Servers are created stopped and without an address; once powered on they
/// receive `192.0.2.<n>` (in creation order) after a configurable number of
/// listings. Terminated servers disappear after a configurable number of
/// listings.
#[derive(Clone, Debug)]
pub struct FakeServerApi {
    state: Arc<Mutex<FakeServers>>,
}

impl Default for FakeServerApi {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeServerApi {
    /// Creates an empty fake where addresses appear on the first listing
    /// after power-on and terminated servers vanish on the next listing.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeServers {
                removed_after_listings: Some(0),
                ..FakeServers::default()
            })),
        }
    }

    /// Registers an SSH key name.
    #[must_use]
    pub fn with_ssh_key(self, name: &str) -> Self {
        locked(&self.state).ssh_keys.insert(name.to_owned());
        self
    }

    /// Seeds a running server with a public address.
    #[must_use]
    pub fn with_server(self, zone: &str, name: &str, address: &str) -> Self {
        {
            let mut state = locked(&self.state);
            state.next_id = state.next_id.saturating_add(1);
            let id = format!("srv-{}", state.next_id);
            state.servers.push(FakeServer {
                zone: zone.to_owned(),
                snapshot: ServerSnapshot {
                    id: id.into(),
                    name: name.to_owned(),
                    state: "running".into(),
                    allowed_actions: vec![Action::from("poweroff"), Action::terminate()],
                    public_ip: Some(address.to_owned()),
                    volumes: Vec::new(),
                },
                address: address.to_owned(),
                powered: true,
                never_ready: false,
                listings_until_ip: 0,
                removal: Removal::Pending,
            });
        }
        self
    }

    /// The named server boots but never receives a public address.
    #[must_use]
    pub fn never_ready(self, name: &str) -> Self {
        locked(&self.state).never_ready.insert(name.to_owned());
        self
    }

    /// Number of listings after power-on that still show no address.
    #[must_use]
    pub fn ip_after_listings(self, listings: u32) -> Self {
        locked(&self.state).ip_after_listings = listings;
        self
    }

    /// Number of listings that still show a server after termination.
    #[must_use]
    pub fn removed_after_listings(self, listings: u32) -> Self {
        locked(&self.state).removed_after_listings = Some(listings);
        self
    }

    /// The next `listings` listings fail with a transient error.
    #[must_use]
    pub fn failing_listings(self, listings: u32) -> Self {
        locked(&self.state).failing_listings = listings;
        self
    }

    /// Terminated servers stay listed forever.
    #[must_use]
    pub fn never_removed(self) -> Self {
        locked(&self.state).removed_after_listings = None;
        self
    }

    /// Every call fails with an authentication error.
    #[must_use]
    pub fn reject_credentials(self) -> Self {
        locked(&self.state).reject_credentials = true;
        self
    }

    /// Returns every call made so far, such as `create web-0`.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        locked(&self.state).calls.clone()
    }

    /// Counts calls starting with `prefix`.
    #[must_use]
    pub fn count(&self, prefix: &str) -> usize {
        locked(&self.state)
            .calls
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    /// Returns every creation request received.
    #[must_use]
    pub fn drafts(&self) -> Vec<ServerDraft> {
        locked(&self.state).drafts.clone()
    }
}

impl ServerApi for FakeServerApi {
    fn list_servers<'a>(
        &'a self,
        _cancel: &'a CancellationToken,
        zone: &'a Zone,
    ) -> ProviderFuture<'a, Vec<ServerSnapshot>> {
        let result = {
            let mut state = locked(&self.state);
            state.check(format!("list {zone}")).and_then(|()| {
                if state.failing_listings > 0 {
                    state.failing_listings -= 1;
                    return Err(ProviderError::Transient {
                        attempts: 3,
                        message: String::from("status 503: service unavailable"),
                    });
                }
                Ok(state.list(zone))
            })
        };
        Box::pin(async move { result })
    }

    fn create_server<'a>(
        &'a self,
        _cancel: &'a CancellationToken,
        zone: &'a Zone,
        draft: &'a ServerDraft,
    ) -> ProviderFuture<'a, ServerSnapshot> {
        let result = {
            let mut state = locked(&self.state);
            state.check(format!("create {}", draft.name)).map(|()| {
                state.drafts.push(draft.clone());
                state.next_id = state.next_id.saturating_add(1);
                let number = state.next_id;
                let snapshot = ServerSnapshot {
                    id: format!("srv-{number}").into(),
                    name: draft.name.clone(),
                    state: "stopped".into(),
                    allowed_actions: vec![Action::power_on()],
                    public_ip: None,
                    volumes: draft
                        .volumes
                        .iter()
                        .enumerate()
                        .map(|(index, volume)| AttachedVolume {
                            id: format!("vol-{number}-{index}"),
                            name: volume.name.clone(),
                        })
                        .collect(),
                };
                let never_ready = state.never_ready.contains(&draft.name);
                let listings_until_ip = state.ip_after_listings;
                state.servers.push(FakeServer {
                    zone: zone.as_str().to_owned(),
                    snapshot: snapshot.clone(),
                    address: format!("192.0.2.{number}"),
                    powered: false,
                    never_ready,
                    listings_until_ip,
                    removal: Removal::Pending,
                });
                snapshot
            })
        };
        Box::pin(async move { result })
    }

    fn perform_action<'a>(
        &'a self,
        _cancel: &'a CancellationToken,
        zone: &'a Zone,
        id: &'a ServerId,
        action: &'a Action,
    ) -> ProviderFuture<'a, ()> {
        let result = {
            let mut state = locked(&self.state);
            state.check(format!("{action} {id}")).and_then(|()| {
                if action == &Action::terminate() {
                    return state.begin_removal(zone, id);
                }
                let server = state.server_mut(zone, id)?;
                if action == &Action::power_on() {
                    server.powered = true;
                    server.snapshot.state = "starting".into();
                }
                Ok(())
            })
        };
        Box::pin(async move { result })
    }

    fn delete_server<'a>(
        &'a self,
        _cancel: &'a CancellationToken,
        zone: &'a Zone,
        id: &'a ServerId,
    ) -> ProviderFuture<'a, ()> {
        let result = {
            let mut state = locked(&self.state);
            state
                .check(format!("delete {id}"))
                .and_then(|()| state.begin_removal(zone, id))
        };
        Box::pin(async move { result })
    }

    fn find_ssh_key<'a>(
        &'a self,
        _cancel: &'a CancellationToken,
        name: &'a str,
    ) -> ProviderFuture<'a, Option<String>> {
        let result = {
            let mut state = locked(&self.state);
            state
                .check(format!("find_ssh_key {name}"))
                .map(|()| state.ssh_keys.contains(name).then(|| format!("key-{name}")))
        };
        Box::pin(async move { result })
    }

    fn resolve_image<'a>(
        &'a self,
        _cancel: &'a CancellationToken,
        _zone: &'a Zone,
        image: &'a str,
    ) -> ProviderFuture<'a, String> {
        let result = {
            let mut state = locked(&self.state);
            state
                .check(format!("resolve_image {image}"))
                .map(|()| format!("img-{image}"))
        };
        Box::pin(async move { result })
    }

    fn check_credentials<'a>(&'a self, _cancel: &'a CancellationToken) -> ProviderFuture<'a, ()> {
        let result = locked(&self.state).check(String::from("check_credentials"));
        Box::pin(async move { result })
    }
}

// -----------------------------------------------------------------------------
// Events and provisioning
// -----------------------------------------------------------------------------

/// Event handler that records every event it receives.
#[derive(Clone, Debug, Default)]
pub struct RecordingHandler {
    name: String,
    delay: Duration,
    events: Arc<Mutex<Vec<Event>>>,
}

impl RecordingHandler {
    /// Creates a recorder.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            ..Self::default()
        }
    }

    /// Sleeps for `delay` before recording each event.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Returns the recorded events in arrival order.
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        locked(&self.events).clone()
    }

    /// Returns the job identifiers of the recorded events.
    #[must_use]
    pub fn job_ids(&self) -> Vec<u64> {
        locked(&self.events).iter().map(|event| event.job_id).collect()
    }
}

impl EventHandler for RecordingHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle<'a>(&'a self, _cancel: &'a CancellationToken, event: Event) -> HandlerFuture<'a> {
        Box::pin(async move {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            locked(&self.events).push(event);
            Ok::<(), HandlerError>(())
        })
    }
}

/// Job repository backed by a map.
#[derive(Clone, Debug, Default)]
pub struct InMemoryJobRepository {
    jobs: Arc<Mutex<HashMap<u64, Vec<InstanceInfo>>>>,
}

impl InMemoryJobRepository {
    /// Creates an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the instances persisted for `job_id`.
    pub fn insert(&self, job_id: u64, instances: Vec<InstanceInfo>) {
        locked(&self.jobs).insert(job_id, instances);
    }
}

impl JobRepository for InMemoryJobRepository {
    fn get_by_job_id(&self, job_id: u64) -> ProvisioningFuture<'_, Vec<InstanceInfo>> {
        let instances = locked(&self.jobs).get(&job_id).cloned().unwrap_or_default();
        Box::pin(async move { Ok(instances) })
    }
}

/// Invocation captured by [`RecordingRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RunnerCall {
    /// Job the run was for.
    pub job_id: u64,
    /// Inventory path handed to the runner.
    pub inventory: Utf8PathBuf,
    /// Inventory contents at the time of the run.
    pub contents: String,
}

/// Provisioning runner that records its invocations.
#[derive(Clone, Debug, Default)]
pub struct RecordingRunner {
    calls: Arc<Mutex<Vec<RunnerCall>>>,
    fail: bool,
}

impl RecordingRunner {
    /// Creates a runner that succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a runner that records, then fails every run.
    #[must_use]
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Returns the recorded invocations.
    #[must_use]
    pub fn calls(&self) -> Vec<RunnerCall> {
        locked(&self.calls).clone()
    }
}

impl ProvisioningRunner for RecordingRunner {
    fn run<'a>(
        &'a self,
        _cancel: &'a CancellationToken,
        job: &'a JobRef,
        inventory: &'a Utf8Path,
    ) -> ProvisioningFuture<'a, ()> {
        Box::pin(async move {
            let contents = std::fs::read_to_string(inventory).unwrap_or_default();
            locked(&self.calls).push(RunnerCall {
                job_id: job.id,
                inventory: inventory.to_owned(),
                contents,
            });
            if self.fail {
                return Err(ProvisioningError::Runner(String::from(
                    "playbook exited with status 2",
                )));
            }
            Ok(())
        })
    }
}

// -----------------------------------------------------------------------------
// Environment
// -----------------------------------------------------------------------------

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: AsyncMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets and removes environment variables while holding a global mutex.
    ///
    /// `None` values remove the variable for the guard's lifetime.
    pub async fn set_vars(pairs: &[(&str, Option<&str>)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe {
                match value {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}

/// Builds a ready instance record for tests.
#[must_use]
pub fn instance(name: &str, address: IpAddr, region: &str) -> InstanceInfo {
    InstanceInfo {
        id: format!("id-{name}"),
        name: name.to_owned(),
        public_ip: address,
        region: region.to_owned(),
        size: String::from("s-1vcpu-1gb"),
        volumes: Vec::new(),
        disk_size_gb: None,
    }
}
