//! Shared fixtures for lifecycle BDD scenarios.

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use hostwright::test_support::{
    FakeServerApi, InMemoryJobRepository, RecordingHandler, RecordingRunner,
};
use hostwright::{
    AnsibleInventoryWriter, EventBus, EventBusConfig, EventKind, InstanceConfig, InstanceInfo,
    Lifecycle, PollPolicy, ProviderError, ProvisioningSubscriber, ScalewayConfig,
    ScalewayProvider, ScalewayTiming,
};
use rstest::fixture;
use tempfile::TempDir;
use tokio::runtime::Runtime;

#[derive(Clone, Debug)]
pub struct LifecycleContext {
    pub runtime: Arc<Runtime>,
    pub api: FakeServerApi,
    pub bus: EventBus,
    pub recorder: RecordingHandler,
    pub runner: RecordingRunner,
    pub inventories: AnsibleInventoryWriter,
    pub outcome: Option<Outcome>,
    _inventory_tmp: Arc<TempDir>,
}

#[derive(Clone, Debug)]
pub enum Outcome {
    Created(Vec<InstanceInfo>),
    Deleted(Vec<InstanceInfo>),
    Failed(ProviderError),
}

impl LifecycleContext {
    pub fn lifecycle(&self) -> Lifecycle {
        let provider = ScalewayProvider::with_api(self.api.clone(), config(), timing());
        Lifecycle::new(Arc::new(provider), self.bus.clone())
    }
}

#[fixture]
pub fn lifecycle_context() -> LifecycleContext {
    let runtime = Arc::new(
        Runtime::new().unwrap_or_else(|err| panic!("tokio runtime should start: {err}")),
    );
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let root = Utf8PathBuf::from_path_buf(tmp.path().join("inventories"))
        .unwrap_or_else(|err| panic!("temp path should be utf8: {}", err.display()));
    let inventories = AnsibleInventoryWriter::new(root);
    let recorder = RecordingHandler::new("recorder");
    let runner = RecordingRunner::new();

    let bus = {
        let _entered = runtime.enter();
        EventBus::new(EventBusConfig::default())
    };
    bus.subscribe(EventKind::Created, Arc::new(recorder.clone()));
    bus.subscribe(EventKind::Deleted, Arc::new(recorder.clone()));
    bus.subscribe(
        EventKind::Created,
        Arc::new(ProvisioningSubscriber::new(
            Arc::new(InMemoryJobRepository::new()),
            Arc::new(inventories.clone()),
            Arc::new(runner.clone()),
        )),
    );

    LifecycleContext {
        runtime,
        api: FakeServerApi::new(),
        bus,
        recorder,
        runner,
        inventories,
        outcome: None,
        _inventory_tmp: Arc::new(tmp),
    }
}

fn config() -> ScalewayConfig {
    ScalewayConfig {
        secret_key: String::from("scw-secret"),
        default_project_id: String::from("project-1"),
        default_organization_id: None,
        default_architecture: String::from("x86_64"),
        api_url: String::from("https://api.scaleway.test"),
    }
}

fn timing() -> ScalewayTiming {
    ScalewayTiming {
        batch_size: 10,
        batch_delay: Duration::from_millis(10),
        ready: PollPolicy::new(Duration::from_millis(10), 3),
        absence: PollPolicy::new(Duration::from_millis(10), 3),
        cache_ttl: Duration::from_secs(30),
    }
}

pub fn request(count: u32) -> InstanceConfig {
    InstanceConfig::builder()
        .region("nyc1")
        .size("s-1vcpu-1gb")
        .image("ubuntu-22-04-x64")
        .ssh_key_name("k1")
        .number_of_instances(count)
        .build()
        .unwrap_or_else(|err| panic!("request fixture should be valid: {err}"))
}
