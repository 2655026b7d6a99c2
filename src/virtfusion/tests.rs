//! Unit tests for the VirtFusion provider over a scripted transport.

use std::net::{IpAddr, Ipv4Addr};

use rstest::{fixture, rstest};
use serde_json::{Value, json};

use super::*;
use crate::provider::VolumeConfig;
use crate::test_support::ScriptedTransport;

fn config() -> VirtFusionConfig {
    VirtFusionConfig {
        api_url: String::from("https://vf.example.test/api/v1"),
        api_token: String::from("vf-token"),
        user_id: 42,
    }
}

#[fixture]
fn timing() -> VirtFusionTiming {
    VirtFusionTiming {
        batch_size: 10,
        batch_delay: Duration::from_secs(1),
        ready: PollPolicy::new(Duration::from_secs(1), 3),
        absence: PollPolicy::new(Duration::from_secs(1), 3),
        cache_ttl: Duration::from_secs(30),
    }
}

fn provider(transport: &ScriptedTransport, timing: VirtFusionTiming) -> VirtFusionProvider {
    VirtFusionProvider::with_transport(
        config(),
        Arc::new(transport.clone()),
        RetryPolicy::default(),
        timing,
    )
    .unwrap_or_else(|err| panic!("provider should build: {err}"))
}

fn request(count: u32) -> InstanceConfig {
    InstanceConfig::builder()
        .region("3")
        .size("4")
        .image("12")
        .ssh_key_name("k1")
        .number_of_instances(count)
        .volume(VolumeConfig::new("root", 20, "/"))
        .volume(VolumeConfig::new("data", 10, "/mnt/data"))
        .build()
        .unwrap_or_else(|err| panic!("request should be valid: {err}"))
}

fn complete(id: u64, name: &str, address: &str) -> Value {
    json!({"data": {
        "id": id,
        "name": name,
        "hypervisorId": 3,
        "state": "complete",
        "network": {"interfaces": [{"ipv4": [{"address": address}]}]}
    }})
}

fn building(id: u64) -> Value {
    json!({"data": {"id": id, "state": "building"}})
}

fn with_ssh_key(transport: &ScriptedTransport) {
    transport.respond(
        Method::GET,
        "ssh_keys/user/42",
        200,
        json!({"data": [{"id": 4, "name": "other"}, {"id": 5, "name": "k1"}]}),
    );
}

fn accept_servers(transport: &ScriptedTransport, ids: &[u64]) {
    for id in ids {
        transport.respond(Method::POST, "servers", 201, json!({"data": {"id": id}}));
        transport.respond(
            Method::POST,
            &format!("servers/{id}/build"),
            200,
            json!({"data": {"id": id}}),
        );
    }
}

fn body_of(transport: &ScriptedTransport, method: &Method, suffix: &str) -> Value {
    transport
        .requests()
        .into_iter()
        .find(|request| &request.method == method && request.url.ends_with(suffix))
        .and_then(|request| request.body)
        .unwrap_or_else(|| panic!("{method} {suffix} should carry a body"))
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn creates_and_builds_a_server(timing: VirtFusionTiming) {
    let transport = ScriptedTransport::new();
    with_ssh_key(&transport);
    accept_servers(&transport, &[101]);
    transport.respond(Method::GET, "servers/101", 200, building(101));
    transport.respond(Method::GET, "servers/101", 200, complete(101, "web-0", "192.0.2.1"));
    let provider = provider(&transport, timing);

    let instances = provider
        .create_instance(&CancellationToken::new(), "web", &request(1))
        .await
        .unwrap_or_else(|err| panic!("create should succeed: {err}"));

    assert_eq!(
        instances,
        vec![InstanceInfo {
            id: String::from("101"),
            name: String::from("web-0"),
            public_ip: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
            region: String::from("3"),
            size: String::from("4"),
            volumes: Vec::new(),
            disk_size_gb: Some(30),
        }]
    );
    assert_eq!(
        body_of(&transport, &Method::POST, "/servers"),
        json!({"packageId": 4, "userId": 42, "hypervisorId": 3, "ipv4": 1, "storage": 30})
    );
    assert_eq!(
        body_of(&transport, &Method::POST, "/servers/101/build"),
        json!({
            "operatingSystemId": 12,
            "name": "web-0",
            "hostname": "web-0",
            "sshKeys": [5],
            "email": false
        })
    );
    assert_eq!(transport.count(&Method::GET, "servers/101"), 2);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn requests_carry_the_bearer_token(timing: VirtFusionTiming) {
    let transport = ScriptedTransport::new();
    transport.respond(Method::GET, "ssh_keys/user/42", 200, json!({"data": []}));
    let provider = provider(&transport, timing);

    provider
        .validate_credentials()
        .await
        .unwrap_or_else(|err| panic!("credentials should validate: {err}"));

    let requests = transport.requests();
    let sent = requests.first().unwrap_or_else(|| panic!("request expected"));
    assert_eq!(sent.url, "https://vf.example.test/api/v1/ssh_keys/user/42");
    assert_eq!(sent.auth.name(), "Authorization");
    assert_eq!(sent.auth.value(), "Bearer vf-token");
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn unknown_servers_are_pending_while_building(timing: VirtFusionTiming) {
    let transport = ScriptedTransport::new();
    with_ssh_key(&transport);
    accept_servers(&transport, &[101]);
    transport.respond(Method::GET, "servers/101", 404, json!({"msg": "not found"}));
    transport.respond(Method::GET, "servers/101", 200, complete(101, "web-0", "192.0.2.1"));
    let provider = provider(&transport, timing);

    let instances = provider
        .create_instance(&CancellationToken::new(), "web", &request(1))
        .await
        .unwrap_or_else(|err| panic!("create should succeed: {err}"));

    assert_eq!(instances.len(), 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn drops_servers_whose_build_never_completes(timing: VirtFusionTiming) {
    let transport = ScriptedTransport::new();
    with_ssh_key(&transport);
    accept_servers(&transport, &[101, 102, 103]);
    transport.respond(Method::GET, "servers/101", 200, complete(101, "web-0", "192.0.2.1"));
    transport.respond(Method::GET, "servers/102", 200, building(102));
    transport.respond(Method::GET, "servers/103", 200, complete(103, "web-2", "192.0.2.3"));
    let provider = provider(&transport, timing);

    let instances = provider
        .create_instance(&CancellationToken::new(), "web", &request(3))
        .await
        .unwrap_or_else(|err| panic!("partial batch should succeed: {err}"));

    let names: Vec<&str> = instances.iter().map(|i| i.name.as_str()).collect();
    assert_eq!(names, vec!["web-0", "web-2"]);
    assert_eq!(transport.count(&Method::GET, "servers/102"), 3);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn splits_large_requests_into_batches(timing: VirtFusionTiming) {
    let transport = ScriptedTransport::new();
    with_ssh_key(&transport);
    let ids: Vec<u64> = (101..=112).collect();
    accept_servers(&transport, &ids);
    for (index, id) in ids.iter().enumerate() {
        transport.respond(
            Method::GET,
            &format!("servers/{id}"),
            200,
            complete(*id, &format!("web-{index}"), &format!("192.0.2.{index}")),
        );
    }
    let provider = provider(&transport, timing);
    let started = tokio::time::Instant::now();

    let instances = provider
        .create_instance(&CancellationToken::new(), "web", &request(12))
        .await
        .unwrap_or_else(|err| panic!("create should succeed: {err}"));

    assert_eq!(instances.len(), 12);
    assert_eq!(started.elapsed(), Duration::from_secs(1), "one pause between two batches");
    for id in &ids {
        assert_eq!(
            transport.count(&Method::GET, &format!("servers/{id}")),
            1,
            "server {id} should be polled once"
        );
    }

    let requests = transport.requests();
    let first_poll = requests
        .iter()
        .position(|request| request.method == Method::GET && request.url.ends_with("servers/101"))
        .unwrap_or_else(|| panic!("server 101 should be polled"));
    let eleventh_create = requests
        .iter()
        .enumerate()
        .filter(|(_, request)| request.method == Method::POST && request.url.ends_with("/servers"))
        .nth(10)
        .map(|(position, _)| position)
        .unwrap_or_else(|| panic!("eleven servers should be created"));
    assert!(first_poll < eleventh_create, "first batch is awaited first");
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn batch_builds_share_one_poll_budget(timing: VirtFusionTiming) {
    let transport = ScriptedTransport::new();
    with_ssh_key(&transport);
    accept_servers(&transport, &[101, 102, 103]);
    for id in [101, 102, 103] {
        transport.respond(Method::GET, &format!("servers/{id}"), 200, building(id));
    }
    let provider = provider(&transport, timing);
    let started = tokio::time::Instant::now();

    let instances = provider
        .create_instance(&CancellationToken::new(), "web", &request(3))
        .await
        .unwrap_or_else(|err| panic!("unready servers are dropped, not fatal: {err}"));

    assert!(instances.is_empty());
    assert_eq!(
        started.elapsed(),
        Duration::from_secs(2),
        "three polls one second apart, not one budget per server"
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn failed_build_lookups_leave_the_server_pending(timing: VirtFusionTiming) {
    let transport = ScriptedTransport::new();
    with_ssh_key(&transport);
    accept_servers(&transport, &[101, 102]);
    transport.respond(Method::GET, "servers/101", 200, complete(101, "web-0", "192.0.2.1"));
    for _ in 0..3 {
        transport.respond(Method::GET, "servers/102", 502, json!({"msg": "bad gateway"}));
    }
    transport.respond(Method::GET, "servers/102", 200, complete(102, "web-1", "192.0.2.2"));
    let provider = provider(&transport, timing);

    let instances = provider
        .create_instance(&CancellationToken::new(), "web", &request(2))
        .await
        .unwrap_or_else(|err| panic!("a failed lookup should not sink the batch: {err}"));

    let names: Vec<&str> = instances.iter().map(|i| i.name.as_str()).collect();
    assert_eq!(names, vec!["web-0", "web-1"]);
    assert_eq!(transport.count(&Method::GET, "servers/101"), 1);
    assert_eq!(transport.count(&Method::GET, "servers/102"), 4);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn build_lookups_failing_for_the_whole_budget_drop_only_that_server(
    timing: VirtFusionTiming,
) {
    let transport = ScriptedTransport::new();
    with_ssh_key(&transport);
    accept_servers(&transport, &[101, 102]);
    transport.respond(Method::GET, "servers/101", 200, complete(101, "web-0", "192.0.2.1"));
    transport.fail(Method::GET, "servers/102", "connection reset");
    let provider = provider(&transport, timing);

    let instances = provider
        .create_instance(&CancellationToken::new(), "web", &request(2))
        .await
        .unwrap_or_else(|err| panic!("partial batch should succeed: {err}"));

    let names: Vec<&str> = instances.iter().map(|i| i.name.as_str()).collect();
    assert_eq!(names, vec!["web-0"]);
}

#[rstest]
#[case::non_numeric_region(InstanceConfig { region: String::from("nyc1"), ..request(1) })]
#[case::non_numeric_image(InstanceConfig { image: String::from("ubuntu"), ..request(1) })]
#[case::non_numeric_package(InstanceConfig { size: Some(String::from("small")), ..request(1) })]
#[case::no_volumes(InstanceConfig { volumes: Vec::new(), ..request(1) })]
#[tokio::test(start_paused = true)]
async fn invalid_requests_fail_before_any_call(
    timing: VirtFusionTiming,
    #[case] invalid: InstanceConfig,
) {
    let transport = ScriptedTransport::new();
    let provider = provider(&transport, timing);

    let result = provider
        .create_instance(&CancellationToken::new(), "web", &invalid)
        .await;

    assert!(matches!(result, Err(ProviderError::Validation(_))));
    assert!(transport.requests().is_empty());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn shape_requests_send_memory_and_cores(timing: VirtFusionTiming) {
    let transport = ScriptedTransport::new();
    with_ssh_key(&transport);
    accept_servers(&transport, &[101]);
    transport.respond(Method::GET, "servers/101", 200, complete(101, "web-0", "192.0.2.1"));
    let provider = provider(&transport, timing);
    let config = InstanceConfig::builder()
        .region("3")
        .shape(2048, 2)
        .image("12")
        .ssh_key_name("k1")
        .volume(VolumeConfig::new("root", 25, "/"))
        .build()
        .unwrap_or_else(|err| panic!("request should be valid: {err}"));

    let instances = provider
        .create_instance(&CancellationToken::new(), "web", &config)
        .await
        .unwrap_or_else(|err| panic!("create should succeed: {err}"));

    assert_eq!(
        body_of(&transport, &Method::POST, "/servers"),
        json!({
            "userId": 42,
            "hypervisorId": 3,
            "ipv4": 1,
            "storage": 25,
            "memory": 2048,
            "cores": 2
        })
    );
    assert_eq!(
        instances.first().map(|instance| instance.size.as_str()),
        Some("2048mb-2vcpu")
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn missing_ssh_key_is_not_found(timing: VirtFusionTiming) {
    let transport = ScriptedTransport::new();
    transport.respond(Method::GET, "ssh_keys/user/42", 200, json!({"data": []}));
    let provider = provider(&transport, timing);

    let result = provider
        .create_instance(&CancellationToken::new(), "web", &request(1))
        .await;

    assert_eq!(result, Err(ProviderError::not_found("ssh key k1")));
    assert_eq!(transport.count(&Method::POST, "servers"), 0);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn authentication_failures_are_not_retried(timing: VirtFusionTiming) {
    let transport = ScriptedTransport::new();
    transport.respond(Method::GET, "ssh_keys/user/42", 401, json!({"msg": "unauthenticated"}));
    let provider = provider(&transport, timing);

    let result = provider
        .create_instance(&CancellationToken::new(), "web", &request(1))
        .await;

    assert!(matches!(
        result,
        Err(ProviderError::Authentication { status: 401, .. })
    ));
    assert_eq!(transport.count(&Method::GET, "ssh_keys/user/42"), 1);
}

fn listing(servers: &Value) -> Value {
    json!({"data": servers})
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn deletes_the_server_on_the_named_hypervisor(timing: VirtFusionTiming) {
    let transport = ScriptedTransport::new();
    transport.respond(
        Method::GET,
        "servers/user/42",
        200,
        listing(&json!([
            {"id": 101, "name": "web-0", "hypervisorId": 3},
            {"id": 102, "name": "web-0", "hypervisorId": 4}
        ])),
    );
    transport.respond(Method::DELETE, "servers/101", 204, Value::Null);
    transport.respond(Method::GET, "servers/101", 200, json!({"data": {"id": 101, "state": "deleting"}}));
    transport.respond(Method::GET, "servers/101", 404, json!({"msg": "not found"}));
    let provider = provider(&transport, timing);

    provider
        .delete_instance(&CancellationToken::new(), "web-0", "3")
        .await
        .unwrap_or_else(|err| panic!("delete should succeed: {err}"));

    assert_eq!(transport.count(&Method::DELETE, "servers/101"), 1);
    assert_eq!(transport.count(&Method::DELETE, "servers/102"), 0);
    assert_eq!(transport.count(&Method::GET, "servers/101"), 2);
    assert!(
        transport
            .requests()
            .iter()
            .any(|request| request.url.ends_with("servers/101?delay=0"))
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn deletion_finds_servers_past_the_first_page(timing: VirtFusionTiming) {
    let transport = ScriptedTransport::new();
    transport.respond(
        Method::GET,
        "servers/user/42",
        200,
        json!({
            "current_page": 1,
            "last_page": 2,
            "data": [{"id": 101, "name": "web-0", "hypervisorId": 3}]
        }),
    );
    transport.respond(
        Method::GET,
        "servers/user/42",
        200,
        json!({
            "current_page": 2,
            "last_page": 2,
            "data": [{"id": 250, "name": "web-9", "hypervisorId": 3}]
        }),
    );
    transport.respond(Method::DELETE, "servers/250", 204, Value::Null);
    transport.respond(Method::GET, "servers/250", 404, json!({"msg": "not found"}));
    let provider = provider(&transport, timing);

    provider
        .delete_instance(&CancellationToken::new(), "web-9", "3")
        .await
        .unwrap_or_else(|err| panic!("server on page two should be deleted: {err}"));

    assert_eq!(transport.count(&Method::GET, "servers/user/42"), 2);
    assert_eq!(transport.count(&Method::DELETE, "servers/250"), 1);
    assert!(
        transport
            .requests()
            .iter()
            .any(|request| request.url.ends_with("servers/user/42?results=200&page=2"))
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn lingering_servers_are_reported_as_still_existing(timing: VirtFusionTiming) {
    let transport = ScriptedTransport::new();
    transport.respond(
        Method::GET,
        "servers/user/42",
        200,
        listing(&json!([{"id": 101, "name": "web-0", "hypervisorId": 3}])),
    );
    transport.respond(Method::DELETE, "servers/101", 204, Value::Null);
    transport.respond(Method::GET, "servers/101", 200, json!({"data": {"id": 101, "state": "deleting"}}));
    let provider = provider(&transport, timing);

    let result = provider
        .delete_instance(&CancellationToken::new(), "web-0", "3")
        .await;

    assert_eq!(
        result,
        Err(ProviderError::StillExists {
            name: String::from("web-0"),
            region: String::from("3"),
            attempts: 3,
        })
    );
}

#[rstest]
#[case::unknown_name("web-9", "3")]
#[case::other_hypervisor("web-0", "7")]
#[tokio::test(start_paused = true)]
async fn deleting_a_missing_instance_is_not_found(
    timing: VirtFusionTiming,
    #[case] name: &str,
    #[case] region: &str,
) {
    let transport = ScriptedTransport::new();
    transport.respond(
        Method::GET,
        "servers/user/42",
        200,
        listing(&json!([{"id": 101, "name": "web-0", "hypervisorId": 3}])),
    );
    let provider = provider(&transport, timing);

    let result = provider
        .delete_instance(&CancellationToken::new(), name, region)
        .await;

    assert!(matches!(result, Err(ProviderError::NotFound { .. })));
    assert_eq!(transport.count(&Method::DELETE, "servers/101"), 0);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn listings_are_cached_until_a_mutation(timing: VirtFusionTiming) {
    let transport = ScriptedTransport::new();
    transport.respond(Method::GET, "servers/user/42", 200, listing(&json!([])));
    transport.respond(
        Method::GET,
        "servers/user/42",
        200,
        listing(&json!([{"id": 101, "name": "web-0", "hypervisorId": 3}])),
    );
    with_ssh_key(&transport);
    accept_servers(&transport, &[101]);
    transport.respond(Method::GET, "servers/101", 200, complete(101, "web-0", "192.0.2.1"));
    transport.respond(Method::GET, "servers/101", 404, json!({"msg": "not found"}));
    transport.respond(Method::DELETE, "servers/101", 204, Value::Null);
    let provider = provider(&transport, timing);
    let cancel = CancellationToken::new();

    for _ in 0..2 {
        let missing = provider.delete_instance(&cancel, "web-0", "3").await;
        assert!(matches!(missing, Err(ProviderError::NotFound { .. })));
    }
    assert_eq!(transport.count(&Method::GET, "servers/user/42"), 1);

    provider
        .create_instance(&cancel, "web", &request(1))
        .await
        .unwrap_or_else(|err| panic!("create should succeed: {err}"));
    provider
        .delete_instance(&cancel, "web-0", "3")
        .await
        .unwrap_or_else(|err| panic!("fresh listing should find web-0: {err}"));

    assert_eq!(transport.count(&Method::GET, "servers/user/42"), 2);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn rejected_credentials_surface_as_authentication_errors(timing: VirtFusionTiming) {
    let transport = ScriptedTransport::new();
    transport.respond(Method::GET, "ssh_keys/user/42", 403, json!({"msg": "forbidden"}));
    let provider = provider(&transport, timing);

    assert!(matches!(
        provider.validate_credentials().await,
        Err(ProviderError::Authentication { status: 403, .. })
    ));
}

#[rstest]
fn environment_vars_expose_virtfusion_credentials(timing: VirtFusionTiming) {
    let provider = provider(&ScriptedTransport::new(), timing);

    let vars = provider.environment_vars();

    assert_eq!(
        vars.get("VIRTFUSION_API_URL").map(String::as_str),
        Some("https://vf.example.test/api/v1")
    );
    assert_eq!(vars.get("VIRTFUSION_API_TOKEN").map(String::as_str), Some("vf-token"));
    assert_eq!(vars.get("VIRTFUSION_USER_ID").map(String::as_str), Some("42"));
    assert_eq!(provider.name(), "virtfusion");
}

#[test]
fn blank_credentials_are_rejected() {
    let result = VirtFusionProvider::with_transport(
        VirtFusionConfig {
            api_token: String::new(),
            ..config()
        },
        Arc::new(ScriptedTransport::new()),
        RetryPolicy::default(),
        VirtFusionTiming::default(),
    );

    assert!(matches!(result, Err(ProviderError::Config(_))));
}
