//! BDD step definitions for create and delete orchestration.

use std::net::{IpAddr, Ipv4Addr};

use hostwright::test_support::instance;
use hostwright::{EventKind, JobRef, ProviderError};
use rstest_bdd_macros::{given, then, when};
use tokio_util::sync::CancellationToken;

use super::test_helpers::{LifecycleContext, Outcome, request};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("invalid step argument: {0}")]
    Argument(String),
    #[error("assertion failed: {0}")]
    Assertion(String),
}

fn job(id: u64) -> JobRef {
    JobRef::new(id, "site", 3)
}

#[given("a Scaleway account with the ssh key \"{key}\"")]
fn account_with_key(mut lifecycle_context: LifecycleContext, key: String) -> LifecycleContext {
    lifecycle_context.api = lifecycle_context.api.with_ssh_key(&key);
    lifecycle_context
}

#[given("server \"{name}\" never receives an address")]
fn server_never_ready(mut lifecycle_context: LifecycleContext, name: String) -> LifecycleContext {
    lifecycle_context.api = lifecycle_context.api.never_ready(&name);
    lifecycle_context
}

#[given("a running server \"{name}\" at \"{address}\" in \"{zone}\"")]
fn running_server(
    mut lifecycle_context: LifecycleContext,
    name: String,
    address: String,
    zone: String,
) -> LifecycleContext {
    lifecycle_context.api = lifecycle_context.api.with_server(&zone, &name, &address);
    lifecycle_context
}

#[given("deleted servers never disappear")]
fn servers_linger(mut lifecycle_context: LifecycleContext) -> LifecycleContext {
    lifecycle_context.api = lifecycle_context.api.never_removed();
    lifecycle_context
}

#[when("I create \"{count}\" instances named \"{name}\" for job \"{job_id}\"")]
fn create_instances(
    lifecycle_context: LifecycleContext,
    count: u32,
    name: String,
    job_id: u64,
) -> LifecycleContext {
    let lifecycle = lifecycle_context.lifecycle();
    let bus = lifecycle_context.bus.clone();
    let config = request(count);
    let result = lifecycle_context.runtime.block_on(async move {
        let created = lifecycle
            .create(&CancellationToken::new(), &job(job_id), &name, &config)
            .await;
        bus.shutdown().await;
        created
    });

    LifecycleContext {
        outcome: Some(result.map_or_else(Outcome::Failed, Outcome::Created)),
        ..lifecycle_context
    }
}

#[when("I delete instance \"{name}\" in \"{region}\" for job \"{job_id}\"")]
fn delete_instance(
    lifecycle_context: LifecycleContext,
    name: String,
    region: String,
    job_id: u64,
) -> LifecycleContext {
    let lifecycle = lifecycle_context.lifecycle();
    let bus = lifecycle_context.bus.clone();
    let target = vec![instance(&name, IpAddr::V4(Ipv4Addr::UNSPECIFIED), &region)];
    let result = lifecycle_context.runtime.block_on(async move {
        let deleted = lifecycle
            .delete(&CancellationToken::new(), &job(job_id), &target)
            .await;
        bus.shutdown().await;
        deleted
    });

    LifecycleContext {
        outcome: Some(result.map_or_else(Outcome::Failed, Outcome::Deleted)),
        ..lifecycle_context
    }
}

fn created(lifecycle_context: &LifecycleContext) -> Result<&[hostwright::InstanceInfo], StepError> {
    match &lifecycle_context.outcome {
        Some(Outcome::Created(instances)) => Ok(instances),
        other => Err(StepError::Assertion(format!(
            "expected created instances, got {other:?}"
        ))),
    }
}

#[then("\"{count}\" instances are returned")]
fn instances_returned(lifecycle_context: &LifecycleContext, count: usize) -> Result<(), StepError> {
    let instances = created(lifecycle_context)?;
    if instances.len() == count {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {count} instances, got {}",
            instances.len()
        )))
    }
}

#[then("instance \"{name}\" is reachable at \"{address}\" in \"{region}\"")]
fn instance_reachable(
    lifecycle_context: &LifecycleContext,
    name: String,
    address: String,
    region: String,
) -> Result<(), StepError> {
    let expected: IpAddr = address
        .parse()
        .map_err(|err| StepError::Argument(format!("{address}: {err}")))?;
    let instances = created(lifecycle_context)?;
    let found = instances
        .iter()
        .find(|candidate| candidate.name == name)
        .ok_or_else(|| StepError::Assertion(format!("instance {name} missing")))?;
    if found.public_ip == expected && found.region == region {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "unexpected placement for {name}: {} in {}",
            found.public_ip, found.region
        )))
    }
}

#[then("a created event for job \"{job_id}\" lists \"{count}\" instances")]
fn created_event_published(
    lifecycle_context: &LifecycleContext,
    job_id: u64,
    count: usize,
) -> Result<(), StepError> {
    let events = lifecycle_context.recorder.events();
    let [event] = events.as_slice() else {
        return Err(StepError::Assertion(format!(
            "expected one event, got {}",
            events.len()
        )));
    };
    if event.kind == EventKind::Created
        && event.job_id == job_id
        && event.instances.len() == count
        && event.requests.len() == 1
    {
        Ok(())
    } else {
        Err(StepError::Assertion(format!("unexpected event: {event:?}")))
    }
}

#[then("the inventory for job \"{job_id}\" lists \"{name}\" at \"{address}\"")]
fn inventory_written(
    lifecycle_context: &LifecycleContext,
    job_id: u64,
    name: String,
    address: String,
) -> Result<(), StepError> {
    let path = lifecycle_context.inventories.inventory_path(job_id);
    let contents = std::fs::read_to_string(&path)
        .map_err(|err| StepError::Assertion(format!("read {path}: {err}")))?;
    let expected = format!("{name} ansible_host={address} ansible_user=root");
    if !contents.lines().any(|line| line == expected) {
        return Err(StepError::Assertion(format!(
            "inventory {path} is missing '{expected}': {contents}"
        )));
    }
    let runs = lifecycle_context.runner.calls();
    if runs.len() == 1 && runs.iter().all(|run| run.inventory == path) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!("unexpected provisioning runs: {runs:?}")))
    }
}

#[then("the deletion succeeds")]
fn deletion_succeeds(lifecycle_context: &LifecycleContext) -> Result<(), StepError> {
    match &lifecycle_context.outcome {
        Some(Outcome::Deleted(removed)) if removed.len() == 1 => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected one removed instance, got {other:?}"
        ))),
    }
}

#[then("a deleted event for job \"{job_id}\" lists \"{name}\"")]
fn deleted_event_published(
    lifecycle_context: &LifecycleContext,
    job_id: u64,
    name: String,
) -> Result<(), StepError> {
    let events = lifecycle_context.recorder.events();
    let [event] = events.as_slice() else {
        return Err(StepError::Assertion(format!(
            "expected one event, got {}",
            events.len()
        )));
    };
    let names: Vec<&str> = event
        .instances
        .iter()
        .map(|removed| removed.name.as_str())
        .collect();
    if event.kind == EventKind::Deleted && event.job_id == job_id && names == [name.as_str()] {
        Ok(())
    } else {
        Err(StepError::Assertion(format!("unexpected event: {event:?}")))
    }
}

#[then("the deletion fails because \"{name}\" still exists in \"{region}\"")]
fn deletion_reports_lingering(
    lifecycle_context: &LifecycleContext,
    name: String,
    region: String,
) -> Result<(), StepError> {
    match &lifecycle_context.outcome {
        Some(Outcome::Failed(ProviderError::StillExists {
            name: actual_name,
            region: actual_region,
            attempts: 3,
        })) if *actual_name == name && *actual_region == region => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected a still-exists failure, got {other:?}"
        ))),
    }
}

#[then("no deleted event is published")]
fn no_deleted_event(lifecycle_context: &LifecycleContext) -> Result<(), StepError> {
    let events = lifecycle_context.recorder.events();
    if events.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!("unexpected events: {events:?}")))
    }
}
