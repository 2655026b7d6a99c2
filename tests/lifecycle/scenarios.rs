//! BDD scenarios for lifecycle orchestration.

use rstest_bdd_macros::scenario;

use super::test_helpers::{LifecycleContext, lifecycle_context};

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Create publishes ready instances and provisions them"
)]
fn scenario_create_publishes(lifecycle_context: LifecycleContext) {
    let _ = lifecycle_context;
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Drop instances that never receive an address"
)]
fn scenario_partial_batch(lifecycle_context: LifecycleContext) {
    let _ = lifecycle_context;
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Delete confirms absence and publishes the removal"
)]
fn scenario_delete_publishes(lifecycle_context: LifecycleContext) {
    let _ = lifecycle_context;
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Report instances that never disappear"
)]
fn scenario_lingering_instance(lifecycle_context: LifecycleContext) {
    let _ = lifecycle_context;
}
