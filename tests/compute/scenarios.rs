//! BDD scenarios for tagged node provisioning.

use rstest_bdd_macros::scenario;

use super::test_helpers::{ComputeContext, compute_context};

#[scenario(
    path = "tests/features/compute.feature",
    name = "Requested nodes come up running from the template"
)]
fn scenario_nodes_come_up(compute_context: ComputeContext) {
    drop(compute_context);
}

#[scenario(
    path = "tests/features/compute.feature",
    name = "A fresh client adds a node to an existing tag"
)]
fn scenario_fresh_client_adds_node(compute_context: ComputeContext) {
    drop(compute_context);
}

#[scenario(
    path = "tests/features/compute.feature",
    name = "A wrong login key is reported as an authentication failure"
)]
fn scenario_wrong_key(compute_context: ComputeContext) {
    drop(compute_context);
}

#[scenario(
    path = "tests/features/compute.feature",
    name = "Rebooting keeps node identity"
)]
fn scenario_reboot_identity(compute_context: ComputeContext) {
    drop(compute_context);
}

#[scenario(
    path = "tests/features/compute.feature",
    name = "Destroying a tag tolerates unsupported deletes"
)]
fn scenario_best_effort_destroy(compute_context: ComputeContext) {
    drop(compute_context);
}

#[scenario(
    path = "tests/features/compute.feature",
    name = "Resolving the same criteria twice yields equal templates"
)]
fn scenario_template_equality(compute_context: ComputeContext) {
    drop(compute_context);
}

#[scenario(
    path = "tests/features/compute.feature",
    name = "Rejected provider credentials stop the operation"
)]
fn scenario_rejected_credentials(compute_context: ComputeContext) {
    drop(compute_context);
}
