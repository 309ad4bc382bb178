//! BDD scenarios for deployment restores.

use rstest_bdd_macros::scenario;

use crate::deployment::{DeploymentContext, deployment_context};

#[scenario(
    path = "tests/features/restore.feature",
    name = "Restore the data a backup produced"
)]
fn scenario_restore_roundtrip(deployment_context: DeploymentContext) {
    let _ = deployment_context;
}

#[scenario(
    path = "tests/features/restore.feature",
    name = "Refuse to restore into a deployment missing an instance"
)]
fn scenario_missing_instance(deployment_context: DeploymentContext) {
    let _ = deployment_context;
}

#[scenario(
    path = "tests/features/restore.feature",
    name = "Refuse to restore when an instance cannot restore"
)]
fn scenario_not_restorable(deployment_context: DeploymentContext) {
    let _ = deployment_context;
}

#[scenario(
    path = "tests/features/restore.feature",
    name = "Detect corruption after upload"
)]
fn scenario_corruption_after_upload(deployment_context: DeploymentContext) {
    let _ = deployment_context;
}
