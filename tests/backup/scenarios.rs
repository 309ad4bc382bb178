//! BDD scenarios for deployment backups.

use rstest_bdd_macros::scenario;

use crate::deployment::{DeploymentContext, deployment_context};

#[scenario(
    path = "tests/features/backup.feature",
    name = "Back up a healthy deployment"
)]
fn scenario_back_up_healthy_deployment(deployment_context: DeploymentContext) {
    let _ = deployment_context;
}

#[scenario(
    path = "tests/features/backup.feature",
    name = "A lock failure still backs up and unlocks everyone"
)]
fn scenario_lock_failure_continues(deployment_context: DeploymentContext) {
    let _ = deployment_context;
}

#[scenario(
    path = "tests/features/backup.feature",
    name = "Fail fast skips the backup phase after a lock failure"
)]
fn scenario_fail_fast(deployment_context: DeploymentContext) {
    let _ = deployment_context;
}

#[scenario(
    path = "tests/features/backup.feature",
    name = "Refuse to overwrite an existing artifact"
)]
fn scenario_existing_artifact(deployment_context: DeploymentContext) {
    let _ = deployment_context;
}

#[scenario(
    path = "tests/features/backup.feature",
    name = "Reject a blob whose remote checksum disagrees"
)]
fn scenario_checksum_mismatch(deployment_context: DeploymentContext) {
    let _ = deployment_context;
}

#[scenario(
    path = "tests/features/backup.feature",
    name = "Cleanup failures do not fail the backup"
)]
fn scenario_advisory_cleanup(deployment_context: DeploymentContext) {
    let _ = deployment_context;
}
