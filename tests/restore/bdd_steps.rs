//! BDD step definitions for restore behaviour.

use fleetback::test_support::tar_with_files;
use fleetback::{BackupWorkflow, Instance, Phase, RestoreWorkflow};
use rstest_bdd_macros::{given, then, when};

use crate::deployment::{
    DeploymentContext, RunOutcome, StepError, outcome_of, parse_identifier,
};

#[given("the deployment has been backed up")]
fn deployment_has_been_backed_up(
    deployment_context: DeploymentContext,
) -> Result<DeploymentContext, StepError> {
    let workflow = BackupWorkflow::new(deployment_context.manager());
    DeploymentContext::block_on(workflow.run("redis", &deployment_context.artifact_path))?
        .map_err(|err| StepError::Assertion(format!("backup should succeed: {err}")))?;
    Ok(deployment_context)
}

#[given("instance \"{instance}\" is removed from the deployment")]
fn instance_removed(mut deployment_context: DeploymentContext, instance: String) -> DeploymentContext {
    deployment_context.removed.push(parse_identifier(&instance));
    deployment_context
}

#[given("instance \"{instance}\" cannot restore")]
fn instance_cannot_restore(
    deployment_context: DeploymentContext,
    instance: String,
) -> Result<DeploymentContext, StepError> {
    deployment_context
        .fake(&parse_identifier(&instance))?
        .set_capable(Phase::Restore, false);
    Ok(deployment_context)
}

#[when("the deployment is restored")]
fn deployment_restored(
    mut deployment_context: DeploymentContext,
) -> Result<DeploymentContext, StepError> {
    let workflow = RestoreWorkflow::new(deployment_context.manager())
        .with_lock_failure_policy(deployment_context.policy);
    let result = DeploymentContext::block_on(
        workflow.run("redis", &deployment_context.artifact_path),
    )?;
    deployment_context.outcome = Some(outcome_of(result));
    Ok(deployment_context)
}

#[then("every instance received its backed up data")]
fn every_instance_received_data(deployment_context: &DeploymentContext) -> Result<(), StepError> {
    for fake in &deployment_context.instances {
        let contents = format!("payload of {}", fake.identifier());
        let expected = tar_with_files(&[
            ("data", contents.as_str()),
            ("conf/redis.conf", "port 6379"),
        ]);
        for blob in fake.fake_blobs() {
            if blob.received().as_deref() != Some(expected.as_slice()) {
                return Err(StepError::Assertion(format!(
                    "{} did not receive its backed up archive",
                    fake.identifier()
                )));
            }
        }
    }
    Ok(())
}

#[then("the abort message mentions \"{text}\"")]
fn abort_message_mentions(
    deployment_context: &DeploymentContext,
    text: String,
) -> Result<(), StepError> {
    match deployment_context.outcome.as_ref() {
        Some(RunOutcome::Aborted { message, .. }) if message.contains(text.trim()) => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected an abort mentioning {text}, got {other:?}"
        ))),
    }
}
