//! BDD step definitions for backup behaviour.

use fleetback::BackupWorkflow;
use rstest_bdd_macros::{given, then, when};

use crate::deployment::{DeploymentContext, StepError, outcome_of, parse_identifier};

#[given("an artifact already exists at the destination")]
fn artifact_already_exists(deployment_context: DeploymentContext) -> DeploymentContext {
    std::fs::create_dir_all(&deployment_context.artifact_path)
        .unwrap_or_else(|err| panic!("pre-create artifact directory: {err}"));
    deployment_context
}

#[when("the deployment is backed up")]
fn deployment_backed_up(
    mut deployment_context: DeploymentContext,
) -> Result<DeploymentContext, StepError> {
    let workflow = BackupWorkflow::new(deployment_context.manager())
        .with_lock_failure_policy(deployment_context.policy);
    let result = DeploymentContext::block_on(
        workflow.run("redis", &deployment_context.artifact_path),
    )?;
    deployment_context.outcome = Some(outcome_of(result));
    Ok(deployment_context)
}

#[then("the artifact is valid and lists {count:u32} instances")]
fn artifact_valid(deployment_context: &DeploymentContext, count: u32) -> Result<(), StepError> {
    let artifact = deployment_context.artifact()?;
    let valid = artifact
        .valid()
        .map_err(|err| StepError::Assertion(format!("validate artifact: {err}")))?;
    if !valid {
        return Err(StepError::Assertion(String::from(
            "artifact failed checksum validation",
        )));
    }
    let listed = artifact
        .instance_identifiers()
        .map_err(|err| StepError::Assertion(format!("read metadata: {err}")))?;
    if listed.len() == count as usize {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {count} instances in metadata, got {listed:?}"
        )))
    }
}

fn recorded_checksum(
    deployment_context: &DeploymentContext,
    instance: &str,
) -> Result<bool, StepError> {
    let recorded = deployment_context
        .artifact()?
        .fetch_checksum(&parse_identifier(instance))
        .map_err(|err| StepError::Assertion(format!("fetch checksum: {err}")))?;
    Ok(recorded.is_some())
}

#[then("no checksum is recorded for \"{instance}\"")]
fn no_checksum_recorded(
    deployment_context: &DeploymentContext,
    instance: String,
) -> Result<(), StepError> {
    if recorded_checksum(deployment_context, &instance)? {
        Err(StepError::Assertion(format!(
            "checksum unexpectedly recorded for {instance}"
        )))
    } else {
        Ok(())
    }
}

#[then("a checksum is recorded for \"{instance}\"")]
fn checksum_recorded(
    deployment_context: &DeploymentContext,
    instance: String,
) -> Result<(), StepError> {
    if recorded_checksum(deployment_context, &instance)? {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "no checksum recorded for {instance}"
        )))
    }
}

#[then("cleanup reported a failure for \"{instance}\"")]
fn cleanup_reported_failure(
    deployment_context: &DeploymentContext,
    instance: String,
) -> Result<(), StepError> {
    let report = deployment_context.report()?;
    let expected = parse_identifier(&instance);
    let advisory: Vec<_> = report
        .advisory
        .iter()
        .map(|error| error.identifier.clone())
        .collect();
    if advisory == [expected] && report.errors.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected one advisory failure for {instance}, got {advisory:?} and blocking {:?}",
            report.errors
        )))
    }
}
