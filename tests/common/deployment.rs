//! Shared deployment fixture and steps for backup and restore scenarios.

use std::sync::Arc;

use camino::Utf8PathBuf;
use fleetback::test_support::{
    EventLog, FakeInstance, StaticDeploymentManager, StaticManagerError,
};
use fleetback::{
    ArtifactIdentifier, BackupChecksum, DirectoryArtifact, Instance, InstanceError,
    LockFailurePolicy, Phase, WorkflowError, WorkflowReport, WorkflowState,
};
use rstest::fixture;
use rstest_bdd_macros::{given, then};
use tempfile::TempDir;
use tokio::runtime::Runtime;

pub const MANIFEST: &str = "name: redis\ninstance_groups: [redis]\n";

const PHASES: [Phase; 7] = [
    Phase::PreBackupLock,
    Phase::Backup,
    Phase::PostBackupUnlock,
    Phase::PreRestoreLock,
    Phase::Restore,
    Phase::PostRestoreUnlock,
    Phase::Cleanup,
];

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
}

/// How a workflow run ended.
#[derive(Clone, Debug)]
pub enum RunOutcome {
    /// Every phase ran; the report says whether it succeeded.
    Finished(WorkflowReport),
    /// The workflow stopped before running phases.
    Aborted { kind: String, message: String },
}

#[derive(Clone, Debug)]
pub struct DeploymentContext {
    pub workspace: Arc<TempDir>,
    pub artifact_path: Utf8PathBuf,
    pub log: EventLog,
    pub instances: Vec<Arc<FakeInstance>>,
    pub removed: Vec<ArtifactIdentifier>,
    pub policy: LockFailurePolicy,
    pub outcome: Option<RunOutcome>,
}

#[fixture]
pub fn deployment_context() -> DeploymentContext {
    let workspace = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let root = Utf8PathBuf::from_path_buf(workspace.path().to_path_buf())
        .unwrap_or_else(|path| panic!("temp dir should be utf8: {}", path.display()));
    DeploymentContext {
        workspace: Arc::new(workspace),
        artifact_path: root.join("redis-backup"),
        log: EventLog::new(),
        instances: Vec::new(),
        removed: Vec::new(),
        policy: LockFailurePolicy::default(),
        outcome: None,
    }
}

impl DeploymentContext {
    pub fn manager(&self) -> StaticDeploymentManager {
        let instances = self
            .instances
            .iter()
            .filter(|fake| !self.removed.contains(fake.identifier()))
            .map(|fake| Arc::clone(fake) as Arc<dyn Instance>)
            .collect();
        StaticDeploymentManager::new(instances, MANIFEST)
    }

    pub fn fake(&self, identifier: &ArtifactIdentifier) -> Result<&Arc<FakeInstance>, StepError> {
        self.instances
            .iter()
            .find(|fake| fake.identifier() == identifier)
            .ok_or_else(|| StepError::Assertion(format!("unknown instance {identifier}")))
    }

    pub fn artifact(&self) -> Result<DirectoryArtifact, StepError> {
        DirectoryArtifact::open(&self.artifact_path)
            .map_err(|err| StepError::Assertion(format!("artifact should open: {err}")))
    }

    pub fn report(&self) -> Result<&WorkflowReport, StepError> {
        match self.outcome.as_ref() {
            Some(RunOutcome::Finished(report)) => Ok(report),
            Some(RunOutcome::Aborted { message, .. }) => Err(StepError::Assertion(format!(
                "expected the workflow to run its phases, but it aborted: {message}"
            ))),
            None => Err(StepError::Assertion(String::from("missing outcome"))),
        }
    }

    pub fn block_on<F: std::future::Future>(future: F) -> Result<F::Output, StepError> {
        let runtime = Runtime::new().map_err(|err| StepError::Assertion(err.to_string()))?;
        Ok(runtime.block_on(future))
    }
}

pub fn outcome_of(result: Result<WorkflowReport, WorkflowError<StaticManagerError>>) -> RunOutcome {
    match result {
        Ok(report) => RunOutcome::Finished(report),
        Err(WorkflowError::Failed { report }) => RunOutcome::Finished(*report),
        Err(err) => {
            let kind = match &err {
                WorkflowError::Deployment(_) => "deployment",
                WorkflowError::Artifact(_) => "artifact",
                WorkflowError::Compatibility { .. } => "incompatible",
                WorkflowError::NotRestorable { .. } => "not-restorable",
                WorkflowError::Discovery { .. } => "discovery",
                WorkflowError::Failed { .. } => "failed",
            };
            RunOutcome::Aborted {
                kind: kind.to_owned(),
                message: err.to_string(),
            }
        }
    }
}

pub fn parse_identifier(text: &str) -> ArtifactIdentifier {
    let trimmed = text.trim();
    match trimmed.split_once('/') {
        Some((name, index)) => ArtifactIdentifier::indexed(name, index),
        None => ArtifactIdentifier::named(trimmed),
    }
}

pub fn parse_phase(name: &str) -> Result<Phase, StepError> {
    PHASES
        .into_iter()
        .find(|phase| phase.name() == name.trim())
        .ok_or_else(|| StepError::Assertion(format!("unknown phase {name}")))
}

#[then("the run ends as \"{expected}\"")]
fn run_ends_as(deployment_context: &DeploymentContext, expected: String) -> Result<(), StepError> {
    let report = deployment_context.report()?;
    let state: WorkflowState = report.state;
    if state.name() == expected.trim() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected state {expected}, got {state} with failures:\n{}",
            report.errors
        )))
    }
}

#[given("a deployment with instances \"{names}\"")]
fn deployment_with_instances(
    mut deployment_context: DeploymentContext,
    names: String,
) -> DeploymentContext {
    for name in names.split(',') {
        let identifier = parse_identifier(name);
        let contents = format!("payload of {identifier}");
        let fake = FakeInstance::with_data(
            identifier,
            deployment_context.log.clone(),
            &[("data", contents.as_str()), ("conf/redis.conf", "port 6379")],
        );
        deployment_context.instances.push(Arc::new(fake));
    }
    deployment_context
}

#[given("instance \"{instance}\" fails during \"{phase}\"")]
fn instance_fails_during(
    deployment_context: DeploymentContext,
    instance: String,
    phase: String,
) -> Result<DeploymentContext, StepError> {
    let failing = parse_phase(&phase)?;
    deployment_context
        .fake(&parse_identifier(&instance))?
        .fail(
            failing,
            InstanceError::RemoteCommand {
                command: format!("sudo {failing}"),
                exit_code: 1,
                stderr: String::from("simulated failure"),
            },
        );
    Ok(deployment_context)
}

#[given("the remote checksum of \"{instance}\" is corrupted")]
fn remote_checksum_corrupted(
    deployment_context: DeploymentContext,
    instance: String,
) -> Result<DeploymentContext, StepError> {
    let mut corrupted = BackupChecksum::new();
    corrupted.insert("data", "0000000000000000");
    let fake = deployment_context.fake(&parse_identifier(&instance))?;
    for blob in fake.fake_blobs() {
        blob.set_remote_checksum(Ok(corrupted.clone()));
    }
    Ok(deployment_context)
}

#[given("locking failures stop the data phase")]
fn locking_failures_stop_data_phase(mut deployment_context: DeploymentContext) -> DeploymentContext {
    deployment_context.policy = LockFailurePolicy::FailFast;
    deployment_context
}

#[then("the reported failures are \"{expected}\"")]
fn reported_failures(deployment_context: &DeploymentContext, expected: String) -> Result<(), StepError> {
    let report = deployment_context.report()?;
    let actual: Vec<String> = report
        .errors
        .iter()
        .map(|error| format!("{} {}", error.identifier, error.phase))
        .collect();
    let wanted: Vec<String> = expected.split(',').map(|item| item.trim().to_owned()).collect();
    if actual == wanted {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected failures {wanted:?}, got {actual:?}"
        )))
    }
}

#[then("every instance ran \"{phase}\"")]
fn every_instance_ran(deployment_context: &DeploymentContext, phase: String) -> Result<(), StepError> {
    let expected_phase = parse_phase(&phase)?;
    let mut expected: Vec<ArtifactIdentifier> = deployment_context
        .instances
        .iter()
        .map(|fake| fake.identifier().clone())
        .filter(|identifier| !deployment_context.removed.contains(identifier))
        .collect();
    expected.sort();
    let actual = deployment_context.log.instances_for(expected_phase);
    if actual == expected {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {expected_phase} on {expected:?}, got {actual:?}"
        )))
    }
}

#[then("no instance ran \"{phase}\"")]
fn no_instance_ran(deployment_context: &DeploymentContext, phase: String) -> Result<(), StepError> {
    let skipped = parse_phase(&phase)?;
    let actual = deployment_context.log.instances_for(skipped);
    if actual.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected no {skipped} actions, got {actual:?}"
        )))
    }
}

#[then("the run is aborted as \"{kind}\"")]
fn run_aborted(deployment_context: &DeploymentContext, kind: String) -> Result<(), StepError> {
    match deployment_context.outcome.as_ref() {
        Some(RunOutcome::Aborted { kind: actual, .. }) if *actual == kind.trim() => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected an aborted run of kind {kind}, got {other:?}"
        ))),
    }
}

#[then("phase \"{earlier}\" finished before \"{later}\" started")]
fn phase_barrier(
    deployment_context: &DeploymentContext,
    earlier: String,
    later: String,
) -> Result<(), StepError> {
    let first = parse_phase(&earlier)?;
    let second = parse_phase(&later)?;
    if deployment_context.log.strictly_before(first, second) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "{second} started before {first} finished: {:?}",
            deployment_context.log.events()
        )))
    }
}
