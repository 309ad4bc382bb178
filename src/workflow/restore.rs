//! Restore workflow: check compatibility, lock, upload, unlock, clean up.

use std::sync::Arc;

use camino::Utf8Path;
use tokio::task::{self, JoinHandle};
use tracing::{Instrument, Span, info, info_span, warn};

use super::{
    LockFailurePolicy, PhasePlan, Progress, WorkflowError, WorkflowReport, WorkflowState,
    drive_phases,
};
use crate::artifact::DirectoryArtifact;
use crate::deployment::DeploymentManager;
use crate::executor::{DeploymentError, DeploymentErrors, Phase, PhaseExecutor};
use crate::identifier::ArtifactIdentifier;
use crate::instance::{Instance, InstanceError};

const RESTORE_PLAN: PhasePlan = PhasePlan {
    lock: Phase::PreRestoreLock,
    data: Phase::Restore,
    data_state: WorkflowState::Restoring,
    unlock: Phase::PostRestoreUnlock,
};

/// Restores every instance of a deployment from an existing artifact.
#[derive(Debug)]
pub struct RestoreWorkflow<M> {
    manager: M,
    executor: PhaseExecutor,
    policy: LockFailurePolicy,
    span: Span,
}

impl<M> RestoreWorkflow<M>
where
    M: DeploymentManager,
{
    /// Creates a workflow discovering instances through `manager`.
    #[must_use]
    pub fn new(manager: M) -> Self {
        Self::with_span(manager, info_span!("restore_workflow"))
    }

    /// Creates a workflow logging under `span`.
    #[must_use]
    pub fn with_span(manager: M, span: Span) -> Self {
        Self {
            manager,
            executor: PhaseExecutor::with_span(span.clone()),
            policy: LockFailurePolicy::default(),
            span,
        }
    }

    /// Overrides the lock failure policy.
    #[must_use]
    pub const fn with_lock_failure_policy(mut self, policy: LockFailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Restores `deployment` from the artifact at `artifact_path`.
    ///
    /// Nothing on any instance is touched until the artifact is known to
    /// match the deployment and every instance holding data can restore.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::Compatibility`] or
    /// [`WorkflowError::NotRestorable`] when the pre-checks fail,
    /// [`WorkflowError::Discovery`] when instances cannot be inspected, and
    /// [`WorkflowError::Failed`] when any blocking phase reported failures.
    pub async fn run(
        &self,
        deployment: &str,
        artifact_path: &Utf8Path,
    ) -> Result<WorkflowReport, WorkflowError<M::Error>> {
        let span = info_span!(parent: &self.span, "restore", deployment, artifact = %artifact_path);
        self.run_in_span(deployment, artifact_path)
            .instrument(span)
            .await
    }

    async fn run_in_span(
        &self,
        deployment: &str,
        artifact_path: &Utf8Path,
    ) -> Result<WorkflowReport, WorkflowError<M::Error>> {
        let instances = self
            .manager
            .list_instances(deployment)
            .await
            .map_err(WorkflowError::Deployment)?;
        let artifact = Arc::new(DirectoryArtifact::open(artifact_path)?);
        info!(instances = instances.len(), "starting restore");

        let holdings = inspect(&instances).await?;
        check_compatibility(&artifact, &holdings)?;
        check_restorable(&holdings)?;

        let mut progress = Progress::new(artifact_path);
        let upload = BlobUpload {
            artifact: Arc::clone(&artifact),
        };
        drive_phases(
            &self.executor,
            self.policy,
            &instances,
            RESTORE_PLAN,
            &mut progress,
            move |instance| upload.restore(instance),
        )
        .await;
        progress.finish()
    }
}

/// What an instance holds, learned before any phase runs.
#[derive(Debug)]
struct Holding {
    identifier: ArtifactIdentifier,
    holds_indexed_data: bool,
    holds_data: bool,
    restorable: bool,
}

fn inspect_one(instance: &dyn Instance) -> Result<Holding, InstanceError> {
    let blobs = instance.blobs()?;
    let holds_data = !blobs.is_empty();
    let restorable = if holds_data {
        instance.is_restorable()?
    } else {
        false
    };
    Ok(Holding {
        identifier: instance.identifier().clone(),
        holds_indexed_data: blobs.iter().any(|blob| !blob.is_named()),
        holds_data,
        restorable,
    })
}

async fn inspect<E>(instances: &[Arc<dyn Instance>]) -> Result<Vec<Holding>, WorkflowError<E>>
where
    E: std::error::Error + 'static,
{
    let handles: Vec<(ArtifactIdentifier, JoinHandle<Result<Holding, InstanceError>>)> = instances
        .iter()
        .map(|instance| {
            let worker = Arc::clone(instance);
            let span = Span::current();
            let handle = task::spawn_blocking(move || {
                let _entered = span.enter();
                inspect_one(worker.as_ref())
            });
            (instance.identifier().clone(), handle)
        })
        .collect();

    let mut holdings = Vec::with_capacity(handles.len());
    let mut errors = DeploymentErrors::new();
    for (identifier, handle) in handles {
        let outcome = handle.await.unwrap_or_else(|join_error| {
            Err(InstanceError::Panicked {
                message: join_error.to_string(),
            })
        });
        match outcome {
            Ok(holding) => holdings.push(holding),
            Err(source) => errors.push(DeploymentError {
                identifier,
                phase: Phase::Restore,
                source,
            }),
        }
    }

    if errors.is_empty() {
        Ok(holdings)
    } else {
        Err(WorkflowError::Discovery { errors })
    }
}

fn check_compatibility<E>(
    artifact: &DirectoryArtifact,
    holdings: &[Holding],
) -> Result<(), WorkflowError<E>>
where
    E: std::error::Error + 'static,
{
    let present: Vec<ArtifactIdentifier> = holdings
        .iter()
        .filter(|holding| holding.holds_indexed_data)
        .map(|holding| holding.identifier.clone())
        .collect();
    if artifact.deployment_matches(&present)? {
        return Ok(());
    }

    let recorded = artifact.instance_identifiers()?;
    let missing = multiset_difference(&recorded, &present);
    let unexpected = multiset_difference(&present, &recorded);
    warn!(?missing, ?unexpected, "artifact does not match deployment");
    Err(WorkflowError::Compatibility {
        missing,
        unexpected,
    })
}

fn check_restorable<E>(holdings: &[Holding]) -> Result<(), WorkflowError<E>>
where
    E: std::error::Error + 'static,
{
    let instances: Vec<ArtifactIdentifier> = holdings
        .iter()
        .filter(|holding| holding.holds_data && !holding.restorable)
        .map(|holding| holding.identifier.clone())
        .collect();
    if instances.is_empty() {
        Ok(())
    } else {
        warn!(?instances, "instances cannot be restored");
        Err(WorkflowError::NotRestorable { instances })
    }
}

/// Items of `left` not matched one-for-one by items of `right`.
fn multiset_difference(
    left: &[ArtifactIdentifier],
    right: &[ArtifactIdentifier],
) -> Vec<ArtifactIdentifier> {
    let mut remaining = right.to_vec();
    let mut difference = Vec::new();
    for identifier in left {
        if let Some(position) = remaining.iter().position(|other| other == identifier) {
            remaining.swap_remove(position);
        } else {
            difference.push(identifier.clone());
        }
    }
    difference.sort();
    difference
}

/// Streams stored blobs back to their instances and verifies them.
#[derive(Debug)]
struct BlobUpload {
    artifact: Arc<DirectoryArtifact>,
}

impl BlobUpload {
    fn restore(&self, instance: &dyn Instance) -> Result<(), InstanceError> {
        for blob in instance.blobs()? {
            let identifier = blob.identifier();
            let expected = self.artifact.fetch_checksum(identifier)?.ok_or_else(|| {
                InstanceError::MissingChecksum {
                    identifier: identifier.clone(),
                }
            })?;

            info!(instance = %instance.identifier(), blob = %identifier, "uploading blob");
            let mut file = self.artifact.read_file(identifier)?;
            blob.stream_to_remote(&mut file)?;

            let remote = blob.checksum()?;
            if !remote.matches(&expected) {
                let differences = expected.differences(&remote);
                warn!(blob = %identifier, files = ?differences, "uploaded blob does not match artifact");
                return Err(InstanceError::Integrity {
                    identifier: identifier.clone(),
                    detail: differences.join(", "),
                });
            }
        }
        instance.restore()
    }
}
