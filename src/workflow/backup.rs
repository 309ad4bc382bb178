//! Backup workflow: lock, transfer, unlock, clean up.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

use camino::Utf8Path;
use chrono::Utc;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use super::{
    LockFailurePolicy, PhasePlan, Progress, WorkflowError, WorkflowReport, WorkflowState,
    drive_phases,
};
use crate::artifact::DirectoryArtifact;
use crate::deployment::DeploymentManager;
use crate::executor::{Phase, PhaseExecutor};
use crate::identifier::ArtifactIdentifier;
use crate::instance::{BackupBlob, Instance, InstanceError};

const BACKUP_PLAN: PhasePlan = PhasePlan {
    lock: Phase::PreBackupLock,
    data: Phase::Backup,
    data_state: WorkflowState::BackingUp,
    unlock: Phase::PostBackupUnlock,
};

/// Backs up every instance of a deployment into a new artifact.
#[derive(Debug)]
pub struct BackupWorkflow<M> {
    manager: M,
    executor: PhaseExecutor,
    policy: LockFailurePolicy,
    span: Span,
}

impl<M> BackupWorkflow<M>
where
    M: DeploymentManager,
{
    /// Creates a workflow discovering instances through `manager`.
    #[must_use]
    pub fn new(manager: M) -> Self {
        Self::with_span(manager, info_span!("backup_workflow"))
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

    /// Backs up `deployment` into a new artifact at `artifact_path`.
    ///
    /// Unlock and cleanup are attempted for every instance even when locking
    /// or transfer failed. The artifact is left on disk in every case.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::Deployment`] when the deployment cannot be
    /// described, [`WorkflowError::Artifact`] when the artifact cannot be
    /// created or finalised, and [`WorkflowError::Failed`] when any blocking
    /// phase reported failures.
    pub async fn run(
        &self,
        deployment: &str,
        artifact_path: &Utf8Path,
    ) -> Result<WorkflowReport, WorkflowError<M::Error>> {
        let span = info_span!(parent: &self.span, "backup", deployment, artifact = %artifact_path);
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
        let manifest = self
            .manager
            .fetch_manifest(deployment)
            .await
            .map_err(WorkflowError::Deployment)?;
        info!(instances = instances.len(), "starting backup");

        let artifact = Arc::new(DirectoryArtifact::create(artifact_path)?);
        artifact.save_manifest(&manifest)?;
        artifact.create_metadata_with_start_time(Utc::now())?;

        let mut progress = Progress::new(artifact_path);
        let transfer = BlobTransfer::new(Arc::clone(&artifact));
        drive_phases(
            &self.executor,
            self.policy,
            &instances,
            BACKUP_PLAN,
            &mut progress,
            move |instance| transfer.back_up(instance),
        )
        .await;

        if let Err(err) = artifact.add_finish_time(Utc::now()) {
            if !progress.has_blocking_errors() {
                return Err(err.into());
            }
            error!(error = %err, "failed to record finish time");
        }
        progress.finish()
    }
}

/// Moves each instance's blobs into the artifact and verifies them.
#[derive(Debug)]
struct BlobTransfer {
    artifact: Arc<DirectoryArtifact>,
    claimed: Mutex<BTreeSet<ArtifactIdentifier>>,
}

impl BlobTransfer {
    const fn new(artifact: Arc<DirectoryArtifact>) -> Self {
        Self {
            artifact,
            claimed: Mutex::new(BTreeSet::new()),
        }
    }

    fn back_up(&self, instance: &dyn Instance) -> Result<(), InstanceError> {
        instance.backup()?;
        for blob in instance.blobs()? {
            if blob.is_named() && !self.claim(blob.identifier()) {
                debug!(
                    instance = %instance.identifier(),
                    blob = %blob.identifier(),
                    "named blob already taken by another instance"
                );
                continue;
            }
            self.transfer(blob.as_ref())?;
        }
        Ok(())
    }

    /// Returns `true` for the first caller claiming `identifier`.
    fn claim(&self, identifier: &ArtifactIdentifier) -> bool {
        self.claimed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(identifier.clone())
    }

    fn transfer(&self, blob: &dyn BackupBlob) -> Result<(), InstanceError> {
        let identifier = blob.identifier();
        match blob.size() {
            Ok(size) => info!(blob = %identifier, size = %size, "transferring blob"),
            Err(err) => warn!(blob = %identifier, error = %err, "could not determine blob size"),
        }

        {
            let mut file = self.artifact.create_file(identifier)?;
            blob.stream_from_remote(&mut file)?;
        }

        let local = self.artifact.calculate_checksum(identifier)?;
        let remote = blob.checksum()?;
        if !local.matches(&remote) {
            let differences = remote.differences(&local);
            warn!(blob = %identifier, files = ?differences, "transferred blob does not match remote");
            return Err(InstanceError::Integrity {
                identifier: identifier.clone(),
                detail: differences.join(", "),
            });
        }

        self.artifact.add_checksum(identifier, local)?;
        info!(blob = %identifier, "blob verified");
        Ok(())
    }
}
