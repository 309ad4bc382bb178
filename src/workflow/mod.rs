//! Deployment-wide backup and restore state machines.
//!
//! Both workflows run the same skeleton: lock every lockable instance, move
//! data, unlock every unlockable instance, clean up. Each step is a
//! [`PhaseExecutor`] barrier, and unlock and cleanup always run no matter
//! what happened before them. Per-instance failures are collected, never
//! propagated, and decide the final [`WorkflowState`].

use std::fmt;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::{info, warn};

use crate::artifact::ArtifactError;
use crate::executor::{DeploymentErrors, Phase, PhaseExecutor};
use crate::identifier::ArtifactIdentifier;
use crate::instance::{Instance, InstanceError};

mod backup;
mod restore;

pub use backup::BackupWorkflow;
pub use restore::RestoreWorkflow;

/// States a workflow moves through.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum WorkflowState {
    /// Nothing has happened yet.
    NotStarted,
    /// Running the pre-lock phase.
    Locking,
    /// Transferring data off the instances.
    BackingUp,
    /// Transferring data onto the instances.
    Restoring,
    /// Running the post-unlock phase.
    Unlocking,
    /// Removing scratch state.
    Cleanup,
    /// Every blocking phase succeeded.
    Completed,
    /// At least one blocking phase reported failures.
    Failed,
}

impl WorkflowState {
    /// Stable name used in logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::NotStarted => "not-started",
            Self::Locking => "locking",
            Self::BackingUp => "backing-up",
            Self::Restoring => "restoring",
            Self::Unlocking => "unlocking",
            Self::Cleanup => "cleanup",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What to do when the lock phase reports failures.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum LockFailurePolicy {
    /// Run the data phase anyway, then unlock.
    #[default]
    Continue,
    /// Skip the data phase and go straight to unlocking.
    FailFast,
}

/// Outcome of a workflow run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WorkflowReport {
    /// Final state, [`WorkflowState::Completed`] or [`WorkflowState::Failed`].
    pub state: WorkflowState,
    /// Artifact the run wrote to or read from.
    pub artifact_path: Utf8PathBuf,
    /// Failures from blocking phases, in phase then instance order.
    pub errors: DeploymentErrors,
    /// Cleanup failures; reported but never fatal.
    pub advisory: DeploymentErrors,
    /// Every state visited, starting with [`WorkflowState::NotStarted`].
    pub transitions: Vec<WorkflowState>,
}

/// Errors that stop a workflow or mark it failed.
#[derive(Debug, Error)]
pub enum WorkflowError<ManagerError>
where
    ManagerError: std::error::Error + 'static,
{
    /// The deployment manager could not describe the deployment.
    #[error("failed to look up deployment: {0}")]
    Deployment(#[source] ManagerError),
    /// The artifact could not be created, opened or finalised.
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    /// The artifact was taken from a differently shaped deployment.
    #[error(
        "artifact does not match deployment (missing: {}; unexpected: {})",
        join_identifiers(.missing),
        join_identifiers(.unexpected)
    )]
    Compatibility {
        /// Recorded instances absent from the deployment.
        missing: Vec<ArtifactIdentifier>,
        /// Deployment instances absent from the artifact.
        unexpected: Vec<ArtifactIdentifier>,
    },
    /// Instances holding backed-up data cannot accept a restore.
    #[error("instances cannot be restored: {}", join_identifiers(.instances))]
    NotRestorable {
        /// Instances without a restore capability.
        instances: Vec<ArtifactIdentifier>,
    },
    /// Querying instances for their blobs failed.
    #[error("failed to inspect deployment instances:\n{errors}")]
    Discovery {
        /// Per-instance failures.
        errors: DeploymentErrors,
    },
    /// One or more blocking phases reported failures.
    #[error("workflow failed:\n{}", .report.errors)]
    Failed {
        /// Full record of the run.
        report: Box<WorkflowReport>,
    },
}

fn join_identifiers(identifiers: &[ArtifactIdentifier]) -> String {
    if identifiers.is_empty() {
        return String::from("none");
    }
    identifiers
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Running record of states entered and failures seen.
#[derive(Debug)]
struct Progress {
    artifact_path: Utf8PathBuf,
    errors: DeploymentErrors,
    transitions: Vec<WorkflowState>,
}

impl Progress {
    fn new(artifact_path: &Utf8Path) -> Self {
        Self {
            artifact_path: artifact_path.to_path_buf(),
            errors: DeploymentErrors::new(),
            transitions: vec![WorkflowState::NotStarted],
        }
    }

    fn enter(&mut self, state: WorkflowState) {
        info!(state = state.name(), "entering state");
        self.transitions.push(state);
    }

    fn record(&mut self, errors: DeploymentErrors) {
        self.errors.append(errors);
    }

    fn has_blocking_errors(&self) -> bool {
        self.errors.iter().any(|error| !error.phase.is_advisory())
    }

    fn finish<E>(mut self) -> Result<WorkflowReport, WorkflowError<E>>
    where
        E: std::error::Error + 'static,
    {
        let (errors, advisory) = self.errors.partition_advisory();
        if !advisory.is_empty() {
            warn!(failures = advisory.len(), "cleanup reported failures");
        }
        let state = if errors.is_empty() {
            WorkflowState::Completed
        } else {
            WorkflowState::Failed
        };
        self.transitions.push(state);
        info!(state = state.name(), "workflow finished");
        let report = WorkflowReport {
            state,
            artifact_path: self.artifact_path,
            errors,
            advisory,
            transitions: self.transitions,
        };
        if report.state == WorkflowState::Failed {
            Err(WorkflowError::Failed {
                report: Box::new(report),
            })
        } else {
            Ok(report)
        }
    }
}

/// Phases bracketing a workflow's data phase.
#[derive(Clone, Copy, Debug)]
struct PhasePlan {
    lock: Phase,
    data: Phase,
    data_state: WorkflowState,
    unlock: Phase,
}

/// Runs lock, data, unlock and cleanup in order, each as a full barrier.
///
/// Unlock and cleanup always run. The data phase is skipped only when the
/// policy is [`LockFailurePolicy::FailFast`] and locking reported failures.
async fn drive_phases<F>(
    executor: &PhaseExecutor,
    policy: LockFailurePolicy,
    instances: &[Arc<dyn Instance>],
    plan: PhasePlan,
    progress: &mut Progress,
    data_operation: F,
) where
    F: Fn(&dyn Instance) -> Result<(), InstanceError> + Send + Sync + 'static,
{
    progress.enter(WorkflowState::Locking);
    let lock = plan.lock;
    let lock_errors = executor
        .run(instances, lock, move |instance| lock.invoke(instance))
        .await;
    let skip_data = policy == LockFailurePolicy::FailFast && !lock_errors.is_empty();
    progress.record(lock_errors);

    if skip_data {
        warn!(phase = plan.data.name(), "locking failed; skipping data phase");
    } else {
        progress.enter(plan.data_state);
        progress.record(executor.run(instances, plan.data, data_operation).await);
    }

    progress.enter(WorkflowState::Unlocking);
    let unlock = plan.unlock;
    progress.record(
        executor
            .run(instances, unlock, move |instance| unlock.invoke(instance))
            .await,
    );

    progress.enter(WorkflowState::Cleanup);
    progress.record(
        executor
            .run(instances, Phase::Cleanup, |instance| {
                Phase::Cleanup.invoke(instance)
            })
            .await,
    );
}
