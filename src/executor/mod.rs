//! Parallel execution of one lifecycle phase across a set of instances.
//!
//! [`PhaseExecutor::run`] starts the operation for every capable instance on
//! the blocking thread pool and returns only after all of them have finished,
//! which gives the workflows their barrier between phases. Failures never
//! cancel siblings; they are collected into [`DeploymentErrors`] in the order
//! of the supplied instance list.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::task::{self, JoinHandle};
use tracing::{Instrument, Span, debug, info, info_span, warn};

use crate::identifier::ArtifactIdentifier;
use crate::instance::{Instance, InstanceError};

/// Lifecycle phases the workflows drive.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Phase {
    /// Quiesce before a backup.
    PreBackupLock,
    /// Produce and transfer backup data.
    Backup,
    /// Resume after a backup.
    PostBackupUnlock,
    /// Quiesce before a restore.
    PreRestoreLock,
    /// Transfer and apply restored data.
    Restore,
    /// Resume after a restore.
    PostRestoreUnlock,
    /// Remove scratch state.
    Cleanup,
}

impl Phase {
    /// Stable name used in logs and error messages.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::PreBackupLock => "pre-backup-lock",
            Self::Backup => "backup",
            Self::PostBackupUnlock => "post-backup-unlock",
            Self::PreRestoreLock => "pre-restore-lock",
            Self::Restore => "restore",
            Self::PostRestoreUnlock => "post-restore-unlock",
            Self::Cleanup => "cleanup",
        }
    }

    /// Failures in advisory phases are reported but do not fail a run.
    #[must_use]
    pub const fn is_advisory(self) -> bool {
        matches!(self, Self::Cleanup)
    }

    /// Asks `instance` whether it supports this phase.
    ///
    /// # Errors
    ///
    /// Propagates the instance's capability query failure.
    pub fn is_capable(self, instance: &dyn Instance) -> Result<bool, InstanceError> {
        match self {
            Self::PreBackupLock => instance.is_pre_backup_lockable(),
            Self::Backup => instance.is_backupable(),
            Self::PostBackupUnlock => instance.is_post_backup_unlockable(),
            Self::PreRestoreLock => instance.is_pre_restore_lockable(),
            Self::Restore => instance.is_restorable(),
            Self::PostRestoreUnlock => instance.is_post_restore_unlockable(),
            Self::Cleanup => instance.is_cleanable(),
        }
    }

    /// Performs the instance action belonging to this phase.
    ///
    /// # Errors
    ///
    /// Propagates the action's failure.
    pub fn invoke(self, instance: &dyn Instance) -> Result<(), InstanceError> {
        match self {
            Self::PreBackupLock => instance.pre_backup_lock(),
            Self::Backup => instance.backup(),
            Self::PostBackupUnlock => instance.post_backup_unlock(),
            Self::PreRestoreLock => instance.pre_restore_lock(),
            Self::Restore => instance.restore(),
            Self::PostRestoreUnlock => instance.post_restore_unlock(),
            Self::Cleanup => instance.cleanup(),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Failure of one instance in one phase.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{identifier} failed during {phase}: {source}")]
pub struct DeploymentError {
    /// Instance that failed.
    pub identifier: ArtifactIdentifier,
    /// Phase in which it failed.
    pub phase: Phase,
    /// Underlying instance failure.
    #[source]
    pub source: InstanceError,
}

/// Ordered collection of per-instance failures.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DeploymentErrors(Vec<DeploymentError>);

impl DeploymentErrors {
    /// Creates an empty collection.
    #[must_use]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Returns `true` when no failures were recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of recorded failures.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterates over failures in recorded order.
    pub fn iter(&self) -> impl Iterator<Item = &DeploymentError> {
        self.0.iter()
    }

    /// Appends a failure.
    pub fn push(&mut self, error: DeploymentError) {
        self.0.push(error);
    }

    /// Moves every failure from `other` onto the end of this collection.
    pub fn append(&mut self, other: Self) {
        self.0.extend(other.0);
    }

    /// Splits the collection into blocking and advisory failures.
    #[must_use]
    pub fn partition_advisory(self) -> (Self, Self) {
        let (advisory, blocking): (Vec<_>, Vec<_>) =
            self.0.into_iter().partition(|error| error.phase.is_advisory());
        (Self(blocking), Self(advisory))
    }

    /// Consumes the collection, returning the failures.
    #[must_use]
    pub fn into_vec(self) -> Vec<DeploymentError> {
        self.0
    }
}

impl fmt::Display for DeploymentErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (position, error) in self.0.iter().enumerate() {
            if position > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{}. {error}", position + 1)?;
        }
        Ok(())
    }
}

impl IntoIterator for DeploymentErrors {
    type Item = DeploymentError;
    type IntoIter = std::vec::IntoIter<DeploymentError>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a DeploymentErrors {
    type Item = &'a DeploymentError;
    type IntoIter = std::slice::Iter<'a, DeploymentError>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl FromIterator<DeploymentError> for DeploymentErrors {
    fn from_iter<T: IntoIterator<Item = DeploymentError>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Runs a phase over many instances at once.
#[derive(Clone, Debug)]
pub struct PhaseExecutor {
    span: Span,
}

impl Default for PhaseExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseExecutor {
    /// Creates an executor logging under a `phase_executor` span.
    #[must_use]
    pub fn new() -> Self {
        Self::with_span(info_span!("phase_executor"))
    }

    /// Creates an executor logging under `span`.
    #[must_use]
    pub const fn with_span(span: Span) -> Self {
        Self { span }
    }

    /// Runs `operation` for every instance capable of `phase` and waits for
    /// all of them.
    ///
    /// Instances whose capability query returns `false` are skipped; a
    /// failing capability query is recorded like a failing operation.
    pub async fn run<F>(
        &self,
        instances: &[Arc<dyn Instance>],
        phase: Phase,
        operation: F,
    ) -> DeploymentErrors
    where
        F: Fn(&dyn Instance) -> Result<(), InstanceError> + Send + Sync + 'static,
    {
        let phase_span = info_span!(parent: &self.span, "phase", phase = phase.name());
        async move {
            info!(instances = instances.len(), "starting phase");
            let shared_operation = Arc::new(operation);
            let handles: Vec<(ArtifactIdentifier, JoinHandle<Option<DeploymentError>>)> =
                instances
                    .iter()
                    .map(|instance| {
                        let worker = Arc::clone(instance);
                        let shared = Arc::clone(&shared_operation);
                        let span = Span::current();
                        let handle = task::spawn_blocking(move || {
                            let _entered = span.enter();
                            execute_one(worker.as_ref(), phase, shared.as_ref())
                        });
                        (instance.identifier().clone(), handle)
                    })
                    .collect();

            let mut errors = DeploymentErrors::new();
            for (identifier, handle) in handles {
                let outcome = handle.await.unwrap_or_else(|join_error| {
                    Some(DeploymentError {
                        identifier,
                        phase,
                        source: InstanceError::Panicked {
                            message: panic_message(join_error.try_into_panic().ok()),
                        },
                    })
                });
                if let Some(error) = outcome {
                    errors.push(error);
                }
            }

            if errors.is_empty() {
                info!("phase finished");
            } else {
                warn!(failures = errors.len(), "phase finished with failures");
            }
            errors
        }
        .instrument(phase_span)
        .await
    }
}

fn execute_one<F>(instance: &dyn Instance, phase: Phase, operation: &F) -> Option<DeploymentError>
where
    F: Fn(&dyn Instance) -> Result<(), InstanceError>,
{
    let identifier = instance.identifier();
    let outcome = match phase.is_capable(instance) {
        Ok(false) => {
            debug!(instance = %identifier, "instance not capable; skipping");
            return None;
        }
        Ok(true) => operation(instance),
        Err(err) => Err(err),
    };

    outcome.err().map(|source| {
        warn!(instance = %identifier, error = %source, "instance failed");
        DeploymentError {
            identifier: identifier.clone(),
            phase,
            source,
        }
    })
}

fn panic_message(payload: Option<Box<dyn Any + Send>>) -> String {
    let Some(boxed) = payload else {
        return String::from("task was cancelled");
    };
    match boxed.downcast::<String>() {
        Ok(message) => *message,
        Err(other) => other
            .downcast_ref::<&str>()
            .map_or_else(|| String::from("non-string panic payload"), |message| (*message).to_owned()),
    }
}
