//! Capability interface for backup targets.
//!
//! The workflows only talk to [`Instance`] and [`BackupBlob`]. Each instance
//! reports which lifecycle phases it supports and performs them on request;
//! each blob can be streamed in either direction and checksummed on the
//! remote side. [`RemoteInstance`] implements both over a
//! [`RemoteRunner`](crate::remote::RemoteRunner).

use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;

use thiserror::Error;

use crate::artifact::ArtifactError;
use crate::checksum::{BackupChecksum, ChecksumError};
use crate::identifier::ArtifactIdentifier;
use crate::remote::RemoteError;

mod remote;

pub use remote::{Job, RemoteBlob, RemoteInstance, RemoteLayout, Script};

/// Errors raised by instance and blob operations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum InstanceError {
    /// The transport failed before the command completed.
    #[error(transparent)]
    Remote(#[from] RemoteError),
    /// A remote command ran but exited non-zero.
    #[error("`{command}` exited with status {exit_code}: {stderr}")]
    RemoteCommand {
        /// Command that failed.
        command: String,
        /// Exit status reported by the remote side.
        exit_code: i32,
        /// Trimmed standard error.
        stderr: String,
    },
    /// Local and remote checksums for a blob disagree.
    #[error("checksum mismatch for {identifier}: {detail}")]
    Integrity {
        /// Blob whose contents differ.
        identifier: ArtifactIdentifier,
        /// Files that differ.
        detail: String,
    },
    /// The artifact holds no checksum for a blob being restored.
    #[error("artifact has no recorded checksum for {identifier}")]
    MissingChecksum {
        /// Blob without a recorded checksum.
        identifier: ArtifactIdentifier,
    },
    /// Reading or writing the local artifact failed.
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    /// Remote checksum output could not be parsed.
    #[error(transparent)]
    Checksum(#[from] ChecksumError),
    /// A job's metadata script produced unusable output.
    #[error("invalid metadata for job {job}: {message}")]
    JobMetadata {
        /// Job whose metadata script failed.
        job: String,
        /// Parser or command failure text.
        message: String,
    },
    /// The operation panicked while running on a worker thread.
    #[error("operation panicked: {message}")]
    Panicked {
        /// Panic payload, when it was a string.
        message: String,
    },
}

/// A unit of backup data owned by an instance.
///
/// Indexed blobs belong to one instance; named blobs carry no index and are
/// stored once per artifact.
pub trait BackupBlob: fmt::Debug + Send + Sync {
    /// Identity of the blob inside the artifact.
    fn identifier(&self) -> &ArtifactIdentifier;

    /// Returns `true` for deployment-wide named blobs.
    fn is_named(&self) -> bool {
        self.identifier().is_named()
    }

    /// Human-readable size of the blob on the remote side.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError`] when the size query fails.
    fn size(&self) -> Result<String, InstanceError>;

    /// Checksum map computed on the remote side.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError`] when the command fails or its output is
    /// malformed.
    fn checksum(&self) -> Result<BackupChecksum, InstanceError>;

    /// Writes the blob's tar stream into `sink`.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError`] when the transfer fails.
    fn stream_from_remote(&self, sink: &mut dyn Write) -> Result<(), InstanceError>;

    /// Uploads a tar stream read from `source` into the blob's location.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError`] when the transfer fails.
    fn stream_to_remote(&self, source: &mut dyn Read) -> Result<(), InstanceError>;
}

/// A backup target: one running member of a deployment.
///
/// Capability queries decide whether the executor calls the matching
/// action. Actions that the instance does not support default to no-ops.
pub trait Instance: fmt::Debug + Send + Sync {
    /// Identity of this instance (`name/index`).
    fn identifier(&self) -> &ArtifactIdentifier;

    /// Whether the instance produces backup data.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError`] when the capability cannot be determined.
    fn is_backupable(&self) -> Result<bool, InstanceError>;

    /// Whether the instance can be quiesced before a backup.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError`] when the capability cannot be determined.
    fn is_pre_backup_lockable(&self) -> Result<bool, InstanceError>;

    /// Whether the instance can be resumed after a backup.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError`] when the capability cannot be determined.
    fn is_post_backup_unlockable(&self) -> Result<bool, InstanceError>;

    /// Whether the instance accepts restored data.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError`] when the capability cannot be determined.
    fn is_restorable(&self) -> Result<bool, InstanceError>;

    /// Whether the instance can be quiesced before a restore.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError`] when the capability cannot be determined.
    fn is_pre_restore_lockable(&self) -> Result<bool, InstanceError> {
        Ok(false)
    }

    /// Whether the instance can be resumed after a restore.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError`] when the capability cannot be determined.
    fn is_post_restore_unlockable(&self) -> Result<bool, InstanceError> {
        Ok(false)
    }

    /// Whether the instance has scratch state to remove after a run.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError`] when the capability cannot be determined.
    fn is_cleanable(&self) -> Result<bool, InstanceError> {
        Ok(true)
    }

    /// Quiesces the instance before a backup.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError`] when locking fails.
    fn pre_backup_lock(&self) -> Result<(), InstanceError>;

    /// Produces backup data on the remote side.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError`] when the backup fails.
    fn backup(&self) -> Result<(), InstanceError>;

    /// Resumes the instance after a backup.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError`] when unlocking fails.
    fn post_backup_unlock(&self) -> Result<(), InstanceError>;

    /// Quiesces the instance before a restore.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError`] when locking fails.
    fn pre_restore_lock(&self) -> Result<(), InstanceError> {
        Ok(())
    }

    /// Applies previously uploaded blob data.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError`] when the restore fails.
    fn restore(&self) -> Result<(), InstanceError>;

    /// Resumes the instance after a restore.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError`] when unlocking fails.
    fn post_restore_unlock(&self) -> Result<(), InstanceError> {
        Ok(())
    }

    /// Removes scratch state left behind by a backup or restore.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError`] when cleanup fails.
    fn cleanup(&self) -> Result<(), InstanceError>;

    /// Blobs this instance holds data in.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError`] when the blobs cannot be enumerated.
    fn blobs(&self) -> Result<Vec<Arc<dyn BackupBlob>>, InstanceError>;
}
