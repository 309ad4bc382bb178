//! Core library for the fleetback backup engine.
//!
//! The crate drives every instance of a deployment through lock, transfer
//! and unlock phases with barrier semantics, stores the transferred data in
//! an on-disk artifact and proves its integrity with per-file SHA-256
//! checksums cross-checked against the remote side.

pub mod artifact;
pub mod checksum;
pub mod config;
pub mod deployment;
pub mod executor;
pub mod identifier;
pub mod instance;
pub mod logging;
pub mod remote;
pub mod test_support;
pub mod workflow;

pub use artifact::{ArtifactError, DirectoryArtifact, Metadata};
pub use checksum::{BackupChecksum, ChecksumError};
pub use config::{ConfigError, EngineConfig};
pub use deployment::{DeploymentManager, InventoryDeploymentManager, InventoryError};
pub use executor::{DeploymentError, DeploymentErrors, Phase, PhaseExecutor};
pub use identifier::ArtifactIdentifier;
pub use instance::{BackupBlob, Instance, InstanceError, RemoteInstance, RemoteLayout};
pub use remote::{RemoteError, RemoteOutput, RemoteRunner, SshRemoteRunner, SshSettings};
pub use workflow::{
    BackupWorkflow, LockFailurePolicy, RestoreWorkflow, WorkflowError, WorkflowReport,
    WorkflowState,
};
