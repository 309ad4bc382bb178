//! Command-line interface definitions for the `fleetback` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::Parser;

/// Top-level CLI for the `fleetback` binary.
#[derive(Debug, Parser)]
#[command(
    name = "fleetback",
    about = "Back up and restore every instance of a deployment",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Lock, back up and unlock every instance of a deployment.
    #[command(name = "backup", about = "Back up a deployment into a new artifact")]
    Backup(BackupCommand),
    /// Upload an artifact back onto a deployment.
    #[command(name = "restore", about = "Restore a deployment from an artifact")]
    Restore(RestoreCommand),
    /// Recompute an artifact's checksums and compare them with its metadata.
    #[command(name = "validate", about = "Check an artifact against its recorded checksums")]
    Validate(ValidateCommand),
}

/// Arguments for the `fleetback backup` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct BackupCommand {
    /// Deployment to back up; resolved through the inventory directory.
    pub(crate) deployment: String,
    /// Directory to create for the artifact.
    ///
    /// Defaults to `<deployment>_<timestamp>` under the configured artifact
    /// root. The directory must not exist yet.
    #[arg(long, value_name = "DIR")]
    pub(crate) artifact_path: Option<String>,
}

/// Arguments for the `fleetback restore` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct RestoreCommand {
    /// Deployment to restore; resolved through the inventory directory.
    pub(crate) deployment: String,
    /// Artifact directory produced by a previous backup.
    #[arg(long, value_name = "DIR")]
    pub(crate) artifact_path: String,
}

/// Arguments for the `fleetback validate` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct ValidateCommand {
    /// Artifact directory to check.
    #[arg(long, value_name = "DIR")]
    pub(crate) artifact_path: String,
}
