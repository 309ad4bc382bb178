//! Binary entry point for the fleetback CLI.

use std::io::{self, Write};
use std::process;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use clap::Parser;
use thiserror::Error;

use fleetback::artifact::{ArtifactError, DirectoryArtifact, default_directory_name};
use fleetback::config::{ConfigError, EngineConfig};
use fleetback::deployment::{InventoryDeploymentManager, InventoryError};
use fleetback::logging::{LoggerError, init_logger};
use fleetback::workflow::{BackupWorkflow, RestoreWorkflow, WorkflowError, WorkflowReport};

mod cli;

use cli::{BackupCommand, Cli, RestoreCommand, ValidateCommand};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Logger(#[from] LoggerError),
    #[error("backup failed: {0}")]
    Backup(#[source] WorkflowError<InventoryError>),
    #[error("restore failed: {0}")]
    Restore(#[source] WorkflowError<InventoryError>),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error("artifact {path} does not match its recorded checksums")]
    InvalidArtifact { path: Utf8PathBuf },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    init_logger()?;
    match cli {
        Cli::Backup(args) => backup(args).await,
        Cli::Restore(args) => restore(args).await,
        Cli::Validate(args) => validate(&args),
    }
}

fn load_config() -> Result<EngineConfig, CliError> {
    let config = EngineConfig::load_without_cli_args()?;
    config.validate()?;
    Ok(config)
}

fn manager_for(config: &EngineConfig) -> InventoryDeploymentManager {
    InventoryDeploymentManager::new(
        config.inventory_path(),
        config.ssh_settings(),
        config.remote_layout(),
    )
}

fn resolve_artifact_path(
    root: &Utf8Path,
    deployment: &str,
    explicit: Option<&str>,
    now: DateTime<Utc>,
) -> Utf8PathBuf {
    explicit.map_or_else(
        || root.join(default_directory_name(deployment, now)),
        Utf8PathBuf::from,
    )
}

async fn backup(args: BackupCommand) -> Result<(), CliError> {
    let config = load_config()?;
    let artifact_path = resolve_artifact_path(
        &config.artifact_root_path(),
        &args.deployment,
        args.artifact_path.as_deref(),
        Utc::now(),
    );
    let report = BackupWorkflow::new(manager_for(&config))
        .with_lock_failure_policy(config.lock_failure_policy())
        .run(&args.deployment, &artifact_path)
        .await
        .map_err(CliError::Backup)?;
    report_success(io::stdout(), "backup", &report);
    Ok(())
}

async fn restore(args: RestoreCommand) -> Result<(), CliError> {
    let config = load_config()?;
    let artifact_path = Utf8PathBuf::from(args.artifact_path);
    let report = RestoreWorkflow::new(manager_for(&config))
        .with_lock_failure_policy(config.lock_failure_policy())
        .run(&args.deployment, &artifact_path)
        .await
        .map_err(CliError::Restore)?;
    report_success(io::stdout(), "restore", &report);
    Ok(())
}

fn validate(args: &ValidateCommand) -> Result<(), CliError> {
    let path = Utf8PathBuf::from(&args.artifact_path);
    let artifact = DirectoryArtifact::open(&path)?;
    if !artifact.valid()? {
        return Err(CliError::InvalidArtifact { path });
    }
    writeln!(io::stdout(), "artifact {path} is valid").ok();
    Ok(())
}

fn report_success(mut target: impl Write, operation: &str, report: &WorkflowReport) {
    writeln!(
        target,
        "{operation} {} for artifact {}",
        report.state, report.artifact_path
    )
    .ok();
    if !report.advisory.is_empty() {
        writeln!(target, "cleanup reported failures:\n{}", report.advisory).ok();
    }
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
