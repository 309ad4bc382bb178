//! Engine configuration loaded via `ortho-config`.
//!
//! Values merge defaults, `fleetback.toml` (located through
//! `FLEETBACK_CONFIG_PATH`, the XDG directories, a dotfile or the project
//! directory) and `FLEETBACK_*` environment variables.

use std::ffi::OsString;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::instance::RemoteLayout;
use crate::remote::SshSettings;
use crate::workflow::LockFailurePolicy;

/// Engine settings shared by every command.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "FLEETBACK",
    discovery(
        app_name = "fleetback",
        env_var = "FLEETBACK_CONFIG_PATH",
        config_file_name = "fleetback.toml",
        dotfile_name = ".fleetback.toml",
        project_file_name = "fleetback.toml"
    )
)]
pub struct EngineConfig {
    /// Directory holding one `<deployment>.yml` inventory per deployment.
    #[ortho_config(default = "inventory".to_owned())]
    pub inventory_dir: String,
    /// Directory under which new artifacts are created when no explicit
    /// artifact path is given.
    #[ortho_config(default = ".".to_owned())]
    pub artifact_root: String,
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Remote user to connect as.
    #[ortho_config(default = "vcap".to_owned())]
    pub ssh_user: String,
    /// Whether to force batch mode for SSH to avoid password prompts.
    #[ortho_config(default = true)]
    pub ssh_batch_mode: bool,
    /// Whether to enforce host key checking.
    #[ortho_config(default = false)]
    pub ssh_strict_host_key_checking: bool,
    /// Known hosts file override.
    #[ortho_config(default = "/dev/null".to_owned())]
    pub ssh_known_hosts_file: String,
    /// Private key for authentication; supports `~/` expansion. When unset,
    /// SSH falls back to its default key locations.
    pub ssh_identity_file: Option<String>,
    /// Directory holding the deployed jobs on every instance.
    #[ortho_config(default = "/var/vcap/jobs".to_owned())]
    pub jobs_root: String,
    /// Scratch directory for backup data on every instance.
    #[ortho_config(default = "/var/vcap/store/bbr-backup".to_owned())]
    pub backup_root: String,
    /// Skip the data phase when locking reports failures.
    #[ortho_config(default = false)]
    pub fail_fast_on_lock_error: bool,
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// A required configuration value is empty.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

impl EngineConfig {
    /// Loads configuration from defaults, configuration files and
    /// environment variables, ignoring the process arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("fleetback")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Rejects blank values with a message naming the environment variable
    /// and TOML key that supply them.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] for the first blank value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            (&self.inventory_dir, "inventory directory", "inventory_dir"),
            (&self.artifact_root, "artifact root", "artifact_root"),
            (&self.ssh_bin, "ssh executable", "ssh_bin"),
            (&self.ssh_user, "ssh user", "ssh_user"),
            (&self.jobs_root, "remote jobs directory", "jobs_root"),
            (&self.backup_root, "remote backup directory", "backup_root"),
        ];
        for (value, description, key) in required {
            require_value(value, description, key)?;
        }
        if let Some(identity) = self.ssh_identity_file.as_deref() {
            require_value(identity, "ssh identity file", "ssh_identity_file")?;
        }
        Ok(())
    }

    /// SSH client options for every instance connection.
    #[must_use]
    pub fn ssh_settings(&self) -> SshSettings {
        SshSettings {
            ssh_bin: self.ssh_bin.clone(),
            user: self.ssh_user.clone(),
            batch_mode: self.ssh_batch_mode,
            strict_host_key_checking: self.ssh_strict_host_key_checking,
            known_hosts_file: self.ssh_known_hosts_file.clone(),
            identity_file: self.ssh_identity_file.clone(),
        }
    }

    /// Remote directory layout shared by every instance.
    #[must_use]
    pub fn remote_layout(&self) -> RemoteLayout {
        RemoteLayout {
            jobs_root: self.jobs_root.clone(),
            backup_root: self.backup_root.clone(),
        }
    }

    /// Policy applied when the lock phase reports failures.
    #[must_use]
    pub const fn lock_failure_policy(&self) -> LockFailurePolicy {
        if self.fail_fast_on_lock_error {
            LockFailurePolicy::FailFast
        } else {
            LockFailurePolicy::Continue
        }
    }

    /// Inventory directory as a path.
    #[must_use]
    pub fn inventory_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(&self.inventory_dir)
    }

    /// Artifact root as a path.
    #[must_use]
    pub fn artifact_root_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(&self.artifact_root)
    }
}

fn require_value(value: &str, description: &str, key: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::MissingField(format!(
            "missing {description}: set FLEETBACK_{} or add {key} to fleetback.toml",
            key.to_ascii_uppercase()
        )));
    }
    Ok(())
}
