//! [`RemoteRunner`] backed by the system `ssh` client.

use std::ffi::OsString;
use std::io::{Read, Write};

use tracing::debug;

use super::process::{feed_process, run_process, stream_process};
use super::{RemoteError, RemoteOutput, RemoteRunner, StreamOutput};

/// Client options shared by every connection.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshSettings {
    /// Path to the `ssh` executable.
    pub ssh_bin: String,
    /// Remote user to connect as.
    pub user: String,
    /// Whether to force batch mode to avoid password prompts.
    pub batch_mode: bool,
    /// Whether to enforce host key checking.
    pub strict_host_key_checking: bool,
    /// Known hosts file override; empty to leave the client default.
    pub known_hosts_file: String,
    /// Private key used for authentication. Supports `~/` expansion.
    pub identity_file: Option<String>,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            ssh_bin: String::from("ssh"),
            user: String::from("vcap"),
            batch_mode: true,
            strict_host_key_checking: false,
            known_hosts_file: String::from("/dev/null"),
            identity_file: None,
        }
    }
}

/// Runs commands on one host through `ssh`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshRemoteRunner {
    settings: SshSettings,
    host: String,
    port: u16,
}

impl SshRemoteRunner {
    /// Creates a runner targeting `host:port`.
    #[must_use]
    pub fn new(settings: SshSettings, host: impl Into<String>, port: u16) -> Self {
        Self {
            settings,
            host: host.into(),
            port,
        }
    }

    /// Host this runner connects to.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Builds the full `ssh` argument vector for `command`.
    #[must_use]
    pub fn build_args(&self, command: &str) -> Vec<OsString> {
        let mut args = self.common_options();
        args.push(OsString::from(format!("{}@{}", self.settings.user, self.host)));
        args.push(OsString::from(command));
        args
    }

    fn common_options(&self) -> Vec<OsString> {
        let mut args = vec![OsString::from("-p"), OsString::from(self.port.to_string())];

        if let Some(ref identity_file) = self.settings.identity_file {
            args.push(OsString::from("-i"));
            args.push(OsString::from(expand_tilde(identity_file)));
        }

        if self.settings.batch_mode {
            args.push(OsString::from("-o"));
            args.push(OsString::from("BatchMode=yes"));
        }

        if !self.settings.strict_host_key_checking {
            args.push(OsString::from("-o"));
            args.push(OsString::from("StrictHostKeyChecking=no"));
        }

        if !self.settings.known_hosts_file.trim().is_empty() {
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!(
                "UserKnownHostsFile={}",
                self.settings.known_hosts_file
            )));
        }

        args
    }
}

impl RemoteRunner for SshRemoteRunner {
    fn run(&self, command: &str) -> Result<RemoteOutput, RemoteError> {
        debug!(host = %self.host, command, "running remote command");
        run_process(&self.settings.ssh_bin, &self.build_args(command), command)
    }

    fn stream(&self, command: &str, sink: &mut dyn Write) -> Result<StreamOutput, RemoteError> {
        debug!(host = %self.host, command, "streaming from remote command");
        stream_process(
            &self.settings.ssh_bin,
            &self.build_args(command),
            command,
            sink,
        )
    }

    fn stream_in(
        &self,
        command: &str,
        source: &mut dyn Read,
    ) -> Result<StreamOutput, RemoteError> {
        debug!(host = %self.host, command, "streaming into remote command");
        feed_process(
            &self.settings.ssh_bin,
            &self.build_args(command),
            command,
            source,
        )
    }
}

/// Expands a leading `~/` prefix to the user's home directory.
///
/// The input is returned unchanged when `HOME` is not set.
///
/// ```
/// # use fleetback::remote::expand_tilde;
/// assert_eq!(expand_tilde("/absolute/path"), "/absolute/path");
/// ```
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}
