//! Remote command execution against backup targets.
//!
//! [`RemoteRunner`] is the seam between instance logic and the transport.
//! Production code wires [`SshRemoteRunner`], which shells out to the system
//! `ssh` client; tests substitute scripted runners.

use std::fmt;
use std::io::{Read, Write};

use thiserror::Error;

mod process;
mod ssh;

pub use process::{feed_process, run_process, stream_process};
pub use ssh::{SshRemoteRunner, SshSettings, expand_tilde};

/// Captured result of a remote command.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RemoteOutput {
    /// Exit status reported by the remote side.
    pub exit_code: i32,
    /// Captured standard output.
    pub stdout: Vec<u8>,
    /// Captured standard error.
    pub stderr: Vec<u8>,
}

impl RemoteOutput {
    /// Returns `true` when the command exited with status zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    /// Standard output decoded lossily as UTF-8.
    #[must_use]
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Standard error decoded lossily as UTF-8 and trimmed.
    #[must_use]
    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_owned()
    }
}

/// Result of a command whose standard output or input was streamed.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StreamOutput {
    /// Exit status reported by the remote side.
    pub exit_code: i32,
    /// Captured standard error.
    pub stderr: Vec<u8>,
}

impl StreamOutput {
    /// Returns `true` when the command exited with status zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    /// Standard error decoded lossily as UTF-8 and trimmed.
    #[must_use]
    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_owned()
    }
}

/// Transport failures. A command that ran and exited non-zero is not an
/// error at this layer.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RemoteError {
    /// The local client process could not be started.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Operating system error text.
        message: String,
    },
    /// Reading or writing the command's streams failed.
    #[error("stream failure while running `{command}`: {message}")]
    Io {
        /// Remote command being executed.
        command: String,
        /// Underlying I/O error text.
        message: String,
    },
    /// The client terminated without reporting an exit status (for example
    /// when killed by a signal).
    #[error("`{command}` terminated without an exit status")]
    MissingExitCode {
        /// Remote command being executed.
        command: String,
    },
}

/// Executes shell commands on a single remote host.
pub trait RemoteRunner: fmt::Debug + Send + Sync {
    /// Runs `command`, capturing both output streams.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError`] when the transport fails.
    fn run(&self, command: &str) -> Result<RemoteOutput, RemoteError>;

    /// Runs `command`, copying its standard output into `sink`.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError`] when the transport or the sink fails.
    fn stream(&self, command: &str, sink: &mut dyn Write) -> Result<StreamOutput, RemoteError>;

    /// Runs `command`, feeding `source` to its standard input.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError`] when the transport or the source fails.
    fn stream_in(&self, command: &str, source: &mut dyn Read)
    -> Result<StreamOutput, RemoteError>;
}
