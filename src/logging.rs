//! Global logger installation for the binary.
//!
//! Library code only emits `tracing` events inside the spans its components
//! own; the binary decides where they go.

use std::io;

use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// Filter applied when `RUST_LOG` is unset or invalid.
pub const DEFAULT_FILTER: &str = "info";

/// Errors raised while installing the logger.
#[derive(Debug, Error)]
pub enum LoggerError {
    /// A global subscriber was already installed.
    #[error("failed to install logger: {0}")]
    Install(String),
}

/// Installs a formatted subscriber writing to standard error, filtered by
/// `RUST_LOG` directives and defaulting to [`DEFAULT_FILTER`].
///
/// # Errors
///
/// Returns [`LoggerError::Install`] when a global subscriber already exists.
pub fn init_logger() -> Result<(), LoggerError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|err| LoggerError::Install(err.to_string()))
}
