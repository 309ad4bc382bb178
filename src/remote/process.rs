//! Local process plumbing shared by the SSH runner.

use std::ffi::OsString;
use std::io::{self, Read, Write};
use std::process::{Child, ChildStderr, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};

use super::{RemoteError, RemoteOutput, StreamOutput};

/// Runs `program` to completion and captures both output streams.
///
/// # Errors
///
/// Returns [`RemoteError::Spawn`] when the process cannot start and
/// [`RemoteError::MissingExitCode`] when it exits without a status.
pub fn run_process(
    program: &str,
    args: &[OsString],
    label: &str,
) -> Result<RemoteOutput, RemoteError> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|err| spawn_error(program, &err))?;

    Ok(RemoteOutput {
        exit_code: exit_code(output.status, label)?,
        stdout: output.stdout,
        stderr: output.stderr,
    })
}

/// Runs `program` and copies its standard output into `sink` as it arrives.
///
/// # Errors
///
/// Returns [`RemoteError::Io`] when copying fails; the child is killed in
/// that case.
pub fn stream_process(
    program: &str,
    args: &[OsString],
    label: &str,
    sink: &mut dyn Write,
) -> Result<StreamOutput, RemoteError> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| spawn_error(program, &err))?;
    let stderr_reader = drain_stderr(&mut child);

    let copied = match child.stdout.take() {
        Some(mut stdout) => io::copy(&mut stdout, sink).and_then(|_| sink.flush()),
        None => Err(io::Error::other("standard output was not captured")),
    };
    if let Err(err) = copied {
        abandon(&mut child);
        return Err(io_error(label, &err));
    }

    finish(child, stderr_reader, label)
}

/// Runs `program` and writes `source` to its standard input before waiting
/// for it to exit.
///
/// # Errors
///
/// Returns [`RemoteError::Io`] when reading `source` or writing to the child
/// fails; the child is killed in that case.
pub fn feed_process(
    program: &str,
    args: &[OsString],
    label: &str,
    source: &mut dyn Read,
) -> Result<StreamOutput, RemoteError> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| spawn_error(program, &err))?;
    let stderr_reader = drain_stderr(&mut child);

    let fed = match child.stdin.take() {
        // Dropping stdin at the end of the arm closes the pipe.
        Some(mut stdin) => io::copy(source, &mut stdin).and_then(|_| stdin.flush()),
        None => Err(io::Error::other("standard input was not captured")),
    };
    if let Err(err) = fed {
        abandon(&mut child);
        return Err(io_error(label, &err));
    }

    finish(child, stderr_reader, label)
}

type StderrReader = Option<JoinHandle<io::Result<Vec<u8>>>>;

fn drain_stderr(child: &mut Child) -> StderrReader {
    child.stderr.take().map(|mut stderr: ChildStderr| {
        thread::spawn(move || {
            let mut buffer = Vec::new();
            stderr.read_to_end(&mut buffer).map(|_| buffer)
        })
    })
}

fn finish(
    mut child: Child,
    stderr_reader: StderrReader,
    label: &str,
) -> Result<StreamOutput, RemoteError> {
    let status = child.wait().map_err(|err| io_error(label, &err))?;
    let stderr = match stderr_reader {
        Some(handle) => handle
            .join()
            .map_err(|_| io_error(label, &io::Error::other("stderr reader panicked")))?
            .map_err(|err| io_error(label, &err))?,
        None => Vec::new(),
    };

    Ok(StreamOutput {
        exit_code: exit_code(status, label)?,
        stderr,
    })
}

fn abandon(child: &mut Child) {
    child.kill().ok();
    child.wait().ok();
}

fn exit_code(status: ExitStatus, label: &str) -> Result<i32, RemoteError> {
    status.code().ok_or_else(|| RemoteError::MissingExitCode {
        command: label.to_owned(),
    })
}

fn spawn_error(program: &str, err: &io::Error) -> RemoteError {
    RemoteError::Spawn {
        program: program.to_owned(),
        message: err.to_string(),
    }
}

fn io_error(label: &str, err: &io::Error) -> RemoteError {
    RemoteError::Io {
        command: label.to_owned(),
        message: err.to_string(),
    }
}
