//! Test support utilities shared across unit and integration tests.
//!
//! The doubles here stand in for the remote side of a backup: a scripted
//! [`RemoteRunner`], fake instances and blobs that record what the engine
//! asked of them, and a static [`DeploymentManager`].

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::env;
use std::ffi::OsString;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

use crate::checksum::{BackupChecksum, compute_local};
use crate::deployment::{DeploymentManager, ManagerFuture};
use crate::executor::Phase;
use crate::identifier::ArtifactIdentifier;
use crate::instance::{BackupBlob, Instance, InstanceError};
use crate::remote::{RemoteError, RemoteOutput, RemoteRunner, StreamOutput};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Builds an uncompressed tar archive holding `files` as `(path, contents)`.
#[must_use]
pub fn tar_with_files(files: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        if builder
            .append_data(&mut header, path, contents.as_bytes())
            .is_err()
        {
            return Vec::new();
        }
    }
    builder.into_inner().unwrap_or_default()
}

/// Lowercase hex SHA-256 of `contents`.
#[must_use]
pub fn sha256_hex(contents: &str) -> String {
    hex::encode(Sha256::digest(contents.as_bytes()))
}

/// One call made through [`ScriptedRemoteRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteInvocation {
    /// Command passed to the runner.
    pub command: String,
    /// Bytes fed to the command's standard input.
    pub stdin: Vec<u8>,
}

#[derive(Debug)]
enum ScriptedResponse {
    Output(RemoteOutput),
    Error(RemoteError),
}

#[derive(Debug, Default)]
struct ScriptState {
    responses: VecDeque<ScriptedResponse>,
    invocations: Vec<RemoteInvocation>,
}

/// Remote runner that replays pre-seeded responses in FIFO order.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRemoteRunner {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedRemoteRunner {
    /// Creates a runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a successful exit with `stdout`.
    pub fn push_success(&self, stdout: &str) {
        self.push_output(RemoteOutput {
            exit_code: 0,
            stdout: stdout.as_bytes().to_vec(),
            stderr: Vec::new(),
        });
    }

    /// Queues a successful exit whose standard output is `bytes`.
    pub fn push_bytes(&self, bytes: Vec<u8>) {
        self.push_output(RemoteOutput {
            exit_code: 0,
            stdout: bytes,
            stderr: Vec::new(),
        });
    }

    /// Queues a non-zero exit with `stderr`.
    pub fn push_failure(&self, exit_code: i32, stderr: &str) {
        self.push_output(RemoteOutput {
            exit_code,
            stdout: Vec::new(),
            stderr: stderr.as_bytes().to_vec(),
        });
    }

    /// Queues an arbitrary output.
    pub fn push_output(&self, output: RemoteOutput) {
        lock(&self.state)
            .responses
            .push_back(ScriptedResponse::Output(output));
    }

    /// Queues a transport failure.
    pub fn push_error(&self, error: RemoteError) {
        lock(&self.state)
            .responses
            .push_back(ScriptedResponse::Error(error));
    }

    /// Snapshot of every invocation so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<RemoteInvocation> {
        lock(&self.state).invocations.clone()
    }

    /// Commands issued so far, in order.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        lock(&self.state)
            .invocations
            .iter()
            .map(|invocation| invocation.command.clone())
            .collect()
    }

    fn next(&self, command: &str, stdin: Vec<u8>) -> Result<RemoteOutput, RemoteError> {
        let mut state = lock(&self.state);
        state.invocations.push(RemoteInvocation {
            command: command.to_owned(),
            stdin,
        });
        match state.responses.pop_front() {
            Some(ScriptedResponse::Output(output)) => Ok(output),
            Some(ScriptedResponse::Error(error)) => Err(error),
            None => Err(RemoteError::Spawn {
                program: String::from("scripted"),
                message: format!("no scripted response for `{command}`"),
            }),
        }
    }
}

impl RemoteRunner for ScriptedRemoteRunner {
    fn run(&self, command: &str) -> Result<RemoteOutput, RemoteError> {
        self.next(command, Vec::new())
    }

    fn stream(&self, command: &str, sink: &mut dyn Write) -> Result<StreamOutput, RemoteError> {
        let output = self.next(command, Vec::new())?;
        sink.write_all(&output.stdout)
            .map_err(|err| RemoteError::Io {
                command: command.to_owned(),
                message: err.to_string(),
            })?;
        Ok(StreamOutput {
            exit_code: output.exit_code,
            stderr: output.stderr,
        })
    }

    fn stream_in(
        &self,
        command: &str,
        source: &mut dyn Read,
    ) -> Result<StreamOutput, RemoteError> {
        let mut stdin = Vec::new();
        source
            .read_to_end(&mut stdin)
            .map_err(|err| RemoteError::Io {
                command: command.to_owned(),
                message: err.to_string(),
            })?;
        let output = self.next(command, stdin)?;
        Ok(StreamOutput {
            exit_code: output.exit_code,
            stderr: output.stderr,
        })
    }
}

/// Action performed by a fake instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Event {
    /// Instance that performed the action.
    pub instance: ArtifactIdentifier,
    /// Phase the action belongs to.
    pub phase: Phase,
}

/// Ordered, shared record of actions performed by fakes.
#[derive(Clone, Debug, Default)]
pub struct EventLog(Arc<Mutex<Vec<Event>>>);

impl EventLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, instance: &ArtifactIdentifier, phase: Phase) {
        lock(&self.0).push(Event {
            instance: instance.clone(),
            phase,
        });
    }

    /// Snapshot of every recorded event.
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        lock(&self.0).clone()
    }

    /// Instances that performed `phase`, sorted.
    #[must_use]
    pub fn instances_for(&self, phase: Phase) -> Vec<ArtifactIdentifier> {
        let mut instances: Vec<ArtifactIdentifier> = lock(&self.0)
            .iter()
            .filter(|event| event.phase == phase)
            .map(|event| event.instance.clone())
            .collect();
        instances.sort();
        instances
    }

    /// Returns `true` when every `earlier` event precedes every `later` one.
    #[must_use]
    pub fn strictly_before(&self, earlier: Phase, later: Phase) -> bool {
        let events = lock(&self.0);
        let last_earlier = events.iter().rposition(|event| event.phase == earlier);
        let first_later = events.iter().position(|event| event.phase == later);
        match (last_earlier, first_later) {
            (Some(last), Some(first)) => last < first,
            _ => true,
        }
    }
}

#[derive(Debug, Default)]
struct FakeBlobState {
    remote_checksum: Option<Result<BackupChecksum, InstanceError>>,
    stream_error: Option<InstanceError>,
    received: Option<Vec<u8>>,
}

/// Blob holding an in-memory tar payload.
///
/// The remote checksum is derived from whatever the blob currently holds
/// (the payload, or the last upload) unless overridden.
#[derive(Debug)]
pub struct FakeBlob {
    identifier: ArtifactIdentifier,
    payload: Vec<u8>,
    state: Mutex<FakeBlobState>,
}

impl FakeBlob {
    /// Creates a blob whose remote contents are `files`.
    #[must_use]
    pub fn new(identifier: ArtifactIdentifier, files: &[(&str, &str)]) -> Self {
        Self {
            identifier,
            payload: tar_with_files(files),
            state: Mutex::new(FakeBlobState::default()),
        }
    }

    /// Overrides the remote checksum result.
    pub fn set_remote_checksum(&self, result: Result<BackupChecksum, InstanceError>) {
        lock(&self.state).remote_checksum = Some(result);
    }

    /// Makes both transfer directions fail with `error`.
    pub fn fail_transfers(&self, error: InstanceError) {
        lock(&self.state).stream_error = Some(error);
    }

    /// Bytes received by the last upload.
    #[must_use]
    pub fn received(&self) -> Option<Vec<u8>> {
        lock(&self.state).received.clone()
    }
}

impl BackupBlob for FakeBlob {
    fn identifier(&self) -> &ArtifactIdentifier {
        &self.identifier
    }

    fn size(&self) -> Result<String, InstanceError> {
        Ok(format!("{}B", self.payload.len()))
    }

    fn checksum(&self) -> Result<BackupChecksum, InstanceError> {
        let state = lock(&self.state);
        if let Some(result) = state.remote_checksum.clone() {
            return result;
        }
        let contents = state.received.as_deref().unwrap_or(&self.payload);
        Ok(compute_local(contents)?)
    }

    fn stream_from_remote(&self, sink: &mut dyn Write) -> Result<(), InstanceError> {
        if let Some(error) = lock(&self.state).stream_error.clone() {
            return Err(error);
        }
        sink.write_all(&self.payload).map_err(|err| {
            InstanceError::Remote(RemoteError::Io {
                command: String::from("fake stream"),
                message: err.to_string(),
            })
        })
    }

    fn stream_to_remote(&self, source: &mut dyn Read) -> Result<(), InstanceError> {
        if let Some(error) = lock(&self.state).stream_error.clone() {
            return Err(error);
        }
        let mut received = Vec::new();
        source.read_to_end(&mut received).map_err(|err| {
            InstanceError::Remote(RemoteError::Io {
                command: String::from("fake upload"),
                message: err.to_string(),
            })
        })?;
        lock(&self.state).received = Some(received);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct FakeBehaviour {
    capabilities: HashMap<Phase, Result<bool, InstanceError>>,
    failures: HashMap<Phase, InstanceError>,
    blobs: Vec<Arc<FakeBlob>>,
    delay: Option<Duration>,
}

/// Instance double that records each action in an [`EventLog`].
///
/// Every capability defaults to `true` and every action to success.
#[derive(Debug)]
pub struct FakeInstance {
    identifier: ArtifactIdentifier,
    log: EventLog,
    behaviour: Mutex<FakeBehaviour>,
}

impl FakeInstance {
    /// Creates an instance with no blobs.
    #[must_use]
    pub fn new(identifier: ArtifactIdentifier, log: EventLog) -> Self {
        Self {
            identifier,
            log,
            behaviour: Mutex::new(FakeBehaviour::default()),
        }
    }

    /// Creates an instance owning one indexed blob holding `files`.
    #[must_use]
    pub fn with_data(identifier: ArtifactIdentifier, log: EventLog, files: &[(&str, &str)]) -> Self {
        let blob = Arc::new(FakeBlob::new(identifier.clone(), files));
        let instance = Self::new(identifier, log);
        instance.add_blob(blob);
        instance
    }

    /// Sets the answer to the capability query for `phase`.
    pub fn set_capable(&self, phase: Phase, capable: bool) {
        lock(&self.behaviour).capabilities.insert(phase, Ok(capable));
    }

    /// Makes the capability query for `phase` fail.
    pub fn fail_capability(&self, phase: Phase, error: InstanceError) {
        lock(&self.behaviour).capabilities.insert(phase, Err(error));
    }

    /// Makes the action for `phase` fail after being recorded.
    pub fn fail(&self, phase: Phase, error: InstanceError) {
        lock(&self.behaviour).failures.insert(phase, error);
    }

    /// Adds a blob to the instance.
    pub fn add_blob(&self, blob: Arc<FakeBlob>) {
        lock(&self.behaviour).blobs.push(blob);
    }

    /// Sleeps for `delay` inside every action.
    pub fn set_delay(&self, delay: Duration) {
        lock(&self.behaviour).delay = Some(delay);
    }

    /// Blobs owned by the instance.
    #[must_use]
    pub fn fake_blobs(&self) -> Vec<Arc<FakeBlob>> {
        lock(&self.behaviour).blobs.clone()
    }

    fn capability(&self, phase: Phase) -> Result<bool, InstanceError> {
        lock(&self.behaviour)
            .capabilities
            .get(&phase)
            .cloned()
            .unwrap_or(Ok(true))
    }

    fn act(&self, phase: Phase) -> Result<(), InstanceError> {
        let (delay, failure) = {
            let behaviour = lock(&self.behaviour);
            (behaviour.delay, behaviour.failures.get(&phase).cloned())
        };
        if let Some(pause) = delay {
            thread::sleep(pause);
        }
        self.log.record(&self.identifier, phase);
        failure.map_or(Ok(()), Err)
    }
}

impl Instance for FakeInstance {
    fn identifier(&self) -> &ArtifactIdentifier {
        &self.identifier
    }

    fn is_backupable(&self) -> Result<bool, InstanceError> {
        self.capability(Phase::Backup)
    }

    fn is_pre_backup_lockable(&self) -> Result<bool, InstanceError> {
        self.capability(Phase::PreBackupLock)
    }

    fn is_post_backup_unlockable(&self) -> Result<bool, InstanceError> {
        self.capability(Phase::PostBackupUnlock)
    }

    fn is_restorable(&self) -> Result<bool, InstanceError> {
        self.capability(Phase::Restore)
    }

    fn is_pre_restore_lockable(&self) -> Result<bool, InstanceError> {
        self.capability(Phase::PreRestoreLock)
    }

    fn is_post_restore_unlockable(&self) -> Result<bool, InstanceError> {
        self.capability(Phase::PostRestoreUnlock)
    }

    fn is_cleanable(&self) -> Result<bool, InstanceError> {
        self.capability(Phase::Cleanup)
    }

    fn pre_backup_lock(&self) -> Result<(), InstanceError> {
        self.act(Phase::PreBackupLock)
    }

    fn backup(&self) -> Result<(), InstanceError> {
        self.act(Phase::Backup)
    }

    fn post_backup_unlock(&self) -> Result<(), InstanceError> {
        self.act(Phase::PostBackupUnlock)
    }

    fn pre_restore_lock(&self) -> Result<(), InstanceError> {
        self.act(Phase::PreRestoreLock)
    }

    fn restore(&self) -> Result<(), InstanceError> {
        self.act(Phase::Restore)
    }

    fn post_restore_unlock(&self) -> Result<(), InstanceError> {
        self.act(Phase::PostRestoreUnlock)
    }

    fn cleanup(&self) -> Result<(), InstanceError> {
        self.act(Phase::Cleanup)
    }

    fn blobs(&self) -> Result<Vec<Arc<dyn BackupBlob>>, InstanceError> {
        Ok(self
            .fake_blobs()
            .into_iter()
            .map(|blob| blob as Arc<dyn BackupBlob>)
            .collect())
    }
}

/// Failure returned by [`StaticDeploymentManager`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("deployment lookup failed: {0}")]
pub struct StaticManagerError(pub String);

/// Deployment manager returning a fixed instance list and manifest.
#[derive(Clone, Debug, Default)]
pub struct StaticDeploymentManager {
    instances: Vec<Arc<dyn Instance>>,
    manifest: String,
    failure: Option<String>,
}

impl StaticDeploymentManager {
    /// Creates a manager serving `instances` and `manifest`.
    #[must_use]
    pub fn new(instances: Vec<Arc<dyn Instance>>, manifest: impl Into<String>) -> Self {
        Self {
            instances,
            manifest: manifest.into(),
            failure: None,
        }
    }

    /// Makes every lookup fail with `message`.
    #[must_use]
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    fn check(&self) -> Result<(), StaticManagerError> {
        self.failure
            .as_ref()
            .map_or(Ok(()), |message| Err(StaticManagerError(message.clone())))
    }
}

impl DeploymentManager for StaticDeploymentManager {
    type Error = StaticManagerError;

    fn list_instances<'a>(
        &'a self,
        _deployment: &'a str,
    ) -> ManagerFuture<'a, Vec<Arc<dyn Instance>>, Self::Error> {
        Box::pin(async move { self.check().map(|()| self.instances.clone()) })
    }

    fn fetch_manifest<'a>(&'a self, _deployment: &'a str) -> ManagerFuture<'a, String, Self::Error> {
        Box::pin(async move { self.check().map(|()| self.manifest.clone()) })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: AsyncMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(value) => env::set_var(key, value),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
