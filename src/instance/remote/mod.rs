//! [`Instance`] implementation driving job scripts over a remote runner.
//!
//! Jobs advertise their lifecycle by shipping scripts under
//! `<jobs_root>/<job>/bin/bbr/`. Discovery runs once per instance and is
//! cached; every later capability query and action reads the cached jobs.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex, PoisonError};

use shell_escape::unix::escape;
use tracing::{Span, debug, info, info_span, warn};

use crate::checksum::{BackupChecksum, parse_remote};
use crate::identifier::ArtifactIdentifier;
use crate::instance::{BackupBlob, Instance, InstanceError};
use crate::remote::{RemoteOutput, RemoteRunner, StreamOutput};

mod job;

pub use job::{Job, Script};

/// Remote directory layout used by jobs and blobs.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteLayout {
    /// Directory holding one subdirectory per deployed job.
    pub jobs_root: String,
    /// Scratch directory where backup scripts write their data.
    pub backup_root: String,
}

impl Default for RemoteLayout {
    fn default() -> Self {
        Self {
            jobs_root: String::from("/var/vcap/jobs"),
            backup_root: String::from("/var/vcap/store/bbr-backup"),
        }
    }
}

impl RemoteLayout {
    /// Directory holding an instance's own blob.
    #[must_use]
    pub fn instance_directory(&self) -> String {
        format!("{}/instance", self.backup_root.trim_end_matches('/'))
    }

    /// Directory holding the named blob `name`.
    #[must_use]
    pub fn named_directory(&self, name: &str) -> String {
        format!("{}/named/{name}", self.backup_root.trim_end_matches('/'))
    }

    fn job_directory(&self, job: &Job) -> String {
        match job.backup_name() {
            Some(name) => self.named_directory(name),
            None => format!("{}/{}", self.instance_directory(), job.name()),
        }
    }
}

/// Instance reached through a [`RemoteRunner`].
#[derive(Debug)]
pub struct RemoteInstance {
    identifier: ArtifactIdentifier,
    runner: Arc<dyn RemoteRunner>,
    layout: RemoteLayout,
    jobs: Mutex<Option<Arc<Vec<Job>>>>,
    span: Span,
}

impl RemoteInstance {
    /// Creates an instance; no remote calls are made until first use.
    #[must_use]
    pub fn new(
        identifier: ArtifactIdentifier,
        runner: Arc<dyn RemoteRunner>,
        layout: RemoteLayout,
    ) -> Self {
        let span = info_span!("instance", instance = %identifier);
        Self {
            identifier,
            runner,
            layout,
            jobs: Mutex::new(None),
            span,
        }
    }

    /// Jobs found on the instance, discovering them on first call.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError`] when discovery or a metadata script fails.
    pub fn jobs(&self) -> Result<Arc<Vec<Job>>, InstanceError> {
        let mut cached = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(jobs) = cached.as_ref() {
            return Ok(Arc::clone(jobs));
        }

        let jobs = Arc::new(self.discover_jobs()?);
        *cached = Some(Arc::clone(&jobs));
        Ok(jobs)
    }

    fn discover_jobs(&self) -> Result<Vec<Job>, InstanceError> {
        let _entered = self.span.enter();
        let command = format!(
            "find {} -path '*/bin/bbr/*' -type f",
            escape(self.layout.jobs_root.as_str().into())
        );
        let output = run_checked(self.runner.as_ref(), &command)?;
        let mut jobs = job::parse_script_listing(&self.layout.jobs_root, &output.stdout_text());

        for job in &mut jobs {
            if let Some(script) = job.script(Script::Metadata) {
                let metadata_command = format!("sudo {}", escape(script.into()));
                let metadata = run_checked(self.runner.as_ref(), &metadata_command)?;
                let backup_name = job::parse_job_metadata(job.name(), &metadata.stdout_text())?;
                job.set_backup_name(backup_name);
            }
        }

        debug!(jobs = jobs.len(), "discovered jobs");
        Ok(jobs)
    }

    fn any_job_has(&self, script: Script) -> Result<bool, InstanceError> {
        Ok(self.jobs()?.iter().any(|job| job.has(script)))
    }

    /// Runs `script` for each job in order, stopping at the first failure.
    fn run_script_strict(&self, script: Script) -> Result<(), InstanceError> {
        let _entered = self.span.enter();
        for job in self.jobs()?.iter() {
            if let Some(command) = self.script_command(job, script) {
                info!(job = job.name(), %script, "running script");
                run_checked(self.runner.as_ref(), &command)?;
            }
        }
        Ok(())
    }

    /// Runs `script` for every job and reports the first failure afterwards.
    fn run_script_tolerant(&self, script: Script) -> Result<(), InstanceError> {
        let _entered = self.span.enter();
        let mut first_error = None;
        for job in self.jobs()?.iter() {
            let Some(command) = self.script_command(job, script) else {
                continue;
            };
            info!(job = job.name(), %script, "running script");
            if let Err(err) = run_checked(self.runner.as_ref(), &command) {
                warn!(job = job.name(), %script, error = %err, "script failed");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn script_command(&self, job: &Job, script: Script) -> Option<String> {
        let path = job.script(script)?;
        let escaped_script = escape(path.into());
        let command = match script {
            Script::Backup | Script::Restore => {
                let directory = self.layout.job_directory(job);
                format!(
                    "sudo mkdir -p {} && sudo ARTIFACT_DIRECTORY={} {escaped_script}",
                    escape(directory.as_str().into()),
                    escape(format!("{directory}/").into()),
                )
            }
            _ => format!("sudo {escaped_script}"),
        };
        Some(command)
    }
}

impl Instance for RemoteInstance {
    fn identifier(&self) -> &ArtifactIdentifier {
        &self.identifier
    }

    fn is_backupable(&self) -> Result<bool, InstanceError> {
        self.any_job_has(Script::Backup)
    }

    fn is_pre_backup_lockable(&self) -> Result<bool, InstanceError> {
        self.any_job_has(Script::PreBackupLock)
    }

    fn is_post_backup_unlockable(&self) -> Result<bool, InstanceError> {
        self.any_job_has(Script::PostBackupUnlock)
    }

    fn is_restorable(&self) -> Result<bool, InstanceError> {
        self.any_job_has(Script::Restore)
    }

    fn is_pre_restore_lockable(&self) -> Result<bool, InstanceError> {
        self.any_job_has(Script::PreRestoreLock)
    }

    fn is_post_restore_unlockable(&self) -> Result<bool, InstanceError> {
        self.any_job_has(Script::PostRestoreUnlock)
    }

    fn is_cleanable(&self) -> Result<bool, InstanceError> {
        Ok(self.jobs()?.iter().any(Job::holds_data))
    }

    fn pre_backup_lock(&self) -> Result<(), InstanceError> {
        self.run_script_strict(Script::PreBackupLock)
    }

    fn backup(&self) -> Result<(), InstanceError> {
        self.run_script_strict(Script::Backup)
    }

    fn post_backup_unlock(&self) -> Result<(), InstanceError> {
        self.run_script_tolerant(Script::PostBackupUnlock)
    }

    fn pre_restore_lock(&self) -> Result<(), InstanceError> {
        self.run_script_strict(Script::PreRestoreLock)
    }

    fn restore(&self) -> Result<(), InstanceError> {
        self.run_script_strict(Script::Restore)
    }

    fn post_restore_unlock(&self) -> Result<(), InstanceError> {
        self.run_script_tolerant(Script::PostRestoreUnlock)
    }

    fn cleanup(&self) -> Result<(), InstanceError> {
        let _entered = self.span.enter();
        let command = format!(
            "sudo rm -rf {}",
            escape(self.layout.backup_root.as_str().into())
        );
        run_checked(self.runner.as_ref(), &command).map(|_| ())
    }

    fn blobs(&self) -> Result<Vec<Arc<dyn BackupBlob>>, InstanceError> {
        let jobs = self.jobs()?;
        let mut blobs: Vec<Arc<dyn BackupBlob>> = Vec::new();

        let owns_instance_blob = jobs
            .iter()
            .any(|job| job.holds_data() && job.backup_name().is_none());
        if owns_instance_blob {
            blobs.push(Arc::new(RemoteBlob::new(
                self.identifier.clone(),
                self.layout.instance_directory(),
                Arc::clone(&self.runner),
            )));
        }

        for name in job::named_blobs(&jobs) {
            blobs.push(Arc::new(RemoteBlob::new(
                ArtifactIdentifier::named(name),
                self.layout.named_directory(name),
                Arc::clone(&self.runner),
            )));
        }

        Ok(blobs)
    }
}

/// Blob stored in one remote directory.
#[derive(Debug)]
pub struct RemoteBlob {
    identifier: ArtifactIdentifier,
    directory: String,
    runner: Arc<dyn RemoteRunner>,
}

impl RemoteBlob {
    /// Creates a blob rooted at `directory` on the runner's host.
    #[must_use]
    pub fn new(
        identifier: ArtifactIdentifier,
        directory: String,
        runner: Arc<dyn RemoteRunner>,
    ) -> Self {
        Self {
            identifier,
            directory,
            runner,
        }
    }

    /// Remote directory holding the blob's files.
    #[must_use]
    pub fn directory(&self) -> &str {
        &self.directory
    }

    fn escaped_directory(&self) -> String {
        escape(self.directory.as_str().into()).into_owned()
    }
}

impl BackupBlob for RemoteBlob {
    fn identifier(&self) -> &ArtifactIdentifier {
        &self.identifier
    }

    fn size(&self) -> Result<String, InstanceError> {
        let command = format!("sudo du -sh {} | cut -f1", self.escaped_directory());
        let output = run_checked(self.runner.as_ref(), &command)?;
        Ok(output.stdout_text().trim().to_owned())
    }

    fn checksum(&self) -> Result<BackupChecksum, InstanceError> {
        let command = format!(
            "cd {} && sudo find . -type f -exec sha256sum {{}} +",
            self.escaped_directory()
        );
        let output = run_checked(self.runner.as_ref(), &command)?;
        parse_remote(&output.stdout_text()).map_err(InstanceError::from)
    }

    fn stream_from_remote(&self, sink: &mut dyn Write) -> Result<(), InstanceError> {
        let command = format!("sudo tar -C {} -c .", self.escaped_directory());
        let output = self.runner.stream(&command, sink)?;
        check_stream(&command, &output)
    }

    fn stream_to_remote(&self, source: &mut dyn Read) -> Result<(), InstanceError> {
        let directory = self.escaped_directory();
        let command = format!("sudo mkdir -p {directory} && sudo tar -C {directory} -x");
        let output = self.runner.stream_in(&command, source)?;
        check_stream(&command, &output)
    }
}

fn run_checked(runner: &dyn RemoteRunner, command: &str) -> Result<RemoteOutput, InstanceError> {
    let output = runner.run(command)?;
    if output.is_success() {
        return Ok(output);
    }
    Err(InstanceError::RemoteCommand {
        command: command.to_owned(),
        exit_code: output.exit_code,
        stderr: output.stderr_text(),
    })
}

fn check_stream(command: &str, output: &StreamOutput) -> Result<(), InstanceError> {
    if output.is_success() {
        return Ok(());
    }
    Err(InstanceError::RemoteCommand {
        command: command.to_owned(),
        exit_code: output.exit_code,
        stderr: output.stderr_text(),
    })
}
