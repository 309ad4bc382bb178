//! Discovery of job lifecycle scripts on a remote instance.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Deserialize;

use crate::instance::InstanceError;

/// Directory below each job holding its lifecycle scripts.
const SCRIPT_DIRECTORY: [&str; 2] = ["bin", "bbr"];

/// Lifecycle scripts a job may provide.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Script {
    /// Writes backup data into `ARTIFACT_DIRECTORY`.
    Backup,
    /// Reads restored data from `ARTIFACT_DIRECTORY`.
    Restore,
    /// Quiesces the job before a backup.
    PreBackupLock,
    /// Resumes the job after a backup.
    PostBackupUnlock,
    /// Quiesces the job before a restore.
    PreRestoreLock,
    /// Resumes the job after a restore.
    PostRestoreUnlock,
    /// Prints YAML describing how the job's data is stored.
    Metadata,
}

impl Script {
    const ALL: [Self; 7] = [
        Self::Backup,
        Self::Restore,
        Self::PreBackupLock,
        Self::PostBackupUnlock,
        Self::PreRestoreLock,
        Self::PostRestoreUnlock,
        Self::Metadata,
    ];

    /// File name of the script inside the job's script directory.
    #[must_use]
    pub const fn file_name(self) -> &'static str {
        match self {
            Self::Backup => "backup",
            Self::Restore => "restore",
            Self::PreBackupLock => "pre-backup-lock",
            Self::PostBackupUnlock => "post-backup-unlock",
            Self::PreRestoreLock => "pre-restore-lock",
            Self::PostRestoreUnlock => "post-restore-unlock",
            Self::Metadata => "metadata",
        }
    }

    fn from_file_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|script| script.file_name() == name)
    }
}

impl fmt::Display for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_name())
    }
}

/// A job deployed on an instance together with its scripts.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Job {
    name: String,
    scripts: BTreeMap<Script, String>,
    backup_name: Option<String>,
}

impl Job {
    /// Creates a job with no scripts.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scripts: BTreeMap::new(),
            backup_name: None,
        }
    }

    /// Job name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Remote path of `script`, when the job provides it.
    #[must_use]
    pub fn script(&self, script: Script) -> Option<&str> {
        self.scripts.get(&script).map(String::as_str)
    }

    /// Returns `true` when the job provides `script`.
    #[must_use]
    pub fn has(&self, script: Script) -> bool {
        self.scripts.contains_key(&script)
    }

    /// Named blob this job stores its data in, if any.
    #[must_use]
    pub fn backup_name(&self) -> Option<&str> {
        self.backup_name.as_deref()
    }

    /// Returns `true` when the job moves data in either direction.
    #[must_use]
    pub fn holds_data(&self) -> bool {
        self.has(Script::Backup) || self.has(Script::Restore)
    }

    pub(super) fn set_backup_name(&mut self, name: Option<String>) {
        self.backup_name = name.filter(|value| !value.trim().is_empty());
    }

    fn insert_script(&mut self, script: Script, path: String) {
        self.scripts.insert(script, path);
    }
}

#[derive(Debug, Default, Deserialize)]
struct JobMetadata {
    #[serde(default)]
    backup_name: Option<String>,
}

/// Groups the output of `find` into jobs keyed by name.
///
/// Only paths shaped `<jobs_root>/<job>/bin/bbr/<script>` with a known script
/// name are kept.
pub(super) fn parse_script_listing(jobs_root: &str, listing: &str) -> Vec<Job> {
    let prefix = format!("{}/", jobs_root.trim_end_matches('/'));
    let mut jobs: BTreeMap<String, Job> = BTreeMap::new();

    for line in listing.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let Some(relative) = line.strip_prefix(prefix.as_str()) else {
            continue;
        };
        let parts: Vec<&str> = relative.split('/').collect();
        let [job_name, bin, bbr, file_name] = parts.as_slice() else {
            continue;
        };
        if [*bin, *bbr] != SCRIPT_DIRECTORY {
            continue;
        }
        let Some(script) = Script::from_file_name(file_name) else {
            continue;
        };

        jobs.entry((*job_name).to_owned())
            .or_insert_with(|| Job::new(*job_name))
            .insert_script(script, line.to_owned());
    }

    jobs.into_values().collect()
}

/// Parses the YAML printed by a job's metadata script.
pub(super) fn parse_job_metadata(job: &str, output: &str) -> Result<Option<String>, InstanceError> {
    if output.trim().is_empty() {
        return Ok(None);
    }
    serde_yaml::from_str::<JobMetadata>(output)
        .map(|metadata| metadata.backup_name)
        .map_err(|err| InstanceError::JobMetadata {
            job: job.to_owned(),
            message: err.to_string(),
        })
}

/// Distinct named blobs used by jobs that hold data.
pub(super) fn named_blobs(jobs: &[Job]) -> BTreeSet<&str> {
    jobs.iter()
        .filter(|job| job.holds_data())
        .filter_map(Job::backup_name)
        .collect()
}
