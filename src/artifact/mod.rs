//! On-disk container for one backup run.
//!
//! A [`DirectoryArtifact`] is a directory holding one tar file per blob,
//! the deployment manifest and a YAML `metadata` record of checksums and
//! timestamps. Blob files are written by one worker each; the metadata file
//! is shared and every mutation goes through a single read-merge-write
//! critical section.

use std::io;
use std::sync::{Mutex, MutexGuard, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::ambient_authority;
use cap_std::fs_utf8::{Dir, File};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{Span, debug, info_span, warn};

use crate::checksum::{BackupChecksum, ChecksumError, compute_local};
use crate::identifier::ArtifactIdentifier;

mod metadata;

pub use metadata::{BackupActivity, BlobRecord, InstanceRecord, Metadata, TIMESTAMP_FORMAT};

/// Name of the metadata file inside an artifact.
pub const METADATA_FILE: &str = "metadata";

/// Name of the manifest file inside an artifact.
pub const MANIFEST_FILE: &str = "manifest.yml";

/// Errors raised by artifact storage.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ArtifactError {
    /// Refused to create an artifact over an existing path.
    #[error("artifact already exists at {path}")]
    AlreadyExists {
        /// Existing location.
        path: Utf8PathBuf,
    },
    /// Filesystem access failed.
    #[error("artifact I/O failed for {path}: {message}")]
    Io {
        /// File or directory being accessed.
        path: Utf8PathBuf,
        /// Operating system error text.
        message: String,
    },
    /// The blob's data file is absent.
    #[error("artifact has no data file for {identifier}")]
    BlobMissing {
        /// Blob whose file is missing.
        identifier: ArtifactIdentifier,
    },
    /// The identifier cannot be mapped to a file inside the artifact.
    #[error("identifier {identifier} is not a valid artifact file name")]
    InvalidIdentifier {
        /// Offending identifier.
        identifier: ArtifactIdentifier,
    },
    /// Metadata must exist before it can be amended.
    #[error("artifact metadata does not exist")]
    MetadataMissing,
    /// Metadata creation is write-once.
    #[error("artifact metadata already exists")]
    MetadataExists,
    /// The metadata file is not valid YAML of the expected shape.
    #[error("artifact metadata is unreadable: {message}")]
    MetadataParse {
        /// Parser error text.
        message: String,
    },
    /// Metadata could not be serialised.
    #[error("artifact metadata could not be encoded: {message}")]
    MetadataEncode {
        /// Serialiser error text.
        message: String,
    },
    /// A checksum for this blob was already recorded.
    #[error("checksum for {identifier} is already recorded")]
    DuplicateEntry {
        /// Blob recorded twice.
        identifier: ArtifactIdentifier,
    },
    /// The manifest is written once per artifact.
    #[error("manifest already saved")]
    ManifestExists,
    /// A stored blob is not a readable archive.
    #[error("blob {identifier} is unreadable: {source}")]
    Checksum {
        /// Blob being checksummed.
        identifier: ArtifactIdentifier,
        /// Underlying archive failure.
        #[source]
        source: ChecksumError,
    },
}

/// Artifact stored as a local directory.
#[derive(Debug)]
pub struct DirectoryArtifact {
    path: Utf8PathBuf,
    dir: Dir,
    metadata_lock: Mutex<()>,
    span: Span,
}

impl DirectoryArtifact {
    /// Creates a fresh artifact directory at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ArtifactError::AlreadyExists`] when anything already exists
    /// at `path`, or [`ArtifactError::Io`] when the directory cannot be
    /// created.
    pub fn create(path: &Utf8Path) -> Result<Self, ArtifactError> {
        if path.exists() {
            return Err(ArtifactError::AlreadyExists {
                path: path.to_path_buf(),
            });
        }
        Dir::create_ambient_dir_all(path, ambient_authority())
            .map_err(|err| io_error(path, &err))?;
        Self::open(path)
    }

    /// Opens an existing artifact directory.
    ///
    /// # Errors
    ///
    /// Returns [`ArtifactError::Io`] when `path` is not an accessible
    /// directory.
    pub fn open(path: &Utf8Path) -> Result<Self, ArtifactError> {
        let dir =
            Dir::open_ambient_dir(path, ambient_authority()).map_err(|err| io_error(path, &err))?;
        Ok(Self {
            path: path.to_path_buf(),
            dir,
            metadata_lock: Mutex::new(()),
            span: info_span!("artifact", path = %path),
        })
    }

    /// Returns `true` when an artifact directory exists at `path`.
    #[must_use]
    pub fn exists(path: &Utf8Path) -> bool {
        path.is_dir()
    }

    /// Location of the artifact on disk.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Creates (or truncates) the data file for `identifier`.
    ///
    /// # Errors
    ///
    /// Returns [`ArtifactError::InvalidIdentifier`] for names that would
    /// leave the artifact directory, or [`ArtifactError::Io`].
    pub fn create_file(&self, identifier: &ArtifactIdentifier) -> Result<File, ArtifactError> {
        let name = file_name(identifier)?;
        debug!(parent: &self.span, file = %name, "creating blob file");
        self.dir.create(&name).map_err(|err| self.io_error(&name, &err))
    }

    /// Opens the data file for `identifier` for reading.
    ///
    /// # Errors
    ///
    /// Returns [`ArtifactError::BlobMissing`] when the file does not exist,
    /// or [`ArtifactError::Io`] on other failures.
    pub fn read_file(&self, identifier: &ArtifactIdentifier) -> Result<File, ArtifactError> {
        let name = file_name(identifier)?;
        self.dir.open(&name).map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                ArtifactError::BlobMissing {
                    identifier: identifier.clone(),
                }
            } else {
                self.io_error(&name, &err)
            }
        })
    }

    /// Recomputes the checksum map of the stored data file.
    ///
    /// # Errors
    ///
    /// Returns [`ArtifactError::BlobMissing`] when the file is absent or
    /// [`ArtifactError::Checksum`] when it is not a readable archive.
    pub fn calculate_checksum(
        &self,
        identifier: &ArtifactIdentifier,
    ) -> Result<BackupChecksum, ArtifactError> {
        let file = self.read_file(identifier)?;
        compute_local(file).map_err(|source| ArtifactError::Checksum {
            identifier: identifier.clone(),
            source,
        })
    }

    /// Records the checksum map for `identifier` in the metadata.
    ///
    /// # Errors
    ///
    /// Returns [`ArtifactError::MetadataMissing`] before metadata exists and
    /// [`ArtifactError::DuplicateEntry`] when the blob is already recorded.
    pub fn add_checksum(
        &self,
        identifier: &ArtifactIdentifier,
        checksum: BackupChecksum,
    ) -> Result<(), ArtifactError> {
        let _guard = self.lock_metadata();
        let mut metadata = self.read_metadata()?;
        if !metadata.insert_checksum(identifier, checksum) {
            return Err(ArtifactError::DuplicateEntry {
                identifier: identifier.clone(),
            });
        }
        self.write_metadata(&metadata)?;
        debug!(parent: &self.span, blob = %identifier, "recorded checksum");
        Ok(())
    }

    /// Checksum map recorded for `identifier`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`ArtifactError`] when the metadata cannot be read.
    pub fn fetch_checksum(
        &self,
        identifier: &ArtifactIdentifier,
    ) -> Result<Option<BackupChecksum>, ArtifactError> {
        let metadata = self.read_metadata()?;
        Ok(metadata.checksum_for(identifier).cloned())
    }

    /// Stores the deployment manifest.
    ///
    /// # Errors
    ///
    /// Returns [`ArtifactError::ManifestExists`] when a manifest was already
    /// saved, or [`ArtifactError::Io`].
    pub fn save_manifest(&self, manifest: &str) -> Result<(), ArtifactError> {
        if self.dir.exists(MANIFEST_FILE) {
            return Err(ArtifactError::ManifestExists);
        }
        self.dir
            .write(MANIFEST_FILE, manifest)
            .map_err(|err| self.io_error(MANIFEST_FILE, &err))
    }

    /// Reads the stored deployment manifest.
    ///
    /// # Errors
    ///
    /// Returns [`ArtifactError::Io`] when the manifest cannot be read.
    pub fn manifest(&self) -> Result<String, ArtifactError> {
        self.dir
            .read_to_string(MANIFEST_FILE)
            .map_err(|err| self.io_error(MANIFEST_FILE, &err))
    }

    /// Writes the initial metadata with `start` as the start time.
    ///
    /// # Errors
    ///
    /// Returns [`ArtifactError::MetadataExists`] when metadata is already
    /// present.
    pub fn create_metadata_with_start_time(
        &self,
        start: DateTime<Utc>,
    ) -> Result<(), ArtifactError> {
        let _guard = self.lock_metadata();
        if self.dir.exists(METADATA_FILE) {
            return Err(ArtifactError::MetadataExists);
        }
        let metadata = Metadata {
            backup_activity: BackupActivity {
                start_time: Some(start.format(TIMESTAMP_FORMAT).to_string()),
                finish_time: None,
            },
            ..Metadata::default()
        };
        self.write_metadata(&metadata)
    }

    /// Records `finish` as the finish time.
    ///
    /// # Errors
    ///
    /// Returns [`ArtifactError::MetadataMissing`] before metadata exists.
    pub fn add_finish_time(&self, finish: DateTime<Utc>) -> Result<(), ArtifactError> {
        let _guard = self.lock_metadata();
        let mut metadata = self.read_metadata()?;
        metadata.backup_activity.finish_time = Some(finish.format(TIMESTAMP_FORMAT).to_string());
        self.write_metadata(&metadata)
    }

    /// Reads and parses the metadata file.
    ///
    /// # Errors
    ///
    /// Returns [`ArtifactError::MetadataMissing`] when the file is absent and
    /// [`ArtifactError::MetadataParse`] when it cannot be parsed.
    pub fn metadata(&self) -> Result<Metadata, ArtifactError> {
        self.read_metadata()
    }

    /// Instances recorded in the metadata.
    ///
    /// # Errors
    ///
    /// Returns [`ArtifactError`] when the metadata cannot be read.
    pub fn instance_identifiers(&self) -> Result<Vec<ArtifactIdentifier>, ArtifactError> {
        Ok(self.read_metadata()?.instance_identifiers())
    }

    /// Returns `true` when the recorded instances are exactly `instances`,
    /// compared as multisets of identities.
    ///
    /// # Errors
    ///
    /// Returns [`ArtifactError`] when the metadata cannot be read.
    pub fn deployment_matches(
        &self,
        instances: &[ArtifactIdentifier],
    ) -> Result<bool, ArtifactError> {
        let mut recorded = self.instance_identifiers()?;
        let mut supplied = instances.to_vec();
        recorded.sort();
        supplied.sort();
        Ok(recorded == supplied)
    }

    /// Recomputes every recorded blob's checksum and compares it with the
    /// stored map.
    ///
    /// A missing data file or any digest difference yields `Ok(false)`.
    ///
    /// # Errors
    ///
    /// Returns [`ArtifactError`] when the metadata is unreadable or a stored
    /// file is not a readable archive.
    pub fn valid(&self) -> Result<bool, ArtifactError> {
        let metadata = self.read_metadata()?;
        for (identifier, recorded) in metadata.recorded_checksums() {
            let actual = match self.calculate_checksum(&identifier) {
                Ok(actual) => actual,
                Err(ArtifactError::BlobMissing { .. }) => {
                    warn!(parent: &self.span, blob = %identifier, "blob file is missing");
                    return Ok(false);
                }
                Err(err) => return Err(err),
            };
            if !actual.matches(recorded) {
                warn!(
                    parent: &self.span,
                    blob = %identifier,
                    files = ?recorded.differences(&actual),
                    "blob contents do not match recorded checksums"
                );
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn lock_metadata(&self) -> MutexGuard<'_, ()> {
        self.metadata_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn read_metadata(&self) -> Result<Metadata, ArtifactError> {
        let contents = self.dir.read_to_string(METADATA_FILE).map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                ArtifactError::MetadataMissing
            } else {
                self.io_error(METADATA_FILE, &err)
            }
        })?;
        serde_yaml::from_str(&contents).map_err(|err| ArtifactError::MetadataParse {
            message: err.to_string(),
        })
    }

    fn write_metadata(&self, metadata: &Metadata) -> Result<(), ArtifactError> {
        let contents =
            serde_yaml::to_string(metadata).map_err(|err| ArtifactError::MetadataEncode {
                message: err.to_string(),
            })?;
        self.dir
            .write(METADATA_FILE, contents)
            .map_err(|err| self.io_error(METADATA_FILE, &err))
    }

    fn io_error(&self, name: &str, err: &io::Error) -> ArtifactError {
        io_error(&self.path.join(name), err)
    }
}

/// Default directory name for a new backup of `deployment`.
///
/// ```
/// use chrono::{TimeZone, Utc};
/// use fleetback::artifact::default_directory_name;
///
/// let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).single().expect("valid time");
/// assert_eq!(default_directory_name("redis", at), "redis_20240301T123005Z");
/// ```
#[must_use]
pub fn default_directory_name(deployment: &str, at: DateTime<Utc>) -> String {
    format!("{deployment}_{}", at.format("%Y%m%dT%H%M%SZ"))
}

fn file_name(identifier: &ArtifactIdentifier) -> Result<String, ArtifactError> {
    let unsafe_part = |part: &str| part.is_empty() || part.contains('/') || part.starts_with('.');
    if unsafe_part(identifier.name()) || identifier.index().is_some_and(|index| index.contains('/')) {
        return Err(ArtifactError::InvalidIdentifier {
            identifier: identifier.clone(),
        });
    }
    Ok(identifier.file_name())
}

fn io_error(path: &Utf8Path, err: &io::Error) -> ArtifactError {
    ArtifactError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests;
