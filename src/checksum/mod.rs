//! Per-file SHA-256 checksum maps for blob archives.
//!
//! A [`BackupChecksum`] maps relative file paths inside a blob to the
//! lowercase hex SHA-256 of their contents. The same map is computed locally
//! from a tar stream and remotely from `sha256sum` output, so the two sides
//! can be compared file by file.

use std::collections::BTreeMap;
use std::io::{self, Read};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tar::Archive;
use thiserror::Error;

/// Checksum map keyed by relative path within a blob.
///
/// Keys are stored without leading `./`, including keys read back from
/// metadata written by tools that kept the prefix.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(from = "BTreeMap<String, String>", into = "BTreeMap<String, String>")]
pub struct BackupChecksum(BTreeMap<String, String>);

impl BackupChecksum {
    /// Creates an empty checksum map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the digest for `path`, replacing any previous value.
    pub fn insert(&mut self, path: impl Into<String>, digest: impl Into<String>) {
        self.0.insert(normalise_path(&path.into()), digest.into());
    }

    /// Returns the digest recorded for `path`.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&str> {
        self.0.get(normalise_path(path).as_str()).map(String::as_str)
    }

    /// Number of files covered by the map.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` when no files are recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over `(path, digest)` pairs in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(path, digest)| (path.as_str(), digest.as_str()))
    }

    /// Returns `true` when both maps cover the same files with the same
    /// digests.
    #[must_use]
    pub fn matches(&self, other: &Self) -> bool {
        self == other
    }

    /// Lists every path whose digest differs or which only one side records.
    #[must_use]
    pub fn differences(&self, other: &Self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .0
            .iter()
            .filter(|(path, digest)| other.0.get(*path) != Some(*digest))
            .map(|(path, _)| path.clone())
            .collect();
        paths.extend(
            other
                .0
                .keys()
                .filter(|path| !self.0.contains_key(*path))
                .cloned(),
        );
        paths.sort();
        paths
    }
}

impl From<BTreeMap<String, String>> for BackupChecksum {
    fn from(map: BTreeMap<String, String>) -> Self {
        map.into_iter().collect()
    }
}

impl From<BackupChecksum> for BTreeMap<String, String> {
    fn from(checksum: BackupChecksum) -> Self {
        checksum.0
    }
}

impl FromIterator<(String, String)> for BackupChecksum {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut checksum = Self::new();
        for (path, digest) in iter {
            checksum.insert(path, digest);
        }
        checksum
    }
}

/// Errors raised while computing or parsing checksum maps.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ChecksumError {
    /// The tar stream could not be read.
    #[error("failed to read archive: {message}")]
    Archive {
        /// Underlying reader failure.
        message: String,
    },
    /// A line of remote checksum output did not contain a digest and a path.
    #[error("malformed checksum line: {line}")]
    Malformed {
        /// Offending line, trimmed.
        line: String,
    },
}

impl From<io::Error> for ChecksumError {
    fn from(err: io::Error) -> Self {
        Self::Archive {
            message: err.to_string(),
        }
    }
}

/// Computes the checksum map for every regular file in a tar stream.
///
/// Directory and link entries are skipped.
///
/// # Errors
///
/// Returns [`ChecksumError::Archive`] when the stream is not a readable tar
/// archive.
pub fn compute_local(reader: impl Read) -> Result<BackupChecksum, ChecksumError> {
    let mut archive = Archive::new(reader);
    let mut checksum = BackupChecksum::new();

    for entry_result in archive.entries()? {
        let mut entry = entry_result?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let path = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let mut hasher = Sha256::new();
        io::copy(&mut entry, &mut hasher)?;
        checksum.insert(path, hex::encode(hasher.finalize()));
    }

    Ok(checksum)
}

/// Parses `sha256sum`-style output, one `<digest>  <path>` entry per line.
///
/// The path is everything after the separator, so leading `*` or trailing
/// spaces that belong to a file name are kept. A `*` directly after a single
/// space marks binary mode and is dropped. Blank lines are ignored, as are
/// entries whose path is empty or `-`.
///
/// # Errors
///
/// Returns [`ChecksumError::Malformed`] when a non-blank line lacks a
/// digest or a path separator.
pub fn parse_remote(output: &str) -> Result<BackupChecksum, ChecksumError> {
    let mut checksum = BackupChecksum::new();

    for raw_line in output.split('\n') {
        let line = raw_line.strip_suffix('\r').unwrap_or(raw_line);
        if line.trim().is_empty() {
            continue;
        }

        let Some((digest, rest)) = line.split_once(' ') else {
            return Err(ChecksumError::Malformed {
                line: line.trim().to_owned(),
            });
        };
        let path = rest
            .strip_prefix(' ')
            .or_else(|| rest.strip_prefix('*'))
            .unwrap_or(rest);
        if digest.is_empty() || path.is_empty() || path == "-" {
            continue;
        }

        checksum.insert(path, digest.to_ascii_lowercase());
    }

    Ok(checksum)
}

fn normalise_path(path: &str) -> String {
    let mut current = path;
    while let Some(rest) = current.strip_prefix("./") {
        current = rest;
    }
    current.to_owned()
}
