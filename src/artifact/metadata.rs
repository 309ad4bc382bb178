//! Serialised form of the artifact `metadata` file.

use std::fmt;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

use crate::checksum::BackupChecksum;
use crate::identifier::ArtifactIdentifier;

/// Timestamp layout used for `backup_activity`, e.g. `2024/03/01 12:00:00 UTC`.
pub const TIMESTAMP_FORMAT: &str = "%Y/%m/%d %H:%M:%S %Z";

/// Root of the metadata document.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Metadata {
    /// Start and finish timestamps of the run.
    #[serde(default)]
    pub backup_activity: BackupActivity,
    /// Checksums of indexed blobs, one entry per instance.
    #[serde(default)]
    pub instances: Vec<InstanceRecord>,
    /// Checksums of named blobs.
    #[serde(default)]
    pub blobs: Vec<BlobRecord>,
}

/// Wall-clock bounds of a backup run.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct BackupActivity {
    /// When the run started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    /// When the run finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_time: Option<String>,
}

/// Checksums recorded for one instance's blob.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct InstanceRecord {
    /// Instance group name.
    pub instance_name: String,
    /// Instance index; older artifacts may store it as a number.
    #[serde(deserialize_with = "index_from_scalar")]
    pub instance_index: String,
    /// Per-file digests.
    #[serde(default)]
    pub checksums: BackupChecksum,
}

/// Checksums recorded for one named blob.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct BlobRecord {
    /// Blob name.
    pub blob_name: String,
    /// Per-file digests.
    #[serde(default)]
    pub checksums: BackupChecksum,
}

impl Metadata {
    /// Checksum recorded for `identifier`, looking in the section its kind
    /// belongs to.
    #[must_use]
    pub fn checksum_for(&self, identifier: &ArtifactIdentifier) -> Option<&BackupChecksum> {
        match identifier.index() {
            Some(index) => self
                .instances
                .iter()
                .find(|record| record.instance_name == identifier.name() && record.instance_index == index)
                .map(|record| &record.checksums),
            None => self
                .blobs
                .iter()
                .find(|record| record.blob_name == identifier.name())
                .map(|record| &record.checksums),
        }
    }

    /// Appends a record for `identifier`. Returns `false` when one already
    /// exists and nothing was changed.
    pub fn insert_checksum(
        &mut self,
        identifier: &ArtifactIdentifier,
        checksums: BackupChecksum,
    ) -> bool {
        if self.checksum_for(identifier).is_some() {
            return false;
        }
        match identifier.index() {
            Some(index) => self.instances.push(InstanceRecord {
                instance_name: identifier.name().to_owned(),
                instance_index: index.to_owned(),
                checksums,
            }),
            None => self.blobs.push(BlobRecord {
                blob_name: identifier.name().to_owned(),
                checksums,
            }),
        }
        true
    }

    /// Identities of the instances recorded in the `instances` section.
    #[must_use]
    pub fn instance_identifiers(&self) -> Vec<ArtifactIdentifier> {
        self.instances
            .iter()
            .map(|record| ArtifactIdentifier::indexed(&record.instance_name, &record.instance_index))
            .collect()
    }

    /// Every recorded blob with its stored checksum, instances first.
    #[must_use]
    pub fn recorded_checksums(&self) -> Vec<(ArtifactIdentifier, &BackupChecksum)> {
        let instances = self.instances.iter().map(|record| {
            (
                ArtifactIdentifier::indexed(&record.instance_name, &record.instance_index),
                &record.checksums,
            )
        });
        let blobs = self
            .blobs
            .iter()
            .map(|record| (ArtifactIdentifier::named(&record.blob_name), &record.checksums));
        instances.chain(blobs).collect()
    }
}

fn index_from_scalar<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    struct IndexVisitor;

    impl Visitor<'_> for IndexVisitor {
        type Value = String;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("an instance index as a string or integer")
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
            Ok(value.to_owned())
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> Result<Self::Value, E> {
            Ok(value.to_string())
        }

        fn visit_i64<E: de::Error>(self, value: i64) -> Result<Self::Value, E> {
            Ok(value.to_string())
        }
    }

    deserializer.deserialize_any(IndexVisitor)
}
