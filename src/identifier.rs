//! Identities for instances and the blobs they produce.
//!
//! An identifier pairs a name with an optional index. Indexed identifiers
//! name a concrete instance (`redis/0`), while named identifiers describe a
//! blob that is shared across the deployment and stored once.

use std::fmt;

/// Identity of an instance or of a blob stored inside an artifact.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ArtifactIdentifier {
    name: String,
    index: Option<String>,
}

impl ArtifactIdentifier {
    /// Builds an identifier, treating an empty index as absent.
    #[must_use]
    pub fn new(name: impl Into<String>, index: Option<String>) -> Self {
        Self {
            name: name.into(),
            index: index.filter(|value| !value.is_empty()),
        }
    }

    /// Builds an identifier for a specific instance.
    #[must_use]
    pub fn indexed(name: impl Into<String>, index: impl Into<String>) -> Self {
        Self::new(name, Some(index.into()))
    }

    /// Builds an identifier for a deployment-wide named blob.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(name, None)
    }

    /// Returns the group or blob name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the instance index when present.
    #[must_use]
    pub fn index(&self) -> Option<&str> {
        self.index.as_deref()
    }

    /// Returns `true` when the identifier carries no index.
    #[must_use]
    pub const fn is_named(&self) -> bool {
        self.index.is_none()
    }

    /// File name used for this identifier's archive inside an artifact.
    ///
    /// ```
    /// use fleetback::ArtifactIdentifier;
    ///
    /// assert_eq!(ArtifactIdentifier::indexed("redis", "0").file_name(), "redis-0.tar");
    /// assert_eq!(ArtifactIdentifier::named("shared").file_name(), "shared.tar");
    /// ```
    #[must_use]
    pub fn file_name(&self) -> String {
        match &self.index {
            Some(index) => format!("{}-{index}.tar", self.name),
            None => format!("{}.tar", self.name),
        }
    }
}

impl fmt::Display for ArtifactIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.index {
            Some(index) => write!(f, "{}/{index}", self.name),
            None => f.write_str(&self.name),
        }
    }
}
