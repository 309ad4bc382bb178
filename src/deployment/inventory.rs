//! Deployment manager backed by YAML inventory files.
//!
//! Each deployment is described by `<inventory_dir>/<deployment>.yml`:
//!
//! ```yaml
//! manifest: redis-manifest.yml
//! instances:
//!   - name: redis
//!     index: 0
//!     host: 10.0.0.5
//!   - name: redis
//!     index: 1
//!     host: 10.0.0.6
//!     port: 2222
//! ```
//!
//! The manifest path is resolved inside the inventory directory.

use std::fmt;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::ambient_authority;
use cap_std::fs_utf8::Dir;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use super::{DeploymentManager, ManagerFuture};
use crate::identifier::ArtifactIdentifier;
use crate::instance::{Instance, RemoteInstance, RemoteLayout};
use crate::remote::{SshRemoteRunner, SshSettings};

const DEFAULT_SSH_PORT: u16 = 22;

/// Errors raised while reading inventories.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum InventoryError {
    /// The deployment name cannot be mapped to an inventory file.
    #[error("invalid deployment name: {deployment}")]
    InvalidName {
        /// Rejected name.
        deployment: String,
    },
    /// An inventory or manifest file could not be read.
    #[error("failed to read {path}: {message}")]
    Read {
        /// File being read.
        path: Utf8PathBuf,
        /// Operating system error text.
        message: String,
    },
    /// An inventory file is not valid YAML of the expected shape.
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// File being parsed.
        path: Utf8PathBuf,
        /// Parser error text.
        message: String,
    },
    /// The inventory lists no instances.
    #[error("deployment {deployment} has no instances")]
    Empty {
        /// Deployment without instances.
        deployment: String,
    },
}

#[derive(Debug, Deserialize)]
struct InventoryFile {
    manifest: String,
    #[serde(default)]
    instances: Vec<InventoryInstance>,
}

#[derive(Debug, Deserialize)]
struct InventoryInstance {
    name: String,
    index: IndexValue,
    #[serde(default)]
    id: Option<String>,
    host: String,
    #[serde(default = "default_port")]
    port: u16,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum IndexValue {
    Number(u64),
    Text(String),
}

impl fmt::Display for IndexValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(value) => write!(f, "{value}"),
            Self::Text(value) => f.write_str(value),
        }
    }
}

const fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

/// Reads deployments from an inventory directory and reaches their
/// instances over SSH.
#[derive(Clone, Debug)]
pub struct InventoryDeploymentManager {
    inventory_dir: Utf8PathBuf,
    ssh: SshSettings,
    layout: RemoteLayout,
}

impl InventoryDeploymentManager {
    /// Creates a manager reading from `inventory_dir`.
    #[must_use]
    pub fn new(inventory_dir: impl Into<Utf8PathBuf>, ssh: SshSettings, layout: RemoteLayout) -> Self {
        Self {
            inventory_dir: inventory_dir.into(),
            ssh,
            layout,
        }
    }

    fn open_dir(&self) -> Result<Dir, InventoryError> {
        Dir::open_ambient_dir(&self.inventory_dir, ambient_authority()).map_err(|err| {
            InventoryError::Read {
                path: self.inventory_dir.clone(),
                message: err.to_string(),
            }
        })
    }

    fn read(&self, dir: &Dir, relative: &Utf8Path) -> Result<String, InventoryError> {
        dir.read_to_string(relative)
            .map_err(|err| InventoryError::Read {
                path: self.inventory_dir.join(relative),
                message: err.to_string(),
            })
    }

    fn load(&self, deployment: &str) -> Result<(Dir, InventoryFile), InventoryError> {
        if deployment.is_empty() || deployment.contains('/') || deployment.starts_with('.') {
            return Err(InventoryError::InvalidName {
                deployment: deployment.to_owned(),
            });
        }
        let dir = self.open_dir()?;
        let file_name = Utf8PathBuf::from(format!("{deployment}.yml"));
        let contents = self.read(&dir, &file_name)?;
        let inventory: InventoryFile =
            serde_yaml::from_str(&contents).map_err(|err| InventoryError::Parse {
                path: self.inventory_dir.join(&file_name),
                message: err.to_string(),
            })?;
        Ok((dir, inventory))
    }

    fn build_instances(
        &self,
        deployment: &str,
    ) -> Result<Vec<Arc<dyn Instance>>, InventoryError> {
        let (_, inventory) = self.load(deployment)?;
        if inventory.instances.is_empty() {
            return Err(InventoryError::Empty {
                deployment: deployment.to_owned(),
            });
        }

        inventory
            .instances
            .into_iter()
            .map(|entry| {
                let index = entry.index.to_string();
                if index.trim().is_empty() {
                    return Err(InventoryError::Parse {
                        path: self.inventory_dir.join(format!("{deployment}.yml")),
                        message: format!("instance {} has an empty index", entry.name),
                    });
                }
                let identifier = ArtifactIdentifier::indexed(entry.name, index);
                debug!(
                    instance = %identifier,
                    id = entry.id.as_deref().unwrap_or("-"),
                    host = %entry.host,
                    port = entry.port,
                    "resolved instance"
                );
                let runner = SshRemoteRunner::new(self.ssh.clone(), entry.host, entry.port);
                Ok(Arc::new(RemoteInstance::new(
                    identifier,
                    Arc::new(runner),
                    self.layout.clone(),
                )) as Arc<dyn Instance>)
            })
            .collect()
    }

    fn read_manifest(&self, deployment: &str) -> Result<String, InventoryError> {
        let (dir, inventory) = self.load(deployment)?;
        self.read(&dir, Utf8Path::new(&inventory.manifest))
    }
}

impl DeploymentManager for InventoryDeploymentManager {
    type Error = InventoryError;

    fn list_instances<'a>(
        &'a self,
        deployment: &'a str,
    ) -> ManagerFuture<'a, Vec<Arc<dyn Instance>>, Self::Error> {
        Box::pin(async move { self.build_instances(deployment) })
    }

    fn fetch_manifest<'a>(&'a self, deployment: &'a str) -> ManagerFuture<'a, String, Self::Error> {
        Box::pin(async move { self.read_manifest(deployment) })
    }
}
