//! Deployment discovery.
//!
//! Workflows learn which instances make up a deployment, and fetch its
//! manifest, through [`DeploymentManager`]. The shipped implementation,
//! [`InventoryDeploymentManager`], reads static inventory files.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::instance::Instance;

mod inventory;

pub use inventory::{InventoryDeploymentManager, InventoryError};

/// Future returned by deployment manager operations.
pub type ManagerFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Source of deployment membership and manifests.
pub trait DeploymentManager: Send + Sync {
    /// Implementation-specific error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Lists the instances currently making up `deployment`.
    fn list_instances<'a>(
        &'a self,
        deployment: &'a str,
    ) -> ManagerFuture<'a, Vec<Arc<dyn Instance>>, Self::Error>;

    /// Fetches the manifest text of `deployment`.
    fn fetch_manifest<'a>(&'a self, deployment: &'a str) -> ManagerFuture<'a, String, Self::Error>;
}
