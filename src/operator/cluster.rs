//! Cluster State API seam
//!
//! The reconciler, the status updater and the watch cache only talk to the
//! cluster through [`ClusterApi`]. [`KubeCluster`](super::KubeCluster) backs
//! it with a real API server and [`InMemoryCluster`](super::InMemoryCluster)
//! with an in-process store.

use super::crd::AppDeployment;
use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt;
use std::fmt;
use thiserror::Error;

/// Namespace + name identity of a namespaced object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn for_resource<K: ResourceExt>(obj: &K) -> Self {
        Self::new(obj.namespace().unwrap_or_default(), obj.name_any())
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Errors returned by the cluster state API
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid object: {0}")]
    Invalid(String),

    #[error("cluster API unavailable: {0}")]
    Transient(String),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ClusterError::Conflict(_))
    }
}

pub type ClusterResult<T> = std::result::Result<T, ClusterError>;

/// Change notification for an AppDeployment. Only the identity is carried;
/// consumers re-fetch the object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Added(ObjectKey),
    Modified(ObjectKey),
    Deleted(ObjectKey),
    Error(String),
}

/// Server-pushed event stream. The stream ending means the server closed it.
pub type WatchStream = BoxStream<'static, WatchEvent>;

/// Snapshot returned by a list call
#[derive(Debug, Clone, Default)]
pub struct AppList {
    pub items: Vec<AppDeployment>,
    /// Resource version to start a watch from
    pub version: String,
}

/// Operations the controller needs from the cluster.
///
/// An empty namespace in `list_apps`/`watch_apps` means all namespaces.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get_app(&self, key: &ObjectKey) -> ClusterResult<AppDeployment>;

    async fn list_apps(&self, namespace: &str) -> ClusterResult<AppList>;

    async fn create_app(&self, app: &AppDeployment) -> ClusterResult<AppDeployment>;

    /// Write the status of `app`, checked against its resource version.
    /// The stored spec is never modified.
    async fn replace_app_status(&self, app: &AppDeployment) -> ClusterResult<AppDeployment>;

    async fn delete_app(&self, key: &ObjectKey) -> ClusterResult<()>;

    async fn watch_apps(&self, namespace: &str, version: &str) -> ClusterResult<WatchStream>;

    async fn get_workload(&self, key: &ObjectKey) -> ClusterResult<Deployment>;

    async fn create_workload(&self, workload: &Deployment) -> ClusterResult<Deployment>;

    /// Replace the workload's spec, checked against its resource version
    async fn replace_workload(&self, workload: &Deployment) -> ClusterResult<Deployment>;
}
