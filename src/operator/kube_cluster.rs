//! [`ClusterApi`] over a Kubernetes API server

use super::cluster::{
    AppList, ClusterApi, ClusterError, ClusterResult, ObjectKey, WatchEvent, WatchStream,
};
use super::crd::AppDeployment;
use async_trait::async_trait;
use futures::{future, StreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams, WatchParams};
use kube::core::WatchEvent as KubeWatchEvent;
use kube::{Api, Client, ResourceExt};
use tracing::debug;

/// Server-side watch timeout; the server closes the stream after this.
const WATCH_TIMEOUT_SECS: u32 = 290;

#[derive(Debug, Clone, Copy)]
enum Verb {
    Read,
    Create,
    Write,
}

fn classify(err: kube::Error, verb: Verb) -> ClusterError {
    match err {
        kube::Error::Api(resp) => match (resp.code, verb) {
            (404, _) => ClusterError::NotFound(resp.message),
            (409, Verb::Create) => ClusterError::AlreadyExists(resp.message),
            (409, _) => ClusterError::Conflict(resp.message),
            (400 | 422, _) => ClusterError::Invalid(resp.message),
            _ => ClusterError::Transient(format!("{} ({})", resp.message, resp.code)),
        },
        other => ClusterError::Transient(other.to_string()),
    }
}

/// Cluster access through a `kube::Client`
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn apps(&self, namespace: &str) -> Api<AppDeployment> {
        if namespace.is_empty() {
            Api::all(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), namespace)
        }
    }

    fn workloads(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn namespace_of<K: ResourceExt>(obj: &K) -> ClusterResult<String> {
    obj.namespace()
        .ok_or_else(|| ClusterError::Invalid(format!("{} has no namespace", obj.name_any())))
}

fn resource_version_of<K: ResourceExt>(obj: &K) -> ClusterResult<String> {
    obj.resource_version().ok_or_else(|| {
        ClusterError::Invalid(format!("{} has no resource version", obj.name_any()))
    })
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get_app(&self, key: &ObjectKey) -> ClusterResult<AppDeployment> {
        self.apps(&key.namespace)
            .get(&key.name)
            .await
            .map_err(|e| classify(e, Verb::Read))
    }

    async fn list_apps(&self, namespace: &str) -> ClusterResult<AppList> {
        let list = self
            .apps(namespace)
            .list(&ListParams::default())
            .await
            .map_err(|e| classify(e, Verb::Read))?;
        Ok(AppList {
            version: list.metadata.resource_version.unwrap_or_default(),
            items: list.items,
        })
    }

    async fn create_app(&self, app: &AppDeployment) -> ClusterResult<AppDeployment> {
        let namespace = namespace_of(app)?;
        self.apps(&namespace)
            .create(&PostParams::default(), app)
            .await
            .map_err(|e| classify(e, Verb::Create))
    }

    async fn replace_app_status(&self, app: &AppDeployment) -> ClusterResult<AppDeployment> {
        let namespace = namespace_of(app)?;
        // A merge patch carrying metadata.resourceVersion is rejected with 409
        // when the stored version moved on.
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": resource_version_of(app)? },
            "status": app.status,
        });
        self.apps(&namespace)
            .patch_status(&app.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| classify(e, Verb::Write))
    }

    async fn delete_app(&self, key: &ObjectKey) -> ClusterResult<()> {
        self.apps(&key.namespace)
            .delete(&key.name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| classify(e, Verb::Write))
    }

    async fn watch_apps(&self, namespace: &str, version: &str) -> ClusterResult<WatchStream> {
        let params = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
        let stream = self
            .apps(namespace)
            .watch(&params, version)
            .await
            .map_err(|e| classify(e, Verb::Read))?;

        debug!(namespace, version, "opened AppDeployment watch");

        let events = stream.filter_map(|item| {
            future::ready(match item {
                Ok(KubeWatchEvent::Added(app)) => Some(WatchEvent::Added(app.object_key())),
                Ok(KubeWatchEvent::Modified(app)) => Some(WatchEvent::Modified(app.object_key())),
                Ok(KubeWatchEvent::Deleted(app)) => Some(WatchEvent::Deleted(app.object_key())),
                Ok(KubeWatchEvent::Bookmark(_)) => None,
                Ok(KubeWatchEvent::Error(resp)) => {
                    Some(WatchEvent::Error(format!("{} ({})", resp.message, resp.code)))
                }
                Err(e) => Some(WatchEvent::Error(e.to_string())),
            })
        });
        Ok(events.boxed())
    }

    async fn get_workload(&self, key: &ObjectKey) -> ClusterResult<Deployment> {
        self.workloads(&key.namespace)
            .get(&key.name)
            .await
            .map_err(|e| classify(e, Verb::Read))
    }

    async fn create_workload(&self, workload: &Deployment) -> ClusterResult<Deployment> {
        let namespace = namespace_of(workload)?;
        self.workloads(&namespace)
            .create(&PostParams::default(), workload)
            .await
            .map_err(|e| classify(e, Verb::Create))
    }

    async fn replace_workload(&self, workload: &Deployment) -> ClusterResult<Deployment> {
        let namespace = namespace_of(workload)?;
        self.workloads(&namespace)
            .replace(&workload.name_any(), &PostParams::default(), workload)
            .await
            .map_err(|e| classify(e, Verb::Write))
    }
}
