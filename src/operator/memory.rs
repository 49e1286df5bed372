//! In-process [`ClusterApi`] with optimistic concurrency, watch streams
//! and fault injection

use super::cluster::{
    AppList, ClusterApi, ClusterError, ClusterResult, ObjectKey, WatchEvent, WatchStream,
};
use super::crd::{AppDeployment, AppDeploymentSpec};
use async_trait::async_trait;
use chrono::Utc;
use futures::channel::mpsc;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

#[derive(Default)]
struct Faults {
    status_conflicts: u32,
    status_write: Option<ClusterError>,
    app_get: Option<ClusterError>,
    workload_create: Option<ClusterError>,
    workload_replace: Option<ClusterError>,
    watch_open: u32,
}

#[derive(Default)]
struct Counters {
    status_write_attempts: u64,
    workload_writes: u64,
    watch_opens: u64,
}

struct Watcher {
    namespace: String,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

#[derive(Default)]
struct Store {
    version: u64,
    apps: BTreeMap<ObjectKey, AppDeployment>,
    workloads: BTreeMap<ObjectKey, Deployment>,
    /// Every app event with the version it was produced at
    history: Vec<(u64, WatchEvent)>,
    watchers: Vec<Watcher>,
    faults: Faults,
    counters: Counters,
}

fn event_namespace(event: &WatchEvent) -> Option<&str> {
    match event {
        WatchEvent::Added(key) | WatchEvent::Modified(key) | WatchEvent::Deleted(key) => {
            Some(&key.namespace)
        }
        WatchEvent::Error(_) => None,
    }
}

fn in_scope(scope: &str, event: &WatchEvent) -> bool {
    scope.is_empty() || event_namespace(event).map_or(true, |ns| ns == scope)
}

impl Store {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    fn publish(&mut self, event: WatchEvent) {
        self.history.push((self.version, event.clone()));
        self.watchers.retain(|w| {
            if !in_scope(&w.namespace, &event) {
                return !w.tx.is_closed();
            }
            w.tx.unbounded_send(event.clone()).is_ok()
        });
    }

    fn bump_app(&mut self, key: &ObjectKey) -> Option<AppDeployment> {
        let version = self.next_version();
        let app = self.apps.get_mut(key)?;
        app.metadata.resource_version = Some(version);
        let app = app.clone();
        self.publish(WatchEvent::Modified(key.clone()));
        Some(app)
    }
}

fn check_version<K: ResourceExt>(stored: &K, incoming: &K) -> ClusterResult<()> {
    match incoming.resource_version() {
        Some(v) if Some(&v) != stored.meta().resource_version.as_ref() => Err(
            ClusterError::Conflict(format!("{} was modified (have {v})", stored.name_any())),
        ),
        _ => Ok(()),
    }
}

fn require_namespace<K: ResourceExt>(obj: &K) -> ClusterResult<ObjectKey> {
    match obj.namespace() {
        Some(ns) if !ns.is_empty() => Ok(ObjectKey::new(ns, obj.name_any())),
        _ => Err(ClusterError::Invalid(format!(
            "{} has no namespace",
            obj.name_any()
        ))),
    }
}

/// Cluster state held in memory
#[derive(Clone, Default)]
pub struct InMemoryCluster {
    inner: Arc<Mutex<Store>>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self) -> MutexGuard<'_, Store> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn app(&self, key: &ObjectKey) -> Option<AppDeployment> {
        self.store().apps.get(key).cloned()
    }

    pub fn workload(&self, key: &ObjectKey) -> Option<Deployment> {
        self.store().workloads.get(key).cloned()
    }

    /// Mutate a record's spec as a user edit would
    pub fn update_app_spec(
        &self,
        key: &ObjectKey,
        edit: impl FnOnce(&mut AppDeploymentSpec),
    ) -> Option<AppDeployment> {
        let mut store = self.store();
        edit(&mut store.apps.get_mut(key)?.spec);
        store.bump_app(key)
    }

    /// Set the observed replica counts on a workload
    pub fn set_workload_replicas(
        &self,
        key: &ObjectKey,
        total: i32,
        available: i32,
        unavailable: i32,
    ) -> Option<Deployment> {
        let mut store = self.store();
        let version = store.next_version();
        let workload = store.workloads.get_mut(key)?;
        workload.metadata.resource_version = Some(version);
        workload.status = Some(DeploymentStatus {
            replicas: Some(total),
            available_replicas: Some(available),
            unavailable_replicas: Some(unavailable),
            ..Default::default()
        });
        Some(workload.clone())
    }

    /// The next `count` status writes fail with a conflict. Each one also
    /// advances the record's version, as a concurrent writer would.
    pub fn inject_status_conflicts(&self, count: u32) {
        self.store().faults.status_conflicts = count;
    }

    pub fn fail_next_status_write(&self, err: ClusterError) {
        self.store().faults.status_write = Some(err);
    }

    pub fn fail_next_app_get(&self, err: ClusterError) {
        self.store().faults.app_get = Some(err);
    }

    pub fn fail_next_workload_create(&self, err: ClusterError) {
        self.store().faults.workload_create = Some(err);
    }

    pub fn fail_next_workload_replace(&self, err: ClusterError) {
        self.store().faults.workload_replace = Some(err);
    }

    /// The next `count` watch opens fail with a transient error
    pub fn fail_watch_opens(&self, count: u32) {
        self.store().faults.watch_open = count;
    }

    pub fn status_write_attempts(&self) -> u64 {
        self.store().counters.status_write_attempts
    }

    pub fn workload_writes(&self) -> u64 {
        self.store().counters.workload_writes
    }

    pub fn watch_opens(&self) -> u64 {
        self.store().counters.watch_opens
    }

    /// End every open watch stream, as a server-side timeout would
    pub fn close_watches(&self) {
        let mut store = self.store();
        for watcher in store.watchers.drain(..) {
            watcher.tx.close_channel();
        }
    }

    /// Push a raw event to open watch streams without touching state
    pub fn inject_watch_event(&self, event: WatchEvent) {
        self.store().watchers.retain(|w| {
            !in_scope(&w.namespace, &event) || w.tx.unbounded_send(event.clone()).is_ok()
        });
    }
}

#[async_trait]
impl ClusterApi for InMemoryCluster {
    async fn get_app(&self, key: &ObjectKey) -> ClusterResult<AppDeployment> {
        let mut store = self.store();
        if let Some(err) = store.faults.app_get.take() {
            return Err(err);
        }
        store
            .apps
            .get(key)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(key.to_string()))
    }

    async fn list_apps(&self, namespace: &str) -> ClusterResult<AppList> {
        let store = self.store();
        let items = store
            .apps
            .iter()
            .filter(|(key, _)| namespace.is_empty() || key.namespace == namespace)
            .map(|(_, app)| app.clone())
            .collect();
        Ok(AppList {
            items,
            version: store.version.to_string(),
        })
    }

    async fn create_app(&self, app: &AppDeployment) -> ClusterResult<AppDeployment> {
        let key = require_namespace(app)?;
        let mut store = self.store();
        if store.apps.contains_key(&key) {
            return Err(ClusterError::AlreadyExists(key.to_string()));
        }

        let mut created = app.clone();
        created.metadata.resource_version = Some(store.next_version());
        created.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        created.metadata.creation_timestamp = Some(Time(Utc::now()));
        created.metadata.generation = Some(1);
        store.apps.insert(key.clone(), created.clone());
        store.publish(WatchEvent::Added(key));
        Ok(created)
    }

    async fn replace_app_status(&self, app: &AppDeployment) -> ClusterResult<AppDeployment> {
        let key = require_namespace(app)?;
        let mut store = self.store();
        store.counters.status_write_attempts += 1;

        if let Some(err) = store.faults.status_write.take() {
            return Err(err);
        }
        if store.faults.status_conflicts > 0 {
            store.faults.status_conflicts -= 1;
            store.bump_app(&key);
            return Err(ClusterError::Conflict(format!("{key} was modified concurrently")));
        }

        let stored = store
            .apps
            .get(&key)
            .ok_or_else(|| ClusterError::NotFound(key.to_string()))?;
        check_version(stored, app)?;

        let version = store.next_version();
        let stored = store
            .apps
            .get_mut(&key)
            .ok_or_else(|| ClusterError::NotFound(key.to_string()))?;
        stored.status = app.status.clone();
        stored.metadata.resource_version = Some(version);
        let updated = stored.clone();
        store.publish(WatchEvent::Modified(key));
        Ok(updated)
    }

    async fn delete_app(&self, key: &ObjectKey) -> ClusterResult<()> {
        let mut store = self.store();
        let removed = store
            .apps
            .remove(key)
            .ok_or_else(|| ClusterError::NotFound(key.to_string()))?;
        store.next_version();

        // Owner-reference garbage collection
        if let Some(uid) = removed.uid() {
            store
                .workloads
                .retain(|_, w| !w.owner_references().iter().any(|o| o.uid == uid));
        }
        store.publish(WatchEvent::Deleted(key.clone()));
        Ok(())
    }

    async fn watch_apps(&self, namespace: &str, version: &str) -> ClusterResult<WatchStream> {
        let mut store = self.store();
        store.counters.watch_opens += 1;
        if store.faults.watch_open > 0 {
            store.faults.watch_open -= 1;
            return Err(ClusterError::Transient("watch refused".to_string()));
        }

        let since = version.parse::<u64>().unwrap_or(0);
        let (tx, rx) = mpsc::unbounded();
        for (_, event) in store
            .history
            .iter()
            .filter(|(v, e)| *v > since && in_scope(namespace, e))
        {
            // Receiver is alive; it is returned below
            let _ = tx.unbounded_send(event.clone());
        }
        store.watchers.push(Watcher {
            namespace: namespace.to_string(),
            tx,
        });

        debug!(namespace, version, "opened in-memory watch");
        Ok(rx.boxed())
    }

    async fn get_workload(&self, key: &ObjectKey) -> ClusterResult<Deployment> {
        self.store()
            .workloads
            .get(key)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(key.to_string()))
    }

    async fn create_workload(&self, workload: &Deployment) -> ClusterResult<Deployment> {
        let key = require_namespace(workload)?;
        let mut store = self.store();
        if let Some(err) = store.faults.workload_create.take() {
            return Err(err);
        }
        if store.workloads.contains_key(&key) {
            return Err(ClusterError::AlreadyExists(key.to_string()));
        }

        let mut created = workload.clone();
        created.metadata.resource_version = Some(store.next_version());
        created.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        created.status = None;
        store.counters.workload_writes += 1;
        store.workloads.insert(key, created.clone());
        Ok(created)
    }

    async fn replace_workload(&self, workload: &Deployment) -> ClusterResult<Deployment> {
        let key = require_namespace(workload)?;
        let mut store = self.store();
        if let Some(err) = store.faults.workload_replace.take() {
            return Err(err);
        }

        let stored = store
            .workloads
            .get(&key)
            .ok_or_else(|| ClusterError::NotFound(key.to_string()))?;
        check_version(stored, workload)?;
        let status = stored.status.clone();

        let mut replaced = workload.clone();
        replaced.metadata.resource_version = Some(store.next_version());
        replaced.status = status;
        store.counters.workload_writes += 1;
        store.workloads.insert(key, replaced.clone());
        Ok(replaced)
    }
}
