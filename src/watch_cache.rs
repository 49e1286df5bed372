//! Watch-fed AppDeployment cache
//!
//! A background task lists AppDeployments, then follows the watch stream
//! from the list's resource version. When the server closes the stream the
//! task relists and reopens it; the list result replaces the map in one
//! step so removals that happened while disconnected are not served.

use crate::operator::{
    AppDeployment, ClusterApi, ClusterResult, ObjectKey, WatchEvent, WatchStream,
};
use futures::StreamExt;
use kube::ResourceExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Stream consumer state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// No stream open; lookups serve whatever is cached
    Disconnected,
    /// Applying events from an open stream
    Streaming,
    /// Cancelled. Terminal.
    Draining,
}

pub struct WatchCache {
    cluster: Arc<dyn ClusterApi>,
    namespace: String,
    reconnect_delay: Duration,
    entries: RwLock<HashMap<String, AppDeployment>>,
    state: watch::Sender<CacheState>,
    generation: AtomicU64,
}

impl WatchCache {
    /// Cache for `namespace`; an empty namespace covers all namespaces
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        namespace: impl Into<String>,
        reconnect_delay: Duration,
    ) -> Self {
        let (state, _) = watch::channel(CacheState::Disconnected);
        Self {
            cluster,
            namespace: namespace.into(),
            reconnect_delay,
            entries: RwLock::new(HashMap::new()),
            state,
            generation: AtomicU64::new(0),
        }
    }

    pub fn get(&self, name: &str) -> Option<AppDeployment> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn insert(&self, app: AppDeployment) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(app.name_any(), app);
    }

    pub fn remove(&self, name: &str) -> Option<AppDeployment> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read-through lookup: on a miss the record is fetched and cached.
    /// Returns `None` when the record does not exist.
    pub async fn get_or_fetch(&self, key: &ObjectKey) -> ClusterResult<Option<AppDeployment>> {
        if let Some(app) = self.get(&key.name) {
            return Ok(Some(app));
        }

        match self.cluster.get_app(key).await {
            Ok(app) => {
                debug!(namespace = %key.namespace, name = %key.name, "cache miss filled");
                self.insert(app.clone());
                Ok(Some(app))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn state(&self) -> CacheState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<CacheState> {
        self.state.subscribe()
    }

    /// Number of stream instances opened so far
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: CacheState) {
        self.state.send_replace(state);
    }

    /// Start the stream consumer on the runtime
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move { cache.run(cancel).await })
    }

    /// Consume the watch stream until `cancel` fires, reopening it whenever
    /// it closes
    pub async fn run(&self, cancel: CancellationToken) {
        info!(namespace = %self.namespace, "Starting AppDeployment watch cache");

        while !cancel.is_cancelled() {
            match self.open().await {
                Ok(stream) => {
                    self.consume(stream, &cancel).await;
                    if cancel.is_cancelled() {
                        break;
                    }
                    self.set_state(CacheState::Disconnected);
                    info!(
                        namespace = %self.namespace,
                        generation = self.generation(),
                        "watch stream closed, reconnecting"
                    );
                }
                Err(e) => {
                    self.set_state(CacheState::Disconnected);
                    warn!(
                        namespace = %self.namespace,
                        error = %e,
                        retry_in_ms = self.reconnect_delay.as_millis() as u64,
                        "failed to open watch stream"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.reconnect_delay) => {}
                    }
                }
            }
        }

        self.set_state(CacheState::Draining);
        info!(namespace = %self.namespace, "watch cache stopped");
    }

    async fn open(&self) -> ClusterResult<WatchStream> {
        let list = self.cluster.list_apps(&self.namespace).await?;
        let stream = self
            .cluster
            .watch_apps(&self.namespace, &list.version)
            .await?;

        let snapshot = list
            .items
            .into_iter()
            .map(|app| (app.name_any(), app))
            .collect::<HashMap<_, _>>();
        let count = snapshot.len();
        *self.entries.write().unwrap_or_else(PoisonError::into_inner) = snapshot;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_state(CacheState::Streaming);
        debug!(
            namespace = %self.namespace,
            version = %list.version,
            generation,
            entries = count,
            "watch stream open"
        );
        Ok(stream)
    }

    async fn consume(&self, mut stream: WatchStream, cancel: &CancellationToken) {
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                event = stream.next() => event,
            };
            match event {
                Some(event) => self.apply(event).await,
                None => return,
            }
        }
    }

    async fn apply(&self, event: WatchEvent) {
        match event {
            WatchEvent::Added(key) | WatchEvent::Modified(key) => {
                match self.cluster.get_app(&key).await {
                    Ok(app) => self.insert(app),
                    Err(e) if e.is_not_found() => {
                        self.remove(&key.name);
                    }
                    Err(e) => {
                        warn!(
                            namespace = %key.namespace,
                            name = %key.name,
                            error = %e,
                            "could not refresh cache entry"
                        );
                    }
                }
            }
            WatchEvent::Deleted(key) => {
                self.remove(&key.name);
                debug!(namespace = %key.namespace, name = %key.name, "cache entry removed");
            }
            WatchEvent::Error(message) => {
                warn!(namespace = %self.namespace, error = %message, "watch stream error");
            }
        }
    }
}
