//! Watch Cache Tests

use appctl::operator::{
    AppDeployment, AppDeploymentSpec, ClusterApi, InMemoryCluster, ObjectKey, WatchEvent,
};
use appctl::{CacheState, WatchCache};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

fn record(namespace: &str, name: &str) -> AppDeployment {
    let mut app = AppDeployment::new(
        name,
        AppDeploymentSpec {
            image: "nginx:latest".to_string(),
            memory_limit: "128Mi".to_string(),
            ..Default::default()
        },
    );
    app.metadata.namespace = Some(namespace.to_string());
    app
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

struct Harness {
    cluster: Arc<InMemoryCluster>,
    cache: Arc<WatchCache>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Harness {
    async fn start(cluster: Arc<InMemoryCluster>, reconnect_delay: Duration) -> Self {
        let cache = Arc::new(WatchCache::new(
            cluster.clone(),
            "default",
            reconnect_delay,
        ));
        let cancel = CancellationToken::new();
        let task = cache.spawn(cancel.clone());

        let mut state = cache.subscribe_state();
        tokio::time::timeout(
            Duration::from_secs(2),
            state.wait_for(|s| *s == CacheState::Streaming),
        )
        .await
        .expect("cache started streaming")
        .unwrap();

        Self {
            cluster,
            cache,
            cancel,
            task,
        }
    }

    async fn stop(self) {
        self.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), self.task)
            .await
            .expect("cache task stopped")
            .unwrap();
        assert_eq!(self.cache.state(), CacheState::Draining);
    }
}

#[tokio::test]
async fn test_initial_list_populates_namespace_only() {
    let cluster = Arc::new(InMemoryCluster::new());
    cluster.create_app(&record("default", "a")).await.unwrap();
    cluster.create_app(&record("default", "b")).await.unwrap();
    cluster.create_app(&record("other", "c")).await.unwrap();

    let h = Harness::start(cluster, Duration::from_millis(10)).await;

    assert_eq!(h.cache.len(), 2);
    assert!(h.cache.get("a").is_some());
    assert!(h.cache.get("c").is_none());
    assert_eq!(h.cache.generation(), 1);
    h.stop().await;
}

#[tokio::test]
async fn test_added_and_deleted_events_are_applied() {
    let h = Harness::start(Arc::new(InMemoryCluster::new()), Duration::from_millis(10)).await;

    h.cluster.create_app(&record("default", "web")).await.unwrap();
    eventually("web cached", || h.cache.get("web").is_some()).await;

    h.cluster
        .delete_app(&ObjectKey::new("default", "web"))
        .await
        .unwrap();
    eventually("web evicted", || h.cache.get("web").is_none()).await;
    h.stop().await;
}

#[tokio::test]
async fn test_modified_event_refreshes_entry() {
    let cluster = Arc::new(InMemoryCluster::new());
    cluster.create_app(&record("default", "web")).await.unwrap();
    let h = Harness::start(cluster, Duration::from_millis(10)).await;

    h.cluster.update_app_spec(&ObjectKey::new("default", "web"), |spec| {
        spec.image = "nginx:1.25".to_string()
    });
    eventually("new image cached", || {
        h.cache
            .get("web")
            .is_some_and(|app| app.spec.image == "nginx:1.25")
    })
    .await;
    h.stop().await;
}

#[tokio::test]
async fn test_closed_stream_is_reopened() {
    let h = Harness::start(Arc::new(InMemoryCluster::new()), Duration::from_millis(10)).await;

    h.cluster.close_watches();
    eventually("second stream", || h.cache.generation() == 2).await;

    h.cluster.create_app(&record("default", "late")).await.unwrap();
    eventually("late cached", || h.cache.get("late").is_some()).await;
    h.stop().await;
}

#[tokio::test]
async fn test_relist_drops_records_deleted_while_disconnected() {
    let cluster = Arc::new(InMemoryCluster::new());
    cluster.create_app(&record("default", "keep")).await.unwrap();
    cluster.create_app(&record("default", "gone")).await.unwrap();
    let h = Harness::start(cluster, Duration::from_millis(50)).await;
    assert!(h.cache.get("gone").is_some());

    h.cluster.fail_watch_opens(1);
    h.cluster.close_watches();
    eventually("reopen attempt", || h.cluster.watch_opens() >= 2).await;

    h.cluster
        .delete_app(&ObjectKey::new("default", "gone"))
        .await
        .unwrap();

    eventually("relisted", || h.cache.generation() == 2).await;
    assert!(h.cache.get("gone").is_none());
    assert!(h.cache.get("keep").is_some());
    h.stop().await;
}

#[tokio::test]
async fn test_lookups_served_while_disconnected() {
    let cluster = Arc::new(InMemoryCluster::new());
    cluster.create_app(&record("default", "keep")).await.unwrap();
    let h = Harness::start(cluster, Duration::from_secs(30)).await;

    h.cluster.fail_watch_opens(u32::MAX);
    h.cluster.close_watches();
    eventually("failed reopen", || {
        h.cluster.watch_opens() >= 2 && h.cache.state() == CacheState::Disconnected
    })
    .await;

    assert!(h.cache.get("keep").is_some());
    assert_eq!(h.cache.len(), 1);
    assert_eq!(h.cache.generation(), 1);
    h.stop().await;
}

#[tokio::test]
async fn test_error_and_phantom_events_leave_cache_alone() {
    let cluster = Arc::new(InMemoryCluster::new());
    cluster.create_app(&record("default", "web")).await.unwrap();
    let h = Harness::start(cluster, Duration::from_millis(10)).await;

    h.cluster
        .inject_watch_event(WatchEvent::Error("too old resource version".to_string()));
    h.cluster
        .inject_watch_event(WatchEvent::Added(ObjectKey::new("default", "ghost")));

    // Events apply in order; once this one lands the others have too
    h.cluster.create_app(&record("default", "marker")).await.unwrap();
    eventually("marker cached", || h.cache.get("marker").is_some()).await;

    assert!(h.cache.get("ghost").is_none());
    assert!(h.cache.get("web").is_some());
    assert_eq!(h.cache.len(), 2);
    assert_eq!(h.cache.generation(), 1);
    h.stop().await;
}

#[tokio::test]
async fn test_cancel_during_reconnect_delay() {
    let cluster = Arc::new(InMemoryCluster::new());
    cluster.fail_watch_opens(u32::MAX);
    let cache = Arc::new(WatchCache::new(
        cluster.clone(),
        "default",
        Duration::from_secs(30),
    ));
    let cancel = CancellationToken::new();
    let task = cache.spawn(cancel.clone());

    eventually("first open attempt", || cluster.watch_opens() >= 1).await;
    assert_eq!(cache.state(), CacheState::Disconnected);

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("cache task stopped")
        .unwrap();
    assert_eq!(cache.state(), CacheState::Draining);
    assert_eq!(cache.generation(), 0);
}

#[tokio::test]
async fn test_read_through_fills_misses() {
    let cluster = Arc::new(InMemoryCluster::new());
    cluster.create_app(&record("default", "web")).await.unwrap();
    let cache = WatchCache::new(cluster.clone(), "default", Duration::from_millis(10));

    assert!(cache.is_empty());
    let app = cache
        .get_or_fetch(&ObjectKey::new("default", "web"))
        .await
        .unwrap();
    assert!(app.is_some());
    assert_eq!(cache.len(), 1);

    let missing = cache
        .get_or_fetch(&ObjectKey::new("default", "nope"))
        .await
        .unwrap();
    assert!(missing.is_none());
    assert_eq!(cache.len(), 1);
}
