//! Status Updater Tests

use appctl::operator::{
    AppDeployment, AppDeploymentSpec, AppDeploymentStatus, ClusterApi, ClusterError,
    DeploymentState, InMemoryCluster, ObjectKey, OperatorError, RetryPolicy, StatusUpdater,
    StatusWrite,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

fn policy(backoff_ms: u64) -> RetryPolicy {
    RetryPolicy {
        max_attempts: 5,
        initial_backoff: Duration::from_millis(backoff_ms),
    }
}

async fn seeded() -> (Arc<InMemoryCluster>, ObjectKey) {
    let cluster = Arc::new(InMemoryCluster::new());
    let mut app = AppDeployment::new(
        "web",
        AppDeploymentSpec {
            image: "nginx:latest".to_string(),
            memory_limit: "128Mi".to_string(),
            ..Default::default()
        },
    );
    app.metadata.namespace = Some("default".to_string());
    let created = cluster.create_app(&app).await.unwrap();
    (cluster, created.object_key())
}

fn running(available: i32) -> AppDeploymentStatus {
    AppDeploymentStatus::new(
        DeploymentState::Running,
        format!("active with {available} replica(s)"),
        available,
    )
}

#[tokio::test]
async fn test_converges_through_conflicts() {
    let (cluster, key) = seeded().await;
    let updater = StatusUpdater::new(cluster.clone(), policy(1));

    cluster.inject_status_conflicts(2);
    let result = updater
        .update_status(&key, &running(2), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result, StatusWrite::Written { attempts: 3 });
    let app = cluster.app(&key).unwrap();
    assert_eq!(app.status.unwrap().available_replicas, 2);
    assert_eq!(app.spec.image, "nginx:latest");
}

#[tokio::test]
async fn test_gives_up_after_max_attempts() {
    let (cluster, key) = seeded().await;
    let updater = StatusUpdater::new(cluster.clone(), policy(1));

    cluster.inject_status_conflicts(10);
    let err = updater
        .update_status(&key, &running(1), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, OperatorError::Cluster(ClusterError::Conflict(_))));
    assert_eq!(cluster.status_write_attempts(), 5);
    assert!(cluster.app(&key).unwrap().status.is_none());
}

#[tokio::test]
async fn test_same_state_and_message_is_not_written() {
    let (cluster, key) = seeded().await;
    let updater = StatusUpdater::new(cluster.clone(), policy(1));
    let cancel = CancellationToken::new();

    updater.update_status(&key, &running(1), &cancel).await.unwrap();
    let attempts = cluster.status_write_attempts();

    let result = updater.update_status(&key, &running(1), &cancel).await.unwrap();
    assert_eq!(result, StatusWrite::Unchanged);
    assert_eq!(cluster.status_write_attempts(), attempts);
}

#[tokio::test]
async fn test_missing_record_is_not_found() {
    let cluster = Arc::new(InMemoryCluster::new());
    let updater = StatusUpdater::new(cluster.clone(), policy(1));

    let err = updater
        .update_status(
            &ObjectKey::new("default", "ghost"),
            &running(1),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(err.is_not_found());
    assert_eq!(cluster.status_write_attempts(), 0);
}

#[tokio::test]
async fn test_non_conflict_write_error_is_not_retried() {
    let (cluster, key) = seeded().await;
    let updater = StatusUpdater::new(cluster.clone(), policy(1));

    cluster.fail_next_status_write(ClusterError::Invalid("status too large".to_string()));
    let err = updater
        .update_status(&key, &running(1), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, OperatorError::Cluster(ClusterError::Invalid(_))));
    assert_eq!(cluster.status_write_attempts(), 1);
}

#[tokio::test]
async fn test_backoff_doubles_between_attempts() {
    let (cluster, key) = seeded().await;
    let updater = StatusUpdater::new(cluster.clone(), policy(20));

    // 20ms + 40ms of backoff before the third attempt
    cluster.inject_status_conflicts(2);
    let started = Instant::now();
    updater
        .update_status(&key, &running(1), &CancellationToken::new())
        .await
        .unwrap();

    assert!(started.elapsed() >= Duration::from_millis(60));
}

#[tokio::test]
async fn test_cancel_interrupts_backoff() {
    let (cluster, key) = seeded().await;
    let updater = StatusUpdater::new(cluster.clone(), policy(10_000));
    let cancel = CancellationToken::new();

    cluster.inject_status_conflicts(1);
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });

    let started = Instant::now();
    let err = updater
        .update_status(&key, &running(1), &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, OperatorError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(cluster.status_write_attempts(), 1);
}
