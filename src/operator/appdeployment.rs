//! AppDeployment Controller
//!
//! Drives the managed Deployment toward each AppDeployment's spec and
//! reports the observed state back into the record's status.

use super::cluster::{ClusterApi, ObjectKey};
use super::crd::{AppDeployment, AppDeploymentStatus, DeploymentState};
use super::locks::KeyedLocks;
use super::resources::{apply_drift, build_workload, detect_drift, replica_counts};
use super::status::{
    derive_status, with_ready_condition, RetryPolicy, StatusUpdater, StatusWrite, MSG_CREATED,
    MSG_UPDATED,
};
use super::types::{Context, OperatorError, Result};
use chrono::Utc;
use futures::{FutureExt, StreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Result of one reconcile pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// The record has not settled and should be looked at again soon
    pub requeue: bool,
}

impl ReconcileOutcome {
    fn settled() -> Self {
        Self { requeue: false }
    }

    fn requeue() -> Self {
        Self { requeue: true }
    }
}

/// Reconciles AppDeployments against their managed Deployments
pub struct Reconciler {
    cluster: Arc<dyn ClusterApi>,
    status: StatusUpdater,
    locks: KeyedLocks,
}

impl Reconciler {
    pub fn new(cluster: Arc<dyn ClusterApi>, policy: RetryPolicy) -> Self {
        Self {
            status: StatusUpdater::new(cluster.clone(), policy),
            cluster,
            locks: KeyedLocks::new(),
        }
    }

    /// One reconcile pass for `key`. Passes for the same key never overlap.
    pub async fn reconcile(
        &self,
        key: &ObjectKey,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome> {
        let _guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(OperatorError::Cancelled),
            guard = self.locks.lock(key) => guard,
        };

        let app = match self.cluster.get_app(key).await {
            Ok(app) => app,
            Err(e) if e.is_not_found() => {
                debug!(namespace = %key.namespace, name = %key.name, "AppDeployment is gone");
                return Ok(ReconcileOutcome::settled());
            }
            Err(e) => return Err(e.into()),
        };

        info!(namespace = %key.namespace, name = %key.name, "Reconciling AppDeployment");

        let workload_key = ObjectKey::new(key.namespace.clone(), app.workload_name());
        match self.cluster.get_workload(&workload_key).await {
            Ok(workload) => self.sync_workload(&app, workload, cancel).await,
            Err(e) if e.is_not_found() => self.create_workload(&app, cancel).await,
            Err(e) => Err(e.into()),
        }
    }

    async fn create_workload(
        &self,
        app: &AppDeployment,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome> {
        let workload = match build_workload(app) {
            Ok(workload) => workload,
            Err(OperatorError::InvalidSpec(reason)) => {
                return self.fail_invalid(app, reason, 0, cancel).await;
            }
            Err(e) => return Err(e),
        };

        let key = app.object_key();
        debug!(namespace = %key.namespace, name = %app.workload_name(), "Creating Deployment");
        if let Err(e) = self.cluster.create_workload(&workload).await {
            let message = format!("failed to create workload: {e}");
            return self.fail(app, message, 0, e, cancel).await;
        }

        self.publish(
            app,
            AppDeploymentStatus::new(DeploymentState::Pending, MSG_CREATED, 0),
            cancel,
        )
        .await?;
        Ok(ReconcileOutcome::requeue())
    }

    async fn sync_workload(
        &self,
        app: &AppDeployment,
        workload: Deployment,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome> {
        let counts = replica_counts(&workload);
        let drift = match detect_drift(app, &workload) {
            Ok(drift) => drift,
            Err(OperatorError::InvalidSpec(reason)) => {
                return self
                    .fail_invalid(app, reason, counts.available.max(0), cancel)
                    .await;
            }
            Err(e) => return Err(e),
        };

        if drift.any() {
            let key = app.object_key();
            info!(
                namespace = %key.namespace,
                name = %app.workload_name(),
                image = drift.image,
                memory = drift.memory,
                replicas = drift.replicas,
                "Deployment drifted from spec, updating"
            );

            let mut updated = workload;
            apply_drift(app, &mut updated, drift);
            if let Err(e) = self.cluster.replace_workload(&updated).await {
                let message = format!("failed to update workload: {e}");
                return self
                    .fail(app, message, counts.available.max(0), e, cancel)
                    .await;
            }

            self.publish(
                app,
                AppDeploymentStatus::new(
                    DeploymentState::Pending,
                    MSG_UPDATED,
                    counts.available.max(0),
                ),
                cancel,
            )
            .await?;
            return Ok(ReconcileOutcome::requeue());
        }

        let desired = derive_status(counts);
        let requeue = desired.state != DeploymentState::Running;
        self.publish(app, desired, cancel).await?;
        Ok(ReconcileOutcome { requeue })
    }

    /// Persist `status` unless the record already carries the same state
    /// and message
    async fn publish(
        &self,
        app: &AppDeployment,
        status: AppDeploymentStatus,
        cancel: &CancellationToken,
    ) -> Result<StatusWrite> {
        let previous = app.current_status();
        if previous.is_some_and(|p| p.same_phase(&status)) {
            return Ok(StatusWrite::Unchanged);
        }

        let status = with_ready_condition(status, previous, Utc::now());
        self.status
            .update_status(&app.object_key(), &status, cancel)
            .await
    }

    async fn fail_invalid(
        &self,
        app: &AppDeployment,
        reason: String,
        available: i32,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome> {
        let message = format!("invalid spec: {reason}");
        self.fail(app, message, available, OperatorError::InvalidSpec(reason), cancel)
            .await
    }

    /// Record a Failed status (best effort) and surface `err`
    async fn fail(
        &self,
        app: &AppDeployment,
        message: String,
        available: i32,
        err: impl Into<OperatorError>,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome> {
        let key = app.object_key();
        warn!(namespace = %key.namespace, name = %key.name, state = "Failed", "{message}");

        let status = AppDeploymentStatus::new(DeploymentState::Failed, message, available);
        if let Err(write_err) = self.publish(app, status, cancel).await {
            warn!(
                namespace = %key.namespace,
                name = %key.name,
                error = %write_err,
                "could not record failure in status"
            );
        }
        Err(err.into())
    }
}

/// Controller entry point for one AppDeployment
pub async fn reconcile_appdeployment(app: Arc<AppDeployment>, ctx: Arc<Context>) -> Result<Action> {
    let outcome = ctx
        .reconciler
        .reconcile(&app.object_key(), &ctx.cancel)
        .await?;

    Ok(if outcome.requeue {
        Action::requeue(ctx.settings.requeue_interval)
    } else {
        Action::requeue(ctx.settings.resync_interval)
    })
}

/// Error handler for the controller
pub fn error_policy(app: Arc<AppDeployment>, error: &OperatorError, ctx: Arc<Context>) -> Action {
    let key = app.object_key();
    error!(
        namespace = %key.namespace,
        name = %key.name,
        error = %error,
        "Reconciliation error"
    );
    Action::requeue(ctx.settings.error_requeue_interval)
}

/// Run the AppDeployment controller until `ctx.cancel` fires. An empty
/// namespace watches all namespaces.
pub async fn run_controller(client: Client, namespace: &str, ctx: Arc<Context>) -> Result<()> {
    let (apps, workloads): (Api<AppDeployment>, Api<Deployment>) = if namespace.is_empty() {
        (Api::all(client.clone()), Api::all(client))
    } else {
        (
            Api::namespaced(client.clone(), namespace),
            Api::namespaced(client, namespace),
        )
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        cancel.cancelled().await;
        let _ = shutdown_tx.send(());
    });

    info!(namespace, "Starting AppDeployment controller");

    Controller::new(apps, WatcherConfig::default())
        .owns(workloads, WatcherConfig::default())
        .graceful_shutdown_on(shutdown_rx.map(|_| ()))
        .run(reconcile_appdeployment, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _action)) => {
                    debug!(namespace = ?obj.namespace, name = %obj.name, "Reconciled");
                }
                Err(e) => {
                    warn!("Reconciliation failed: {:?}", e);
                }
            }
        })
        .await;

    info!("AppDeployment controller stopped");
    Ok(())
}
