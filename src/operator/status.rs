//! Status derivation and the optimistic-concurrency status updater

use super::cluster::{ClusterApi, ObjectKey};
use super::crd::{AppDeploymentStatus, Condition, DeploymentState};
use super::types::{OperatorError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const MSG_CREATED: &str = "created, waiting for replicas";
pub const MSG_UPDATED: &str = "updated, waiting for pods";
pub const MSG_UNSCHEDULED: &str = "waiting for pods to be scheduled";

pub const READY_CONDITION: &str = "Ready";

/// Replica counters of a workload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicaCounts {
    pub available: i32,
    pub desired: i32,
    pub total: i32,
    pub unavailable: i32,
}

/// Status for a workload whose spec matches its record. Pure and total:
/// negative counters are treated as zero.
pub fn derive_status(counts: ReplicaCounts) -> AppDeploymentStatus {
    let available = counts.available.max(0);
    let desired = counts.desired.max(0);
    let total = counts.total.max(0);
    let unavailable = counts.unavailable.max(0);

    if available == 0 {
        let message = if total == 0 {
            MSG_UNSCHEDULED.to_string()
        } else {
            let missing = if unavailable > 0 { unavailable } else { total };
            format!("has {missing} unavailable replica(s)")
        };
        return AppDeploymentStatus::new(DeploymentState::Pending, message, 0);
    }

    if available < desired {
        return AppDeploymentStatus::new(
            DeploymentState::Pending,
            format!("scaling up: {available}/{desired} replicas"),
            available,
        );
    }

    AppDeploymentStatus::new(
        DeploymentState::Running,
        format!("active with {available} replica(s)"),
        available,
    )
}

/// Attach a `Ready` condition mirroring `status`. The transition time is
/// carried over from `previous` while readiness is unchanged.
pub fn with_ready_condition(
    mut status: AppDeploymentStatus,
    previous: Option<&AppDeploymentStatus>,
    now: DateTime<Utc>,
) -> AppDeploymentStatus {
    let ready = if status.state == DeploymentState::Running {
        "True"
    } else {
        "False"
    };

    let last_transition_time = previous
        .and_then(|p| p.conditions.as_ref())
        .and_then(|c| c.iter().find(|c| c.type_ == READY_CONDITION))
        .filter(|c| c.status == ready)
        .and_then(|c| c.last_transition_time.clone())
        .unwrap_or_else(|| now.to_rfc3339_opts(SecondsFormat::Secs, true));

    status.conditions = Some(vec![Condition {
        type_: READY_CONDITION.to_string(),
        status: ready.to_string(),
        last_transition_time: Some(last_transition_time),
        reason: Some(status.state.to_string()),
        message: Some(status.message.clone()),
    }]);
    status
}

/// Bounded exponential backoff for status write conflicts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
        }
    }
}

/// Outcome of a status update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusWrite {
    /// Stored status already had the requested state and message
    Unchanged,
    /// Written after this many attempts
    Written { attempts: u32 },
}

/// Writes status through re-fetch, compare and version-checked update
#[derive(Clone)]
pub struct StatusUpdater {
    cluster: Arc<dyn ClusterApi>,
    policy: RetryPolicy,
}

impl StatusUpdater {
    pub fn new(cluster: Arc<dyn ClusterApi>, policy: RetryPolicy) -> Self {
        Self { cluster, policy }
    }

    pub async fn update_status(
        &self,
        key: &ObjectKey,
        desired: &AppDeploymentStatus,
        cancel: &CancellationToken,
    ) -> Result<StatusWrite> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut backoff = self.policy.initial_backoff;
        let mut attempt = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(OperatorError::Cancelled);
            }

            let mut latest = self.cluster.get_app(key).await?;
            if latest
                .current_status()
                .is_some_and(|current| current.same_phase(desired))
            {
                debug!(namespace = %key.namespace, name = %key.name, "status unchanged");
                return Ok(StatusWrite::Unchanged);
            }

            attempt += 1;
            latest.status = Some(desired.clone());
            match self.cluster.replace_app_status(&latest).await {
                Ok(_) => {
                    info!(
                        namespace = %key.namespace,
                        name = %key.name,
                        state = %desired.state,
                        attempt,
                        "status updated"
                    );
                    return Ok(StatusWrite::Written { attempts: attempt });
                }
                Err(e) if e.is_conflict() && attempt < max_attempts => {
                    warn!(
                        namespace = %key.namespace,
                        name = %key.name,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "status write conflict, retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(OperatorError::Cancelled),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = backoff.saturating_mul(2);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
