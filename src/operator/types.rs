//! Operator Types
//!
//! Error, result and controller context types

use super::appdeployment::Reconciler;
use super::cluster::ClusterError;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Operator errors
#[derive(Error, Debug)]
pub enum OperatorError {
    #[error("cluster API error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("invalid resource spec: {0}")]
    InvalidSpec(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl OperatorError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, OperatorError::Cluster(e) if e.is_not_found())
    }
}

/// Result type for operator operations
pub type Result<T, E = OperatorError> = std::result::Result<T, E>;

/// Requeue timing for the controller loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerSettings {
    /// Delay before revisiting a record that is not yet Running
    pub requeue_interval: Duration,
    /// Periodic resync of settled records
    pub resync_interval: Duration,
    /// Delay after a failed reconcile
    pub error_requeue_interval: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            requeue_interval: Duration::from_secs(10),
            resync_interval: Duration::from_secs(300),
            error_requeue_interval: Duration::from_secs(60),
        }
    }
}

/// Context data for the controller
pub struct Context {
    pub reconciler: Reconciler,
    pub cancel: CancellationToken,
    pub settings: ControllerSettings,
}

impl Context {
    pub fn new(
        reconciler: Reconciler,
        cancel: CancellationToken,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            reconciler,
            cancel,
            settings,
        }
    }
}
