mod appdeployment;
mod cluster;
mod crd;
mod kube_cluster;
mod locks;
mod memory;
pub mod quantity;
mod resources;
mod status;
mod types;

pub use appdeployment::{
    error_policy, reconcile_appdeployment, run_controller, ReconcileOutcome, Reconciler,
};
pub use cluster::{
    AppList, ClusterApi, ClusterError, ClusterResult, ObjectKey, WatchEvent, WatchStream,
};
pub use crd::{
    AppDeployment, AppDeploymentSpec, AppDeploymentStatus, Condition, ContainerPortTemplate,
    ContainerTemplate, DeploymentState, PodTemplate, TemplateMetadata, TemplatePodSpec,
};
pub use kube_cluster::KubeCluster;
pub use locks::KeyedLocks;
pub use memory::InMemoryCluster;
pub use resources::{
    apply_drift, build_workload, detect_drift, replica_counts, WorkloadDrift,
    DEFAULT_CONTAINER_PORT, MANAGED_BY_LABEL, MANAGER_NAME,
};
pub use status::{
    derive_status, with_ready_condition, ReplicaCounts, RetryPolicy, StatusUpdater, StatusWrite,
    MSG_CREATED, MSG_UNSCHEDULED, MSG_UPDATED, READY_CONDITION,
};
pub use types::{Context, ControllerSettings, OperatorError, Result};
