//! Managed workload construction
//!
//! Builds the Deployment owned by an AppDeployment and compares a live
//! Deployment against the record's spec.

use super::crd::{AppDeployment, ContainerTemplate};
use super::quantity::parse_bytes;
use super::status::ReplicaCounts;
use super::types::{OperatorError, Result};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PodSpec, PodTemplateSpec, ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGER_NAME: &str = "appctl";
pub const DEFAULT_CONTAINER_PORT: i32 = 80;

const MEMORY: &str = "memory";

/// Which workload fields differ from the record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkloadDrift {
    pub image: bool,
    pub memory: bool,
    pub replicas: bool,
}

impl WorkloadDrift {
    pub fn any(&self) -> bool {
        self.image || self.memory || self.replicas
    }
}

fn pod_labels(app: &AppDeployment) -> BTreeMap<String, String> {
    match &app.spec.template.metadata.labels {
        Some(labels) if !labels.is_empty() => labels.clone(),
        _ => BTreeMap::from([("app".to_string(), app.workload_name())]),
    }
}

fn to_container(template: &ContainerTemplate) -> Container {
    let ports = template
        .ports
        .iter()
        .map(|p| ContainerPort {
            container_port: p.container_port,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        })
        .collect::<Vec<_>>();

    Container {
        name: template.name.clone(),
        image: Some(template.image.clone()),
        ports: (!ports.is_empty()).then_some(ports),
        ..Default::default()
    }
}

fn memory_limits(memory_limit: &str) -> ResourceRequirements {
    ResourceRequirements {
        limits: Some(BTreeMap::from([(
            MEMORY.to_string(),
            Quantity(memory_limit.to_string()),
        )])),
        ..Default::default()
    }
}

/// Point the primary container at the record's image and memory limit
fn set_primary(app: &AppDeployment, container: &mut Container) {
    container.image = Some(app.spec.image.clone());
    container
        .resources
        .get_or_insert_with(Default::default)
        .limits
        .get_or_insert_with(BTreeMap::new)
        .insert(MEMORY.to_string(), Quantity(app.spec.memory_limit.clone()));
}

fn containers(app: &AppDeployment) -> Vec<Container> {
    let mut containers = if app.spec.template.spec.containers.is_empty() {
        vec![Container {
            name: app.workload_name(),
            ports: Some(vec![ContainerPort {
                container_port: DEFAULT_CONTAINER_PORT,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            resources: Some(memory_limits(&app.spec.memory_limit)),
            ..Default::default()
        }]
    } else {
        app.spec.template.spec.containers.iter().map(to_container).collect()
    };

    if let Some(primary) = containers.first_mut() {
        set_primary(app, primary);
    }
    containers
}

fn parse_memory(app: &AppDeployment) -> Result<u128> {
    parse_bytes(&app.spec.memory_limit)
        .map_err(|e| OperatorError::InvalidSpec(format!("memoryLimit: {e}")))
}

/// Create the Deployment for an AppDeployment
pub fn build_workload(app: &AppDeployment) -> Result<Deployment> {
    let namespace = app
        .namespace()
        .ok_or_else(|| OperatorError::InvalidSpec("namespace required".to_string()))?;
    parse_memory(app)?;

    let pod_labels = pod_labels(app);
    let mut labels = pod_labels.clone();
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGER_NAME.to_string());

    let selector = app.spec.selector.clone().unwrap_or_else(|| LabelSelector {
        match_labels: Some(pod_labels.clone()),
        ..Default::default()
    });

    let deployment = Deployment {
        metadata: ObjectMeta {
            name: Some(app.workload_name()),
            namespace: Some(namespace),
            labels: Some(labels),
            owner_references: app.controller_owner_ref(&()).map(|o| vec![o]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(app.replica_floor()),
            selector,
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: containers(app),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    };

    Ok(deployment)
}

fn primary_container(workload: &Deployment) -> Option<&Container> {
    workload
        .spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .first()
}

/// Compare the live workload with the record, field by field. Memory is
/// compared as a byte count; a workload limit that does not parse counts
/// as drift.
pub fn detect_drift(app: &AppDeployment, workload: &Deployment) -> Result<WorkloadDrift> {
    let desired_memory = parse_memory(app)?;
    let primary = primary_container(workload);

    let image = primary.and_then(|c| c.image.as_deref()) != Some(app.spec.image.as_str());

    let live_memory = primary
        .and_then(|c| c.resources.as_ref())
        .and_then(|r| r.limits.as_ref())
        .and_then(|l| l.get(MEMORY))
        .and_then(|q| parse_bytes(&q.0).ok());
    let memory = live_memory != Some(desired_memory);

    let live_replicas = workload
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let replicas = live_replicas != app.replica_floor();

    Ok(WorkloadDrift {
        image,
        memory,
        replicas,
    })
}

/// Bring the drifted fields of `workload` back in line with the record
pub fn apply_drift(app: &AppDeployment, workload: &mut Deployment, drift: WorkloadDrift) {
    let spec = workload.spec.get_or_insert_with(Default::default);
    if drift.replicas {
        spec.replicas = Some(app.replica_floor());
    }
    if drift.image || drift.memory {
        let pod = spec.template.spec.get_or_insert_with(Default::default);
        if pod.containers.is_empty() {
            pod.containers = containers(app);
        } else {
            set_primary(app, &mut pod.containers[0]);
        }
    }
}

/// Replica counters observed on the workload
pub fn replica_counts(workload: &Deployment) -> ReplicaCounts {
    let status = workload.status.clone().unwrap_or_default();
    ReplicaCounts {
        available: status.available_replicas.unwrap_or(0),
        desired: workload
            .spec
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or(1),
        total: status.replicas.unwrap_or(0),
        unavailable: status.unavailable_replicas.unwrap_or(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::crd::{AppDeploymentSpec, ContainerPortTemplate};

    fn app(memory: &str, min_replicas: Option<i32>) -> AppDeployment {
        let mut app = AppDeployment::new(
            "web",
            AppDeploymentSpec {
                image: "nginx:latest".to_string(),
                memory_limit: memory.to_string(),
                min_replicas,
                ..Default::default()
            },
        );
        app.metadata.namespace = Some("default".to_string());
        app.metadata.uid = Some("uid-1".to_string());
        app
    }

    #[test]
    fn test_build_workload_defaults() {
        let workload = build_workload(&app("256Mi", None)).unwrap();
        assert_eq!(workload.metadata.name.as_deref(), Some("web"));
        assert_eq!(workload.metadata.namespace.as_deref(), Some("default"));
        assert_eq!(
            workload.labels().get(MANAGED_BY_LABEL).map(String::as_str),
            Some(MANAGER_NAME)
        );

        let owner = &workload.owner_references()[0];
        assert_eq!(owner.uid, "uid-1");
        assert_eq!(owner.controller, Some(true));

        let spec = workload.spec.as_ref().unwrap();
        assert_eq!(spec.replicas, Some(1));
        let container = &spec.template.spec.as_ref().unwrap().containers[0];
        assert_eq!(container.image.as_deref(), Some("nginx:latest"));
        assert_eq!(container.ports.as_ref().unwrap()[0].container_port, 80);
        let limits = container.resources.as_ref().unwrap().limits.as_ref().unwrap();
        assert_eq!(limits[MEMORY].0, "256Mi");
    }

    #[test]
    fn test_build_workload_uses_template_containers() {
        let mut record = app("128Mi", Some(2));
        record.spec.template.spec.containers = vec![
            ContainerTemplate {
                name: "main".to_string(),
                image: "ignored:0".to_string(),
                ports: vec![ContainerPortTemplate {
                    container_port: 8080,
                }],
            },
            ContainerTemplate {
                name: "sidecar".to_string(),
                image: "envoy:1".to_string(),
                ports: vec![],
            },
        ];

        let workload = build_workload(&record).unwrap();
        let spec = workload.spec.as_ref().unwrap();
        assert_eq!(spec.replicas, Some(2));
        let containers = &spec.template.spec.as_ref().unwrap().containers;
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[0].image.as_deref(), Some("nginx:latest"));
        assert_eq!(containers[0].ports.as_ref().unwrap()[0].container_port, 8080);
        assert_eq!(containers[1].image.as_deref(), Some("envoy:1"));
        assert!(containers[1].resources.is_none());
    }

    #[test]
    fn test_build_workload_rejects_bad_memory() {
        let err = build_workload(&app("lots", None)).unwrap_err();
        assert!(matches!(err, OperatorError::InvalidSpec(_)));
    }

    #[test]
    fn test_memory_drift_is_compared_as_quantity() {
        let record = app("1Gi", None);
        let mut workload = build_workload(&record).unwrap();
        let container =
            &mut workload.spec.as_mut().unwrap().template.spec.as_mut().unwrap().containers[0];
        container
            .resources
            .as_mut()
            .unwrap()
            .limits
            .as_mut()
            .unwrap()
            .insert(MEMORY.to_string(), Quantity("1073741824".to_string()));

        assert!(!detect_drift(&record, &workload).unwrap().any());
    }

    #[test]
    fn test_detect_and_apply_drift() {
        let record = app("256Mi", Some(1));
        let mut workload = build_workload(&record).unwrap();

        let mut changed = record.clone();
        changed.spec.image = "nginx:1.25".to_string();
        changed.spec.min_replicas = Some(3);

        let drift = detect_drift(&changed, &workload).unwrap();
        assert_eq!(
            drift,
            WorkloadDrift {
                image: true,
                memory: false,
                replicas: true
            }
        );

        apply_drift(&changed, &mut workload, drift);
        assert!(!detect_drift(&changed, &workload).unwrap().any());
        assert_eq!(workload.spec.as_ref().unwrap().replicas, Some(3));
    }

    #[test]
    fn test_replica_counts_defaults() {
        let workload = build_workload(&app("256Mi", Some(2))).unwrap();
        assert_eq!(
            replica_counts(&workload),
            ReplicaCounts {
                available: 0,
                desired: 2,
                total: 0,
                unavailable: 0
            }
        );
    }
}
