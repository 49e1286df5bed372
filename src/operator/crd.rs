use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::cluster::ObjectKey;

// ==================== AppDeployment CRD ====================

#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "appctl.dev",
    version = "v1",
    kind = "AppDeployment",
    plural = "appdeployments",
    shortname = "appd",
    status = "AppDeploymentStatus",
    namespaced,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Available","type":"integer","jsonPath":".status.availableReplicas"}"#,
    printcolumn = r#"{"name":"Message","type":"string","jsonPath":".status.message"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AppDeploymentSpec {
    /// Container image to run
    pub image: String,

    /// Name of the managed workload; defaults to the resource name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,

    /// Memory limit of the primary container (e.g. "256Mi")
    pub memory_limit: String,

    /// Replica floor; the workload runs this many replicas
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_replicas: Option<i32>,

    /// Replica ceiling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_replicas: Option<i32>,

    /// Selector for the workload's pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,

    /// Pod template for the workload
    #[serde(default)]
    pub template: PodTemplate,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodTemplate {
    #[serde(default)]
    pub metadata: TemplateMetadata,

    #[serde(default)]
    pub spec: TemplatePodSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TemplateMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TemplatePodSpec {
    #[serde(default)]
    pub containers: Vec<ContainerTemplate>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerTemplate {
    pub name: String,
    pub image: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<ContainerPortTemplate>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerPortTemplate {
    pub container_port: i32,
}

/// Lifecycle state reported in an AppDeployment's status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum DeploymentState {
    #[default]
    Pending,
    Running,
    Failed,
}

impl DeploymentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentState::Pending => "Pending",
            DeploymentState::Running => "Running",
            DeploymentState::Failed => "Failed",
        }
    }
}

impl fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AppDeploymentStatus {
    /// Current state of the AppDeployment
    #[serde(default)]
    pub state: DeploymentState,

    /// Human readable detail for the current state
    #[serde(default)]
    pub message: String,

    /// Number of available workload replicas
    #[serde(default)]
    pub available_replicas: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
}

impl AppDeploymentStatus {
    pub fn new(state: DeploymentState, message: impl Into<String>, available_replicas: i32) -> Self {
        Self {
            state,
            message: message.into(),
            available_replicas,
            conditions: None,
        }
    }

    /// Two statuses describe the same phase when state and message match.
    /// Replica counts and conditions are not compared.
    pub fn same_phase(&self, other: &AppDeploymentStatus) -> bool {
        self.state == other.state && self.message == other.message
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl AppDeployment {
    /// Identity of this record
    pub fn object_key(&self) -> ObjectKey {
        ObjectKey::for_resource(self)
    }

    /// Name of the managed workload: the explicit app name when set,
    /// otherwise the record's own name
    pub fn workload_name(&self) -> String {
        match self.spec.app_name.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => self.name_any(),
        }
    }

    /// Replica count the workload should run, never below one
    pub fn replica_floor(&self) -> i32 {
        self.spec.min_replicas.filter(|n| *n > 0).unwrap_or(1)
    }

    /// Last status written to this record, if any
    pub fn current_status(&self) -> Option<&AppDeploymentStatus> {
        self.status.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    fn sample(app_name: Option<&str>, min_replicas: Option<i32>) -> AppDeployment {
        AppDeployment::new(
            "web",
            AppDeploymentSpec {
                image: "nginx:latest".to_string(),
                app_name: app_name.map(str::to_string),
                memory_limit: "256Mi".to_string(),
                min_replicas,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_workload_name_falls_back_to_record_name() {
        assert_eq!(sample(None, None).workload_name(), "web");
        assert_eq!(sample(Some(""), None).workload_name(), "web");
        assert_eq!(sample(Some("frontend"), None).workload_name(), "frontend");
    }

    #[test]
    fn test_replica_floor_defaults_to_one() {
        assert_eq!(sample(None, None).replica_floor(), 1);
        assert_eq!(sample(None, Some(0)).replica_floor(), 1);
        assert_eq!(sample(None, Some(3)).replica_floor(), 3);
    }

    #[test]
    fn test_status_serializes_state_as_string() {
        let status = AppDeploymentStatus::new(DeploymentState::Running, "active with 1 replica(s)", 1);
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "Running");
        assert_eq!(json["availableReplicas"], 1);
        assert!(json.get("conditions").is_none());
    }

    #[test]
    fn test_same_phase_ignores_replica_count() {
        let a = AppDeploymentStatus::new(DeploymentState::Pending, "x", 0);
        let b = AppDeploymentStatus::new(DeploymentState::Pending, "x", 3);
        let c = AppDeploymentStatus::new(DeploymentState::Running, "x", 0);
        assert!(a.same_phase(&b));
        assert!(!a.same_phase(&c));
    }

    #[test]
    fn test_crd_has_status_subresource() {
        let crd = AppDeployment::crd();
        assert_eq!(crd.spec.group, "appctl.dev");
        assert_eq!(crd.spec.names.kind, "AppDeployment");
        let version = &crd.spec.versions[0];
        assert!(version.subresources.as_ref().unwrap().status.is_some());
    }
}
