//! Wire types shared by the HTTP server and the CLI client

use crate::operator::quantity::parse_bytes;
use crate::operator::{
    AppDeployment, AppDeploymentSpec, ContainerPortTemplate, ContainerTemplate, DeploymentState,
    PodTemplate, TemplateMetadata, TemplatePodSpec, DEFAULT_CONTAINER_PORT,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Body of `POST /deploy`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployRequest {
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub memory_limit: String,
    #[serde(default)]
    pub min_replicas: i32,
    #[serde(default)]
    pub max_replicas: i32,
}

/// Rejected deploy request
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing required fields: name, image, memoryLimit")]
    MissingFields,

    #[error("invalid memoryLimit: {0}")]
    InvalidMemoryLimit(String),
}

impl DeployRequest {
    /// Replica bounds after defaulting: min at least 1, max at least min
    pub fn replica_bounds(&self) -> (i32, i32) {
        let min = if self.min_replicas <= 0 {
            1
        } else {
            self.min_replicas
        };
        let max = self.max_replicas.max(min);
        (min, max)
    }

    /// Build the AppDeployment this request describes in `namespace`
    pub fn to_app_deployment(&self, namespace: &str) -> Result<AppDeployment, ValidationError> {
        if self.name.is_empty() || self.image.is_empty() || self.memory_limit.is_empty() {
            return Err(ValidationError::MissingFields);
        }
        parse_bytes(&self.memory_limit)
            .map_err(|e| ValidationError::InvalidMemoryLimit(e.to_string()))?;

        let (min, max) = self.replica_bounds();
        let labels = BTreeMap::from([("app".to_string(), self.name.clone())]);

        let mut app = AppDeployment::new(
            &self.name,
            AppDeploymentSpec {
                image: self.image.clone(),
                app_name: Some(self.name.clone()),
                memory_limit: self.memory_limit.clone(),
                min_replicas: Some(min),
                max_replicas: Some(max),
                selector: Some(LabelSelector {
                    match_labels: Some(labels.clone()),
                    ..Default::default()
                }),
                template: PodTemplate {
                    metadata: TemplateMetadata {
                        labels: Some(labels),
                    },
                    spec: TemplatePodSpec {
                        containers: vec![ContainerTemplate {
                            name: self.name.clone(),
                            image: self.image.clone(),
                            ports: vec![ContainerPortTemplate {
                                container_port: DEFAULT_CONTAINER_PORT,
                            }],
                        }],
                    },
                },
            },
        );
        app.metadata.namespace = Some(namespace.to_string());
        Ok(app)
    }
}

/// Generic `{status, message}` reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageResponse {
    pub status: String,
    pub message: String,
}

impl MessageResponse {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: "success".to_string(),
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            message: message.into(),
        }
    }
}

/// Reply of `GET /status/{name}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: DeploymentState,
    pub replicas: i32,
}

impl From<&AppDeployment> for StatusResponse {
    fn from(app: &AppDeployment) -> Self {
        let status = app.status.clone().unwrap_or_default();
        Self {
            status: status.state,
            replicas: status.available_replicas,
        }
    }
}
