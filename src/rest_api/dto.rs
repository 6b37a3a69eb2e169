//! Wire types of the provider REST API
//!
//! Request and response bodies use the camelCase field names function
//! tooling already speaks. Conversion to and from the Function custom
//! resource lives here so both write paths share one mapping.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};

use crate::controller::{LABEL_FUNCTION_NAME, LABEL_SCALE_MAX, LABEL_SCALE_MIN};
use crate::controller::replicas::parse_scale_bounds;
use crate::crd::{Function, FunctionResources, FunctionSpec};

/// Deploy or update request for one function
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionDeployment {
    /// Name of the function, also the name of the generated workload
    pub service: String,
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env_process: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env_vars: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secrets: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub constraints: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limits: Option<FunctionResources>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requests: Option<FunctionResources>,
    #[serde(default)]
    pub read_only_root_filesystem: bool,
}

/// Observed state of one deployed function
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionStatus {
    pub name: String,
    pub image: String,
    pub namespace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env_process: Option<String>,
    pub replicas: i32,
    pub available_replicas: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secrets: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_replicas: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_replicas: Option<i32>,
    /// Recent request volume, filled from the metrics backend when available
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invocation_count: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

/// Body of `POST /system/scale-function/{name}`
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    pub replicas: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Body of `DELETE /system/functions`
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteFunctionRequest {
    pub function_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Error body returned by every failing endpoint
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
        }
    }
}

impl FunctionDeployment {
    /// Build the Function resource this request describes.
    ///
    /// Scale bound labels are parsed into the scaling field so both the
    /// factory and autoscalers see the same numbers. `namespace` is set by
    /// the caller after resolving the request against the install scope.
    pub fn into_function(self, namespace: &str) -> Function {
        let scaling = {
            let bounds = parse_scale_bounds(self.labels.as_ref());
            (bounds.min.is_some() || bounds.max.is_some()).then_some(bounds)
        };

        let spec = FunctionSpec {
            image: self.image,
            env_process: self.env_process,
            environment: self.env_vars,
            labels: self.labels,
            annotations: self.annotations,
            secrets: self.secrets,
            constraints: self.constraints,
            limits: self.limits.filter(|r| !r.is_empty()),
            requests: self.requests.filter(|r| !r.is_empty()),
            replicas: None,
            scaling,
            profiles: None,
            read_only_root_filesystem: self.read_only_root_filesystem,
        };

        let mut function = Function::new(&self.service, spec);
        function.metadata.namespace = Some(namespace.to_string());
        function
    }
}

impl FunctionStatus {
    /// Read a function's status off its mirrored Deployment.
    ///
    /// Returns `None` for Deployments this operator does not manage.
    pub fn from_deployment(deployment: &Deployment) -> Option<Self> {
        let labels = deployment.metadata.labels.as_ref()?;
        let name = labels.get(LABEL_FUNCTION_NAME)?.clone();
        let bounds = parse_scale_bounds(Some(labels));

        let spec = deployment.spec.as_ref();
        let template_spec = spec.and_then(|s| s.template.spec.as_ref());
        let container = template_spec.and_then(|pod| pod.containers.first());

        let env_process = container.and_then(|c| {
            c.env
                .as_deref()
                .unwrap_or_default()
                .iter()
                .find(|env| env.name == "fprocess")
                .and_then(|env| env.value.clone())
        });
        let secrets: Vec<String> = template_spec
            .and_then(|pod| pod.volumes.as_ref())
            .map(|volumes| {
                volumes
                    .iter()
                    .filter_map(|v| v.projected.as_ref())
                    .flat_map(|p| p.sources.as_deref().unwrap_or_default())
                    .filter_map(|s| s.secret.as_ref())
                    .filter_map(|s| s.name.clone())
                    .collect()
            })
            .unwrap_or_default();

        let user_labels: BTreeMap<String, String> = labels
            .iter()
            .filter(|(key, _)| {
                *key != LABEL_SCALE_MIN && *key != LABEL_SCALE_MAX && !key.starts_with("app.kubernetes.io/")
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Some(Self {
            name,
            image: container.map(|c| c.image.clone().unwrap_or_default())?,
            namespace: deployment.namespace().unwrap_or_default(),
            env_process,
            replicas: spec.and_then(|s| s.replicas).unwrap_or(0),
            available_replicas: deployment
                .status
                .as_ref()
                .and_then(|s| s.available_replicas)
                .unwrap_or(0),
            labels: (!user_labels.is_empty()).then_some(user_labels),
            annotations: deployment
                .spec
                .as_ref()
                .and_then(|s| s.template.metadata.as_ref())
                .and_then(|m| m.annotations.clone()),
            secrets: (!secrets.is_empty()).then_some(secrets),
            min_replicas: bounds.min,
            max_replicas: bounds.max,
            invocation_count: None,
            created_at: deployment
                .metadata
                .creation_timestamp
                .as_ref()
                .map(|t| t.0.to_rfc3339()),
        })
    }
}
