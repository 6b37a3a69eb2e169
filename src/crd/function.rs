//! Function Custom Resource Definition
//!
//! A Function describes one deployable FnStack workload: the container image,
//! its runtime environment, and the scaling bounds advertised to autoscalers.
//! The reconciler translates each Function into a Deployment and a Service.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, FunctionResources, ScalingBounds};

/// Structured validation error for `FunctionSpec`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpecValidationError {
    pub field: String,
    pub message: String,
    pub how_to_fix: String,
}

impl SpecValidationError {
    pub fn new(
        field: impl Into<String>,
        message: impl Into<String>,
        how_to_fix: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            how_to_fix: how_to_fix.into(),
        }
    }
}

#[derive(CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "fnstack.dev",
    version = "v1alpha1",
    kind = "Function",
    namespaced,
    status = "FunctionStatus",
    shortname = "fn",
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.image"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Available","type":"integer","jsonPath":".status.availableReplicas"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct FunctionSpec {
    /// Container image running the function
    pub image: String,

    /// Entrypoint override exported to the container as the `fprocess`
    /// environment variable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env_process: Option<String>,

    /// Environment variables for the function container
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<BTreeMap<String, String>>,

    /// Extra labels stamped onto the generated workload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,

    /// Extra annotations stamped onto the generated workload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,

    /// Secret names projected read-only into the function container
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secrets: Option<Vec<String>>,

    /// Node placement constraints of the form "label=value"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub constraints: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub limits: Option<FunctionResources>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub requests: Option<FunctionResources>,

    /// Declared replica count. When unset the operator leaves the count
    /// alone so an external autoscaler can own it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub scaling: Option<ScalingBounds>,

    /// Names of Profile resources merged into the generated pod spec
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profiles: Option<Vec<String>>,

    /// Mount the container root filesystem read-only, with a writable /tmp
    #[serde(default)]
    pub read_only_root_filesystem: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FunctionStatus {
    /// Lifecycle phase: Pending, Reconciling, Ready, or Failed
    #[serde(default)]
    pub phase: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub available_replicas: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Check a function name against the DNS-1123 label rules Kubernetes
/// enforces on Service and Deployment names.
pub fn validate_function_name(name: &str) -> Result<(), SpecValidationError> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-');

    if valid {
        Ok(())
    } else {
        Err(SpecValidationError::new(
            "name",
            format!("{name:?} is not a valid function name"),
            "Use a lowercase RFC 1123 label: alphanumerics and '-', at most 63 characters, \
             starting and ending with an alphanumeric.",
        ))
    }
}

impl FunctionSpec {
    /// Validate the spec before any workload is generated from it
    pub fn validate(&self) -> Result<(), Vec<SpecValidationError>> {
        let mut errors: Vec<SpecValidationError> = Vec::new();

        if self.image.trim().is_empty() {
            errors.push(SpecValidationError::new(
                "spec.image",
                "image must not be empty",
                "Set spec.image to the container image that runs the function.",
            ));
        }

        if let Some(replicas) = self.replicas {
            if replicas < 0 {
                errors.push(SpecValidationError::new(
                    "spec.replicas",
                    "replicas must not be negative",
                    "Set spec.replicas to zero or a positive count, or remove it to let an \
                     autoscaler own the count.",
                ));
            }
        }

        if let Some(scaling) = &self.scaling {
            if scaling.min.is_some_and(|min| min < 0) {
                errors.push(SpecValidationError::new(
                    "spec.scaling.min",
                    "minimum replicas must not be negative",
                    "Set spec.scaling.min to zero or a positive count.",
                ));
            }
            if let (Some(min), Some(max)) = (scaling.min, scaling.max) {
                if max < min {
                    errors.push(SpecValidationError::new(
                        "spec.scaling",
                        format!("maximum replicas ({max}) is below minimum ({min})"),
                        "Raise spec.scaling.max to at least spec.scaling.min.",
                    ));
                }
            }
        }

        if let Some(secrets) = &self.secrets {
            for secret in secrets {
                if secret.trim().is_empty() {
                    errors.push(SpecValidationError::new(
                        "spec.secrets",
                        "secret names must not be empty",
                        "Remove the empty entry from spec.secrets.",
                    ));
                }
            }
        }

        if let Some(constraints) = &self.constraints {
            for constraint in constraints {
                if !constraint.contains('=') {
                    errors.push(SpecValidationError::new(
                        "spec.constraints",
                        format!("constraint {constraint:?} is not of the form \"label=value\""),
                        "Write each constraint as a node label selector, e.g. \
                         \"kubernetes.io/arch=arm64\".",
                    ));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Flatten validation errors into a single message for status reporting
    pub fn validate_message(&self) -> Option<String> {
        match self.validate() {
            Ok(()) => None,
            Err(errors) => Some(
                errors
                    .iter()
                    .map(|e| format!("{}: {}", e.field, e.message))
                    .collect::<Vec<_>>()
                    .join("; "),
            ),
        }
    }
}
