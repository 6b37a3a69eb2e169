//! Profile Custom Resource Definition
//!
//! A Profile carries pod-level settings a platform operator curates and
//! functions opt into by name: tolerations, placement, runtime class, pod
//! security and extra volumes. Profiles are additive on top of the generated
//! workload and can never reach into the function container's core fields.

use k8s_openapi::api::core::v1::{
    Affinity, PodSecurityContext, Toleration, TopologySpreadConstraint, Volume, VolumeMount,
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "fnstack.dev",
    version = "v1alpha1",
    kind = "Profile",
    namespaced,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSpec {
    /// Tolerations appended to the pod spec
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<Vec<serde_json::Value>>")]
    pub tolerations: Option<Vec<Toleration>>,

    /// Runtime class set on the pod spec (e.g. gVisor, Kata)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_class_name: Option<String>,

    /// Affinity rules set on the pod spec
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<serde_json::Value>")]
    pub affinity: Option<Affinity>,

    /// Pod-level security context
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<serde_json::Value>")]
    pub pod_security_context: Option<PodSecurityContext>,

    /// Topology spread constraints appended to the pod spec
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<Vec<serde_json::Value>>")]
    pub topology_spread_constraints: Option<Vec<TopologySpreadConstraint>>,

    /// Extra volumes appended to the pod spec
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<Vec<serde_json::Value>>")]
    pub volumes: Option<Vec<Volume>>,

    /// Mounts for the extra volumes, appended to the function container
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<Vec<serde_json::Value>>")]
    pub volume_mounts: Option<Vec<VolumeMount>>,
}
