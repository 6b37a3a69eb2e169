//! Replica reading and scaling for function deployments
//!
//! Reads never touch the cluster: current and available counts come from the
//! Deployment mirror, and the scaling bounds come from the labels the factory
//! stamped onto the Deployment. Writes are targeted merge patches guarded by
//! the last-observed resourceVersion so a concurrent writer is detected
//! instead of overwritten.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::{debug, info, instrument};

use crate::cache::{ClusterCache, ObjectKey};
use crate::controller::resources::{LABEL_SCALE_MAX, LABEL_SCALE_MIN};
use crate::crd::ScalingBounds;
use crate::error::{Error, Result};

/// Replica state of one function at a point in time
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReplicaSnapshot {
    /// Desired count from the Deployment spec
    pub replicas: i32,
    /// Ready-and-serving count from the Deployment status
    pub available: i32,
    /// Bounds advertised to autoscalers, absent labels leave `None`
    pub bounds: ScalingBounds,
}

/// Read the replica state of a function from the mirror
pub fn read_replicas(cache: &ClusterCache, key: &ObjectKey) -> Result<ReplicaSnapshot> {
    let deployment = cache
        .deployment(key)
        .ok_or_else(|| Error::FunctionNotFound(key.to_string()))?;
    Ok(snapshot_of(&deployment))
}

/// Extract the replica snapshot from a Deployment
pub fn snapshot_of(deployment: &Deployment) -> ReplicaSnapshot {
    ReplicaSnapshot {
        replicas: deployment
            .spec
            .as_ref()
            .and_then(|spec| spec.replicas)
            .unwrap_or(0),
        available: deployment
            .status
            .as_ref()
            .and_then(|status| status.available_replicas)
            .unwrap_or(0),
        bounds: parse_scale_bounds(deployment.metadata.labels.as_ref()),
    }
}

/// Parse the scale bound labels, ignoring values that are not counts
pub fn parse_scale_bounds(labels: Option<&BTreeMap<String, String>>) -> ScalingBounds {
    let bound = |label: &str| {
        labels
            .and_then(|map| map.get(label))
            .and_then(|value| value.parse::<i32>().ok())
            .filter(|count| *count >= 0)
    };
    ScalingBounds {
        min: bound(LABEL_SCALE_MIN),
        max: bound(LABEL_SCALE_MAX),
    }
}

/// Set the replica count of a function's Deployment.
///
/// The patch is conditioned on the mirror's resourceVersion. On a version
/// conflict the Deployment is re-read from the API server and the patch is
/// retried exactly once; a second conflict is surfaced as [`Error::Conflict`]
/// and left to the caller, who owns the retry policy.
///
/// Scaling to zero writes a zero count. The Deployment itself is never
/// deleted here, so scale-from-zero later is a pure replica bump.
#[instrument(skip(client, cache))]
pub async fn update_replicas(
    client: &Client,
    cache: &ClusterCache,
    key: &ObjectKey,
    desired: i32,
) -> Result<()> {
    if desired < 0 {
        return Err(Error::ValidationError(format!(
            "replica count must not be negative, got {desired}"
        )));
    }

    let deployment = cache
        .deployment(key)
        .ok_or_else(|| Error::FunctionNotFound(key.to_string()))?;
    let api: Api<Deployment> = Api::namespaced(client.clone(), &key.namespace);
    let observed_version = deployment.resource_version().unwrap_or_default();

    match patch_replicas(&api, &key.name, &observed_version, desired).await {
        Ok(()) => {
            info!(replicas = desired, "scaled deployment");
            Ok(())
        }
        Err(Error::KubeError(kube::Error::Api(e))) if e.code == 409 => {
            debug!("replica patch conflicted, re-reading before one retry");
            let fresh = api.get(&key.name).await?;
            let fresh_version = fresh.resource_version().unwrap_or_default();
            patch_replicas(&api, &key.name, &fresh_version, desired)
                .await
                .map_err(|err| match err {
                    Error::KubeError(kube::Error::Api(e)) if e.code == 409 => {
                        Error::Conflict(format!("deployments/{key}"))
                    }
                    other => other,
                })?;
            info!(replicas = desired, "scaled deployment after conflict retry");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

async fn patch_replicas(
    api: &Api<Deployment>,
    name: &str,
    resource_version: &str,
    replicas: i32,
) -> Result<()> {
    let patch = json!({
        "metadata": { "resourceVersion": resource_version },
        "spec": { "replicas": replicas }
    });
    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::fixture;
    use k8s_openapi::api::apps::v1::{DeploymentSpec, DeploymentStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn deployment(name: &str, replicas: i32, available: i32) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("fnstack-fn".to_string()),
                labels: Some(BTreeMap::from([
                    (LABEL_SCALE_MIN.to_string(), "1".to_string()),
                    (LABEL_SCALE_MAX.to_string(), "5".to_string()),
                ])),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(replicas),
                ..Default::default()
            }),
            status: Some(DeploymentStatus {
                available_replicas: Some(available),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_snapshot_reads_spec_status_and_labels() {
        let snapshot = snapshot_of(&deployment("figlet", 3, 2));

        assert_eq!(snapshot.replicas, 3);
        assert_eq!(snapshot.available, 2);
        assert_eq!(snapshot.bounds.min, Some(1));
        assert_eq!(snapshot.bounds.max, Some(5));
    }

    #[test]
    fn test_snapshot_tolerates_missing_fields() {
        let bare = Deployment::default();
        let snapshot = snapshot_of(&bare);

        assert_eq!(snapshot.replicas, 0);
        assert_eq!(snapshot.available, 0);
        assert_eq!(snapshot.bounds, ScalingBounds::default());
    }

    #[test]
    fn test_bounds_ignore_garbage_labels() {
        let labels = BTreeMap::from([
            (LABEL_SCALE_MIN.to_string(), "many".to_string()),
            (LABEL_SCALE_MAX.to_string(), "-2".to_string()),
        ]);
        let bounds = parse_scale_bounds(Some(&labels));

        assert_eq!(bounds.min, None);
        assert_eq!(bounds.max, None);
    }

    #[test]
    fn test_read_replicas_from_mirror() {
        let mut fixture = fixture::cache(false);
        fixture::apply(&mut fixture.deployments, deployment("figlet", 4, 4));

        let snapshot =
            read_replicas(&fixture.cache, &ObjectKey::new("fnstack-fn", "figlet")).unwrap();
        assert_eq!(snapshot.replicas, 4);

        let missing = read_replicas(&fixture.cache, &ObjectKey::new("fnstack-fn", "absent"));
        assert!(matches!(missing, Err(Error::FunctionNotFound(_))));
    }
}
