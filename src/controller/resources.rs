//! Kubernetes resource builders for functions
//!
//! This module translates a function definition into the Deployment and
//! Service that run it. The translation is a pure function of the spec and
//! the operator's deployment settings, so the same input always produces
//! byte-identical output regardless of which path (custom resource or REST
//! deploy request) supplied it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use k8s_openapi::api::apps::v1::{
    Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment,
};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EmptyDirVolumeSource, EnvVar, ExecAction, HTTPGetAction, PodSpec,
    PodTemplateSpec, Probe, ProjectedVolumeSource, ResourceRequirements, SecretProjection,
    SecurityContext, Service, ServicePort, ServiceSpec, Volume, VolumeMount, VolumeProjection,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::{Client, Resource, ResourceExt};
use tracing::{info, instrument};

use crate::cache::{object_ref, ClusterCache, ObjectKey};
use crate::config::{DeploymentConfig, ProbeConfig, NONROOT_FUNCTION_USER};
use crate::crd::{Function, FunctionSpec, Profile, ProfileSpec};
use crate::error::{Error, Result};

/// Field manager recorded by every server-side apply this operator performs
pub const FIELD_MANAGER: &str = "fnstack-operator";

/// Label carrying the function name, also the sole selector label
pub const LABEL_FUNCTION_NAME: &str = "fnstack.dev/function";
/// Labels advertising replica bounds to autoscalers
pub const LABEL_SCALE_MIN: &str = "fnstack.dev/scale-min";
pub const LABEL_SCALE_MAX: &str = "fnstack.dev/scale-max";

const SECRETS_VOLUME_NAME: &str = "projected-secrets";
const SECRETS_MOUNT_PATH: &str = "/var/fnstack/secrets";
const SCRATCH_VOLUME_NAME: &str = "temp";
const SCRATCH_MOUNT_PATH: &str = "/tmp";
const HEALTH_PATH: &str = "/_/health";

type Labels = BTreeMap<String, String>;

/// The pair of resources that together run one function
#[derive(Clone, Debug)]
pub struct FunctionWorkload {
    pub deployment: Deployment,
    pub service: Service,
}

// ============================================================================
// Labels and ownership
// ============================================================================

/// Labels stamped on every resource the operator manages
pub fn standard_labels(name: &str) -> Labels {
    BTreeMap::from([
        (LABEL_FUNCTION_NAME.to_string(), name.to_string()),
        (
            "app.kubernetes.io/managed-by".to_string(),
            "fnstack-operator".to_string(),
        ),
    ])
}

/// The immutable selector linking a function's Deployment to its pods.
///
/// Deliberately excludes user labels: a label edit must never orphan the
/// running ReplicaSets.
pub fn selector_labels(name: &str) -> Labels {
    BTreeMap::from([(LABEL_FUNCTION_NAME.to_string(), name.to_string())])
}

fn deployment_labels(name: &str, spec: &FunctionSpec) -> Labels {
    let mut labels = spec.labels.clone().unwrap_or_default();
    if let Some(bounds) = &spec.scaling {
        if let Some(min) = bounds.min {
            labels.insert(LABEL_SCALE_MIN.to_string(), min.to_string());
        }
        if let Some(max) = bounds.max {
            labels.insert(LABEL_SCALE_MAX.to_string(), max.to_string());
        }
    }
    // Core labels win over user labels of the same name.
    labels.extend(standard_labels(name));
    labels
}

fn build_annotations(spec: &FunctionSpec) -> Labels {
    let mut annotations = BTreeMap::from([(
        "prometheus.io.scrape".to_string(),
        "false".to_string(),
    )]);
    if let Some(user) = &spec.annotations {
        annotations.extend(user.clone());
    }
    annotations
}

/// Create an OwnerReference for garbage collection.
///
/// Returns `None` for synthetic functions that were never persisted as
/// custom resources (direct REST deployments have no owner).
pub fn owner_reference(function: &Function) -> Option<OwnerReference> {
    let uid = function.metadata.uid.clone()?;
    Some(OwnerReference {
        api_version: Function::api_version(&()).to_string(),
        kind: Function::kind(&()).to_string(),
        name: function.name_any(),
        uid,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

// ============================================================================
// Rendering
// ============================================================================

/// Translates function definitions into runnable workloads
#[derive(Clone)]
pub struct FunctionFactory {
    config: DeploymentConfig,
}

impl FunctionFactory {
    pub fn new(config: DeploymentConfig) -> Self {
        Self { config }
    }

    /// Render the Deployment and Service for a function.
    ///
    /// `current_replicas` is the replica count of the already-running
    /// Deployment, if any. When the spec does not pin a count, that value is
    /// carried forward so a redeploy never undoes autoscaler decisions.
    pub fn translate(
        &self,
        function: &Function,
        profiles: &[Arc<Profile>],
        current_replicas: Option<i32>,
    ) -> FunctionWorkload {
        let name = function.name_any();
        let namespace = function.namespace().unwrap_or_else(|| "default".to_string());
        let spec = &function.spec;

        let labels = deployment_labels(&name, spec);
        let annotations = build_annotations(spec);
        let owner = owner_reference(function);

        let (volumes, mounts) = build_volumes(spec);
        let mut container = self.build_container(&name, spec);
        container.volume_mounts = mounts;

        let mut pod_spec = PodSpec {
            containers: vec![container],
            node_selector: build_node_selector(spec.constraints.as_deref().unwrap_or_default()),
            volumes,
            ..Default::default()
        };
        for profile in profiles {
            apply_profile(&mut pod_spec, &profile.spec);
        }

        let deployment = Deployment {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(namespace.clone()),
                labels: Some(labels.clone()),
                annotations: Some(annotations.clone()),
                owner_references: owner.clone().map(|reference| vec![reference]),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(resolve_replicas(spec, current_replicas)),
                selector: LabelSelector {
                    match_labels: Some(selector_labels(&name)),
                    ..Default::default()
                },
                strategy: Some(DeploymentStrategy {
                    type_: Some("RollingUpdate".to_string()),
                    rolling_update: Some(RollingUpdateDeployment {
                        max_surge: Some(IntOrString::Int(1)),
                        max_unavailable: Some(IntOrString::Int(0)),
                    }),
                }),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels.clone()),
                        annotations: Some(annotations.clone()),
                        ..Default::default()
                    }),
                    spec: Some(pod_spec),
                },
                ..Default::default()
            }),
            status: None,
        };

        let service = Service {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(namespace),
                labels: Some(standard_labels(&name)),
                annotations: Some(annotations),
                owner_references: owner.map(|reference| vec![reference]),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                selector: Some(selector_labels(&name)),
                ports: Some(vec![ServicePort {
                    name: Some("http".to_string()),
                    port: 8080,
                    target_port: Some(IntOrString::Int(self.config.runtime_http_port)),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            status: None,
        };

        FunctionWorkload {
            deployment,
            service,
        }
    }

    fn build_container(&self, name: &str, spec: &FunctionSpec) -> Container {
        let mut env = Vec::new();
        if let Some(process) = &spec.env_process {
            env.push(EnvVar {
                name: "fprocess".to_string(),
                value: Some(process.clone()),
                ..Default::default()
            });
        }
        if let Some(vars) = &spec.environment {
            for (key, value) in vars {
                env.push(EnvVar {
                    name: key.clone(),
                    value: Some(value.clone()),
                    ..Default::default()
                });
            }
        }

        Container {
            name: name.to_string(),
            image: Some(spec.image.clone()),
            image_pull_policy: Some(self.config.image_pull_policy.as_str().to_string()),
            ports: Some(vec![ContainerPort {
                name: Some("http".to_string()),
                container_port: self.config.runtime_http_port,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            env: (!env.is_empty()).then_some(env),
            resources: build_resources(spec),
            readiness_probe: Some(self.build_probe(&self.config.readiness_probe)),
            liveness_probe: Some(self.build_probe(&self.config.liveness_probe)),
            security_context: self.build_security_context(spec),
            ..Default::default()
        }
    }

    fn build_probe(&self, timing: &ProbeConfig) -> Probe {
        let mut probe = Probe {
            initial_delay_seconds: Some(timing.initial_delay_seconds),
            timeout_seconds: Some(timing.timeout_seconds),
            period_seconds: Some(timing.period_seconds),
            ..Default::default()
        };
        if self.config.http_probe {
            probe.http_get = Some(HTTPGetAction {
                path: Some(HEALTH_PATH.to_string()),
                port: IntOrString::Int(self.config.runtime_http_port),
                scheme: Some("HTTP".to_string()),
                ..Default::default()
            });
        } else {
            // Watchdog runtimes without a health endpoint touch a lock file
            // once they are serving.
            probe.exec = Some(ExecAction {
                command: Some(vec!["cat".to_string(), "/tmp/.lock".to_string()]),
            });
        }
        probe
    }

    fn build_security_context(&self, spec: &FunctionSpec) -> Option<SecurityContext> {
        let mut context = SecurityContext::default();
        let mut configured = false;
        if spec.read_only_root_filesystem {
            context.read_only_root_filesystem = Some(true);
            configured = true;
        }
        if self.config.set_nonroot_user {
            context.run_as_user = Some(NONROOT_FUNCTION_USER);
            configured = true;
        }
        configured.then_some(context)
    }
}

/// Pick the replica count for a rendered Deployment
pub fn resolve_replicas(spec: &FunctionSpec, current: Option<i32>) -> i32 {
    if let Some(declared) = spec.replicas {
        return declared.max(0);
    }
    if let Some(current) = current {
        return current;
    }
    spec.scaling
        .and_then(|bounds| bounds.min)
        .filter(|min| *min > 0)
        .unwrap_or(1)
}

fn build_resources(spec: &FunctionSpec) -> Option<ResourceRequirements> {
    let limits = quantity_map(spec.limits.as_ref());
    let requests = quantity_map(spec.requests.as_ref());
    if limits.is_none() && requests.is_none() {
        return None;
    }
    Some(ResourceRequirements {
        limits,
        requests,
        ..Default::default()
    })
}

fn quantity_map(
    resources: Option<&crate::crd::FunctionResources>,
) -> Option<BTreeMap<String, Quantity>> {
    let resources = resources?;
    let mut map = BTreeMap::new();
    if let Some(memory) = &resources.memory {
        map.insert("memory".to_string(), Quantity(memory.clone()));
    }
    if let Some(cpu) = &resources.cpu {
        map.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    (!map.is_empty()).then_some(map)
}

/// Parse "key=value" scheduling constraints into a node selector.
///
/// Accepts the legacy "key==value" form as well; malformed entries are
/// skipped rather than failing the whole deployment.
fn build_node_selector(constraints: &[String]) -> Option<Labels> {
    let selector: Labels = constraints
        .iter()
        .filter_map(|constraint| {
            constraint
                .split_once("==")
                .or_else(|| constraint.split_once('='))
                .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        })
        .collect();
    (!selector.is_empty()).then_some(selector)
}

fn build_volumes(spec: &FunctionSpec) -> (Option<Vec<Volume>>, Option<Vec<VolumeMount>>) {
    let mut volumes = Vec::new();
    let mut mounts = Vec::new();

    let secrets = spec.secrets.as_deref().unwrap_or_default();
    if !secrets.is_empty() {
        volumes.push(Volume {
            name: SECRETS_VOLUME_NAME.to_string(),
            projected: Some(ProjectedVolumeSource {
                sources: Some(
                    secrets
                        .iter()
                        .map(|secret| VolumeProjection {
                            secret: Some(SecretProjection {
                                name: Some(secret.clone()),
                                ..Default::default()
                            }),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: SECRETS_VOLUME_NAME.to_string(),
            mount_path: SECRETS_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        });
    }

    if spec.read_only_root_filesystem {
        // The root filesystem is sealed, so give the runtime a writable /tmp.
        volumes.push(Volume {
            name: SCRATCH_VOLUME_NAME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: SCRATCH_VOLUME_NAME.to_string(),
            mount_path: SCRATCH_MOUNT_PATH.to_string(),
            ..Default::default()
        });
    }

    (
        (!volumes.is_empty()).then_some(volumes),
        (!mounts.is_empty()).then_some(mounts),
    )
}

// ============================================================================
// Profiles
// ============================================================================

/// Look up every profile a function references, in declaration order
pub fn resolve_profiles(cache: &ClusterCache, spec: &FunctionSpec) -> Result<Vec<Arc<Profile>>> {
    let names = spec.profiles.as_deref().unwrap_or_default();
    let mut profiles = Vec::with_capacity(names.len());
    for name in names {
        let key = ObjectKey::new(cache.profiles_namespace(), name);
        let profile = cache.profiles().get(&object_ref(&key)).ok_or_else(|| {
            Error::ValidationError(format!(
                "unknown profile {name:?} in namespace {:?}",
                cache.profiles_namespace()
            ))
        })?;
        profiles.push(profile);
    }
    Ok(profiles)
}

/// Overlay one profile onto a rendered pod spec.
///
/// Profiles are additive: list-valued settings append, scalar settings
/// replace. Core container fields (image, env, probes) are out of reach.
pub fn apply_profile(pod_spec: &mut PodSpec, profile: &ProfileSpec) {
    if let Some(tolerations) = &profile.tolerations {
        pod_spec
            .tolerations
            .get_or_insert_with(Vec::new)
            .extend(tolerations.iter().cloned());
    }
    if let Some(runtime_class) = &profile.runtime_class_name {
        pod_spec.runtime_class_name = Some(runtime_class.clone());
    }
    if let Some(affinity) = &profile.affinity {
        pod_spec.affinity = Some(affinity.clone());
    }
    if let Some(security) = &profile.pod_security_context {
        pod_spec.security_context = Some(security.clone());
    }
    if let Some(constraints) = &profile.topology_spread_constraints {
        pod_spec
            .topology_spread_constraints
            .get_or_insert_with(Vec::new)
            .extend(constraints.iter().cloned());
    }
    if let Some(volumes) = &profile.volumes {
        pod_spec
            .volumes
            .get_or_insert_with(Vec::new)
            .extend(volumes.iter().cloned());
    }
    if let Some(mounts) = &profile.volume_mounts {
        if let Some(container) = pod_spec.containers.first_mut() {
            container
                .volume_mounts
                .get_or_insert_with(Vec::new)
                .extend(mounts.iter().cloned());
        }
    }
}

// ============================================================================
// Drift detection
// ============================================================================

/// Compare a rendered Deployment against the observed one.
///
/// Returns the first aspect that differs, or `None` when the observed state
/// matches. Annotations and top-level labels are subset-checked because the
/// Deployment controller injects bookkeeping keys we do not own.
pub fn workload_drift(desired: &Deployment, observed: &Deployment) -> Option<&'static str> {
    if replicas_of(desired) != replicas_of(observed) {
        return Some("replicas");
    }

    let (want, have) = match (first_container(desired), first_container(observed)) {
        (Some(want), Some(have)) => (want, have),
        _ => return Some("containers"),
    };
    if want.image != have.image {
        return Some("image");
    }
    if env_map(want) != env_map(have) {
        return Some("environment");
    }
    if want.resources.clone().unwrap_or_default() != have.resources.clone().unwrap_or_default() {
        return Some("resources");
    }
    if want.security_context != have.security_context {
        return Some("securityContext");
    }

    if secret_volume_sources(desired) != secret_volume_sources(observed) {
        return Some("secrets");
    }
    if template_labels(desired) != template_labels(observed)
        || !is_subset(desired.metadata.labels.as_ref(), observed.metadata.labels.as_ref())
    {
        return Some("labels");
    }
    if !is_subset(
        template_annotations(desired),
        template_annotations(observed),
    ) || !is_subset(
        desired.metadata.annotations.as_ref(),
        observed.metadata.annotations.as_ref(),
    ) {
        return Some("annotations");
    }
    if node_selector(desired) != node_selector(observed) {
        return Some("nodeSelector");
    }

    None
}

fn replicas_of(deployment: &Deployment) -> Option<i32> {
    deployment.spec.as_ref().and_then(|spec| spec.replicas)
}

fn first_container(deployment: &Deployment) -> Option<&Container> {
    deployment
        .spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .first()
}

fn env_map(container: &Container) -> BTreeMap<&str, Option<&str>> {
    container
        .env
        .iter()
        .flatten()
        .map(|var| (var.name.as_str(), var.value.as_deref()))
        .collect()
}

fn secret_volume_sources(deployment: &Deployment) -> BTreeSet<&str> {
    deployment
        .spec
        .iter()
        .filter_map(|spec| spec.template.spec.as_ref())
        .flat_map(|pod| pod.volumes.iter().flatten())
        .filter(|volume| volume.name == SECRETS_VOLUME_NAME)
        .flat_map(|volume| volume.projected.iter())
        .flat_map(|projected| projected.sources.iter().flatten())
        .filter_map(|source| source.secret.as_ref()?.name.as_deref())
        .collect()
}

fn template_labels(deployment: &Deployment) -> Option<&Labels> {
    deployment
        .spec
        .as_ref()?
        .template
        .metadata
        .as_ref()?
        .labels
        .as_ref()
}

fn template_annotations(deployment: &Deployment) -> Option<&Labels> {
    deployment
        .spec
        .as_ref()?
        .template
        .metadata
        .as_ref()?
        .annotations
        .as_ref()
}

fn node_selector(deployment: &Deployment) -> Option<&Labels> {
    deployment
        .spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .node_selector
        .as_ref()
}

fn is_subset(want: Option<&Labels>, have: Option<&Labels>) -> bool {
    let Some(want) = want else { return true };
    want.iter()
        .all(|(key, value)| have.and_then(|map| map.get(key)) == Some(value))
}

// ============================================================================
// Apply and delete
// ============================================================================

/// Apply a rendered Deployment with server-side apply, returning the
/// server's view of it
#[instrument(skip(client, deployment), fields(name = %deployment.name_any(), namespace = deployment.namespace()))]
pub async fn apply_deployment(client: &Client, deployment: &Deployment) -> Result<Deployment> {
    let namespace = deployment
        .namespace()
        .unwrap_or_else(|| "default".to_string());
    let api: Api<Deployment> = Api::namespaced(client.clone(), &namespace);

    let applied = api
        .patch(
            &deployment.name_any(),
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(deployment),
        )
        .await?;

    Ok(applied)
}

/// Apply a rendered Service with server-side apply
#[instrument(skip(client, service), fields(name = %service.name_any(), namespace = service.namespace()))]
pub async fn apply_service(client: &Client, service: &Service) -> Result<Service> {
    let namespace = service.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<Service> = Api::namespaced(client.clone(), &namespace);

    let applied = api
        .patch(
            &service.name_any(),
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(service),
        )
        .await?;

    Ok(applied)
}

/// Delete a function's Deployment and Service, tolerating absence
#[instrument(skip(client))]
pub async fn delete_function_workload(client: &Client, namespace: &str, name: &str) -> Result<()> {
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    match deployments.delete(name, &DeleteParams::background()).await {
        Ok(_) => info!("deleted deployment {name}"),
        Err(kube::Error::Api(e)) if e.code == 404 => {}
        Err(e) => return Err(Error::KubeError(e)),
    }

    let services: Api<Service> = Api::namespaced(client.clone(), namespace);
    match services.delete(name, &DeleteParams::background()).await {
        Ok(_) => info!("deleted service {name}"),
        Err(kube::Error::Api(e)) if e.code == 404 => {}
        Err(e) => return Err(Error::KubeError(e)),
    }

    Ok(())
}
