//! Runtime configuration for the operator
//!
//! All values arrive through CLI flags or environment variables and are
//! converted into plain structs passed to each component by its constructor.

use std::time::Duration;

use crate::error::{Error, Result};

/// UID assigned to function containers when non-root enforcement is on
pub const NONROOT_FUNCTION_USER: i64 = 12000;

/// Image pull policy applied to function containers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImagePullPolicy {
    Always,
    IfNotPresent,
    Never,
}

impl ImagePullPolicy {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "Always" => Ok(ImagePullPolicy::Always),
            "IfNotPresent" => Ok(ImagePullPolicy::IfNotPresent),
            "Never" => Ok(ImagePullPolicy::Never),
            other => Err(Error::ConfigError(format!(
                "invalid image pull policy {other:?}, expected Always, IfNotPresent or Never"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ImagePullPolicy::Always => "Always",
            ImagePullPolicy::IfNotPresent => "IfNotPresent",
            ImagePullPolicy::Never => "Never",
        }
    }
}

/// Timing knobs for a single container probe
#[derive(Clone, Copy, Debug)]
pub struct ProbeConfig {
    pub initial_delay_seconds: i32,
    pub timeout_seconds: i32,
    pub period_seconds: i32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            initial_delay_seconds: 2,
            timeout_seconds: 1,
            period_seconds: 2,
        }
    }
}

/// Settings stamped into every generated function workload
#[derive(Clone, Debug)]
pub struct DeploymentConfig {
    /// Port the function runtime listens on inside the container
    pub runtime_http_port: i32,
    /// Use an HTTP health probe instead of the exec lock-file fallback
    pub http_probe: bool,
    /// Force function containers to run as the non-root user
    pub set_nonroot_user: bool,
    pub image_pull_policy: ImagePullPolicy,
    pub readiness_probe: ProbeConfig,
    pub liveness_probe: ProbeConfig,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            runtime_http_port: 8080,
            http_probe: true,
            set_nonroot_user: false,
            image_pull_policy: ImagePullPolicy::Always,
            readiness_probe: ProbeConfig::default(),
            liveness_probe: ProbeConfig::default(),
        }
    }
}

/// Top-level operator configuration
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Namespace functions are deployed into when no other is given
    pub function_namespace: String,
    /// Namespace holding Profile resources
    pub profiles_namespace: String,
    /// Watch all namespaces instead of only `function_namespace`
    pub cluster_scope: bool,
    /// Full re-list interval for every watch mirror
    pub resync_interval: Duration,
    /// How long to wait for the initial cache sync before giving up
    pub startup_timeout: Duration,
    /// Number of concurrent reconcile workers
    pub workers: usize,
    /// Retriable reconcile attempts before a function is marked Failed
    pub max_retries: u32,
    /// Base delay for reconcile retry backoff
    pub retry_base: Duration,
    /// Cap for reconcile retry backoff
    pub retry_cap: Duration,
    /// Port the provider REST API listens on
    pub port: u16,
    /// Base URL of the Prometheus instance answering rate queries
    pub prometheus_url: String,
    pub deployment: DeploymentConfig,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            function_namespace: "default".to_string(),
            profiles_namespace: "fnstack".to_string(),
            cluster_scope: false,
            resync_interval: Duration::from_secs(300),
            startup_timeout: Duration::from_secs(60),
            workers: 2,
            max_retries: 5,
            retry_base: Duration::from_secs(2),
            retry_cap: Duration::from_secs(60),
            port: 8081,
            prometheus_url: "http://prometheus:9090".to_string(),
            deployment: DeploymentConfig::default(),
        }
    }
}

impl OperatorConfig {
    /// The namespace a function lives in, honoring an explicit override only
    /// when running cluster-scoped.
    pub fn resolve_namespace(&self, requested: Option<&str>) -> Result<String> {
        match requested {
            None => Ok(self.function_namespace.clone()),
            Some(ns) if ns == self.function_namespace => Ok(ns.to_string()),
            Some(ns) if self.cluster_scope => Ok(ns.to_string()),
            Some(ns) => Err(Error::ValidationError(format!(
                "namespace {ns:?} is not managed by this installation"
            ))),
        }
    }
}
