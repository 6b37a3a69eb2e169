//! Write paths behind the provider API
//!
//! The handlers speak to a [`WorkloadWriter`] and never care which mode the
//! process runs in. In declarative mode writes land on Function custom
//! resources and the reconciler converges the cluster. In imperative mode
//! writes translate and apply the workload synchronously, the way a
//! standalone provider without a CRD installation works.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::{info, instrument};

use crate::cache::{ClusterCache, ObjectKey};
use crate::controller::{
    apply_deployment, apply_service, delete_function_workload, resolve_profiles, FunctionFactory,
    LABEL_FUNCTION_NAME,
};
use crate::crd::Function;
use crate::error::{Error, Result};

/// Write side of the provider API, one implementation per mode
#[async_trait]
pub trait WorkloadWriter: Send + Sync {
    /// Create a new function. Fails with [`Error::Conflict`] when a function
    /// of that name already exists.
    async fn deploy(&self, function: &Function) -> Result<()>;

    /// Replace an existing function's spec. Fails with
    /// [`Error::FunctionNotFound`] when there is nothing to update.
    async fn update(&self, function: &Function) -> Result<()>;

    /// Remove a function and its workload.
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Declarative mode: persist Function custom resources
pub struct CustomResourceWriter {
    client: Client,
}

impl CustomResourceWriter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Function> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl WorkloadWriter for CustomResourceWriter {
    #[instrument(skip(self, function), fields(name = %function.name_any()))]
    async fn deploy(&self, function: &Function) -> Result<()> {
        let namespace = function.namespace().unwrap_or_default();
        match self
            .api(&namespace)
            .create(&PostParams::default(), function)
            .await
        {
            Ok(_) => {
                info!(name = %function.name_any(), "created function resource");
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 409 => Err(Error::Conflict(format!(
                "function {} already exists",
                function.name_any()
            ))),
            Err(e) => Err(Error::KubeError(e)),
        }
    }

    #[instrument(skip(self, function), fields(name = %function.name_any()))]
    async fn update(&self, function: &Function) -> Result<()> {
        let namespace = function.namespace().unwrap_or_default();
        let name = function.name_any();
        let api = self.api(&namespace);

        if api.get_opt(&name).await?.is_none() {
            return Err(Error::FunctionNotFound(name));
        }

        api.patch(
            &name,
            &PatchParams::default(),
            &Patch::Merge(&json!({ "spec": function.spec })),
        )
        .await?;
        info!(name = %name, "updated function resource");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        let api = self.api(namespace);
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => {
                info!(name, "deleted function resource");
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 404 => {
                Err(Error::FunctionNotFound(name.to_string()))
            }
            Err(e) => Err(Error::KubeError(e)),
        }
    }
}

/// Imperative mode: translate and apply the workload synchronously
pub struct DirectWriter {
    client: Client,
    cache: ClusterCache,
    factory: FunctionFactory,
}

impl DirectWriter {
    pub fn new(client: Client, cache: ClusterCache, factory: FunctionFactory) -> Self {
        Self {
            client,
            cache,
            factory,
        }
    }

    /// Look up a managed Deployment in the mirror
    fn managed_deployment(&self, key: &ObjectKey) -> Option<Arc<Deployment>> {
        self.cache
            .deployment(key)
            .filter(|d| d.labels().contains_key(LABEL_FUNCTION_NAME))
    }

    /// Apply both workload objects, parenting the Service to the Deployment
    /// so a manual `kubectl delete deployment` cascades.
    async fn apply_workload(&self, function: &Function, current_replicas: Option<i32>) -> Result<()> {
        let profiles = resolve_profiles(&self.cache, &function.spec)?;
        let mut workload = self.factory.translate(function, &profiles, current_replicas);

        let applied = apply_deployment(&self.client, &workload.deployment).await?;
        if let Some(uid) = applied.uid() {
            workload.service.metadata.owner_references = Some(vec![OwnerReference {
                api_version: "apps/v1".to_string(),
                kind: "Deployment".to_string(),
                name: applied.name_any(),
                uid,
                controller: Some(true),
                ..Default::default()
            }]);
        }
        apply_service(&self.client, &workload.service).await?;
        Ok(())
    }
}

#[async_trait]
impl WorkloadWriter for DirectWriter {
    #[instrument(skip(self, function), fields(name = %function.name_any()))]
    async fn deploy(&self, function: &Function) -> Result<()> {
        let key = ObjectKey::new(
            function.namespace().unwrap_or_default(),
            function.name_any(),
        );
        if self.cache.deployment(&key).is_some() {
            return Err(Error::Conflict(format!(
                "function {} already exists",
                key.name
            )));
        }

        self.apply_workload(function, None).await?;
        info!(function = %key, "deployed function workload");
        Ok(())
    }

    #[instrument(skip(self, function), fields(name = %function.name_any()))]
    async fn update(&self, function: &Function) -> Result<()> {
        let key = ObjectKey::new(
            function.namespace().unwrap_or_default(),
            function.name_any(),
        );
        let Some(existing) = self.managed_deployment(&key) else {
            return Err(Error::FunctionNotFound(key.name));
        };

        // Keep whatever replica count is live, scaling is a separate call.
        let current = existing.spec.as_ref().and_then(|s| s.replicas);
        self.apply_workload(function, current).await?;
        info!(function = %key, "updated function workload");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        let key = ObjectKey::new(namespace, name);
        if self.managed_deployment(&key).is_none() {
            return Err(Error::FunctionNotFound(name.to_string()));
        }

        delete_function_workload(&self.client, namespace, name).await?;
        info!(function = %key, "deleted function workload");
        Ok(())
    }
}

/// Verify every referenced secret exists before any write happens
pub async fn ensure_secrets_exist(
    client: &Client,
    namespace: &str,
    secrets: Option<&Vec<String>>,
) -> Result<()> {
    let Some(secrets) = secrets else {
        return Ok(());
    };

    let api: Api<Secret> = Api::namespaced(client.clone(), namespace);
    for secret in secrets {
        if api.get_opt(secret).await?.is_none() {
            return Err(Error::ValidationError(format!(
                "secret {secret:?} not found in namespace {namespace:?}"
            )));
        }
    }
    Ok(())
}
