//! Invocation routing for functions
//!
//! Resolves a function name to the address of one ready replica, straight
//! from the Endpoints mirror. No cluster round-trip happens on the hot path:
//! a pod crash or scale-up becomes visible to the next lookup within one
//! watch-delivery latency.

use std::collections::HashMap;
use std::sync::Mutex;

use k8s_openapi::api::core::v1::Endpoints;

use crate::cache::{object_ref, ClusterCache, ObjectKey};
use crate::error::{Error, Result};

const DEFAULT_RUNTIME_PORT: i32 = 8080;

/// Resolves function names to invocable replica addresses
pub struct FunctionLookup {
    cache: ClusterCache,
    default_namespace: String,
    cluster_scope: bool,
    /// Per-function round-robin position
    cursors: Mutex<HashMap<ObjectKey, usize>>,
}

impl FunctionLookup {
    pub fn new(cache: ClusterCache, default_namespace: impl Into<String>, cluster_scope: bool) -> Self {
        Self {
            cache,
            default_namespace: default_namespace.into(),
            cluster_scope,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    /// Split a raw function name into its namespace and name.
    ///
    /// A `name.namespace` suffix is honored when running cluster-scoped.
    /// In single-namespace mode the suffix must match the managed namespace;
    /// anything else resolves to a function this installation cannot know.
    pub fn function_key(&self, raw: &str) -> Result<ObjectKey> {
        match raw.split_once('.') {
            Some((name, namespace)) if !namespace.is_empty() => {
                if !self.cluster_scope && namespace != self.default_namespace {
                    return Err(Error::FunctionNotFound(raw.to_string()));
                }
                Ok(ObjectKey::new(namespace, name))
            }
            _ => Ok(ObjectKey::new(&self.default_namespace, raw)),
        }
    }

    /// Resolve a function name to the base URL of one ready replica.
    ///
    /// Consecutive calls for the same function walk the ready set round-robin.
    /// Zero ready replicas is reported distinctly from an unknown function so
    /// callers can trigger scale-from-zero.
    pub fn resolve(&self, raw: &str) -> Result<String> {
        let key = self.function_key(raw)?;

        let endpoints = self
            .cache
            .endpoints()
            .get(&object_ref(&key))
            .ok_or_else(|| Error::FunctionNotFound(raw.to_string()))?;

        let addresses = ready_addresses(&endpoints);
        if addresses.is_empty() {
            return Err(Error::NoReadyReplicas(raw.to_string()));
        }

        let (ip, port) = &addresses[self.advance(&key, addresses.len())];
        Ok(format!("http://{ip}:{port}"))
    }

    fn advance(&self, key: &ObjectKey, len: usize) -> usize {
        let mut cursors = self.cursors.lock().expect("cursor lock poisoned");
        let cursor = cursors.entry(key.clone()).or_insert(0);
        let index = *cursor % len;
        *cursor = cursor.wrapping_add(1);
        index
    }
}

/// Collect the ready addresses of an Endpoints object, sorted for a stable
/// round-robin order across lookups
fn ready_addresses(endpoints: &Endpoints) -> Vec<(String, i32)> {
    let mut addresses = Vec::new();
    for subset in endpoints.subsets.iter().flatten() {
        let port = subset
            .ports
            .iter()
            .flatten()
            .find(|port| port.name.as_deref() == Some("http"))
            .or_else(|| subset.ports.iter().flatten().next())
            .map(|port| port.port)
            .unwrap_or(DEFAULT_RUNTIME_PORT);
        for address in subset.addresses.iter().flatten() {
            addresses.push((address.ip.clone(), port));
        }
    }
    addresses.sort();
    addresses
}
