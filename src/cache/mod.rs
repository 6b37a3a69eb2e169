//! Watch-driven read mirrors of the cluster state
//!
//! Every read path in the operator (router, replica reader, list handlers,
//! reconciler) is served from these in-memory mirrors instead of the API
//! server. Each mirror is fed by a long-lived watch; a periodic re-list
//! replaces the mirror contents wholesale so missed events heal on their own.
//! Startup blocks until every mirror has completed its first list.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Endpoints;
use kube::{
    api::Api,
    client::Client,
    core::NamespaceResourceScope,
    runtime::{
        reflector::{self, store::Writer, ObjectRef, Store},
        watcher::{self, watcher},
        WatchStreamExt,
    },
    Resource, ResourceExt,
};
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::OperatorConfig;
use crate::crd::{Function, Profile};
use crate::error::{Error, Result};

/// Buffered events per subscriber before new ones are dropped.
/// A dropped event is healed by the next resync re-list.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Namespace/name pair identifying a mirrored object
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Build a reflector lookup key for a mirrored object
pub fn object_ref<K>(key: &ObjectKey) -> ObjectRef<K>
where
    K: kube::runtime::reflector::Lookup<DynamicType = ()>,
{
    ObjectRef::new(&key.name).within(&key.namespace)
}

/// Configures and starts the set of watch mirrors
pub struct CacheBuilder {
    client: Client,
    config: OperatorConfig,
    watch_functions: bool,
    deployment_subscribers: Vec<mpsc::Sender<ObjectKey>>,
    function_subscribers: Vec<mpsc::Sender<ObjectKey>>,
}

impl CacheBuilder {
    pub fn new(client: Client, config: OperatorConfig) -> Self {
        Self {
            client,
            config,
            watch_functions: false,
            deployment_subscribers: Vec::new(),
            function_subscribers: Vec::new(),
        }
    }

    /// Also mirror Function resources (declarative mode only)
    pub fn with_functions(mut self) -> Self {
        self.watch_functions = true;
        self
    }

    /// Register for Deployment change notifications.
    ///
    /// Must be called before [`CacheBuilder::start`] so no event is missed.
    pub fn subscribe_deployments(&mut self) -> mpsc::Receiver<ObjectKey> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.deployment_subscribers.push(tx);
        rx
    }

    /// Register for Function change notifications
    pub fn subscribe_functions(&mut self) -> mpsc::Receiver<ObjectKey> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.function_subscribers.push(tx);
        rx
    }

    /// Start all watches and block until every mirror has listed once.
    ///
    /// A mirror that cannot complete its initial list within the startup
    /// timeout is a fatal error: the caller is expected to exit rather than
    /// serve from an empty cache.
    pub async fn start(self, shutdown: watch::Receiver<bool>) -> Result<ClusterCache> {
        let CacheBuilder {
            client,
            config,
            watch_functions,
            deployment_subscribers,
            function_subscribers,
        } = self;

        let (deployments, deployments_writer) = reflector::store();
        tokio::spawn(drive(
            scoped_api::<Deployment>(&client, &config),
            deployments_writer,
            deployment_subscribers,
            config.resync_interval,
            shutdown.clone(),
        ));

        let (endpoints, endpoints_writer) = reflector::store();
        tokio::spawn(drive(
            scoped_api::<Endpoints>(&client, &config),
            endpoints_writer,
            Vec::new(),
            config.resync_interval,
            shutdown.clone(),
        ));

        let (profiles, profiles_writer) = reflector::store();
        tokio::spawn(drive(
            Api::<Profile>::namespaced(client.clone(), &config.profiles_namespace),
            profiles_writer,
            Vec::new(),
            config.resync_interval,
            shutdown.clone(),
        ));

        let functions = if watch_functions {
            let (functions, functions_writer) = reflector::store();
            tokio::spawn(drive(
                scoped_api::<Function>(&client, &config),
                functions_writer,
                function_subscribers,
                config.resync_interval,
                shutdown.clone(),
            ));
            Some(functions)
        } else {
            None
        };

        await_sync(&deployments, "Deployment", config.startup_timeout).await?;
        await_sync(&endpoints, "Endpoints", config.startup_timeout).await?;
        await_sync(&profiles, "Profile", config.startup_timeout).await?;
        if let Some(functions) = &functions {
            await_sync(functions, "Function", config.startup_timeout).await?;
        }

        info!("all caches synced");

        Ok(ClusterCache {
            deployments,
            endpoints,
            profiles,
            functions,
            profiles_namespace: config.profiles_namespace,
        })
    }
}

/// Read access to the synced mirrors
#[derive(Clone)]
pub struct ClusterCache {
    deployments: Store<Deployment>,
    endpoints: Store<Endpoints>,
    profiles: Store<Profile>,
    functions: Option<Store<Function>>,
    profiles_namespace: String,
}

impl ClusterCache {
    pub fn deployments(&self) -> &Store<Deployment> {
        &self.deployments
    }

    pub fn endpoints(&self) -> &Store<Endpoints> {
        &self.endpoints
    }

    pub fn profiles(&self) -> &Store<Profile> {
        &self.profiles
    }

    /// The Function mirror, present only in declarative mode
    pub fn functions(&self) -> Option<&Store<Function>> {
        self.functions.as_ref()
    }

    pub fn deployment(&self, key: &ObjectKey) -> Option<Arc<Deployment>> {
        self.deployments.get(&object_ref(key))
    }

    pub fn function(&self, key: &ObjectKey) -> Option<Arc<Function>> {
        self.functions.as_ref()?.get(&object_ref(key))
    }

    pub fn profiles_namespace(&self) -> &str {
        &self.profiles_namespace
    }
}

fn scoped_api<K>(client: &Client, config: &OperatorConfig) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    if config.cluster_scope {
        Api::all(client.clone())
    } else {
        Api::namespaced(client.clone(), &config.function_namespace)
    }
}

async fn await_sync<K>(store: &Store<K>, kind: &str, limit: Duration) -> Result<()>
where
    K: kube::runtime::reflector::Lookup + Clone + 'static,
    K::DynamicType: std::hash::Hash + Eq + Clone,
{
    match tokio::time::timeout(limit, store.wait_until_ready()).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err(Error::CacheSync(format!(
            "{kind} watch ended before the initial list completed"
        ))),
        Err(_) => Err(Error::CacheSync(format!(
            "timed out waiting for the {kind} cache to sync"
        ))),
    }
}

/// Feed one mirror from its watch, re-listing every `resync_interval`.
///
/// The fresh list emitted after each rebuild replaces the mirror contents,
/// so objects changed while the watch was wedged converge without backlog
/// tracking. Watch errors are retried with the default backoff.
async fn drive<K>(
    api: Api<K>,
    mut writer: Writer<K>,
    subscribers: Vec<mpsc::Sender<ObjectKey>>,
    resync_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + fmt::Debug + Send + Sync + 'static,
{
    let kind = K::kind(&()).to_string();

    loop {
        let mut stream = watcher(api.clone(), watcher::Config::default())
            .default_backoff()
            .boxed();
        let resync = tokio::time::sleep(resync_interval);
        tokio::pin!(resync);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("stopping {kind} watch");
                        return;
                    }
                }
                _ = &mut resync => {
                    debug!("re-listing {kind} after resync interval");
                    break;
                }
                event = stream.try_next() => match event {
                    Ok(Some(event)) => {
                        writer.apply_watcher_event(&event);
                        notify_subscribers(&subscribers, &event);
                    }
                    Ok(None) => {
                        warn!("{kind} watch stream ended, rebuilding");
                        break;
                    }
                    Err(e) => {
                        warn!("{kind} watch error: {e}");
                    }
                },
            }
        }
    }
}

fn notify_subscribers<K>(subscribers: &[mpsc::Sender<ObjectKey>], event: &watcher::Event<K>)
where
    K: Resource<DynamicType = ()>,
{
    if subscribers.is_empty() {
        return;
    }

    let obj = match event {
        watcher::Event::Apply(obj)
        | watcher::Event::Delete(obj)
        | watcher::Event::InitApply(obj) => obj,
        watcher::Event::Init | watcher::Event::InitDone => return,
    };

    let key = ObjectKey::new(obj.namespace().unwrap_or_default(), obj.name_any());
    for subscriber in subscribers {
        // A full channel means the consumer is behind; the resync re-list
        // will deliver the key again.
        if subscriber.try_send(key.clone()).is_err() {
            debug!("dropping {key} notification for a lagging subscriber");
        }
    }
}
