//! Reconcile loop converging Function resources to Deployments and Services
//!
//! Watch events land on a coalescing work queue; a fixed pool of workers
//! drains it, translating each Function through the factory and applying
//! the result with server-side apply. Failed keys are retried with
//! exponential backoff until `max_retries`, then parked as Failed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::api::{Api, Patch, PatchParams};
use kube::client::Client;
use kube::runtime::reflector::Store;
use kube::ResourceExt;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::cache::{object_ref, ClusterCache, ObjectKey};
use crate::config::OperatorConfig;
use crate::crd::{Function, FunctionStatus};
use crate::error::{Error, Result};

use super::conditions::{
    set_condition, CONDITION_STATUS_FALSE, CONDITION_STATUS_TRUE, CONDITION_TYPE_PROGRESSING,
    CONDITION_TYPE_READY, CONDITION_TYPE_STALLED,
};
#[cfg(feature = "metrics")]
use super::metrics;
use super::queue::WorkQueue;
use super::replicas::snapshot_of;
use super::resources::{self, FunctionFactory, FIELD_MANAGER, LABEL_FUNCTION_NAME};

/// Lifecycle phases surfaced in `.status.phase`
pub const PHASE_PENDING: &str = "Pending";
pub const PHASE_RECONCILING: &str = "Reconciling";
pub const PHASE_READY: &str = "Ready";
pub const PHASE_FAILED: &str = "Failed";

/// Metrics label identifying this control loop
const CONTROLLER_NAME: &str = "function";

/// Shared state for the reconcile workers
pub struct ReconcilerContext {
    pub client: Client,
    pub cache: ClusterCache,
    pub functions: Store<Function>,
    pub factory: FunctionFactory,
    pub queue: Arc<WorkQueue>,
    pub config: OperatorConfig,
}

/// Run the reconciler until shutdown flips.
///
/// Spawns one pump per event stream and `config.workers` workers, then
/// closes the queue when the shutdown signal fires so the workers drain
/// what is already queued and exit.
pub async fn run_reconciler(
    ctx: Arc<ReconcilerContext>,
    function_events: mpsc::Receiver<ObjectKey>,
    deployment_events: mpsc::Receiver<ObjectKey>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(workers = ctx.config.workers, "starting function reconciler");

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();
    tasks.push(tokio::spawn(pump_function_events(
        ctx.clone(),
        function_events,
    )));
    tasks.push(tokio::spawn(pump_deployment_events(
        ctx.clone(),
        deployment_events,
    )));
    for worker in 0..ctx.config.workers.max(1) {
        tasks.push(tokio::spawn(run_worker(ctx.clone(), worker)));
    }

    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }

    ctx.queue.close();
    for task in tasks {
        let _ = task.await;
    }
    info!("function reconciler stopped");
}

/// Forward every Function event onto the queue
async fn pump_function_events(ctx: Arc<ReconcilerContext>, mut events: mpsc::Receiver<ObjectKey>) {
    while let Some(key) = events.recv().await {
        debug!(function = %key, "queueing function event");
        ctx.queue.add(key);
        #[cfg(feature = "metrics")]
        metrics::set_workqueue_depth(ctx.queue.len());
    }
}

/// Forward Deployment events for workloads this operator owns
async fn pump_deployment_events(
    ctx: Arc<ReconcilerContext>,
    mut events: mpsc::Receiver<ObjectKey>,
) {
    while let Some(key) = events.recv().await {
        if !deployment_event_is_relevant(&ctx.cache, &ctx.functions, &key) {
            continue;
        }
        debug!(function = %key, "queueing deployment event");
        ctx.queue.add(key);
        #[cfg(feature = "metrics")]
        metrics::set_workqueue_depth(ctx.queue.len());
    }
}

/// Decide whether a Deployment event maps back to a Function.
///
/// A live Deployment is relevant when it carries the function label. A
/// deleted one is relevant only while the Function still exists, so the
/// reconciler can recreate the workload.
fn deployment_event_is_relevant(
    cache: &ClusterCache,
    functions: &Store<Function>,
    key: &ObjectKey,
) -> bool {
    match cache.deployment(key) {
        Some(deployment) => deployment.labels().contains_key(LABEL_FUNCTION_NAME),
        None => functions.get(&object_ref(key)).is_some(),
    }
}

async fn run_worker(ctx: Arc<ReconcilerContext>, worker: usize) {
    debug!(worker, "reconcile worker started");
    while let Some(key) = ctx.queue.next().await {
        #[cfg(feature = "metrics")]
        metrics::set_workqueue_depth(ctx.queue.len());
        process_key(&ctx, key).await;
    }
    debug!(worker, "reconcile worker stopped");
}

/// Reconcile one key and settle its retry bookkeeping
async fn process_key(ctx: &ReconcilerContext, key: ObjectKey) {
    let started = Instant::now();
    let outcome = reconcile_key(ctx, &key).await;
    #[cfg(feature = "metrics")]
    metrics::observe_reconcile_duration_seconds(CONTROLLER_NAME, started.elapsed().as_secs_f64());

    match outcome {
        Ok(()) => {
            ctx.queue.forget(&key);
        }
        Err(err) if err.is_retriable() => {
            #[cfg(feature = "metrics")]
            metrics::inc_reconcile_error(CONTROLLER_NAME, error_kind(&err));
            let attempt = ctx.queue.bump_retry(&key);
            if attempt < ctx.config.max_retries {
                let delay = retry_backoff(ctx.config.retry_base, ctx.config.retry_cap, attempt);
                warn!(function = %key, attempt, delay_ms = delay.as_millis() as u64,
                    "reconcile failed, will retry: {err}");
                schedule_retry(ctx.queue.clone(), key.clone(), delay);
            } else {
                error!(function = %key, attempt, "reconcile failed, giving up: {err}");
                mark_failed(ctx, &key, &err).await;
                ctx.queue.forget(&key);
            }
        }
        Err(err) => {
            #[cfg(feature = "metrics")]
            metrics::inc_reconcile_error(CONTROLLER_NAME, error_kind(&err));
            error!(function = %key, "reconcile failed terminally: {err}");
            mark_failed(ctx, &key, &err).await;
            ctx.queue.forget(&key);
        }
    }

    ctx.queue.done(&key);
}

/// Exponential backoff for the given 1-based attempt, capped
fn retry_backoff(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.saturating_mul(2u32.saturating_pow(exponent)).min(cap)
}

fn schedule_retry(queue: Arc<WorkQueue>, key: ObjectKey, delay: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        queue.add(key);
    });
}

/// Metrics label for an error class
fn error_kind(err: &Error) -> &'static str {
    match err {
        Error::KubeError(_) => "kube",
        Error::ConfigError(_) => "config",
        Error::ValidationError(_) => "validation",
        Error::HttpError(_) => "http",
        Error::SerializationError(_) => "serialization",
        Error::FunctionNotFound(_) => "not_found",
        Error::NoReadyReplicas(_) => "no_ready_replicas",
        Error::Conflict(_) => "conflict",
        Error::MetricsQuery(_) => "metrics_query",
        Error::CacheSync(_) => "cache_sync",
    }
}

/// Converge one Function towards its desired workload.
///
/// Reads only from the local mirrors; every write goes through the API
/// server. A missing Function means it was deleted and owner references
/// take the workload down with it.
#[instrument(skip(ctx), fields(function = %key))]
async fn reconcile_key(ctx: &ReconcilerContext, key: &ObjectKey) -> Result<()> {
    let Some(function) = ctx.functions.get(&object_ref(key)) else {
        info!(function = %key, "function deleted, owned workload is garbage collected");
        return Ok(());
    };

    if let Some(message) = function.spec.validate_message() {
        return Err(Error::ValidationError(message));
    }

    // First sighting: stamp Pending. The status patch comes straight back
    // as a watch event and drives the next step.
    if function.status.is_none() {
        let update = StatusUpdate {
            phase: PHASE_PENDING,
            reason: "Accepted",
            message: "queued for reconciliation".to_string(),
            replicas: 0,
            available: 0,
        };
        return write_status(ctx, &function, &update).await;
    }

    let profiles = resources::resolve_profiles(&ctx.cache, &function.spec)?;
    let observed = ctx.cache.deployment(key);
    let current_replicas = observed
        .as_ref()
        .and_then(|d| d.spec.as_ref())
        .and_then(|s| s.replicas);
    let workload = ctx.factory.translate(&function, &profiles, current_replicas);
    let target = workload
        .deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(0);

    let drift = match &observed {
        None => Some("created"),
        Some(observed) => resources::workload_drift(&workload.deployment, observed),
    };

    if let Some(reason) = drift {
        let available = observed.as_deref().map(snapshot_of).map_or(0, |s| s.available);
        let update = StatusUpdate {
            phase: PHASE_RECONCILING,
            reason: "Deploying",
            message: format!("applying workload: {reason}"),
            replicas: target,
            available,
        };
        write_status(ctx, &function, &update).await?;
        resources::apply_deployment(&ctx.client, &workload.deployment).await?;
        resources::apply_service(&ctx.client, &workload.service).await?;
        info!(function = %key, reason, "applied workload");
        return Ok(());
    }

    // Nothing to apply. Report readiness from the observed Deployment;
    // rollout progress arrives as further Deployment events.
    let snapshot = observed.as_deref().map(snapshot_of).unwrap_or_default();
    let update = if target == 0 {
        StatusUpdate {
            phase: PHASE_READY,
            reason: "ScaledToZero",
            message: "function is scaled to zero".to_string(),
            replicas: 0,
            available: snapshot.available,
        }
    } else if snapshot.available > 0 {
        StatusUpdate {
            phase: PHASE_READY,
            reason: "MinimumReplicasAvailable",
            message: format!("{} of {target} replicas are available", snapshot.available),
            replicas: target,
            available: snapshot.available,
        }
    } else {
        StatusUpdate {
            phase: PHASE_RECONCILING,
            reason: "WaitingForReplicas",
            message: format!("0 of {target} replicas are available"),
            replicas: target,
            available: 0,
        }
    };
    write_status(ctx, &function, &update).await
}

/// Record a terminal failure on the Function status, best effort
async fn mark_failed(ctx: &ReconcilerContext, key: &ObjectKey, err: &Error) {
    let Some(function) = ctx.functions.get(&object_ref(key)) else {
        return;
    };
    let snapshot = ctx
        .cache
        .deployment(key)
        .as_deref()
        .map(snapshot_of)
        .unwrap_or_default();
    let update = StatusUpdate {
        phase: PHASE_FAILED,
        reason: "ReconcileFailed",
        message: err.to_string(),
        replicas: snapshot.replicas,
        available: snapshot.available,
    };
    if let Err(status_err) = write_status(ctx, &function, &update).await {
        warn!(function = %key, "failed to record Failed phase: {status_err}");
    }
}

struct StatusUpdate<'a> {
    phase: &'a str,
    reason: &'a str,
    message: String,
    replicas: i32,
    available: i32,
}

/// Build the status this update would produce, carrying over unchanged
/// condition transition times so refreshes compare equal.
fn build_status(function: &Function, update: &StatusUpdate<'_>) -> FunctionStatus {
    let generation = function.metadata.generation;
    let mut conditions = function
        .status
        .as_ref()
        .map(|s| s.conditions.clone())
        .unwrap_or_default();

    let ready = update.phase == PHASE_READY;
    set_condition(
        &mut conditions,
        CONDITION_TYPE_READY,
        if ready {
            CONDITION_STATUS_TRUE
        } else {
            CONDITION_STATUS_FALSE
        },
        update.reason,
        &update.message,
        generation,
    );
    set_condition(
        &mut conditions,
        CONDITION_TYPE_PROGRESSING,
        if update.phase == PHASE_RECONCILING || update.phase == PHASE_PENDING {
            CONDITION_STATUS_TRUE
        } else {
            CONDITION_STATUS_FALSE
        },
        update.reason,
        &update.message,
        generation,
    );
    set_condition(
        &mut conditions,
        CONDITION_TYPE_STALLED,
        if update.phase == PHASE_FAILED {
            CONDITION_STATUS_TRUE
        } else {
            CONDITION_STATUS_FALSE
        },
        update.reason,
        &update.message,
        generation,
    );

    FunctionStatus {
        phase: update.phase.to_string(),
        message: Some(update.message.clone()),
        observed_generation: generation,
        replicas: update.replicas,
        available_replicas: update.available,
        conditions,
    }
}

/// Patch the Function status unless it already matches.
///
/// The equality check keeps the loop quiescent: a status patch raises a
/// fresh watch event, and writing only on change lets that event settle
/// instead of ping-ponging forever.
async fn write_status(
    ctx: &ReconcilerContext,
    function: &Function,
    update: &StatusUpdate<'_>,
) -> Result<()> {
    let status = build_status(function, update);
    if function.status.as_ref() == Some(&status) {
        return Ok(());
    }

    let namespace = function
        .namespace()
        .unwrap_or_else(|| ctx.config.function_namespace.clone());
    let api: Api<Function> = Api::namespaced(ctx.client.clone(), &namespace);
    api.patch_status(
        &function.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&json!({ "status": status })),
    )
    .await?;

    debug!(
        function = %function.name_any(),
        phase = update.phase,
        reason = update.reason,
        "updated function status"
    );
    Ok(())
}
