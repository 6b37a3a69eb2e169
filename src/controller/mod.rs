//! Controller module for Function reconciliation
//! This module contains the work queue, the reconcile loop, and the
//! translation from Function specs to Kubernetes workloads.

pub mod conditions;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod queue;
mod reconciler;
pub mod replicas;
mod resources;

pub use reconciler::{
    run_reconciler, ReconcilerContext, PHASE_FAILED, PHASE_PENDING, PHASE_READY, PHASE_RECONCILING,
};
pub use resources::{
    apply_deployment, apply_service, delete_function_workload, owner_reference, resolve_profiles,
    resolve_replicas, FunctionFactory, FunctionWorkload, FIELD_MANAGER, LABEL_FUNCTION_NAME,
    LABEL_SCALE_MAX, LABEL_SCALE_MIN,
};
