//! Prometheus metrics for the FnStack operator
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with the default `metrics` feature)
//! exports the following:
//! - `fnstack_reconcile_duration_seconds` (histogram): reconcile duration labeled by controller.
//! - `fnstack_reconcile_errors_total` (counter): reconcile errors labeled by controller and kind.
//! - `fnstack_workqueue_depth` (gauge): keys waiting for a reconcile worker.
//! - `fnstack_function_invocation_total` (counter): proxied invocations labeled by function and status code.
//! - `fnstack_function_invocation_duration_seconds` (histogram): proxied invocation latency per function.
//!
//! The invocation counter doubles as the autoscaler signal: the query client
//! reads its per-function rate back out of Prometheus.

use std::sync::atomic::{AtomicI64, AtomicU64};

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels for reconcile duration metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    /// Controller name, e.g. "function"
    pub controller: String,
}

/// Labels for reconcile error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub controller: String,
    /// Error kind/category, e.g. "kube", "validation", "conflict"
    pub kind: String,
}

/// Labels for invocation metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct InvocationLabels {
    /// Function identity in `name.namespace` form
    pub function_name: String,
    /// HTTP status code returned to the caller
    pub code: String,
}

/// Labels for invocation latency metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct InvocationDurationLabels {
    pub function_name: String,
}

/// Histogram tracking reconcile duration (seconds)
pub static RECONCILE_DURATION_SECONDS: Lazy<Family<ReconcileLabels, Histogram>> = Lazy::new(|| {
    fn reconcile_histogram() -> Histogram {
        // 1ms .. ~32s across 16 buckets.
        Histogram::new(exponential_buckets(0.001, 2.0, 16))
    }

    Family::new_with_constructor(reconcile_histogram)
});

/// Counter tracking reconcile errors
pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Gauge tracking the number of keys waiting in the work queue
pub static WORKQUEUE_DEPTH: Lazy<Gauge<i64, AtomicI64>> = Lazy::new(Gauge::default);

/// Counter tracking proxied function invocations
pub static FUNCTION_INVOCATION_TOTAL: Lazy<Family<InvocationLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Histogram tracking proxied invocation latency (seconds)
pub static FUNCTION_INVOCATION_DURATION_SECONDS: Lazy<
    Family<InvocationDurationLabels, Histogram>,
> = Lazy::new(|| {
    fn invocation_histogram() -> Histogram {
        // 5ms .. ~160s across 16 buckets; cold starts live at the top end.
        Histogram::new(exponential_buckets(0.005, 2.0, 16))
    }

    Family::new_with_constructor(invocation_histogram)
});

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "fnstack_reconcile_duration_seconds",
        "Duration of reconcile attempts in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "fnstack_reconcile_errors_total",
        "Total number of reconcile errors",
        RECONCILE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "fnstack_workqueue_depth",
        "Number of keys waiting for a reconcile worker",
        WORKQUEUE_DEPTH.clone(),
    );
    registry.register(
        "fnstack_function_invocation_total",
        "Total number of proxied function invocations",
        FUNCTION_INVOCATION_TOTAL.clone(),
    );
    registry.register(
        "fnstack_function_invocation_duration_seconds",
        "Latency of proxied function invocations in seconds",
        FUNCTION_INVOCATION_DURATION_SECONDS.clone(),
    );

    registry
});

/// Observe a reconcile duration in seconds.
pub fn observe_reconcile_duration_seconds(controller: &str, seconds: f64) {
    let labels = ReconcileLabels {
        controller: controller.to_string(),
    };
    RECONCILE_DURATION_SECONDS
        .get_or_create(&labels)
        .observe(seconds);
}

/// Increment the reconcile error counter.
pub fn inc_reconcile_error(controller: &str, kind: &str) {
    let labels = ErrorLabels {
        controller: controller.to_string(),
        kind: kind.to_string(),
    };
    RECONCILE_ERRORS_TOTAL.get_or_create(&labels).inc();
}

/// Track the current work queue depth.
pub fn set_workqueue_depth(depth: usize) {
    WORKQUEUE_DEPTH.set(depth as i64);
}

/// Count one proxied invocation and its latency.
pub fn observe_invocation(function_name: &str, code: u16, seconds: f64) {
    FUNCTION_INVOCATION_TOTAL
        .get_or_create(&InvocationLabels {
            function_name: function_name.to_string(),
            code: code.to_string(),
        })
        .inc();
    FUNCTION_INVOCATION_DURATION_SECONDS
        .get_or_create(&InvocationDurationLabels {
            function_name: function_name.to_string(),
        })
        .observe(seconds);
}
