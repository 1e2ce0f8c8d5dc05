//! Prometheus metrics for the metrics operator
//!
//! # Exported metrics
//! - `metrics_operator_reconcile_operations_total` (counter): reconcile attempts labeled by controller.
//! - `metrics_operator_reconcile_errors_total` (counter): failed reconciles labeled by controller and error kind.
//! - `metrics_operator_reconcile_duration_seconds` (histogram): reconcile duration labeled by controller.
//! - `metrics_operator_status_update_operations_total` / `..._errors_total` (counters): status refreshes.
//! - `metrics_operator_triggered_total` (counter): events labeled by the triggering kind and action.
//! - `metrics_operator_workqueue_depth` (gauge), `..._adds_total`, `..._retries_total` (counters) per queue.
//! - `metrics_operator_feature_gate` (gauge): 1 when the named gate is enabled.

use std::sync::atomic::{AtomicI64, AtomicU64};

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

use crate::config::FeatureGates;

/// Labels for operator reconcile metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    /// Controller name, e.g. "metricsserver"
    pub controller: String,
}

/// Labels for operator error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub controller: String,
    /// Error kind, see `Error::metric_label`
    pub kind: String,
}

/// Labels for the event trigger counter
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TriggerLabels {
    /// Kind of the object which emitted the event ("MetricsServer", "StatefulSet")
    pub triggered_by: String,
    /// "add", "update" or "delete"
    pub action: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct QueueLabels {
    pub name: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FeatureGateLabels {
    pub name: String,
}

pub static RECONCILE_OPERATIONS_TOTAL: Lazy<Family<ReconcileLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Histogram tracking reconcile duration (seconds)
pub static RECONCILE_DURATION_SECONDS: Lazy<Family<ReconcileLabels, Histogram>> = Lazy::new(|| {
    fn reconcile_histogram() -> Histogram {
        Histogram::new([0.1, 0.5, 1.0, 5.0, 10.0].into_iter())
    }

    Family::new_with_constructor(reconcile_histogram)
});

pub static STATUS_UPDATE_OPERATIONS_TOTAL: Lazy<
    Family<ReconcileLabels, Counter<u64, AtomicU64>>,
> = Lazy::new(Family::default);

pub static STATUS_UPDATE_ERRORS_TOTAL: Lazy<Family<ReconcileLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static TRIGGERED_TOTAL: Lazy<Family<TriggerLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static WORKQUEUE_DEPTH: Lazy<Family<QueueLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

pub static WORKQUEUE_ADDS_TOTAL: Lazy<Family<QueueLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static WORKQUEUE_RETRIES_TOTAL: Lazy<Family<QueueLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static FEATURE_GATE: Lazy<Family<FeatureGateLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "metrics_operator_reconcile_operations",
        "Total number of reconcile operations",
        RECONCILE_OPERATIONS_TOTAL.clone(),
    );
    registry.register(
        "metrics_operator_reconcile_errors",
        "Number of errors that occurred during reconcile operations",
        RECONCILE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "metrics_operator_reconcile_duration_seconds",
        "Histogram of reconcile operations",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "metrics_operator_status_update_operations",
        "Total number of update operations to status subresources",
        STATUS_UPDATE_OPERATIONS_TOTAL.clone(),
    );
    registry.register(
        "metrics_operator_status_update_errors",
        "Number of errors that occurred during update operations to status subresources",
        STATUS_UPDATE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "metrics_operator_triggered",
        "Number of times an event triggered the operator",
        TRIGGERED_TOTAL.clone(),
    );
    registry.register(
        "metrics_operator_workqueue_depth",
        "Depth of the queue",
        WORKQUEUE_DEPTH.clone(),
    );
    registry.register(
        "metrics_operator_workqueue_adds",
        "Total number of additions to the queue",
        WORKQUEUE_ADDS_TOTAL.clone(),
    );
    registry.register(
        "metrics_operator_workqueue_retries",
        "Total number of retries",
        WORKQUEUE_RETRIES_TOTAL.clone(),
    );
    registry.register(
        "metrics_operator_feature_gate",
        "Reports about the operator feature gates. 1 means that the feature gate is enabled",
        FEATURE_GATE.clone(),
    );

    registry
});

fn reconcile_labels(controller: &str) -> ReconcileLabels {
    ReconcileLabels {
        controller: controller.to_string(),
    }
}

fn queue_labels(name: &str) -> QueueLabels {
    QueueLabels {
        name: name.to_string(),
    }
}

pub fn inc_reconcile_operation(controller: &str) {
    RECONCILE_OPERATIONS_TOTAL
        .get_or_create(&reconcile_labels(controller))
        .inc();
}

/// Increment the reconcile error counter.
pub fn inc_reconcile_error(controller: &str, kind: &str) {
    let labels = ErrorLabels {
        controller: controller.to_string(),
        kind: kind.to_string(),
    };
    RECONCILE_ERRORS_TOTAL.get_or_create(&labels).inc();
}

/// Observe a reconcile duration in seconds.
pub fn observe_reconcile_duration_seconds(controller: &str, seconds: f64) {
    RECONCILE_DURATION_SECONDS
        .get_or_create(&reconcile_labels(controller))
        .observe(seconds);
}

pub fn inc_status_update(controller: &str) {
    STATUS_UPDATE_OPERATIONS_TOTAL
        .get_or_create(&reconcile_labels(controller))
        .inc();
}

pub fn inc_status_update_error(controller: &str) {
    STATUS_UPDATE_ERRORS_TOTAL
        .get_or_create(&reconcile_labels(controller))
        .inc();
}

/// Counter of events by emitting kind and action.
pub fn triggered_by(triggered_by: &str, action: &str) -> Counter<u64, AtomicU64> {
    let labels = TriggerLabels {
        triggered_by: triggered_by.to_string(),
        action: action.to_string(),
    };
    TRIGGERED_TOTAL.get_or_create(&labels).clone()
}

pub fn set_workqueue_depth(queue: &str, depth: usize) {
    WORKQUEUE_DEPTH
        .get_or_create(&queue_labels(queue))
        .set(depth as i64);
}

pub fn inc_workqueue_adds(queue: &str) {
    WORKQUEUE_ADDS_TOTAL.get_or_create(&queue_labels(queue)).inc();
}

pub fn inc_workqueue_retries(queue: &str) {
    WORKQUEUE_RETRIES_TOTAL
        .get_or_create(&queue_labels(queue))
        .inc();
}

/// Publishes the state of every known feature gate.
pub fn record_feature_gates(gates: &FeatureGates) {
    for (name, enabled) in gates.iter() {
        let labels = FeatureGateLabels {
            name: name.to_string(),
        };
        FEATURE_GATE.get_or_create(&labels).set(i64::from(enabled));
    }
}

/// Renders the registry in the OpenMetrics text format.
pub fn encode_metrics() -> Result<String, std::fmt::Error> {
    let mut buffer = String::new();
    prometheus_client::encoding::text::encode(&mut buffer, &REGISTRY)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconcile_counters() {
        inc_reconcile_operation("metrics-test");
        inc_reconcile_operation("metrics-test");
        inc_reconcile_error("metrics-test", "kube");

        let ops = RECONCILE_OPERATIONS_TOTAL
            .get_or_create(&reconcile_labels("metrics-test"))
            .get();
        assert_eq!(ops, 2);
    }

    #[test]
    fn test_triggered_by_counter() {
        triggered_by("StatefulSet", "metrics-test-add").inc();
        assert_eq!(triggered_by("StatefulSet", "metrics-test-add").get(), 1);
    }

    #[test]
    fn test_feature_gate_gauge() {
        let gates = FeatureGates::parse("StatusForConfigurationResources=true").unwrap();
        record_feature_gates(&gates);
        let labels = FeatureGateLabels {
            name: "StatusForConfigurationResources".to_string(),
        };
        assert_eq!(FEATURE_GATE.get_or_create(&labels).get(), 1);
    }

    #[test]
    fn test_encode_contains_registered_families() {
        inc_workqueue_adds("metrics-test-queue");
        let text = encode_metrics().unwrap();
        assert!(text.contains("metrics_operator_workqueue_adds_total"));
        assert!(text.contains("metrics_operator_reconcile_duration_seconds"));
    }
}
