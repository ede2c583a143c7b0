//! Prometheus metrics for the review operator
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports the following metrics:
//! - `review_reconcile_duration_seconds` (histogram): reconcile pass duration labeled by controller.
//! - `review_reconcile_errors_total` (counter): failed passes labeled by controller and kind.
//! - `review_dependent_outcomes_total` (counter): node outcomes labeled by controller/node/outcome.
//! - `review_status_writes_total` (counter): status writes labeled by controller and result (written|elided).
//! - `review_queue_depth` (gauge): keys ready for a worker, labeled by controller.

use std::sync::atomic::{AtomicI64, AtomicU64};

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels for operator reconcile metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    /// Controller name, e.g. "reviewcluster"
    pub controller: String,
}

/// Labels for operator error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub controller: String,
    /// Error kind, e.g. "kube", "conflict", "dependent"
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub controller: String,
    pub node: String,
    pub outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StatusWriteLabels {
    pub controller: String,
    /// "written" or "elided"
    pub result: String,
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

/// Counter tracking per-node outcomes
pub static DEPENDENT_OUTCOMES_TOTAL: Lazy<Family<OutcomeLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Counter tracking issued and elided status writes
pub static STATUS_WRITES_TOTAL: Lazy<Family<StatusWriteLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static QUEUE_DEPTH: Lazy<Family<ReconcileLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

/// Global metrics registry. Counters are registered without the `_total`
/// suffix; the text encoder appends it.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "review_reconcile_duration_seconds",
        "Duration of reconcile passes in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "review_reconcile_errors",
        "Total number of failed reconcile passes",
        RECONCILE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "review_dependent_outcomes",
        "Outcomes of dependent resource evaluations",
        DEPENDENT_OUTCOMES_TOTAL.clone(),
    );
    registry.register(
        "review_status_writes",
        "Status writes issued or elided",
        STATUS_WRITES_TOTAL.clone(),
    );
    registry.register(
        "review_queue_depth",
        "Parents waiting for a reconcile worker",
        QUEUE_DEPTH.clone(),
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

pub fn inc_dependent_outcome(controller: &str, node: &str, outcome: &str) {
    let labels = OutcomeLabels {
        controller: controller.to_string(),
        node: node.to_string(),
        outcome: outcome.to_string(),
    };
    DEPENDENT_OUTCOMES_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_status_write(controller: &str, result: &str) {
    let labels = StatusWriteLabels {
        controller: controller.to_string(),
        result: result.to_string(),
    };
    STATUS_WRITES_TOTAL.get_or_create(&labels).inc();
}

pub fn set_queue_depth(controller: &str, depth: usize) {
    let labels = ReconcileLabels {
        controller: controller.to_string(),
    };
    QUEUE_DEPTH
        .get_or_create(&labels)
        .set(i64::try_from(depth).unwrap_or(i64::MAX));
}

/// Render the registry in the Prometheus text format
pub fn encode_text() -> Result<String, std::fmt::Error> {
    let mut buffer = String::new();
    prometheus_client::encoding::text::encode(&mut buffer, &REGISTRY)?;
    Ok(buffer)
}
