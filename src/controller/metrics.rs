//! Prometheus metrics for the KMM operator
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports the following metrics:
//! - `kmm_reconcile_duration_seconds` (histogram): reconcile duration labeled by controller.
//! - `kmm_reconcile_errors_total` (counter): reconcile errors labeled by controller and kind.
//! - `kmm_jobs_created_total` (counter): build and sign jobs created, labeled by module and job type.
//! - `kmm_worker_pods_created_total` (counter): worker pods created, labeled by action.

use std::sync::atomic::AtomicU64;

use once_cell::sync::Lazy;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels for operator reconcile metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    /// Controller name, e.g. "build-sign"
    pub controller: String,
}

/// Labels for operator error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub controller: String,
    /// Error category from `Error::kind`
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct JobLabels {
    pub namespace: String,
    pub module: String,
    /// "build" or "sign"
    pub job_type: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct WorkerLabels {
    /// "load" or "unload"
    pub action: String,
}

/// Histogram tracking reconcile duration (seconds)
pub static RECONCILE_DURATION_SECONDS: Lazy<Family<ReconcileLabels, Histogram>> = Lazy::new(|| {
    fn reconcile_histogram() -> Histogram {
        // 1ms .. ~32s across 16 buckets.
        Histogram::new(exponential_buckets(0.001, 2.0, 16))
    }

    Family::new_with_constructor(reconcile_histogram)
});

pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static JOBS_CREATED_TOTAL: Lazy<Family<JobLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static WORKER_PODS_CREATED_TOTAL: Lazy<Family<WorkerLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "kmm_reconcile_duration_seconds",
        "Duration of reconcile loops in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "kmm_reconcile_errors",
        "Total number of reconcile errors",
        RECONCILE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "kmm_jobs_created",
        "Build and sign jobs created",
        JOBS_CREATED_TOTAL.clone(),
    );
    registry.register(
        "kmm_worker_pods_created",
        "Worker pods created to load or unload modules",
        WORKER_PODS_CREATED_TOTAL.clone(),
    );

    registry
});

pub fn observe_reconcile_duration_seconds(controller: &str, seconds: f64) {
    let labels = ReconcileLabels {
        controller: controller.to_string(),
    };
    RECONCILE_DURATION_SECONDS
        .get_or_create(&labels)
        .observe(seconds);
}

pub fn inc_reconcile_error(controller: &str, kind: &str) {
    let labels = ErrorLabels {
        controller: controller.to_string(),
        kind: kind.to_string(),
    };
    RECONCILE_ERRORS_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_job_created(namespace: &str, module: &str, job_type: &str) {
    let labels = JobLabels {
        namespace: namespace.to_string(),
        module: module.to_string(),
        job_type: job_type.to_string(),
    };
    JOBS_CREATED_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_worker_pod_created(action: &str) {
    let labels = WorkerLabels {
        action: action.to_string(),
    };
    WORKER_PODS_CREATED_TOTAL.get_or_create(&labels).inc();
}

/// Text exposition of [`REGISTRY`]
pub fn render() -> Result<String, std::fmt::Error> {
    let mut buffer = String::new();
    encode(&mut buffer, &REGISTRY)?;
    Ok(buffer)
}
