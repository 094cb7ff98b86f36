//! Metrics module
//!
//! Prometheus collectors for reconcile outcomes and work queue activity,
//! registered on the default registry and served on `/metrics`.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec, IntCounterVec,
    TextEncoder,
};

use crate::error::{Error, Result};

/// Reconcile passes by controller and outcome (`success` or error category).
pub static RECONCILES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "cstor_operator_reconcile_total",
        "Reconcile passes by controller and outcome",
        &["controller", "result"]
    )
    .expect("reconcile counter registers once")
});

/// Reconcile pass duration by controller.
pub static RECONCILE_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "cstor_operator_reconcile_duration_seconds",
        "Reconcile pass duration",
        &["controller"],
        vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .expect("reconcile histogram registers once")
});

/// Keys added to a work queue.
pub static QUEUE_ADDS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "cstor_operator_workqueue_adds_total",
        "Keys added to a work queue",
        &["queue"]
    )
    .expect("queue add counter registers once")
});

/// Keys requeued with backoff after a failed pass.
pub static QUEUE_RETRIES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "cstor_operator_workqueue_retries_total",
        "Keys requeued with backoff",
        &["queue"]
    )
    .expect("queue retry counter registers once")
});

/// Objects created or deleted by a controller, by kind and verb.
pub static OBJECT_WRITES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "cstor_operator_object_writes_total",
        "Objects created or deleted by the controllers",
        &["kind", "verb"]
    )
    .expect("object write counter registers once")
});

/// Count one create or delete of `kind`.
pub fn record_write(kind: &str, verb: &str) {
    OBJECT_WRITES.with_label_values(&[kind, verb]).inc();
}

/// Render every registered metric in the text exposition format.
pub fn render() -> Result<(String, Vec<u8>)> {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&families, &mut buffer)
        .map_err(|e| Error::Internal(format!("encode metrics: {}", e)))?;
    Ok((encoder.format_type().to_string(), buffer))
}
