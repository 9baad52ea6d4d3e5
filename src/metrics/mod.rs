//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Operation outcomes and latency per call shape
//! - Error kinds delivered to callers
//! - Statuses seen on watched submissions
//! - Graphs currently held by the scheduler

use crate::chain::ExtrinsicStatus;
use crate::error::{ExtrinsicError, ExtrinsicResult};

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, CounterVec, Encoder, Gauge,
    HistogramVec, TextEncoder,
};
use std::time::Duration;

lazy_static! {
    // Operation metrics
    pub static ref OPERATIONS: CounterVec = register_counter_vec!(
        "extrinsic_operations_total",
        "Completed operations by call shape and outcome",
        &["operation", "outcome"]
    ).unwrap();

    pub static ref OPERATION_LATENCY: HistogramVec = register_histogram_vec!(
        "extrinsic_operation_latency_seconds",
        "Time from enqueue to completion delivery",
        &["operation"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 6.0, 12.0, 30.0, 60.0, 120.0]
    ).unwrap();

    pub static ref ERRORS: CounterVec = register_counter_vec!(
        "extrinsic_errors_total",
        "Errors delivered to completion handlers by kind",
        &["operation", "kind"]
    ).unwrap();

    // Watch metrics
    pub static ref WATCH_STATUSES: CounterVec = register_counter_vec!(
        "extrinsic_watch_statuses_total",
        "Statuses received on watched submissions",
        &["status"]
    ).unwrap();

    // Scheduler metrics
    pub static ref INFLIGHT_GRAPHS: Gauge = register_gauge!(
        "extrinsic_inflight_graphs",
        "Task graphs scheduled and not yet finished"
    ).unwrap();
}

/// Outcome label for one delivered result
pub fn outcome_label<T>(result: &ExtrinsicResult<T>) -> &'static str {
    match result {
        Ok(_) => "success",
        Err(ExtrinsicError::Cancelled) => "cancelled",
        Err(_) => "failure",
    }
}

pub fn record_outcome<T>(operation: &str, result: &ExtrinsicResult<T>, elapsed: Duration) {
    OPERATIONS
        .with_label_values(&[operation, outcome_label(result)])
        .inc();
    OPERATION_LATENCY
        .with_label_values(&[operation])
        .observe(elapsed.as_secs_f64());
    if let Err(e) = result {
        record_error(operation, e);
    }
}

pub fn record_error(operation: &str, error: &ExtrinsicError) {
    ERRORS.with_label_values(&[operation, error.kind()]).inc();
}

pub fn record_watch_status(status: &ExtrinsicStatus) {
    WATCH_STATUSES.with_label_values(&[status.name()]).inc();
}

pub fn set_inflight_graphs(count: usize) {
    INFLIGHT_GRAPHS.set(count as f64);
}

/// Text exposition of every registered metric
pub fn render() -> ExtrinsicResult<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| ExtrinsicError::Internal(format!("metrics encoding failed: {}", e)))?;
    String::from_utf8(buffer)
        .map_err(|e| ExtrinsicError::Internal(format!("metrics are not UTF-8: {}", e)))
}
