use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, HistogramVec, IntCounterVec, TextEncoder,
};

use crate::error::GatewayResult;

lazy_static! {
    // Session store metrics
    pub static ref SESSION_OPERATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "quiz_session_operations_total",
        "Total number of session store operations",
        &["operation", "store", "status"]
    )
    .unwrap();

    pub static ref SESSION_OPERATION_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "quiz_session_operation_duration_seconds",
        "Session store operation duration in seconds",
        &["operation", "store"],
        vec![0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    )
    .unwrap();

    pub static ref RECONCILE_RECORDS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "quiz_reconcile_records_total",
        "Buffered records processed by reconciliation",
        &["outcome"]
    )
    .unwrap();

    // Business metrics
    pub static ref ANSWERS_EVALUATED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "quiz_answers_evaluated_total",
        "Total number of evaluated questions",
        &["correct"]
    )
    .unwrap();

    pub static ref ATTEMPTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "quiz_attempts_total",
        "Quiz attempts by lifecycle event",
        &["status"]
    )
    .unwrap();
}

/// Prometheus text exposition of every registered metric.
pub fn render_metrics() -> Result<String, prometheus::Error> {
    TextEncoder::new().encode_to_string(&prometheus::gather())
}

/// Times a session store call and counts it by outcome.
pub async fn track_session_operation<F, T>(
    operation: &str,
    store: &str,
    future: F,
) -> GatewayResult<T>
where
    F: std::future::Future<Output = GatewayResult<T>>,
{
    let timer = SESSION_OPERATION_DURATION_SECONDS
        .with_label_values(&[operation, store])
        .start_timer();
    let result = future.await;
    timer.observe_duration();

    let outcome = match &result {
        Ok(_) => "success",
        Err(_) => "error",
    };
    SESSION_OPERATIONS_TOTAL
        .with_label_values(&[operation, store, outcome])
        .inc();
    result
}

pub fn record_reconcile(outcome: &str) {
    RECONCILE_RECORDS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_attempt(status: &str) {
    ATTEMPTS_TOTAL.with_label_values(&[status]).inc();
}
