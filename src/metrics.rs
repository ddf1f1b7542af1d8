//! Metrics collection for work units
//!
//! Provides Prometheus-compatible metrics for unit throughput, failures by
//! kind and reply channel traffic.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, Encoder, HistogramVec,
    IntCounterVec, IntGauge, TextEncoder,
};
use std::time::Duration;

lazy_static! {
    /// Counter for work units that started their thread
    static ref UNITS_STARTED: IntCounterVec = register_int_counter_vec!(
        "batch_kernel_units_started_total",
        "Total number of work units started",
        &["kind"]
    ).unwrap();

    /// Counter for work units that finished, by terminal status
    static ref UNITS_FINISHED: IntCounterVec = register_int_counter_vec!(
        "batch_kernel_units_finished_total",
        "Total number of work units finished",
        &["kind", "status"]
    ).unwrap();

    /// Counter for failures, by where in the unit lifecycle they happened
    static ref UNIT_FAILURES: IntCounterVec = register_int_counter_vec!(
        "batch_kernel_unit_failures_total",
        "Total number of work unit failures",
        &["kind", "failure_kind"]
    ).unwrap();

    /// Counter for FAILED final statuses sent on behalf of a dead partition
    static ref SYNTHESIZED_FINAL_STATUSES: IntCounterVec = register_int_counter_vec!(
        "batch_kernel_synthesized_final_statuses_total",
        "Total number of partition final statuses synthesized at thread end",
        &["step_name"]
    ).unwrap();

    /// Counter for reply messages handed to a reply channel
    static ref REPLY_MESSAGES: IntCounterVec = register_int_counter_vec!(
        "batch_kernel_reply_messages_total",
        "Total number of partition reply messages sent",
        &["type"]
    ).unwrap();

    /// Histogram for unit wall-clock duration
    static ref UNIT_DURATION: HistogramVec = register_histogram_vec!(
        "batch_kernel_unit_duration_seconds",
        "Work unit duration in seconds",
        &["kind"],
        vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0]
    ).unwrap();

    /// Gauge for units currently on a thread
    static ref ACTIVE_UNITS: IntGauge = register_int_gauge!(
        "batch_kernel_active_units",
        "Number of work units currently running"
    ).unwrap();
}

/// Work unit metrics recorder
pub struct BatchMetrics;

impl BatchMetrics {
    /// Record a unit starting its thread
    pub fn record_unit_started(kind: &str) {
        UNITS_STARTED.with_label_values(&[kind]).inc();
        ACTIVE_UNITS.inc();
    }

    /// Record a unit finishing its thread
    pub fn record_unit_finished(kind: &str, status: &str, duration: Duration) {
        UNITS_FINISHED.with_label_values(&[kind, status]).inc();
        UNIT_DURATION.with_label_values(&[kind]).observe(duration.as_secs_f64());
        ACTIVE_UNITS.dec();
    }

    /// Record a failure in one lifecycle phase
    pub fn record_unit_failure(kind: &str, failure_kind: &str) {
        UNIT_FAILURES.with_label_values(&[kind, failure_kind]).inc();
    }

    /// Record a synthesized partition final status
    pub fn record_synthesized_final_status(step_name: &str) {
        SYNTHESIZED_FINAL_STATUSES.with_label_values(&[step_name]).inc();
    }

    /// Record a reply message sent
    pub fn record_reply_message(msg_type: &str) {
        REPLY_MESSAGES.with_label_values(&[msg_type]).inc();
    }

    /// Get all metrics in Prometheus text format
    pub fn export_metrics() -> Result<String, String> {
        let encoder = TextEncoder::new();
        let metric_families = prometheus::gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| format!("Failed to encode metrics: {}", e))?;
        String::from_utf8(buffer).map_err(|e| format!("Failed to convert metrics to UTF-8: {}", e))
    }
}
