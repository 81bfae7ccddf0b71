//! Metrics module for recurring-service.
//! Provides Prometheus metrics for generation runs and per-schedule outcomes.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_counter_vec, register_histogram, register_histogram_vec,
    register_int_counter_vec, CounterVec, Encoder, Histogram, HistogramVec, IntCounterVec,
    TextEncoder,
};
use std::sync::OnceLock;

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "recurring_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Generation runs counter
pub static GENERATION_RUNS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Per-schedule outcome counter
pub static SCHEDULES_PROCESSED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Invoices generated counter by currency
pub static INVOICES_GENERATED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Generated amount counter by currency (monetary tracking)
pub static GENERATED_AMOUNT_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Error counter for alerting
pub static ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Wall time of a full generation run
pub static RUN_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    GENERATION_RUNS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "recurring_generation_runs_total",
                "Total generation runs by status"
            ),
            &["status"]
        )
        .expect("Failed to register GENERATION_RUNS_TOTAL")
    });

    SCHEDULES_PROCESSED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "recurring_schedules_processed_total",
                "Total schedules processed by outcome"
            ),
            &["outcome"]
        )
        .expect("Failed to register SCHEDULES_PROCESSED_TOTAL")
    });

    INVOICES_GENERATED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "recurring_invoices_generated_total",
                "Total invoices generated by currency"
            ),
            &["currency"]
        )
        .expect("Failed to register INVOICES_GENERATED_TOTAL")
    });

    GENERATED_AMOUNT_TOTAL.get_or_init(|| {
        register_counter_vec!(
            opts!(
                "recurring_generated_amount_total",
                "Total generated invoice amount by currency"
            ),
            &["currency"]
        )
        .expect("Failed to register GENERATED_AMOUNT_TOTAL")
    });

    ERRORS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("recurring_errors_total", "Total errors by type for alerting"),
            &["error_type", "operation"]
        )
        .expect("Failed to register ERRORS_TOTAL")
    });

    // Runs range from milliseconds (empty due set) to minutes
    RUN_DURATION.get_or_init(|| {
        register_histogram!(histogram_opts!(
            "recurring_generation_run_duration_seconds",
            "Generation run duration",
            vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]
        ))
        .expect("Failed to register RUN_DURATION")
    });

    // Force initialization of lazy statics
    let _ = &*DB_QUERY_DURATION;
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Record a completed or failed generation run.
pub fn record_generation_run(status: &str, duration_secs: f64) {
    if let Some(counter) = GENERATION_RUNS_TOTAL.get() {
        counter.with_label_values(&[status]).inc();
    }
    if let Some(histogram) = RUN_DURATION.get() {
        histogram.observe(duration_secs);
    }
}

/// Record a per-schedule outcome.
pub fn record_schedule_outcome(outcome: &str) {
    if let Some(counter) = SCHEDULES_PROCESSED_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

/// Record a generated invoice for financial tracking.
pub fn record_invoice_generated(currency: &str, amount: f64) {
    if let Some(counter) = INVOICES_GENERATED_TOTAL.get() {
        counter.with_label_values(&[currency]).inc();
    }
    if let Some(counter) = GENERATED_AMOUNT_TOTAL.get() {
        counter.with_label_values(&[currency]).inc_by(amount.abs());
    }
}

/// Record an error for alerting.
pub fn record_error(error_type: &str, operation: &str) {
    if let Some(counter) = ERRORS_TOTAL.get() {
        counter.with_label_values(&[error_type, operation]).inc();
    }
}
