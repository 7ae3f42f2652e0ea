//! Metrics module for billing-service.
//! Provides Prometheus metrics for subscription, hours and invoice operations, plus the
//! recorder behind the shared HTTP request middleware.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_counter_vec, register_histogram_vec, register_int_counter_vec,
    CounterVec, Encoder, HistogramVec, IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;

/// Recorder for metrics emitted through the `metrics` facade (HTTP request counters).
pub static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "billing_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Subscription lifecycle operations counter
pub static SUBSCRIPTION_OPERATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Hours ledger operations counter
pub static HOURS_OPERATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Invoice operations counter
pub static INVOICE_OPERATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Activation attempts by plan and outcome
pub static ACTIVATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Notifications emitted or suppressed
pub static NOTIFICATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Error counter for alerting
pub static ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Charged amount by currency in minor units (monetary tracking)
pub static CHARGE_AMOUNT_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    METRICS_HANDLE.get_or_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder")
    });

    SUBSCRIPTION_OPERATIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_subscription_operations_total",
                "Total subscription operations by operation type"
            ),
            &["operation"]
        )
        .expect("Failed to register SUBSCRIPTION_OPERATIONS_TOTAL")
    });

    HOURS_OPERATIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_hours_operations_total",
                "Total hours balance operations by operation type"
            ),
            &["operation"]
        )
        .expect("Failed to register HOURS_OPERATIONS_TOTAL")
    });

    INVOICE_OPERATIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_invoice_operations_total",
                "Total invoice operations by operation and transaction type"
            ),
            &["operation", "transaction_type"]
        )
        .expect("Failed to register INVOICE_OPERATIONS_TOTAL")
    });

    ACTIVATIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_activations_total",
                "Subscription activation attempts by plan and outcome"
            ),
            &["plan", "outcome"]
        )
        .expect("Failed to register ACTIVATIONS_TOTAL")
    });

    NOTIFICATIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_notifications_total",
                "Notifications by type and outcome"
            ),
            &["notification_type", "outcome"]
        )
        .expect("Failed to register NOTIFICATIONS_TOTAL")
    });

    ERRORS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("billing_errors_total", "Total errors by code for alerting"),
            &["code", "operation"]
        )
        .expect("Failed to register ERRORS_TOTAL")
    });

    CHARGE_AMOUNT_TOTAL.get_or_init(|| {
        register_counter_vec!(
            opts!(
                "billing_charge_amount_total",
                "Total charged amount in minor units by currency and transaction type"
            ),
            &["currency", "transaction_type"]
        )
        .expect("Failed to register CHARGE_AMOUNT_TOTAL")
    });

    // Force initialization of lazy statics
    let _ = &*DB_QUERY_DURATION;
}

/// Get metrics in Prometheus text format: facade metrics first, then the billing registry.
pub fn get_metrics() -> String {
    let mut output = METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_else(|| "# Metrics recorder not initialized\n".to_string());

    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return output;
    }
    output.push_str(&String::from_utf8(buffer).unwrap_or_default());
    output
}

pub fn record_subscription_operation(operation: &str) {
    if let Some(counter) = SUBSCRIPTION_OPERATIONS_TOTAL.get() {
        counter.with_label_values(&[operation]).inc();
    }
}

pub fn record_hours_operation(operation: &str) {
    if let Some(counter) = HOURS_OPERATIONS_TOTAL.get() {
        counter.with_label_values(&[operation]).inc();
    }
}

pub fn record_invoice_operation(operation: &str, transaction_type: &str) {
    if let Some(counter) = INVOICE_OPERATIONS_TOTAL.get() {
        counter
            .with_label_values(&[operation, transaction_type])
            .inc();
    }
}

/// Record an activation attempt. `outcome` is `activated`, `payment_failed`, `rejected` or `write_failed`.
pub fn record_activation(plan: &str, outcome: &str) {
    if let Some(counter) = ACTIVATIONS_TOTAL.get() {
        counter.with_label_values(&[plan, outcome]).inc();
    }
}

pub fn record_notification(notification_type: &str, outcome: &str) {
    if let Some(counter) = NOTIFICATIONS_TOTAL.get() {
        counter
            .with_label_values(&[notification_type, outcome])
            .inc();
    }
}

/// Record an error for alerting.
pub fn record_error(code: &str, operation: &str) {
    if let Some(counter) = ERRORS_TOTAL.get() {
        counter.with_label_values(&[code, operation]).inc();
    }
}

/// Record a charged amount for financial tracking.
pub fn record_charge_amount(currency: &str, transaction_type: &str, amount_minor_units: i64) {
    if let Some(counter) = CHARGE_AMOUNT_TOTAL.get() {
        counter
            .with_label_values(&[currency, transaction_type])
            .inc_by(amount_minor_units.unsigned_abs() as f64);
    }
}
