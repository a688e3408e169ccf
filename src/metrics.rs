//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // HTTP Metrics
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("feedbridge_http_requests_total", "Total number of HTTP requests"),
        &["method", "endpoint", "status"]
    ).expect("metric can be created");

    // Relay cycle metrics
    pub static ref RELAY_CYCLES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("feedbridge_relay_cycles_total", "Total number of delivery cycles run"),
        &["trigger"]
    ).expect("metric can be created");
    pub static ref RELAY_CYCLE_DURATION_SECONDS: prometheus::Histogram = prometheus::Histogram::with_opts(
        HistogramOpts::new(
            "feedbridge_relay_cycle_duration_seconds",
            "Delivery cycle duration in seconds"
        ).buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0])
    ).expect("metric can be created");
    pub static ref ACCOUNTS_PROCESSED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("feedbridge_accounts_processed_total", "Accounts processed per outcome"),
        &["outcome"]
    ).expect("metric can be created");
    pub static ref EVENTS_FETCHED_TOTAL: IntCounter = IntCounter::new(
        "feedbridge_events_fetched_total",
        "Total number of feed events fetched"
    ).expect("metric can be created");
    pub static ref NOTIFICATIONS_SENT_TOTAL: IntCounter = IntCounter::new(
        "feedbridge_notifications_sent_total",
        "Total number of notifications delivered to the push gateway"
    ).expect("metric can be created");
    pub static ref NOTIFICATIONS_SUPPRESSED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("feedbridge_notifications_suppressed_total", "Deliveries suppressed before dispatch"),
        &["reason"]
    ).expect("metric can be created");
    pub static ref DELIVERY_FAILURES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("feedbridge_delivery_failures_total", "Failed delivery attempts"),
        &["reason"]
    ).expect("metric can be created");
    pub static ref CLAIM_RACES_LOST_TOTAL: IntCounter = IntCounter::new(
        "feedbridge_claim_races_lost_total",
        "Delivery claims lost to a concurrent cycle"
    ).expect("metric can be created");
    pub static ref LEDGER_ROWS_PURGED_TOTAL: IntCounter = IntCounter::new(
        "feedbridge_ledger_rows_purged_total",
        "Ledger rows removed by the retention purge"
    ).expect("metric can be created");

    // Sink/source round trips
    pub static ref UPSTREAM_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("feedbridge_upstream_requests_total", "Requests to the source feed and push gateway"),
        &["upstream", "status"]
    ).expect("metric can be created");

    // Webhook metrics
    pub static ref WEBHOOK_EVENTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("feedbridge_webhook_events_total", "Inbound sink webhook events"),
        &["event", "status"]
    ).expect("metric can be created");

    // Registry state
    pub static ref LINKED_ACCOUNTS_ACTIVE: IntGauge = IntGauge::new(
        "feedbridge_linked_accounts_active",
        "Current number of active linked accounts"
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("feedbridge_errors_total", "Total number of errors"),
        &["error_type", "endpoint"]
    ).expect("metric can be created");
}

/// Initialize metrics registry.
pub fn init_metrics() {
    REGISTRY
        .register(Box::new(HTTP_REQUESTS_TOTAL.clone()))
        .expect("HTTP_REQUESTS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(RELAY_CYCLES_TOTAL.clone()))
        .expect("RELAY_CYCLES_TOTAL can be registered");
    REGISTRY
        .register(Box::new(RELAY_CYCLE_DURATION_SECONDS.clone()))
        .expect("RELAY_CYCLE_DURATION_SECONDS can be registered");
    REGISTRY
        .register(Box::new(ACCOUNTS_PROCESSED_TOTAL.clone()))
        .expect("ACCOUNTS_PROCESSED_TOTAL can be registered");
    REGISTRY
        .register(Box::new(EVENTS_FETCHED_TOTAL.clone()))
        .expect("EVENTS_FETCHED_TOTAL can be registered");
    REGISTRY
        .register(Box::new(NOTIFICATIONS_SENT_TOTAL.clone()))
        .expect("NOTIFICATIONS_SENT_TOTAL can be registered");
    REGISTRY
        .register(Box::new(NOTIFICATIONS_SUPPRESSED_TOTAL.clone()))
        .expect("NOTIFICATIONS_SUPPRESSED_TOTAL can be registered");
    REGISTRY
        .register(Box::new(DELIVERY_FAILURES_TOTAL.clone()))
        .expect("DELIVERY_FAILURES_TOTAL can be registered");
    REGISTRY
        .register(Box::new(CLAIM_RACES_LOST_TOTAL.clone()))
        .expect("CLAIM_RACES_LOST_TOTAL can be registered");
    REGISTRY
        .register(Box::new(LEDGER_ROWS_PURGED_TOTAL.clone()))
        .expect("LEDGER_ROWS_PURGED_TOTAL can be registered");
    REGISTRY
        .register(Box::new(UPSTREAM_REQUESTS_TOTAL.clone()))
        .expect("UPSTREAM_REQUESTS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(WEBHOOK_EVENTS_TOTAL.clone()))
        .expect("WEBHOOK_EVENTS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(LINKED_ACCOUNTS_ACTIVE.clone()))
        .expect("LINKED_ACCOUNTS_ACTIVE can be registered");
    REGISTRY
        .register(Box::new(ERRORS_TOTAL.clone()))
        .expect("ERRORS_TOTAL can be registered");

    tracing::info!("Metrics registry initialized");
}
