// src/utils/prometheus_metrics.rs

use once_cell::sync::Lazy;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram, Counter,
    CounterVec, Gauge, Histogram,
};

// Item-level metrics, labelled by strategy
pub static ITEMS_PROCESSED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "taskblaster_items_processed_total",
        "Total number of work items that completed successfully.",
        &["strategy"]
    )
    .expect("Failed to register taskblaster_items_processed_total counter")
});

pub static ITEMS_FAILED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "taskblaster_items_failed_total",
        "Total number of work items that produced a failed result.",
        &["strategy"]
    )
    .expect("Failed to register taskblaster_items_failed_total counter")
});

pub static ITEM_PROCESSING_DURATION_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "taskblaster_item_processing_duration_seconds",
        "Histogram of per-item processing durations."
    )
    .expect("Failed to register taskblaster_item_processing_duration_seconds histogram")
});

pub static ACTIVE_ITEMS: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "taskblaster_active_items",
        "Number of work items currently being processed."
    )
    .expect("Failed to register taskblaster_active_items gauge")
});

// Rate limiting
pub static RATE_LIMIT_WAITS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "taskblaster_rate_limit_waits_total",
        "Number of times a caller had to wait for a rate limiter permit."
    )
    .expect("Failed to register taskblaster_rate_limit_waits_total counter")
});

// Process pool
pub static WORKER_RESTARTS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "taskblaster_worker_restarts_total",
        "Number of worker processes respawned after a crash or timeout."
    )
    .expect("Failed to register taskblaster_worker_restarts_total counter")
});

// Pipeline
pub static PIPELINE_QUEUE_DEPTH: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "taskblaster_pipeline_queue_depth",
        "Current number of items waiting in the producer-consumer queue."
    )
    .expect("Failed to register taskblaster_pipeline_queue_depth gauge")
});

/// Records a finished item against the per-strategy counters.
pub fn record_item(strategy: &str, success: bool, duration_secs: f64) {
    if success {
        ITEMS_PROCESSED_TOTAL.with_label_values(&[strategy]).inc();
    } else {
        ITEMS_FAILED_TOTAL.with_label_values(&[strategy]).inc();
    }
    ITEM_PROCESSING_DURATION_SECONDS.observe(duration_secs);
}
