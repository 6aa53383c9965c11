//! Prometheus instrumentation for the data plane
//!
//! Ingestion series live under the `qan_api2_data_ingestion` prefix; query
//! engine series under `qan_api2_query`.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram_vec, Counter,
    CounterVec, Encoder, Gauge, HistogramVec, TextEncoder,
};

lazy_static! {
    // === Ingestion ===

    /// Batches waiting in the ingestion queue
    pub static ref REQUESTS_LEN: Gauge = register_gauge!(
        "qan_api2_data_ingestion_requests_len",
        "Current number of requests in a queue."
    ).unwrap();

    /// Ingestion queue capacity
    pub static ref REQUESTS_CAP: Gauge = register_gauge!(
        "qan_api2_data_ingestion_requests_cap",
        "Maximum number of requests in a queue."
    ).unwrap();

    /// Buckets written per commit
    pub static ref BUCKETS_PER_BATCH: HistogramVec = register_histogram_vec!(
        "qan_api2_data_ingestion_buckets_per_batch",
        "Number of metric buckets per ClickHouse batch.",
        &["error"],
        vec![1.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0, 10000.0]
    ).unwrap();

    /// Commit latency
    pub static ref BATCH_SAVE_SECONDS: HistogramVec = register_histogram_vec!(
        "qan_api2_data_ingestion_batch_save_seconds",
        "Batch save duration.",
        &["error"],
        vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    ).unwrap();

    /// Malformed buckets left out of collect requests
    pub static ref BUCKETS_REJECTED: Counter = register_counter!(
        "qan_api2_data_ingestion_buckets_rejected_total",
        "Malformed metric buckets rejected before queueing."
    ).unwrap();

    // === Query engine ===

    /// Read operations by outcome
    pub static ref QUERIES_TOTAL: CounterVec = register_counter_vec!(
        "qan_api2_query_queries_total",
        "Total read operations",
        &["operation", "status"]
    ).unwrap();

    /// Read operation latency
    pub static ref QUERY_DURATION: HistogramVec = register_histogram_vec!(
        "qan_api2_query_duration_seconds",
        "Read operation latency in seconds",
        &["operation"],
        vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]
    ).unwrap();

    // === Retention ===

    /// Partitions dropped by the retention job
    pub static ref PARTITIONS_DROPPED: CounterVec = register_counter_vec!(
        "qan_api2_retention_partitions_dropped_total",
        "Partitions dropped by retention",
        &["status"]
    ).unwrap();
}

/// Initialize metrics so every series is present before the first scrape
pub fn init() {
    REQUESTS_LEN.set(0.0);
    for error in ["0", "1"] {
        BUCKETS_PER_BATCH.with_label_values(&[error]);
        BATCH_SAVE_SECONDS.with_label_values(&[error]);
    }

    tracing::info!("Metrics system initialized");
}

/// Get metrics in Prometheus text format
///
/// # Returns
///
/// Result containing the formatted metrics string, or an error if encoding fails
pub fn gather_metrics() -> Result<String, String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Metrics contain invalid UTF-8: {}", e))
}

#[inline]
fn error_label(failed: bool) -> &'static str {
    if failed {
        "1"
    } else {
        "0"
    }
}

/// Update the queue gauges
#[inline]
pub fn update_queue(len: usize, cap: usize) {
    REQUESTS_LEN.set(len as f64);
    REQUESTS_CAP.set(cap as f64);
}

/// Record one commit attempt
#[inline]
pub fn record_batch(buckets: usize, duration_secs: f64, failed: bool) {
    let label = error_label(failed);
    BUCKETS_PER_BATCH
        .with_label_values(&[label])
        .observe(buckets as f64);
    BATCH_SAVE_SECONDS
        .with_label_values(&[label])
        .observe(duration_secs);
}

/// Record malformed buckets left out of a request
#[inline]
pub fn record_rejected(buckets: usize) {
    BUCKETS_REJECTED.inc_by(buckets as f64);
}

/// Record one read operation
#[inline]
pub fn record_query(operation: &str, duration_secs: f64, success: bool) {
    let status = if success { "success" } else { "error" };
    QUERIES_TOTAL.with_label_values(&[operation, status]).inc();
    QUERY_DURATION
        .with_label_values(&[operation])
        .observe(duration_secs);
}

/// Record one partition drop
#[inline]
pub fn record_partition_drop(success: bool) {
    let status = if success { "success" } else { "error" };
    PARTITIONS_DROPPED.with_label_values(&[status]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_batch() {
        record_batch(3, 0.01, false);
        record_batch(1, 0.02, true);
        let failed = BUCKETS_PER_BATCH.with_label_values(&["1"]).get_sample_count();
        assert!(failed >= 1);
    }

    #[test]
    fn test_gather_metrics() {
        init();
        update_queue(2, 100);
        record_query("GetReport", 0.1, true);
        let metrics = gather_metrics().expect("Failed to gather metrics");
        assert!(metrics.contains("qan_api2_data_ingestion_requests_cap 100"));
        assert!(metrics.contains("qan_api2_query_queries_total"));
    }
}
