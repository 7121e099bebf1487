// =============================================================================
// METRICS MODULE
// =============================================================================
// Prometheus metrics for observability: HTTP traffic, store latency and the
// circulation/ownership counters the dashboard cares about.
// =============================================================================

use anyhow::Result;
use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

// =============================================================================
// METRIC NAMES (Constants)
// =============================================================================

/// HTTP request counter
/// Labels: method (GET/POST), endpoint (/api/v1/books), status (200/409)
pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";

/// HTTP request duration histogram
/// Labels: method, endpoint
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";

/// Available copies gauge per book
/// Labels: tag
pub const LIBRARY_AVAILABLE_COPIES: &str = "library_available_copies";

/// Issue attempts counter
/// Labels: status (success/failed)
pub const LIBRARY_ISSUES_TOTAL: &str = "library_issues_total";

/// Return attempts counter
/// Labels: status (success/failed)
pub const LIBRARY_RETURNS_TOTAL: &str = "library_returns_total";

/// Ownership transfer attempts counter
/// Labels: status (success/failed)
pub const LIBRARY_OWNERSHIP_TRANSFERS_TOTAL: &str = "library_ownership_transfers_total";

/// Overdue loans gauge (count at last poll)
pub const LIBRARY_OVERDUE_LOANS: &str = "library_overdue_loans";

/// Database query duration histogram
/// Labels: operation (select/insert/update/delete)
pub const DB_QUERY_DURATION_SECONDS: &str = "db_query_duration_seconds";

/// Redis operation duration histogram
/// Labels: operation (get/setex/del)
pub const REDIS_OPERATION_DURATION_SECONDS: &str = "redis_operation_duration_seconds";

// =============================================================================
// SETUP FUNCTION
// =============================================================================
/// Initialize the Prometheus recorder and return the handle used to render
/// the /metrics endpoint.
pub fn setup_metrics() -> Result<PrometheusHandle> {
    // Latency buckets from 1ms up to 10s
    let latency_buckets = &[
        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(HTTP_REQUEST_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .set_buckets_for_metric(
            Matcher::Full(DB_QUERY_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .set_buckets_for_metric(
            Matcher::Full(REDIS_OPERATION_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .install_recorder()?;

    describe_counter!(
        HTTP_REQUESTS_TOTAL,
        "Total number of HTTP requests received"
    );

    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request latency in seconds"
    );

    describe_gauge!(
        LIBRARY_AVAILABLE_COPIES,
        "Copies currently on the shelf for each book"
    );

    describe_counter!(LIBRARY_ISSUES_TOTAL, "Total number of issue attempts");

    describe_counter!(LIBRARY_RETURNS_TOTAL, "Total number of return attempts");

    describe_counter!(
        LIBRARY_OWNERSHIP_TRANSFERS_TOTAL,
        "Total number of ownership transfer attempts"
    );

    describe_gauge!(
        LIBRARY_OVERDUE_LOANS,
        "Number of loans currently past their due date"
    );

    describe_histogram!(
        DB_QUERY_DURATION_SECONDS,
        "Database query latency in seconds"
    );

    describe_histogram!(
        REDIS_OPERATION_DURATION_SECONDS,
        "Redis operation latency in seconds"
    );

    Ok(handle)
}

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

/// Record an HTTP request
pub fn record_http_request(method: &str, endpoint: &str, status: u16, duration_secs: f64) {
    counter!(
        HTTP_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "endpoint" => endpoint.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "method" => method.to_string(),
        "endpoint" => endpoint.to_string()
    )
    .record(duration_secs);
}

/// Update the available-copies gauge for a book (labeled by shelf tag)
pub fn set_available_copies(tag: &str, available: i32) {
    gauge!(
        LIBRARY_AVAILABLE_COPIES,
        "tag" => tag.to_string()
    )
    .set(available as f64);
}

/// Record an issue attempt
pub fn record_issue(success: bool) {
    let status = if success { "success" } else { "failed" };
    counter!(
        LIBRARY_ISSUES_TOTAL,
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a return attempt
pub fn record_return(success: bool) {
    let status = if success { "success" } else { "failed" };
    counter!(
        LIBRARY_RETURNS_TOTAL,
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record an ownership transfer attempt
pub fn record_transfer(success: bool) {
    let status = if success { "success" } else { "failed" };
    counter!(
        LIBRARY_OWNERSHIP_TRANSFERS_TOTAL,
        "status" => status.to_string()
    )
    .increment(1);
}

/// Update the overdue-loan count
pub fn set_overdue_loans(count: i64) {
    gauge!(LIBRARY_OVERDUE_LOANS).set(count as f64);
}

/// Record database query duration
pub fn record_db_query(operation: &str, duration_secs: f64) {
    histogram!(
        DB_QUERY_DURATION_SECONDS,
        "operation" => operation.to_string()
    )
    .record(duration_secs);
}

/// Record Redis operation duration
pub fn record_redis_operation(operation: &str, duration_secs: f64) {
    histogram!(
        REDIS_OPERATION_DURATION_SECONDS,
        "operation" => operation.to_string()
    )
    .record(duration_secs);
}
