//! Prometheus metrics for storage operations
//!
//! This module defines metrics for:
//! - Database operation latency
//! - Errors by kind

use lazy_static::lazy_static;
use prometheus::{register_histogram_vec, register_int_counter_vec, HistogramVec, IntCounterVec};

lazy_static! {
    /// Duration of database operations in seconds
    ///
    /// Labels:
    /// - operation: "create_run", "complete_run", "record_checkpoint", "record_counts", ...
    ///
    /// Buckets: 0.001s to 10s
    pub static ref DB_OPERATION_DURATION: HistogramVec = register_histogram_vec!(
        "waypoint_db_operation_duration_seconds",
        "Duration of database operations",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .expect("waypoint_db_operation_duration_seconds metric registration");

    /// Database errors by kind
    ///
    /// Labels:
    /// - kind: "unavailable", "constraint", "other"
    pub static ref DB_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "waypoint_db_errors_total",
        "Total number of database errors",
        &["kind"]
    )
    .expect("waypoint_db_errors_total metric registration");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        let _ = DB_OPERATION_DURATION.with_label_values(&["test"]);
        let _ = DB_ERRORS_TOTAL.with_label_values(&["other"]);
    }
}
