//! Prometheus metrics for pipeline orchestration
//!
//! This module defines metrics for stage execution, checkpoint writes and
//! control-plane activity.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, HistogramVec,
    IntCounter, IntCounterVec,
};

lazy_static! {
    /// Stage executor invocations
    ///
    /// Labels:
    /// - stage: persisted stage name
    /// - outcome: "completed", "no_data", "skipped", "transient_error", "terminal_error"
    pub static ref STAGE_EXECUTIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "waypoint_stage_executions_total",
        "Total number of stage executor invocations",
        &["stage", "outcome"]
    )
    .expect("waypoint_stage_executions_total metric registration");

    /// Duration of a single executor invocation
    ///
    /// Buckets: 0.1s to 30min (stage calls may crawl several provider pages)
    pub static ref STAGE_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "waypoint_stage_duration_seconds",
        "Duration of stage executor invocations",
        &["stage"],
        vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0]
    )
    .expect("waypoint_stage_duration_seconds metric registration");

    /// Checkpoints written by the dispatcher
    ///
    /// Labels:
    /// - stage: persisted stage name
    /// - status: "completed", "failed", "skipped"
    pub static ref CHECKPOINT_WRITES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "waypoint_checkpoint_writes_total",
        "Total number of checkpoint writes",
        &["stage", "status"]
    )
    .expect("waypoint_checkpoint_writes_total metric registration");

    /// Dispatch units discarded without running a stage
    ///
    /// Labels:
    /// - reason: see `DropReason::as_str`
    pub static ref DISPATCH_UNITS_DROPPED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "waypoint_dispatch_units_dropped_total",
        "Total number of dispatch units dropped",
        &["reason"]
    )
    .expect("waypoint_dispatch_units_dropped_total metric registration");

    /// Units put back on their queue after an infrastructure error or lock wait
    ///
    /// Labels:
    /// - queue: queue name
    pub static ref DISPATCH_UNITS_REQUEUED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "waypoint_dispatch_units_requeued_total",
        "Total number of dispatch units re-enqueued",
        &["queue"]
    )
    .expect("waypoint_dispatch_units_requeued_total metric registration");

    /// Runs moved to a terminal status
    ///
    /// Labels:
    /// - status: "completed", "partial_failure"
    pub static ref RUNS_FINALIZED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "waypoint_runs_finalized_total",
        "Total number of runs finalized",
        &["status"]
    )
    .expect("waypoint_runs_finalized_total metric registration");

    /// Control-plane resets
    pub static ref HARD_STOPS_TOTAL: IntCounter = register_int_counter!(
        "waypoint_hard_stops_total",
        "Total number of control-plane hard stops"
    )
    .expect("waypoint_hard_stops_total metric registration");
}
