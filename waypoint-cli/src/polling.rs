//! Status polling and display for pipeline runs

use anyhow::{Context, Result};
use std::time::Duration;
use tokio::time::{interval, timeout};
use tracing::{debug, info};
use waypoint_core::{EntityState, RunId, RunStatus, STAGE_COUNT};
use waypoint_runtime::{PipelineOrchestrator, RunStatusReport};

/// Print a run report to stdout
pub fn display_report(report: &RunStatusReport) {
    let status_icon = match report.status {
        RunStatus::Running => "🔄",
        RunStatus::Completed => "✅",
        RunStatus::PartialFailure => "⚠️",
    };

    println!("{} Run {} is {}", status_icon, report.run_id, report.status);
    println!("Started: {}", report.started_at);
    if let Some(completed) = report.completed_at {
        println!("Completed: {}", completed);
    }
    println!(
        "Entities: {} total, {} completed, {} stalled, {} in progress",
        report.summary.total,
        report.summary.completed,
        report.summary.stalled,
        report.summary.in_progress
    );

    for entity in &report.entities {
        match entity.state {
            EntityState::Completed => {}
            EntityState::AtStage(stage) => {
                println!(
                    "   {} waiting at stage {}/{} ({})",
                    entity.entity_id,
                    stage.number(),
                    STAGE_COUNT,
                    stage
                );
            }
            EntityState::Failed(stage) => {
                println!(
                    "   {} stalled at stage {}/{} ({}): {}",
                    entity.entity_id,
                    stage.number(),
                    STAGE_COUNT,
                    stage,
                    entity.error.as_deref().unwrap_or("no error recorded")
                );
            }
        }
    }
}

/// Poll a run until it reaches a terminal status
///
/// Returns the final status or times out
pub async fn poll_run_status(
    orchestrator: &PipelineOrchestrator,
    run_id: RunId,
    timeout_duration: Duration,
    poll_interval_duration: Duration,
) -> Result<RunStatus> {
    debug!(
        "Starting to poll run {} with timeout {:?} and interval {:?}",
        run_id, timeout_duration, poll_interval_duration
    );

    let mut poll_ticker = interval(poll_interval_duration);

    let result = timeout(timeout_duration, async {
        loop {
            poll_ticker.tick().await;

            let report = orchestrator
                .get_run_status(run_id)
                .await
                .context("Failed to fetch run status")?;

            info!(
                "Run {}: {}/{} entities settled",
                run_id,
                report.summary.completed + report.summary.stalled,
                report.summary.total
            );

            if report.status.is_terminal() {
                display_report(&report);
                return Ok(report.status);
            }
        }
    })
    .await;

    match result {
        Ok(status) => status,
        Err(_) => {
            anyhow::bail!(
                "Run {} did not finish within timeout of {:?}; it keeps running in the workers",
                run_id,
                timeout_duration
            )
        }
    }
}
