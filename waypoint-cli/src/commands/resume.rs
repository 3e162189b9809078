//! Resume command

use crate::connect::parse_run_id;
use anyhow::Result;
use waypoint_runtime::{PipelineOrchestrator, ResumeMode};

pub async fn execute(
    orchestrator: &PipelineOrchestrator,
    run_id: &str,
    retry_failed: bool,
) -> Result<()> {
    let run_id = parse_run_id(run_id)?;
    let mode = if retry_failed {
        ResumeMode::RetryFailed
    } else {
        ResumeMode::PendingOnly
    };

    let report = orchestrator.resume_run(run_id, mode).await?;

    if let Some(status) = report.finalized {
        println!("Run {} had nothing left to do and is now {}", run_id, status);
        return Ok(());
    }

    println!("Run {} resumed: {} entities re-seeded", run_id, report.seeded.len());
    for unit in &report.seeded {
        println!("   {} from stage {} ({})", unit.entity_id, unit.stage.number(), unit.stage);
    }
    if report.stalled_skipped > 0 {
        println!(
            "{} stalled entities left alone; use --retry-failed to retry them",
            report.stalled_skipped
        );
    }

    Ok(())
}
