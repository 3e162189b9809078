//! Stop command

use anyhow::Result;
use waypoint_runtime::PipelineOrchestrator;

/// Hard stop of the whole pipeline.
///
/// Runs stay `running`; use `resume` to continue them.
pub async fn execute(orchestrator: &PipelineOrchestrator) -> Result<()> {
    let report = orchestrator.stop_pipeline().await?;

    println!("🛑 Pipeline stopped");
    println!("Discarded units: {}", report.units_discarded);
    println!("Cleared locks: {}", report.locks_cleared);
    println!("Epoch: {}", report.epoch);
    println!("Interrupted runs stay running until resumed");

    Ok(())
}
