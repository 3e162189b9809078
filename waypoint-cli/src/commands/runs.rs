//! Runs and queues commands

use anyhow::Result;
use waypoint_runtime::PipelineOrchestrator;

/// List the most recent runs, newest first
pub async fn execute(orchestrator: &PipelineOrchestrator, limit: i64) -> Result<()> {
    let runs = orchestrator.list_runs(limit).await?;
    if runs.is_empty() {
        println!("No runs");
        return Ok(());
    }

    println!("{:<36}  {:<16}  {:>8}  STARTED", "RUN", "STATUS", "ENTITIES");
    for run in &runs {
        println!(
            "{:<36}  {:<16}  {:>8}  {}",
            run.id,
            run.status,
            run.entity_ids.0.len(),
            run.started_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(())
}

/// Print the depth of every dispatch queue
pub async fn queues(orchestrator: &PipelineOrchestrator) -> Result<()> {
    for (queue, depth) in orchestrator.queue_depths().await? {
        println!("{:<24} {}", queue, depth);
    }
    Ok(())
}
