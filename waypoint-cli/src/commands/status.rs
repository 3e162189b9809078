//! Status command

use crate::connect::parse_run_id;
use crate::polling::display_report;
use anyhow::Result;
use waypoint_runtime::PipelineOrchestrator;

/// Print where every entity of a run stands
pub async fn execute(orchestrator: &PipelineOrchestrator, run_id: &str, json: bool) -> Result<()> {
    let report = orchestrator.get_run_status(parse_run_id(run_id)?).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        display_report(&report);
    }

    Ok(())
}
