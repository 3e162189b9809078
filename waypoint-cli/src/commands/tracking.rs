//! Tracking command

use crate::connect::parse_run_id;
use anyhow::Result;
use waypoint_core::EntityId;
use waypoint_runtime::PipelineOrchestrator;

/// What part of a run's counters to print
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingView {
    Summary { top: usize },
    Entity(EntityId),
    Empty,
}

/// Print the collected item counters of a run
pub async fn execute(
    orchestrator: &PipelineOrchestrator,
    run_id: &str,
    view: TrackingView,
) -> Result<()> {
    let run_id = parse_run_id(run_id)?;

    match view {
        TrackingView::Summary { top } => summary(orchestrator, run_id, top).await,
        TrackingView::Entity(entity_id) => {
            let tracking = orchestrator.entity_tracking(run_id, entity_id).await?;
            println!("Entity {} in run {}: {} items", entity_id, run_id, tracking.total);
            for (section, count) in tracking.counts.iter() {
                println!("   {:<20} {:>8}", section.as_str(), count);
            }
            Ok(())
        }
        TrackingView::Empty => {
            let empty = orchestrator.empty_entities(run_id).await?;
            println!("Run {}: {} entities collected nothing", run_id, empty.len());
            for entity_id in &empty {
                println!("   {}", entity_id);
            }
            Ok(())
        }
    }
}

async fn summary(
    orchestrator: &PipelineOrchestrator,
    run_id: waypoint_core::RunId,
    top: usize,
) -> Result<()> {
    let summary = orchestrator.tracking_summary(run_id, top).await?;

    println!(
        "Run {}: {} entities reported counters, {} with nothing collected",
        summary.run_id,
        summary.total_entities,
        summary.empty.len()
    );
    for (section, total) in summary.totals.iter() {
        match summary.stats.get(&section) {
            Some(stats) => println!(
                "   {:<20} total {:>8}  avg {:>8.1}  min {:>6}  max {:>6}  ({} reported)",
                section.as_str(),
                total,
                stats.mean,
                stats.min,
                stats.max,
                stats.reported
            ),
            None => println!("   {:<20} total {:>8}", section.as_str(), total),
        }
    }

    if !summary.top.is_empty() {
        println!("Top {} entities:", summary.top.len());
        for entity in &summary.top {
            println!("   {:<12} {}", entity.entity_id.get(), entity.total);
        }
    }

    Ok(())
}
