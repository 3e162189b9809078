//! Start command

use crate::polling::poll_run_status;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use waypoint_core::{EntityId, RunStatus};
use waypoint_runtime::PipelineOrchestrator;

pub struct StartArgs {
    pub entity_ids: Vec<i64>,
    pub file: Option<PathBuf>,
    pub metadata: Option<String>,
    pub wait: bool,
    pub timeout: u64,
    pub poll_interval: u64,
}

/// Start a run and optionally wait for it.
///
/// Returns the final status when `--wait` is given and the run finished.
pub async fn execute(
    orchestrator: &PipelineOrchestrator,
    args: StartArgs,
) -> Result<Option<RunStatus>> {
    let entities = match &args.file {
        Some(path) => read_entity_file(path)?,
        None => args.entity_ids.iter().copied().map(EntityId).collect(),
    };
    let metadata = run_metadata(args.metadata.as_deref(), args.file.as_deref())?;

    let run_id = orchestrator.start_pipeline(&entities, metadata).await?;
    println!("Run {} started for {} entities", run_id, entities.len());

    if !args.wait {
        return Ok(None);
    }

    info!("Waiting for run {} to finish", run_id);
    let status = poll_run_status(
        orchestrator,
        run_id,
        Duration::from_secs(args.timeout),
        Duration::from_secs(args.poll_interval),
    )
    .await?;

    Ok(Some(status))
}

fn read_entity_file(path: &Path) -> Result<Vec<EntityId>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read entity file {}", path.display()))?;
    parse_entity_list(&contents)
        .with_context(|| format!("Invalid entity file {}", path.display()))
}

/// Entity ids as a JSON array, or one id per line with `#` comments
fn parse_entity_list(contents: &str) -> Result<Vec<EntityId>> {
    let trimmed = contents.trim_start();
    if trimmed.starts_with('[') {
        let ids: Vec<i64> = serde_json::from_str(trimmed).context("Expected a JSON array of ids")?;
        return Ok(ids.into_iter().map(EntityId).collect());
    }

    contents
        .lines()
        .map(|line| line.split('#').next().unwrap_or_default().trim())
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.parse::<i64>()
                .map(EntityId)
                .with_context(|| format!("'{}' is not an entity id", line))
        })
        .collect()
}

fn run_metadata(raw: Option<&str>, file: Option<&Path>) -> Result<serde_json::Value> {
    let mut metadata = match raw {
        Some(raw) => serde_json::from_str(raw).context("--metadata must be a JSON object")?,
        None => serde_json::json!({}),
    };

    let serde_json::Value::Object(map) = &mut metadata else {
        anyhow::bail!("--metadata must be a JSON object");
    };
    map.entry("trigger")
        .or_insert_with(|| serde_json::Value::from("cli"));
    if let Some(file) = file {
        map.entry("entity_file")
            .or_insert_with(|| serde_json::Value::from(file.display().to_string()));
    }

    Ok(metadata)
}
