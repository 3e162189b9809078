//! Store traits shared by the PostgreSQL and in-memory backends

use crate::models::{CheckpointModel, DataTrackingModel, PipelineRunModel};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use waypoint_core::{
    CheckpointStatus, EntityId, EntityState, RunId, RunStatus, SectionCounts, Stage,
};

/// Entity with work left in a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncompleteEntity {
    pub entity_id: EntityId,

    /// First stage without a satisfying checkpoint
    pub next_stage: Stage,

    /// The latest attempt of `next_stage` failed
    pub stalled: bool,
}

/// Registry of pipeline runs
#[async_trait]
pub trait RunRegistry: Send + Sync {
    /// Create a run in `running` status for the given entities
    async fn create_run(
        &self,
        entities: &[EntityId],
        metadata: serde_json::Value,
    ) -> Result<PipelineRunModel>;

    /// Move a run to a terminal status.
    ///
    /// Repeating the call with the same status is a no-op; asking for a
    /// different terminal status than the one recorded is a `Conflict`.
    /// A running run with a `pending` checkpoint is refused with
    /// `PendingRetry`.
    async fn complete_run(&self, run_id: RunId, status: RunStatus) -> Result<PipelineRunModel>;

    /// Fetch a run, or `NotFound`
    async fn get_run(&self, run_id: RunId) -> Result<PipelineRunModel>;

    /// Most recently started runs first
    async fn list_runs(&self, limit: i64) -> Result<Vec<PipelineRunModel>>;
}

/// Durable record of stage outcomes
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Upsert the checkpoint for (run, entity, stage). Last writer wins.
    async fn record_checkpoint(
        &self,
        run_id: RunId,
        entity_id: EntityId,
        stage: Stage,
        status: CheckpointStatus,
        metadata: serde_json::Value,
    ) -> Result<CheckpointModel>;

    async fn get_checkpoint(
        &self,
        run_id: RunId,
        entity_id: EntityId,
        stage: Stage,
    ) -> Result<Option<CheckpointModel>>;

    /// Turn a `failed` checkpoint into a `pending` one, recording that a
    /// retry of the stage was requested.
    ///
    /// Serialized with [`RunRegistry::complete_run`]: either the run is
    /// finalized first and this returns `Conflict`, or the pending
    /// checkpoint keeps the run open until the retry records an outcome.
    /// Returns `None` when the checkpoint is missing or not `failed`. The
    /// error of the failed attempt moves to `previous_error`.
    async fn request_retry(
        &self,
        run_id: RunId,
        entity_id: EntityId,
        stage: Stage,
    ) -> Result<Option<CheckpointModel>>;

    /// All checkpoints of one entity in a run
    async fn list_entity_checkpoints(
        &self,
        run_id: RunId,
        entity_id: EntityId,
    ) -> Result<Vec<CheckpointModel>>;

    /// All checkpoints of a run
    async fn list_checkpoints(&self, run_id: RunId) -> Result<Vec<CheckpointModel>>;

    /// Whether the stage has a `completed` checkpoint
    async fn has_completed(
        &self,
        run_id: RunId,
        entity_id: EntityId,
        stage: Stage,
    ) -> Result<bool> {
        let checkpoint = self.get_checkpoint(run_id, entity_id, stage).await?;
        Ok(match checkpoint {
            Some(checkpoint) => checkpoint.checkpoint_status()? == CheckpointStatus::Completed,
            None => false,
        })
    }

    /// Entities of the run that still have stages to go.
    ///
    /// `members` lists entities that belong to the run even if they have no
    /// checkpoint yet. Fully finished entities are omitted; entities whose
    /// next stage last failed are reported with `stalled = true`.
    async fn list_incomplete(
        &self,
        run_id: RunId,
        members: &[EntityId],
    ) -> Result<Vec<IncompleteEntity>> {
        let checkpoints = self.list_checkpoints(run_id).await?;
        let ledgers = group_by_entity(members, &checkpoints)?;

        Ok(ledgers
            .into_iter()
            .filter_map(|(entity_id, ledger)| match EntityState::derive(&ledger) {
                EntityState::AtStage(next_stage) => Some(IncompleteEntity {
                    entity_id,
                    next_stage,
                    stalled: false,
                }),
                EntityState::Failed(next_stage) => Some(IncompleteEntity {
                    entity_id,
                    next_stage,
                    stalled: true,
                }),
                EntityState::Completed => None,
            })
            .collect())
    }
}

/// Audit counters per (run, entity)
#[async_trait]
pub trait DataTrackingStore: Send + Sync {
    /// Merge-patch the reported counters into the tracking record.
    ///
    /// Only sections present in `counts` are touched and a touched counter
    /// never decreases. `metadata` must be a JSON object (or null); its keys
    /// overwrite the stored ones.
    async fn record_counts(
        &self,
        run_id: RunId,
        entity_id: EntityId,
        counts: &SectionCounts,
        metadata: serde_json::Value,
    ) -> Result<DataTrackingModel>;

    async fn get_tracking(
        &self,
        run_id: RunId,
        entity_id: EntityId,
    ) -> Result<Option<DataTrackingModel>>;

    async fn list_tracking(&self, run_id: RunId) -> Result<Vec<DataTrackingModel>>;
}

/// Everything the orchestrator needs from storage
pub trait PipelineStore: RunRegistry + CheckpointStore + DataTrackingStore {}

impl<T> PipelineStore for T where T: RunRegistry + CheckpointStore + DataTrackingStore {}

/// Group checkpoints into a per-entity ledger, including members that have
/// no checkpoint yet.
pub fn group_by_entity(
    members: &[EntityId],
    checkpoints: &[CheckpointModel],
) -> Result<BTreeMap<EntityId, BTreeMap<Stage, CheckpointStatus>>> {
    let mut ledgers: BTreeMap<EntityId, BTreeMap<Stage, CheckpointStatus>> = members
        .iter()
        .map(|entity| (*entity, BTreeMap::new()))
        .collect();

    for checkpoint in checkpoints {
        ledgers
            .entry(checkpoint.entity())
            .or_default()
            .insert(checkpoint.stage()?, checkpoint.checkpoint_status()?);
    }

    Ok(ledgers)
}

/// Reject metadata that cannot be merged key-by-key
pub(crate) fn normalize_metadata(metadata: serde_json::Value) -> Result<serde_json::Value> {
    match metadata {
        serde_json::Value::Null => Ok(serde_json::json!({})),
        serde_json::Value::Object(_) => Ok(metadata),
        other => Err(crate::Error::ValidationError(format!(
            "metadata must be a JSON object, got {}",
            other
        ))),
    }
}
