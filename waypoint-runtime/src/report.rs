//! Read-only projections over runs, checkpoints and tracking records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use waypoint_core::{
    EntityId, EntityState, EntityStateMachine, RunId, RunStatus, Section, SectionCounts, Stage,
};
use waypoint_storage::store::group_by_entity;
use waypoint_storage::{CheckpointModel, DataTrackingModel, PipelineRunModel};

/// Where one entity stands within a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityProgress {
    pub entity_id: EntityId,
    pub state: EntityState,

    /// Stage the entity waits at or stalled at; `None` once done
    pub current_stage: Option<Stage>,

    /// 1-based position of `current_stage`
    pub current_stage_number: Option<usize>,

    /// Length of the satisfied stage prefix
    pub stages_completed: usize,
    pub last_completed_stage: Option<Stage>,

    /// Error recorded on the stalled stage
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSummary {
    pub total: usize,
    pub completed: usize,
    pub stalled: usize,
    pub in_progress: usize,
}

impl ProgressSummary {
    /// Every entity is done or stalled
    pub fn is_settled(&self) -> bool {
        self.in_progress == 0
    }

    /// Terminal status the run would get if finalized now
    pub fn final_status(&self) -> Option<RunStatus> {
        match (self.is_settled(), self.stalled) {
            (false, _) => None,
            (true, 0) => Some(RunStatus::Completed),
            (true, _) => Some(RunStatus::PartialFailure),
        }
    }
}

/// Run status with per-entity stage progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatusReport {
    pub run_id: RunId,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
    pub entities: Vec<EntityProgress>,
    pub summary: ProgressSummary,
}

impl RunStatusReport {
    pub fn build(
        run: &PipelineRunModel,
        checkpoints: &[CheckpointModel],
    ) -> waypoint_storage::Result<Self> {
        let entities = entity_progress(&run.entities(), checkpoints)?;
        let summary = summarize(&entities);

        Ok(Self {
            run_id: run.run_id(),
            status: run.run_status()?,
            started_at: run.started_at,
            completed_at: run.completed_at,
            metadata: run.metadata.0.clone(),
            entities,
            summary,
        })
    }
}

/// Progress of every entity that is a member of the run or has a checkpoint in it
pub fn entity_progress(
    members: &[EntityId],
    checkpoints: &[CheckpointModel],
) -> waypoint_storage::Result<Vec<EntityProgress>> {
    let ledgers = group_by_entity(members, checkpoints)?;

    Ok(ledgers
        .into_iter()
        .map(|(entity_id, ledger)| {
            let machine = EntityStateMachine::from_checkpoints(ledger);
            let state = machine.current_state();

            let error = match state {
                EntityState::Failed(stage) => checkpoints
                    .iter()
                    .find(|c| c.entity() == entity_id && c.stage_name == stage.as_str())
                    .and_then(|c| c.error_message())
                    .map(str::to_string),
                _ => None,
            };

            EntityProgress {
                entity_id,
                state,
                current_stage: state.stage(),
                current_stage_number: state.stage().map(|s| s.number()),
                stages_completed: machine.satisfied_stages().len(),
                last_completed_stage: machine.last_satisfied_stage(),
                error,
            }
        })
        .collect())
}

pub fn summarize(entities: &[EntityProgress]) -> ProgressSummary {
    entities
        .iter()
        .fold(ProgressSummary::default(), |mut summary, entity| {
            summary.total += 1;
            match entity.state {
                EntityState::Completed => summary.completed += 1,
                EntityState::Failed(_) => summary.stalled += 1,
                EntityState::AtStage(_) => summary.in_progress += 1,
            }
            summary
        })
}

/// Reported counters for one entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityTracking {
    pub entity_id: EntityId,
    pub counts: SectionCounts,
    pub total: i64,
}

impl EntityTracking {
    pub fn from_record(record: &DataTrackingModel) -> Self {
        let counts = record.counts();
        Self {
            entity_id: record.entity(),
            total: counts.total(),
            counts,
        }
    }

    /// Nothing was collected for any section
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

/// Spread of one section's counter across the entities that reported it
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SectionStats {
    pub reported: usize,
    pub min: i64,
    pub max: i64,
    pub mean: f64,
}

/// Aggregated audit counters of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingSummary {
    pub run_id: RunId,

    /// Entities with at least one reported counter
    pub total_entities: usize,
    pub totals: SectionCounts,

    /// Per-section mean over `total_entities`
    pub averages: BTreeMap<Section, f64>,
    pub per_entity: Vec<EntityTracking>,

    /// Entities with the most collected items, largest first
    pub top: Vec<EntityTracking>,

    /// Per-section min/max/mean over the entities that reported the section
    pub stats: BTreeMap<Section, SectionStats>,

    /// Entities whose every reported counter is zero
    pub empty: Vec<EntityId>,
}

impl TrackingSummary {
    pub fn build(run_id: RunId, records: &[DataTrackingModel], top_n: usize) -> Self {
        let per_entity: Vec<EntityTracking> =
            records.iter().map(EntityTracking::from_record).collect();

        let mut totals = SectionCounts::new();
        for entity in &per_entity {
            totals.accumulate(&entity.counts);
        }

        let total_entities = per_entity.len();
        let averages = if total_entities == 0 {
            BTreeMap::new()
        } else {
            totals
                .iter()
                .map(|(section, sum)| (section, sum as f64 / total_entities as f64))
                .collect()
        };

        let mut top = per_entity.clone();
        top.sort_by(|a, b| b.total.cmp(&a.total).then(a.entity_id.cmp(&b.entity_id)));
        top.truncate(top_n);

        let stats = section_stats(&per_entity);
        let empty = per_entity
            .iter()
            .filter(|entity| entity.is_empty())
            .map(|entity| entity.entity_id)
            .collect();

        Self {
            run_id,
            total_entities,
            totals,
            averages,
            per_entity,
            top,
            stats,
            empty,
        }
    }
}

fn section_stats(per_entity: &[EntityTracking]) -> BTreeMap<Section, SectionStats> {
    let mut stats = BTreeMap::new();
    for section in Section::all() {
        let values: Vec<i64> = per_entity
            .iter()
            .filter_map(|entity| entity.counts.get(*section))
            .collect();
        let (Some(min), Some(max)) = (values.iter().min(), values.iter().max()) else {
            continue;
        };
        let sum = values.iter().fold(0i64, |sum, v| sum.saturating_add(*v));
        stats.insert(
            *section,
            SectionStats {
                reported: values.len(),
                min: *min,
                max: *max,
                mean: sum as f64 / values.len() as f64,
            },
        );
    }
    stats
}
