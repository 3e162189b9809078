//! Assertions over checkpoint ledgers
//!
//! Provides assertion helpers that give better error messages than
//! comparing raw checkpoint rows.

use std::collections::HashSet;
use waypoint_core::{CheckpointStatus, EntityId, Stage};
use waypoint_storage::CheckpointModel;

/// Assert no (run, entity, stage) has more than one checkpoint
pub fn assert_unique_checkpoints(checkpoints: &[CheckpointModel]) {
    let mut seen = HashSet::new();
    for checkpoint in checkpoints {
        let key = (
            checkpoint.run_id,
            checkpoint.entity_id,
            checkpoint.stage_name.clone(),
        );
        assert!(
            seen.insert(key),
            "Duplicate checkpoint for entity {} stage {}",
            checkpoint.entity_id,
            checkpoint.stage_name
        );
    }
}

/// The (stage, status) ledger of one entity, in stage order
pub fn ledger(checkpoints: &[CheckpointModel], entity: EntityId) -> Vec<(Stage, CheckpointStatus)> {
    let mut ledger: Vec<(Stage, CheckpointStatus)> = checkpoints
        .iter()
        .filter(|c| c.entity() == entity)
        .map(|c| {
            (
                c.stage().expect("known stage"),
                c.checkpoint_status().expect("known status"),
            )
        })
        .collect();
    ledger.sort_by_key(|(stage, _)| *stage);
    ledger
}

/// Assert an entity has a completed checkpoint for every stage and nothing else
pub fn assert_entity_completed(checkpoints: &[CheckpointModel], entity: EntityId) {
    let expected: Vec<(Stage, CheckpointStatus)> = Stage::all()
        .iter()
        .map(|stage| (*stage, CheckpointStatus::Completed))
        .collect();
    assert_eq!(
        ledger(checkpoints, entity),
        expected,
        "Entity {} did not complete every stage",
        entity
    );
}

/// Assert an entity completed the stages before `stage`, failed `stage`, and
/// has no checkpoint after it
pub fn assert_entity_stalled_at(
    checkpoints: &[CheckpointModel],
    entity: EntityId,
    stage: Stage,
) {
    let mut expected: Vec<(Stage, CheckpointStatus)> = Stage::all()[..stage.index()]
        .iter()
        .map(|s| (*s, CheckpointStatus::Completed))
        .collect();
    expected.push((stage, CheckpointStatus::Failed));
    assert_eq!(
        ledger(checkpoints, entity),
        expected,
        "Entity {} is not stalled at {}",
        entity,
        stage
    );
}
