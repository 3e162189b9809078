//! Per-entity progress state machine
//!
//! An entity inside a run is always in exactly one state: waiting at one of
//! the ten stages, stalled at a stage whose last attempt failed, or done.
//! The state is never stored; it is derived from the entity's checkpoints,
//! and the only way to move it is to record another checkpoint.

use crate::{CheckpointStatus, Stage};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Progress of one entity within one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "stage", rename_all = "snake_case")]
pub enum EntityState {
    /// Waiting for (or executing) this stage
    AtStage(Stage),

    /// The latest attempt of this stage failed; the entity does not advance
    Failed(Stage),

    /// Every stage has a satisfying checkpoint
    Completed,
}

impl EntityState {
    /// The stage the entity needs next, if it is not done
    pub fn stage(&self) -> Option<Stage> {
        match self {
            EntityState::AtStage(stage) | EntityState::Failed(stage) => Some(*stage),
            EntityState::Completed => None,
        }
    }

    /// Completed or stalled entities no longer hold a run open
    pub fn is_settled(&self) -> bool {
        !matches!(self, EntityState::AtStage(_))
    }

    pub fn is_stalled(&self) -> bool {
        matches!(self, EntityState::Failed(_))
    }

    /// Derive the state from the checkpoint statuses recorded so far.
    ///
    /// Checkpoints for stages beyond the first unsatisfied one are ignored:
    /// they cannot have been reached legitimately.
    pub fn derive(ledger: &BTreeMap<Stage, CheckpointStatus>) -> EntityState {
        for stage in Stage::all() {
            match ledger.get(stage) {
                Some(status) if status.is_satisfying() => continue,
                Some(CheckpointStatus::Failed) => return EntityState::Failed(*stage),
                _ => return EntityState::AtStage(*stage),
            }
        }
        EntityState::Completed
    }
}

impl fmt::Display for EntityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityState::AtStage(stage) => write!(f, "at {}", stage),
            EntityState::Failed(stage) => write!(f, "failed at {}", stage),
            EntityState::Completed => f.write_str("completed"),
        }
    }
}

/// State machine for a single entity, driven by checkpoint outcomes
#[derive(Debug, Clone)]
pub struct EntityStateMachine {
    current_state: EntityState,
    ledger: BTreeMap<Stage, CheckpointStatus>,
}

impl EntityStateMachine {
    /// A fresh entity, waiting at the first stage
    pub fn new() -> Self {
        Self {
            current_state: EntityState::AtStage(Stage::first()),
            ledger: BTreeMap::new(),
        }
    }

    /// Rebuild the machine from persisted checkpoints
    pub fn from_checkpoints<I>(checkpoints: I) -> Self
    where
        I: IntoIterator<Item = (Stage, CheckpointStatus)>,
    {
        let ledger: BTreeMap<Stage, CheckpointStatus> = checkpoints.into_iter().collect();
        let current_state = EntityState::derive(&ledger);
        Self {
            current_state,
            ledger,
        }
    }

    pub fn current_state(&self) -> EntityState {
        self.current_state
    }

    /// Status recorded for a stage, if any
    pub fn status_of(&self, stage: Stage) -> Option<CheckpointStatus> {
        self.ledger.get(&stage).copied()
    }

    /// Stages with a satisfying checkpoint, in pipeline order
    pub fn satisfied_stages(&self) -> Vec<Stage> {
        Stage::all()
            .iter()
            .copied()
            .take_while(|stage| self.ledger.get(stage).is_some_and(|s| s.is_satisfying()))
            .collect()
    }

    /// Last stage of the contiguous satisfied prefix
    pub fn last_satisfied_stage(&self) -> Option<Stage> {
        self.satisfied_stages().last().copied()
    }

    /// Apply the outcome of executing `stage`.
    ///
    /// Only the stage the entity is waiting at (or stalled at) may be
    /// applied; anything else is a duplicate or out-of-order dispatch.
    pub fn apply(&mut self, stage: Stage, status: CheckpointStatus) -> crate::Result<EntityState> {
        if self.current_state.stage() != Some(stage) {
            return Err(crate::Error::InvalidTransition(format!(
                "cannot record {} for {} while entity is {}",
                status, stage, self.current_state
            )));
        }

        self.ledger.insert(stage, status);
        let new_state = EntityState::derive(&self.ledger);
        self.current_state = new_state;

        Ok(new_state)
    }
}

impl Default for EntityStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
