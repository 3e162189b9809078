//! Control plane: dispatch queues, dependency locks and the stop epoch
//!
//! The control plane holds only transient coordination state. Everything
//! that must survive a crash lives in the checkpoint store, so the whole
//! control plane can be wiped by [`ControlPlane::hard_stop`] and rebuilt
//! from durable state by resuming runs.
//!
//! Every dispatch unit carries the epoch it was enqueued under. A hard stop
//! bumps the epoch, which fences out units that were already dequeued by
//! some worker: they are abandoned instead of seeding further work.

mod memory;
mod redis;

pub use self::memory::MemoryControlPlane;
pub use self::redis::RedisControlPlane;

use crate::orchestrator::ResumeMode;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use waypoint_core::{EntityId, RunId, Stage};

/// Queue carrying seeding and finalization units
pub const ORCHESTRATION_QUEUE: &str = "orchestration";

/// One queued piece of work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DispatchUnit {
    /// Run `stage` for one entity
    Stage {
        run_id: RunId,
        entity_id: EntityId,
        stage: Stage,
        epoch: u64,
        /// How many times this unit was put back after an infrastructure error
        #[serde(default)]
        deliveries: u32,
        /// Enqueued by a `retry_failed` resume for a stage that had failed
        #[serde(default)]
        retry_failed: bool,
    },

    /// Seed stage units for every entity of a run from its checkpoints
    Seed {
        run_id: RunId,
        mode: ResumeMode,
        epoch: u64,
    },

    /// Check whether a run can be finalized
    Finalize { run_id: RunId, epoch: u64 },
}

impl DispatchUnit {
    pub fn stage(run_id: RunId, entity_id: EntityId, stage: Stage, epoch: u64) -> Self {
        DispatchUnit::Stage {
            run_id,
            entity_id,
            stage,
            epoch,
            deliveries: 0,
            retry_failed: false,
        }
    }

    /// Unit re-running a failed stage whose retry was requested
    pub fn retry(run_id: RunId, entity_id: EntityId, stage: Stage, epoch: u64) -> Self {
        DispatchUnit::Stage {
            run_id,
            entity_id,
            stage,
            epoch,
            deliveries: 0,
            retry_failed: true,
        }
    }

    /// Name of the queue the unit belongs on
    pub fn queue(&self) -> String {
        match self {
            DispatchUnit::Stage { stage, .. } => stage.descriptor().queue_name(),
            DispatchUnit::Seed { .. } | DispatchUnit::Finalize { .. } => {
                ORCHESTRATION_QUEUE.to_string()
            }
        }
    }

    pub fn epoch(&self) -> u64 {
        match self {
            DispatchUnit::Stage { epoch, .. }
            | DispatchUnit::Seed { epoch, .. }
            | DispatchUnit::Finalize { epoch, .. } => *epoch,
        }
    }

    pub fn run_id(&self) -> RunId {
        match self {
            DispatchUnit::Stage { run_id, .. }
            | DispatchUnit::Seed { run_id, .. }
            | DispatchUnit::Finalize { run_id, .. } => *run_id,
        }
    }

    /// Copy of the unit marked as redelivered
    pub fn redelivered(&self) -> Self {
        let mut unit = self.clone();
        if let DispatchUnit::Stage { deliveries, .. } = &mut unit {
            *deliveries += 1;
        }
        unit
    }

    pub(crate) fn encode(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| crate::Error::Internal(format!("encode dispatch unit: {}", e)))
    }

    pub(crate) fn decode(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| crate::Error::Internal(format!("decode dispatch unit: {}", e)))
    }
}

/// Every queue the pipeline uses, stage queues first
pub fn all_queues() -> Vec<String> {
    Stage::all()
        .iter()
        .map(|stage| stage.descriptor().queue_name())
        .chain(std::iter::once(ORCHESTRATION_QUEUE.to_string()))
        .collect()
}

/// Proof of holding a named lock. Only the holder's token can release it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    pub name: String,
    pub token: String,
}

impl LockLease {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            token: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// What a hard stop threw away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardStopReport {
    pub units_discarded: u64,
    pub locks_cleared: u64,
    /// Epoch in force after the stop
    pub epoch: u64,
}

/// Queue and lock broker shared by every worker process
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Append a unit to the tail of its queue
    async fn enqueue(&self, unit: DispatchUnit) -> Result<()>;

    /// Pop the head of `queue`, waiting up to `wait` for one to arrive
    async fn dequeue(&self, queue: &str, wait: Duration) -> Result<Option<DispatchUnit>>;

    /// Number of units waiting in `queue`
    async fn queue_depth(&self, queue: &str) -> Result<u64>;

    /// Try to take the named lock for at most `ttl`. Returns `None` if
    /// another holder has it.
    async fn acquire_lock(&self, name: &str, ttl: Duration) -> Result<Option<LockLease>>;

    /// Extend a held lock to expire `ttl` from now. Returns false if the
    /// lease is no longer held.
    async fn renew_lock(&self, lease: &LockLease, ttl: Duration) -> Result<bool>;

    /// Release a lock. Returns false if the lease had already expired or
    /// been cleared.
    async fn release_lock(&self, lease: &LockLease) -> Result<bool>;

    /// Current stop epoch
    async fn epoch(&self) -> Result<u64>;

    /// Drop every queued unit, clear every lock and bump the epoch, as
    /// one atomic step.
    async fn hard_stop(&self) -> Result<HardStopReport>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_queue_routing() {
        let run_id = RunId::new();
        let unit = DispatchUnit::stage(run_id, EntityId(1), Stage::Reviews, 0);
        assert_eq!(unit.queue(), "stage:reviews");

        let finalize = DispatchUnit::Finalize { run_id, epoch: 0 };
        assert_eq!(finalize.queue(), ORCHESTRATION_QUEUE);
    }

    #[test]
    fn test_unit_wire_format() {
        let run_id = RunId::new();
        let unit = DispatchUnit::stage(run_id, EntityId(3), Stage::Map, 2);
        let encoded = unit.encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["kind"], "stage");
        assert_eq!(value["stage"], "map");
        assert_eq!(value["entity_id"], 3);
        assert_eq!(DispatchUnit::decode(&encoded).unwrap(), unit);
    }

    #[test]
    fn test_redelivered_counts_deliveries() {
        let unit = DispatchUnit::stage(RunId::new(), EntityId(1), Stage::Tips, 0);
        match unit.redelivered().redelivered() {
            DispatchUnit::Stage { deliveries, .. } => assert_eq!(deliveries, 2),
            other => panic!("unexpected unit {:?}", other),
        }
    }

    #[test]
    fn test_redelivered_retry_stays_a_retry() {
        let unit = DispatchUnit::retry(RunId::new(), EntityId(1), Stage::Metadata, 4);
        match unit.redelivered() {
            DispatchUnit::Stage {
                deliveries,
                retry_failed,
                epoch,
                ..
            } => {
                assert_eq!(deliveries, 1);
                assert!(retry_failed);
                assert_eq!(epoch, 4);
            }
            other => panic!("unexpected unit {:?}", other),
        }
    }

    #[test]
    fn test_units_without_retry_flag_decode_as_plain() {
        let run_id = RunId::new();
        let raw = format!(
            r#"{{"kind":"stage","run_id":"{}","entity_id":1,"stage":"tips","epoch":0}}"#,
            run_id
        );
        assert_eq!(
            DispatchUnit::decode(&raw).unwrap(),
            DispatchUnit::stage(run_id, EntityId(1), Stage::Tips, 0)
        );
    }

    #[test]
    fn test_all_queues() {
        let queues = all_queues();
        assert_eq!(queues.len(), Stage::all().len() + 1);
        assert_eq!(queues.first().map(String::as_str), Some("stage:metadata"));
        assert_eq!(queues.last().map(String::as_str), Some(ORCHESTRATION_QUEUE));
    }
}
