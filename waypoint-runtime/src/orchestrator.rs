//! Pipeline orchestrator: the control surface for runs
//!
//! The orchestrator is stateless and cheap to clone. Runs, checkpoints and
//! tracking counters live in the [`PipelineStore`]; queued work lives in the
//! [`ControlPlane`]. Every trigger (CLI, admin HTTP, ingestion) goes through
//! the same operations here.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use waypoint_core::EntityId;
//! use waypoint_runtime::{MemoryControlPlane, PipelineOrchestrator, ResumeMode};
//! use waypoint_storage::MemoryStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let orchestrator = PipelineOrchestrator::new(
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(MemoryControlPlane::new()),
//! );
//!
//! // Create the run and queue its seeding unit
//! let run_id = orchestrator
//!     .start_pipeline(&[EntityId(1), EntityId(2)], serde_json::json!({"trigger": "cli"}))
//!     .await?;
//!
//! let status = orchestrator.get_run_status(run_id).await?;
//! println!("{} entities in progress", status.summary.in_progress);
//!
//! // After a crash or hard stop, re-seed from checkpoints
//! orchestrator.resume_run(run_id, ResumeMode::PendingOnly).await?;
//! # Ok(())
//! # }
//! ```

use crate::control_plane::{all_queues, ControlPlane, DispatchUnit, HardStopReport};
use crate::metrics::{HARD_STOPS_TOTAL, RUNS_FINALIZED_TOTAL};
use crate::report::{
    entity_progress, summarize, EntityTracking, RunStatusReport, TrackingSummary,
};
use crate::{map_storage_error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use waypoint_core::{EntityId, RunId, RunStatus, Stage};
use waypoint_storage::{PipelineRunModel, PipelineStore};

/// Which incomplete entities a resume re-seeds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeMode {
    /// Entities waiting at a stage; stalled entities stay stalled
    #[default]
    PendingOnly,

    /// Also re-run the failed stage of stalled entities. The retry is
    /// recorded as a `pending` checkpoint before its unit is queued, so the
    /// run cannot be finalized until the retry has run.
    RetryFailed,
}

/// Entity and stage a seeding pass enqueued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeededUnit {
    pub entity_id: EntityId,
    pub stage: Stage,

    /// The unit re-runs a failed stage
    #[serde(default)]
    pub retry: bool,
}

/// Outcome of seeding or resuming a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeReport {
    pub run_id: RunId,
    pub mode: ResumeMode,
    pub seeded: Vec<SeededUnit>,

    /// Stalled entities left alone because of `PendingOnly`
    pub stalled_skipped: usize,

    /// Set when nothing was seeded and the run was finalized instead
    pub finalized: Option<RunStatus>,
}

impl ResumeReport {
    fn new(run_id: RunId, mode: ResumeMode) -> Self {
        Self {
            run_id,
            mode,
            seeded: Vec::new(),
            stalled_skipped: 0,
            finalized: None,
        }
    }
}

/// Stateless orchestrator over a pipeline store and a control plane
#[derive(Clone)]
pub struct PipelineOrchestrator {
    store: Arc<dyn PipelineStore>,
    control: Arc<dyn ControlPlane>,
}

impl PipelineOrchestrator {
    /// Create a new orchestrator
    ///
    /// # Arguments
    ///
    /// * `store` - Durable run, checkpoint and tracking storage
    /// * `control` - Queue and lock broker shared with the workers
    pub fn new(store: Arc<dyn PipelineStore>, control: Arc<dyn ControlPlane>) -> Self {
        Self { store, control }
    }

    pub fn store(&self) -> &Arc<dyn PipelineStore> {
        &self.store
    }

    pub fn control(&self) -> &Arc<dyn ControlPlane> {
        &self.control
    }

    /// Start a pipeline run
    ///
    /// Creates the run in `running` status and queues one seeding unit on the
    /// orchestration queue. The seeding unit fans out a stage-1 unit per
    /// entity once a worker picks it up.
    ///
    /// # Arguments
    ///
    /// * `entities` - Entities to enrich; duplicates are ignored
    /// * `metadata` - Free-form JSON object stored with the run (trigger, operator, ...)
    ///
    /// # Returns
    ///
    /// The id of the new run
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `entities` is empty (`Validation`)
    /// - The run cannot be stored
    /// - The seeding unit cannot be queued; the run then exists and can be
    ///   resumed
    #[instrument(skip(self, entities, metadata), fields(entity_count = entities.len()))]
    pub async fn start_pipeline(
        &self,
        entities: &[EntityId],
        metadata: serde_json::Value,
    ) -> Result<RunId> {
        let mut seen = HashSet::with_capacity(entities.len());
        let members: Vec<EntityId> = entities
            .iter()
            .copied()
            .filter(|entity| seen.insert(*entity))
            .collect();

        if members.is_empty() {
            return Err(crate::Error::Validation(
                "a pipeline run needs at least one entity".to_string(),
            ));
        }

        let epoch = self.control.epoch().await?;
        let run = self
            .store
            .create_run(&members, metadata)
            .await
            .map_err(map_storage_error)?;
        let run_id = run.run_id();

        self.control
            .enqueue(DispatchUnit::Seed {
                run_id,
                mode: ResumeMode::PendingOnly,
                epoch,
            })
            .await
            .inspect_err(|e| warn!(run_id = %run_id, error = %e, "Run created but not seeded"))?;

        info!(run_id = %run_id, entities = members.len(), "Pipeline run started");
        Ok(run_id)
    }

    /// Status of a run with per-entity stage progress
    ///
    /// # Errors
    ///
    /// `NotFound` if the run does not exist
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn get_run_status(&self, run_id: RunId) -> Result<RunStatusReport> {
        let run = self.load_run(run_id).await?;
        let checkpoints = self
            .store
            .list_checkpoints(run_id)
            .await
            .map_err(map_storage_error)?;

        RunStatusReport::build(&run, &checkpoints).map_err(map_storage_error)
    }

    /// Most recently started runs first
    pub async fn list_runs(&self, limit: i64) -> Result<Vec<PipelineRunModel>> {
        self.store.list_runs(limit).await.map_err(map_storage_error)
    }

    /// Hard-stop the pipeline
    ///
    /// Discards every queued unit and every dependency lock and bumps the
    /// control-plane epoch, so units already picked up by a worker are
    /// abandoned. In-flight executor calls are not waited for. Runs stay
    /// `running`; call [`resume_run`](Self::resume_run) to continue them.
    #[instrument(skip(self))]
    pub async fn stop_pipeline(&self) -> Result<HardStopReport> {
        let report = self.control.hard_stop().await?;
        HARD_STOPS_TOTAL.inc();

        warn!(
            units_discarded = report.units_discarded,
            locks_cleared = report.locks_cleared,
            epoch = report.epoch,
            "Pipeline hard-stopped"
        );
        Ok(report)
    }

    /// Resume a run from its checkpoints
    ///
    /// Re-seeds the next stage of every incomplete entity. When nothing is
    /// incomplete the run is finalized instead. Safe to call repeatedly:
    /// duplicate stage units are dropped by the dispatcher.
    ///
    /// # Arguments
    ///
    /// * `run_id` - Run to resume
    /// * `mode` - Whether stalled entities get their failed stage re-run
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The run does not exist (`NotFound`)
    /// - The run already has a terminal status (`InvalidState`)
    #[instrument(skip(self), fields(run_id = %run_id, mode = ?mode))]
    pub async fn resume_run(&self, run_id: RunId, mode: ResumeMode) -> Result<ResumeReport> {
        let run = self.load_run(run_id).await?;
        let status = run.run_status().map_err(map_storage_error)?;
        if status.is_terminal() {
            return Err(crate::Error::InvalidState(format!(
                "run {} is already {}",
                run_id, status
            )));
        }

        let epoch = self.control.epoch().await?;
        let report = self.seed_run(&run, mode, epoch).await?;

        info!(
            seeded = report.seeded.len(),
            stalled_skipped = report.stalled_skipped,
            finalized = ?report.finalized,
            "Run resumed"
        );
        Ok(report)
    }

    /// Handle a seeding unit: enqueue the next stage of every incomplete
    /// entity of the run, under `epoch`.
    ///
    /// A unit from before the last hard stop, or for a run that is gone or
    /// already terminal, seeds nothing.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn seed(&self, run_id: RunId, mode: ResumeMode, epoch: u64) -> Result<ResumeReport> {
        if self.control.epoch().await? > epoch {
            debug!("Stale seeding unit");
            return Ok(ResumeReport::new(run_id, mode));
        }

        let run = match self.store.get_run(run_id).await {
            Ok(run) => run,
            Err(waypoint_storage::Error::NotFound(_)) => {
                warn!("Seeding unit for a missing run");
                return Ok(ResumeReport::new(run_id, mode));
            }
            Err(e) => return Err(map_storage_error(e)),
        };
        if run.run_status().map_err(map_storage_error)?.is_terminal() {
            return Ok(ResumeReport::new(run_id, mode));
        }

        self.seed_run(&run, mode, epoch).await
    }

    async fn seed_run(
        &self,
        run: &PipelineRunModel,
        mode: ResumeMode,
        epoch: u64,
    ) -> Result<ResumeReport> {
        let run_id = run.run_id();
        let mut report = ResumeReport::new(run_id, mode);

        let incomplete = self
            .store
            .list_incomplete(run_id, &run.entities())
            .await
            .map_err(map_storage_error)?;

        for entity in incomplete {
            let retry = match (entity.stalled, mode) {
                (false, _) => false,
                (true, ResumeMode::PendingOnly) => {
                    report.stalled_skipped += 1;
                    continue;
                }
                (true, ResumeMode::RetryFailed) => self
                    .store
                    .request_retry(run_id, entity.entity_id, entity.next_stage)
                    .await
                    .map_err(map_storage_error)?
                    .is_some(),
            };

            let unit = if retry {
                DispatchUnit::retry(run_id, entity.entity_id, entity.next_stage, epoch)
            } else {
                DispatchUnit::stage(run_id, entity.entity_id, entity.next_stage, epoch)
            };
            self.control.enqueue(unit).await?;
            report.seeded.push(SeededUnit {
                entity_id: entity.entity_id,
                stage: entity.next_stage,
                retry,
            });
        }

        if report.seeded.is_empty() {
            report.finalized = self.check_finalization(run_id).await?;
        }
        Ok(report)
    }

    /// Finalize the run if every member is done or stalled
    ///
    /// Returns the terminal status when the run is (or already was)
    /// finalized, `None` while some entity still has a stage to go or a
    /// requested retry has not run yet. Concurrent callers agree on the
    /// status, so racing finalizers are harmless.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn check_finalization(&self, run_id: RunId) -> Result<Option<RunStatus>> {
        let run = match self.store.get_run(run_id).await {
            Ok(run) => run,
            Err(waypoint_storage::Error::NotFound(_)) => return Ok(None),
            Err(e) => return Err(map_storage_error(e)),
        };
        let current = run.run_status().map_err(map_storage_error)?;
        if current.is_terminal() {
            return Ok(Some(current));
        }

        let checkpoints = self
            .store
            .list_checkpoints(run_id)
            .await
            .map_err(map_storage_error)?;
        let progress = entity_progress(&run.entities(), &checkpoints).map_err(map_storage_error)?;
        let summary = summarize(&progress);

        let Some(status) = summary.final_status() else {
            debug!(in_progress = summary.in_progress, "Run not settled yet");
            return Ok(None);
        };

        match self.store.complete_run(run_id, status).await {
            Ok(_) => {}
            Err(waypoint_storage::Error::PendingRetry(msg)) => {
                // A retry was requested after the checkpoints were read
                debug!(reason = %msg, "Finalization deferred to pending retry");
                return Ok(None);
            }
            Err(e) => return Err(map_storage_error(e)),
        }
        RUNS_FINALIZED_TOTAL
            .with_label_values(&[status.as_str()])
            .inc();

        info!(
            status = %status,
            completed = summary.completed,
            stalled = summary.stalled,
            "Run finalized"
        );
        Ok(Some(status))
    }

    /// Aggregated audit counters of a run
    ///
    /// # Arguments
    ///
    /// * `top_n` - How many entities to list in `top`
    ///
    /// # Errors
    ///
    /// `NotFound` if the run does not exist
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn tracking_summary(&self, run_id: RunId, top_n: usize) -> Result<TrackingSummary> {
        self.load_run(run_id).await?;
        let records = self
            .store
            .list_tracking(run_id)
            .await
            .map_err(map_storage_error)?;

        Ok(TrackingSummary::build(run_id, &records, top_n))
    }

    /// Counters reported for one entity of a run
    ///
    /// # Errors
    ///
    /// `NotFound` if the run does not exist or nothing was reported for the
    /// entity yet
    #[instrument(skip(self), fields(run_id = %run_id, entity_id = %entity_id))]
    pub async fn entity_tracking(
        &self,
        run_id: RunId,
        entity_id: EntityId,
    ) -> Result<EntityTracking> {
        self.load_run(run_id).await?;
        let record = self
            .store
            .get_tracking(run_id, entity_id)
            .await
            .map_err(map_storage_error)?
            .ok_or_else(|| {
                crate::Error::NotFound(format!(
                    "no tracking data for entity {} in run {}",
                    entity_id, run_id
                ))
            })?;

        Ok(EntityTracking::from_record(&record))
    }

    /// Entities of a run whose every reported counter is zero
    pub async fn empty_entities(&self, run_id: RunId) -> Result<Vec<EntityId>> {
        Ok(self.tracking_summary(run_id, 0).await?.empty)
    }

    /// Units waiting in every pipeline queue
    pub async fn queue_depths(&self) -> Result<BTreeMap<String, u64>> {
        let mut depths = BTreeMap::new();
        for queue in all_queues() {
            let depth = self.control.queue_depth(&queue).await?;
            depths.insert(queue, depth);
        }
        Ok(depths)
    }

    async fn load_run(&self, run_id: RunId) -> Result<PipelineRunModel> {
        self.store.get_run(run_id).await.map_err(map_storage_error)
    }
}
