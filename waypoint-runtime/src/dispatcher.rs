//! Stage dispatcher
//!
//! The dispatcher is the only place that runs a stage and records its
//! checkpoint. For every stage unit it:
//!
//! 1. drops the unit if it was enqueued before the last hard stop, or its
//!    run is gone or already finalized;
//! 2. rebuilds the entity's state machine from its checkpoints and drops
//!    the unit unless the entity is waiting at exactly this stage;
//! 3. calls the executor, retrying transient errors per the retry policy.
//!    Each call holds the stage's dependency lock (bounded wait, deferred on
//!    timeout); the lock is released before sleeping between attempts;
//! 4. records the checkpoint and audit counts, then enqueues the next stage
//!    or a finalization check.
//!
//! The gate in step 2 makes duplicate deliveries harmless: a second unit for
//! a stage that already has a satisfying checkpoint does nothing, and no
//! stage ever runs before its predecessor is satisfied. A stage whose
//! checkpoint reads `failed` never runs again from a unit alone; a retry is
//! requested by turning the checkpoint into `pending` first, which puts the
//! entity back at the stage.

use crate::concurrency::DependencyGate;
use crate::control_plane::{ControlPlane, DispatchUnit};
use crate::executor::{StageContext, StageError, StageExecutor, StageOutcome, StageReport};
use crate::metrics::{
    CHECKPOINT_WRITES_TOTAL, DISPATCH_UNITS_DROPPED_TOTAL, STAGE_DURATION_SECONDS,
    STAGE_EXECUTIONS_TOTAL,
};
use crate::retry::RetryPolicy;
use crate::{map_storage_error, Result};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use waypoint_core::{
    CheckpointStatus, EntityId, EntityState, EntityStateMachine, RunId, SectionCounts, Stage,
};
use waypoint_storage::{CheckpointModel, PipelineStore};

/// Dispatcher tuning
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Retry policy for transient executor errors
    pub retry: RetryPolicy,

    /// TTL of dependency locks; held locks are renewed while a stage runs
    pub lock_ttl: Duration,

    /// How long to wait for a busy dependency before deferring the unit
    pub lock_wait: Duration,

    /// Poll interval while waiting for a dependency lock
    pub lock_poll_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            lock_ttl: Duration::from_secs(60),
            lock_wait: Duration::from_secs(60),
            lock_poll_interval: Duration::from_millis(100),
        }
    }
}

/// Why a unit was discarded without running its stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Enqueued before the last hard stop
    StaleEpoch,

    /// The run does not exist
    RunMissing,

    /// The run already has a terminal status
    RunTerminal,

    /// The entity row behind the checkpoint is gone
    EntityMissing,

    /// The stage already has a satisfying checkpoint
    AlreadyDone,

    /// The entity is waiting at (or stalled at) a different stage
    NotCurrentStage,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::StaleEpoch => "stale_epoch",
            DropReason::RunMissing => "run_missing",
            DropReason::RunTerminal => "run_terminal",
            DropReason::EntityMissing => "entity_missing",
            DropReason::AlreadyDone => "already_done",
            DropReason::NotCurrentStage => "not_current_stage",
        }
    }
}

/// What processing one stage unit did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Checkpoint recorded; the next stage was enqueued
    Advanced { next: Stage },

    /// Checkpoint recorded for the last stage; finalization was enqueued
    EntityCompleted,

    /// A failed checkpoint was recorded; the entity stops here
    Stalled { error: String },

    /// The dependency lock could not be taken in time; the unit should be
    /// put back on its queue. No checkpoint was written.
    Deferred,

    /// A redelivered unit found its checkpoint already written and enqueued
    /// the follow-up work that had been lost. `None` means finalization.
    Reseeded { next: Option<Stage> },

    /// Nothing was done
    Dropped(DropReason),
}

/// Runs stage units against the checkpoint store
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn PipelineStore>,
    control: Arc<dyn ControlPlane>,
    executor: Arc<dyn StageExecutor>,
    gate: DependencyGate,
    retry: RetryPolicy,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        control: Arc<dyn ControlPlane>,
        executor: Arc<dyn StageExecutor>,
        config: DispatcherConfig,
    ) -> Self {
        let gate = DependencyGate::new(control.clone(), config.lock_ttl, config.lock_wait)
            .with_poll_interval(config.lock_poll_interval);
        Self {
            store,
            control,
            executor,
            gate,
            retry: config.retry,
        }
    }

    /// Process a stage unit. Other unit kinds belong to the orchestrator.
    pub async fn process(&self, unit: &DispatchUnit) -> Result<DispatchOutcome> {
        match unit {
            DispatchUnit::Stage {
                run_id,
                entity_id,
                stage,
                epoch,
                deliveries,
                retry_failed,
            } => {
                self.dispatch_stage(
                    *run_id,
                    *entity_id,
                    *stage,
                    *epoch,
                    *deliveries,
                    *retry_failed,
                )
                .await
            }
            other => Err(crate::Error::Internal(format!(
                "dispatcher cannot process {:?}",
                other
            ))),
        }
    }

    /// Gate, execute and record one stage for one entity, for a unit that
    /// is not a requested retry.
    ///
    /// # Arguments
    ///
    /// * `epoch` - Control-plane epoch the unit was enqueued under
    /// * `deliveries` - How many times the unit was put back after an
    ///   infrastructure error
    ///
    /// # Errors
    ///
    /// Storage and control-plane failures are returned as-is; retryable ones
    /// (see [`crate::Error::is_retryable`]) mean the unit should be
    /// redelivered. Executor failures are never returned: they end up in a
    /// failed checkpoint.
    pub async fn process_stage(
        &self,
        run_id: RunId,
        entity_id: EntityId,
        stage: Stage,
        epoch: u64,
        deliveries: u32,
    ) -> Result<DispatchOutcome> {
        self.dispatch_stage(run_id, entity_id, stage, epoch, deliveries, false)
            .await
    }

    #[instrument(
        skip(self),
        fields(run_id = %run_id, entity_id = %entity_id, stage = %stage)
    )]
    async fn dispatch_stage(
        &self,
        run_id: RunId,
        entity_id: EntityId,
        stage: Stage,
        epoch: u64,
        deliveries: u32,
        retry_failed: bool,
    ) -> Result<DispatchOutcome> {
        if self.is_stale(epoch).await? {
            return Ok(dropped(DropReason::StaleEpoch));
        }

        let run = match self.store.get_run(run_id).await {
            Ok(run) => run,
            Err(waypoint_storage::Error::NotFound(_)) => {
                return Ok(dropped(DropReason::RunMissing));
            }
            Err(e) => return Err(map_storage_error(e)),
        };
        if run.run_status().map_err(map_storage_error)?.is_terminal() {
            return Ok(dropped(DropReason::RunTerminal));
        }

        let (mut machine, checkpoints) = self.load_entity(run_id, entity_id).await?;
        match machine.current_state() {
            // Includes a `pending` checkpoint left by a requested retry
            EntityState::AtStage(current) if current == stage => {}
            EntityState::Failed(current) if current == stage => {
                // The failure is on record; only the follow-up may have been lost
                if retry_failed {
                    info!("Requested retry already ran and failed");
                }
                self.enqueue_finalize(run_id, epoch).await?;
                let error = failure_message(&checkpoints, stage);
                return Ok(DispatchOutcome::Stalled { error });
            }
            _ => {
                return self
                    .handle_out_of_turn(run_id, entity_id, stage, epoch, deliveries, &machine)
                    .await;
            }
        }

        let Some((result, attempts)) = self.execute_with_retry(run_id, entity_id, stage).await?
        else {
            return Ok(DispatchOutcome::Deferred);
        };

        match result {
            Ok(report) => {
                self.record_success(run_id, entity_id, stage, epoch, &mut machine, report, attempts)
                    .await
            }
            Err(err) => {
                self.record_failure(
                    run_id,
                    entity_id,
                    stage,
                    epoch,
                    &mut machine,
                    err,
                    attempts,
                    retry_failed,
                )
                .await
            }
        }
    }

    async fn is_stale(&self, epoch: u64) -> Result<bool> {
        Ok(self.control.epoch().await? > epoch)
    }

    async fn load_entity(
        &self,
        run_id: RunId,
        entity_id: EntityId,
    ) -> Result<(EntityStateMachine, Vec<CheckpointModel>)> {
        let checkpoints = self
            .store
            .list_entity_checkpoints(run_id, entity_id)
            .await
            .map_err(map_storage_error)?;

        let mut ledger = Vec::with_capacity(checkpoints.len());
        for checkpoint in &checkpoints {
            ledger.push((
                checkpoint.stage().map_err(map_storage_error)?,
                checkpoint.checkpoint_status().map_err(map_storage_error)?,
            ));
        }

        Ok((EntityStateMachine::from_checkpoints(ledger), checkpoints))
    }

    /// A unit for a stage the entity is not waiting at.
    ///
    /// Normally a duplicate. A redelivered unit whose checkpoint landed but
    /// whose successor was never enqueued re-enqueues that successor.
    async fn handle_out_of_turn(
        &self,
        run_id: RunId,
        entity_id: EntityId,
        stage: Stage,
        epoch: u64,
        deliveries: u32,
        machine: &EntityStateMachine,
    ) -> Result<DispatchOutcome> {
        let satisfied = machine.status_of(stage).is_some_and(|s| s.is_satisfying());
        if !satisfied {
            debug!(state = %machine.current_state(), "Unit is not for the entity's current stage");
            return Ok(dropped(DropReason::NotCurrentStage));
        }

        let successor_pending = match stage.next() {
            Some(next) => machine.current_state() == EntityState::AtStage(next),
            None => machine.current_state() == EntityState::Completed,
        };
        if deliveries == 0 || !successor_pending {
            return Ok(dropped(DropReason::AlreadyDone));
        }

        info!("Redelivered unit already checkpointed, re-enqueueing follow-up");
        match stage.next() {
            Some(next) => {
                self.control
                    .enqueue(DispatchUnit::stage(run_id, entity_id, next, epoch))
                    .await?;
                Ok(DispatchOutcome::Reseeded { next: Some(next) })
            }
            None => {
                self.enqueue_finalize(run_id, epoch).await?;
                Ok(DispatchOutcome::Reseeded { next: None })
            }
        }
    }

    /// Call the executor until it succeeds, fails terminally or runs out of
    /// attempts. Returns the last result and the number of attempts made, or
    /// `None` when the dependency lock could not be taken for an attempt.
    async fn execute_with_retry(
        &self,
        run_id: RunId,
        entity_id: EntityId,
        stage: Stage,
    ) -> Result<Option<(StageResult, u32)>> {
        let lock = stage.descriptor().lock_name();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let ctx = StageContext {
                run_id,
                entity_id,
                stage,
                attempt,
            };

            let Some(result) = self.execute_once(&ctx, lock.as_deref()).await? else {
                return Ok(None);
            };

            let label = match &result {
                Ok(report) => report.outcome.as_str(),
                Err(e) if e.is_transient() => "transient_error",
                Err(_) => "terminal_error",
            };
            STAGE_EXECUTIONS_TOTAL
                .with_label_values(&[stage.as_str(), label])
                .inc();

            match result {
                Err(err) if err.is_transient() && self.retry.should_retry(attempt) => {
                    let delay = self.retry.calculate_delay(attempt);
                    warn!(
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err.message,
                        "Transient stage failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return Ok(Some((other, attempt))),
            }
        }
    }

    /// One executor call, holding the dependency lock for its duration only
    async fn execute_once(
        &self,
        ctx: &StageContext,
        lock: Option<&str>,
    ) -> Result<Option<StageResult>> {
        let lease = match lock {
            Some(lock) => match self.gate.acquire(lock).await? {
                Some(lease) => Some(lease),
                None => {
                    info!(lock = %lock, attempt = ctx.attempt, "Dependency busy, deferring unit");
                    return Ok(None);
                }
            },
            None => None,
        };

        let timer = STAGE_DURATION_SECONDS
            .with_label_values(&[ctx.stage.as_str()])
            .start_timer();
        let result = match &lease {
            Some(lease) => {
                let result = self.gate.hold(lease, self.executor.execute(ctx)).await;
                self.gate.release(lease).await;
                result
            }
            None => self.executor.execute(ctx).await,
        };
        timer.observe_duration();

        Ok(Some(result))
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_success(
        &self,
        run_id: RunId,
        entity_id: EntityId,
        stage: Stage,
        epoch: u64,
        machine: &mut EntityStateMachine,
        report: StageReport,
        attempts: u32,
    ) -> Result<DispatchOutcome> {
        let status = match report.outcome {
            StageOutcome::Skipped { .. } => CheckpointStatus::Skipped,
            StageOutcome::Completed | StageOutcome::NoData => CheckpointStatus::Completed,
        };
        let next_state = machine.apply(stage, status)?;

        let mut metadata = json!({
            "outcome": report.outcome.as_str(),
            "attempts": attempts,
            "counts": report.counts,
        });
        if let StageOutcome::Skipped { reason } = &report.outcome {
            metadata["reason"] = json!(reason);
        }
        if !report.metadata.is_null() {
            metadata["details"] = report.metadata.clone();
        }

        if let Some(outcome) = self
            .write_checkpoint(run_id, entity_id, stage, status, metadata)
            .await?
        {
            return Ok(outcome);
        }
        self.track_counts(run_id, entity_id, stage, report.counts).await;

        if self.is_stale(epoch).await? {
            warn!("Hard stop during stage, checkpoint kept but not advancing");
            return Ok(dropped(DropReason::StaleEpoch));
        }

        match next_state {
            EntityState::AtStage(next) => {
                self.control
                    .enqueue(DispatchUnit::stage(run_id, entity_id, next, epoch))
                    .await?;
                Ok(DispatchOutcome::Advanced { next })
            }
            EntityState::Completed => {
                info!("Entity finished every stage");
                self.enqueue_finalize(run_id, epoch).await?;
                Ok(DispatchOutcome::EntityCompleted)
            }
            EntityState::Failed(at) => Err(crate::Error::Internal(format!(
                "entity stalled at {} after a satisfying checkpoint for {}",
                at, stage
            ))),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_failure(
        &self,
        run_id: RunId,
        entity_id: EntityId,
        stage: Stage,
        epoch: u64,
        machine: &mut EntityStateMachine,
        err: StageError,
        attempts: u32,
        retry_failed: bool,
    ) -> Result<DispatchOutcome> {
        machine.apply(stage, CheckpointStatus::Failed)?;
        warn!(attempts, kind = ?err.kind, error = %err.message, "Stage failed");

        let metadata = json!({
            "error": err.message,
            "kind": err.kind,
            "attempts": attempts,
            "retry": retry_failed,
        });
        if let Some(outcome) = self
            .write_checkpoint(run_id, entity_id, stage, CheckpointStatus::Failed, metadata)
            .await?
        {
            return Ok(outcome);
        }

        if self.is_stale(epoch).await? {
            return Ok(dropped(DropReason::StaleEpoch));
        }
        self.enqueue_finalize(run_id, epoch).await?;

        Ok(DispatchOutcome::Stalled { error: err.message })
    }

    /// Persist a checkpoint. Returns an outcome only when the unit has to be
    /// abandoned because the run or entity disappeared underneath it.
    async fn write_checkpoint(
        &self,
        run_id: RunId,
        entity_id: EntityId,
        stage: Stage,
        status: CheckpointStatus,
        metadata: serde_json::Value,
    ) -> Result<Option<DispatchOutcome>> {
        match self
            .store
            .record_checkpoint(run_id, entity_id, stage, status, metadata)
            .await
        {
            Ok(_) => {
                CHECKPOINT_WRITES_TOTAL
                    .with_label_values(&[stage.as_str(), status.as_str()])
                    .inc();
                Ok(None)
            }
            Err(waypoint_storage::Error::NotFound(msg)) => {
                warn!(error = %msg, "Checkpoint target disappeared");
                Ok(Some(dropped(DropReason::EntityMissing)))
            }
            Err(e) => Err(map_storage_error(e)),
        }
    }

    /// Record the sections this stage owns. Counters are audit data, so a
    /// failure here is logged and never fails the stage.
    async fn track_counts(
        &self,
        run_id: RunId,
        entity_id: EntityId,
        stage: Stage,
        counts: SectionCounts,
    ) {
        let (owned, foreign) = counts.partition_by_owner(stage);
        if !foreign.is_empty() {
            let sections: Vec<&str> = foreign.iter().map(|s| s.as_str()).collect();
            warn!(?sections, "Stage reported counts for sections it does not own");
        }
        if owned.is_empty() {
            return;
        }

        let metadata = json!({
            stage.as_str(): { "recorded_at": Utc::now().to_rfc3339() }
        });
        if let Err(e) = self
            .store
            .record_counts(run_id, entity_id, &owned, metadata)
            .await
        {
            warn!(error = %e, "Failed to record section counts");
        }
    }

    async fn enqueue_finalize(&self, run_id: RunId, epoch: u64) -> Result<()> {
        self.control
            .enqueue(DispatchUnit::Finalize { run_id, epoch })
            .await
    }
}

type StageResult = std::result::Result<StageReport, StageError>;

fn dropped(reason: DropReason) -> DispatchOutcome {
    DISPATCH_UNITS_DROPPED_TOTAL
        .with_label_values(&[reason.as_str()])
        .inc();
    debug!(reason = reason.as_str(), "Dropping dispatch unit");
    DispatchOutcome::Dropped(reason)
}

fn failure_message(checkpoints: &[CheckpointModel], stage: Stage) -> String {
    checkpoints
        .iter()
        .find(|c| c.stage_name == stage.as_str())
        .and_then(|c| c.error_message())
        .unwrap_or("stage failed")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane::MemoryControlPlane;
    use crate::retry::RetryStrategy;
    use crate::ORCHESTRATION_QUEUE;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use waypoint_core::Section;
    use waypoint_storage::{CheckpointStore, DataTrackingStore, MemoryStore, RunRegistry};

    /// Executor returning queued results per stage, `completed` once empty
    #[derive(Default)]
    struct Scripted {
        script: Mutex<HashMap<Stage, Vec<std::result::Result<StageReport, StageError>>>>,
        calls: Mutex<Vec<StageContext>>,
    }

    impl Scripted {
        fn push(&self, stage: Stage, result: std::result::Result<StageReport, StageError>) {
            self.script
                .lock()
                .unwrap()
                .entry(stage)
                .or_default()
                .push(result);
        }

        fn calls(&self) -> Vec<StageContext> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StageExecutor for Scripted {
        async fn execute(&self, ctx: &StageContext) -> std::result::Result<StageReport, StageError> {
            self.calls.lock().unwrap().push(*ctx);
            let mut script = self.script.lock().unwrap();
            match script.get_mut(&ctx.stage) {
                Some(queue) if !queue.is_empty() => queue.remove(0),
                _ => Ok(StageReport::completed()),
            }
        }
    }

    struct Fixture {
        store: MemoryStore,
        control: MemoryControlPlane,
        executor: Arc<Scripted>,
        dispatcher: Dispatcher,
        run_id: RunId,
    }

    async fn fixture(entities: &[i64]) -> Fixture {
        let store = MemoryStore::new();
        let control = MemoryControlPlane::new();
        let executor = Arc::new(Scripted::default());
        let config = DispatcherConfig {
            retry: RetryPolicy::immediate(3),
            lock_ttl: Duration::from_secs(5),
            lock_wait: Duration::from_millis(20),
            lock_poll_interval: Duration::from_millis(5),
        };
        let dispatcher = Dispatcher::new(
            Arc::new(store.clone()),
            Arc::new(control.clone()),
            executor.clone(),
            config,
        );
        let ids: Vec<EntityId> = entities.iter().copied().map(EntityId).collect();
        let run = store.create_run(&ids, json!({})).await.unwrap();

        Fixture {
            store,
            control,
            executor,
            dispatcher,
            run_id: run.run_id(),
        }
    }

    async fn satisfy_through(f: &Fixture, entity: i64, last: Stage) {
        for stage in Stage::all().iter().take(last.index() + 1) {
            f.store
                .record_checkpoint(
                    f.run_id,
                    EntityId(entity),
                    *stage,
                    CheckpointStatus::Completed,
                    json!({}),
                )
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_completes_stage_and_enqueues_successor() {
        let f = fixture(&[1]).await;
        f.executor.push(
            Stage::Metadata,
            Ok(StageReport::completed().with_metadata(json!({"source": "places"}))),
        );
        let outcome = f
            .dispatcher
            .process_stage(f.run_id, EntityId(1), Stage::Metadata, 0, 0)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            DispatchOutcome::Advanced {
                next: Stage::HeroImages
            }
        );
        let checkpoint = f
            .store
            .get_checkpoint(f.run_id, EntityId(1), Stage::Metadata)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(checkpoint.status, "completed");
        assert_eq!(checkpoint.metadata.0["details"]["source"], "places");
        assert_eq!(f.control.peek("stage:hero_images").len(), 1);
    }

    #[tokio::test]
    async fn test_refuses_stage_before_predecessor() {
        let f = fixture(&[1]).await;
        let outcome = f
            .dispatcher
            .process_stage(f.run_id, EntityId(1), Stage::Weather, 0, 0)
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::Dropped(DropReason::NotCurrentStage));
        assert!(f.executor.calls().is_empty());
        assert!(f
            .store
            .get_checkpoint(f.run_id, EntityId(1), Stage::Weather)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_duplicate_unit_is_a_no_op() {
        let f = fixture(&[1]).await;
        satisfy_through(&f, 1, Stage::Metadata).await;

        let outcome = f
            .dispatcher
            .process_stage(f.run_id, EntityId(1), Stage::Metadata, 0, 0)
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::Dropped(DropReason::AlreadyDone));
        assert!(f.executor.calls().is_empty());
        assert!(f.control.peek("stage:hero_images").is_empty());
    }

    #[tokio::test]
    async fn test_redelivered_unit_reseeds_lost_successor() {
        let f = fixture(&[1]).await;
        satisfy_through(&f, 1, Stage::BestTime).await;

        let outcome = f
            .dispatcher
            .process_stage(f.run_id, EntityId(1), Stage::BestTime, 0, 1)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            DispatchOutcome::Reseeded {
                next: Some(Stage::Weather)
            }
        );
        assert!(f.executor.calls().is_empty());
        assert_eq!(f.control.peek("stage:weather").len(), 1);
    }

    #[tokio::test]
    async fn test_last_stage_enqueues_finalize() {
        let f = fixture(&[1]).await;
        satisfy_through(&f, 1, Stage::Nearby).await;

        let outcome = f
            .dispatcher
            .process_stage(f.run_id, EntityId(1), Stage::Audiences, 0, 0)
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::EntityCompleted);
        assert_eq!(
            f.control.peek(ORCHESTRATION_QUEUE),
            vec![DispatchUnit::Finalize {
                run_id: f.run_id,
                epoch: 0
            }]
        );
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let f = fixture(&[1]).await;
        f.executor
            .push(Stage::Metadata, Err(StageError::transient("timeout")));
        f.executor
            .push(Stage::Metadata, Err(StageError::transient("timeout")));

        let outcome = f
            .dispatcher
            .process_stage(f.run_id, EntityId(1), Stage::Metadata, 0, 0)
            .await
            .unwrap();

        assert!(matches!(outcome, DispatchOutcome::Advanced { .. }));
        let attempts: Vec<u32> = f.executor.calls().iter().map(|c| c.attempt).collect();
        assert_eq!(attempts, vec![1, 2, 3]);

        let checkpoint = f
            .store
            .get_checkpoint(f.run_id, EntityId(1), Stage::Metadata)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(checkpoint.metadata.0["attempts"], 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_record_failure() {
        let f = fixture(&[1]).await;
        for _ in 0..3 {
            f.executor
                .push(Stage::Metadata, Err(StageError::transient("503 from provider")));
        }

        let outcome = f
            .dispatcher
            .process_stage(f.run_id, EntityId(1), Stage::Metadata, 0, 0)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            DispatchOutcome::Stalled {
                error: "503 from provider".to_string()
            }
        );
        let checkpoint = f
            .store
            .get_checkpoint(f.run_id, EntityId(1), Stage::Metadata)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(checkpoint.checkpoint_status().unwrap(), CheckpointStatus::Failed);
        assert_eq!(checkpoint.error_message(), Some("503 from provider"));
        assert!(f.control.peek("stage:hero_images").is_empty());
        assert_eq!(f.control.peek(ORCHESTRATION_QUEUE).len(), 1);
    }

    #[tokio::test]
    async fn test_terminal_error_is_not_retried() {
        let f = fixture(&[1]).await;
        f.executor
            .push(Stage::Metadata, Err(StageError::terminal("bad place id")));

        let outcome = f
            .dispatcher
            .process_stage(f.run_id, EntityId(1), Stage::Metadata, 0, 0)
            .await
            .unwrap();

        assert!(matches!(outcome, DispatchOutcome::Stalled { .. }));
        assert_eq!(f.executor.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_unit_after_failure_does_not_rerun_stage() {
        let f = fixture(&[1]).await;
        f.executor
            .push(Stage::Metadata, Err(StageError::terminal("bad place id")));
        f.dispatcher
            .process_stage(f.run_id, EntityId(1), Stage::Metadata, 0, 0)
            .await
            .unwrap();

        // A second fresh unit, e.g. from a pending-only resume racing the first
        let outcome = f
            .dispatcher
            .process_stage(f.run_id, EntityId(1), Stage::Metadata, 0, 0)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            DispatchOutcome::Stalled {
                error: "bad place id".to_string()
            }
        );
        assert_eq!(f.executor.calls().len(), 1);
        assert!(f.control.peek("stage:hero_images").is_empty());
    }

    #[tokio::test]
    async fn test_requested_retry_reruns_failed_stage() {
        let f = fixture(&[1]).await;
        f.executor
            .push(Stage::Metadata, Err(StageError::terminal("bad place id")));
        f.dispatcher
            .process_stage(f.run_id, EntityId(1), Stage::Metadata, 0, 0)
            .await
            .unwrap();

        f.store
            .request_retry(f.run_id, EntityId(1), Stage::Metadata)
            .await
            .unwrap()
            .unwrap();
        let outcome = f
            .dispatcher
            .process(&DispatchUnit::retry(f.run_id, EntityId(1), Stage::Metadata, 0))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            DispatchOutcome::Advanced {
                next: Stage::HeroImages
            }
        );
        assert!(f
            .store
            .has_completed(f.run_id, EntityId(1), Stage::Metadata)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_requested_retry_survives_redelivery() {
        let f = fixture(&[1]).await;
        f.executor
            .push(Stage::Metadata, Err(StageError::terminal("bad place id")));
        f.dispatcher
            .process_stage(f.run_id, EntityId(1), Stage::Metadata, 0, 0)
            .await
            .unwrap();
        f.store
            .request_retry(f.run_id, EntityId(1), Stage::Metadata)
            .await
            .unwrap()
            .unwrap();

        let unit = DispatchUnit::retry(f.run_id, EntityId(1), Stage::Metadata, 0);
        f.store.set_unavailable(true);
        let err = f.dispatcher.process(&unit).await.unwrap_err();
        assert!(err.is_retryable());
        f.store.set_unavailable(false);

        let outcome = f.dispatcher.process(&unit.redelivered()).await.unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Advanced {
                next: Stage::HeroImages
            }
        );
        assert_eq!(f.executor.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_retry_is_marked_and_not_repeated() {
        let f = fixture(&[1]).await;
        f.executor
            .push(Stage::Metadata, Err(StageError::terminal("bad place id")));
        f.executor
            .push(Stage::Metadata, Err(StageError::terminal("still bad")));
        f.dispatcher
            .process_stage(f.run_id, EntityId(1), Stage::Metadata, 0, 0)
            .await
            .unwrap();
        f.store
            .request_retry(f.run_id, EntityId(1), Stage::Metadata)
            .await
            .unwrap()
            .unwrap();

        let unit = DispatchUnit::retry(f.run_id, EntityId(1), Stage::Metadata, 0);
        let outcome = f.dispatcher.process(&unit).await.unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Stalled {
                error: "still bad".to_string()
            }
        );
        let checkpoint = f
            .store
            .get_checkpoint(f.run_id, EntityId(1), Stage::Metadata)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(checkpoint.metadata.0["retry"], true);

        // A redelivered copy of the retry does not run the stage a third time
        let again = f.dispatcher.process(&unit.redelivered()).await.unwrap();
        assert!(matches!(again, DispatchOutcome::Stalled { .. }));
        assert_eq!(f.executor.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_skipped_outcome_advances_with_skipped_checkpoint() {
        let f = fixture(&[1]).await;
        satisfy_through(&f, 1, Stage::Map).await;
        f.executor
            .push(Stage::Reviews, Ok(StageReport::skipped("quota exhausted")));

        let outcome = f
            .dispatcher
            .process_stage(f.run_id, EntityId(1), Stage::Reviews, 0, 0)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            DispatchOutcome::Advanced {
                next: Stage::SocialVideos
            }
        );
        let checkpoint = f
            .store
            .get_checkpoint(f.run_id, EntityId(1), Stage::Reviews)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(checkpoint.checkpoint_status().unwrap(), CheckpointStatus::Skipped);
        assert_eq!(checkpoint.metadata.0["reason"], "quota exhausted");
    }

    #[tokio::test]
    async fn test_only_owned_counts_are_tracked() {
        let f = fixture(&[1]).await;
        satisfy_through(&f, 1, Stage::Metadata).await;
        f.executor.push(
            Stage::HeroImages,
            Ok(StageReport::completed().with_counts(
                SectionCounts::new()
                    .with(Section::HeroImages, 6)
                    .with(Section::Reviews, 40),
            )),
        );

        f.dispatcher
            .process_stage(f.run_id, EntityId(1), Stage::HeroImages, 0, 0)
            .await
            .unwrap();

        let tracking = f
            .store
            .get_tracking(f.run_id, EntityId(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tracking.count(Section::HeroImages), Some(6));
        assert_eq!(tracking.count(Section::Reviews), None);
    }

    #[tokio::test]
    async fn test_stale_epoch_is_dropped() {
        let f = fixture(&[1]).await;
        f.control.hard_stop().await.unwrap();

        let outcome = f
            .dispatcher
            .process_stage(f.run_id, EntityId(1), Stage::Metadata, 0, 0)
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::Dropped(DropReason::StaleEpoch));
        assert!(f.executor.calls().is_empty());
    }

    #[tokio::test]
    async fn test_terminal_run_is_dropped() {
        let f = fixture(&[1]).await;
        f.store
            .complete_run(f.run_id, waypoint_core::RunStatus::PartialFailure)
            .await
            .unwrap();

        let outcome = f
            .dispatcher
            .process_stage(f.run_id, EntityId(1), Stage::Metadata, 0, 0)
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Dropped(DropReason::RunTerminal));

        let missing = f
            .dispatcher
            .process_stage(RunId::new(), EntityId(1), Stage::Metadata, 0, 0)
            .await
            .unwrap();
        assert_eq!(missing, DispatchOutcome::Dropped(DropReason::RunMissing));
    }

    #[tokio::test]
    async fn test_busy_dependency_defers() {
        let f = fixture(&[1]).await;
        let _held = f
            .control
            .acquire_lock("dependency:gemini", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        let outcome = f
            .dispatcher
            .process_stage(f.run_id, EntityId(1), Stage::Metadata, 0, 0)
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::Deferred);
        assert!(f.executor.calls().is_empty());
    }

    #[tokio::test]
    async fn test_dependency_lock_is_released_between_attempts() {
        let store = MemoryStore::new();
        let control = MemoryControlPlane::new();
        let executor = Arc::new(Scripted::default());
        executor.push(Stage::Metadata, Err(StageError::transient("429 from provider")));
        let dispatcher = Dispatcher::new(
            Arc::new(store.clone()),
            Arc::new(control.clone()),
            executor.clone(),
            DispatcherConfig {
                retry: RetryPolicy {
                    max_attempts: 2,
                    initial_delay: Duration::from_millis(300),
                    strategy: RetryStrategy::Fixed,
                    ..Default::default()
                },
                lock_ttl: Duration::from_secs(5),
                lock_wait: Duration::from_secs(2),
                lock_poll_interval: Duration::from_millis(5),
            },
        );
        let run_id = store.create_run(&[EntityId(1)], json!({})).await.unwrap().run_id();

        let task = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move {
                dispatcher
                    .process_stage(run_id, EntityId(1), Stage::Metadata, 0, 0)
                    .await
            }
        });
        for _ in 0..100 {
            if !executor.calls().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Backing off after the first attempt: another entity can use the dependency
        let lease = control
            .acquire_lock("dependency:gemini", Duration::from_secs(1))
            .await
            .unwrap()
            .expect("lock free during backoff");
        control.release_lock(&lease).await.unwrap();

        let outcome = task.await.unwrap().unwrap();
        assert!(matches!(outcome, DispatchOutcome::Advanced { .. }));
        assert_eq!(executor.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_storage_outage_is_retryable() {
        let f = fixture(&[1]).await;
        f.store.set_unavailable(true);

        let err = f
            .dispatcher
            .process_stage(f.run_id, EntityId(1), Stage::Metadata, 0, 0)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
