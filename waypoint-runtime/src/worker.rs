//! Worker pool consuming dispatch units
//!
//! One group of consumer tasks per stage queue, sized by
//! [`ConcurrencyConfig`], plus a group on the orchestration queue for
//! seeding and finalization units.
//!
//! While a unit is being handled its consumer also watches the control-plane
//! epoch; when a hard stop bumps it, the handler future is dropped on the
//! spot (including an in-flight executor call) and the unit is abandoned.
//!
//! Units that hit a retryable infrastructure error are put back on their
//! queue marked as redelivered; units deferred on a busy dependency are put
//! back unchanged.

use crate::concurrency::ConcurrencyConfig;
use crate::control_plane::{ControlPlane, DispatchUnit, ORCHESTRATION_QUEUE};
use crate::dispatcher::{DispatchOutcome, Dispatcher, DropReason};
use crate::metrics::{DISPATCH_UNITS_DROPPED_TOTAL, DISPATCH_UNITS_REQUEUED_TOTAL};
use crate::orchestrator::PipelineOrchestrator;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};
use waypoint_core::Stage;

/// Worker pool tuning
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub concurrency: ConcurrencyConfig,

    /// Longest a consumer blocks on an empty queue before re-checking for
    /// shutdown
    pub poll_interval: Duration,

    /// Pause before putting back a unit that hit an infrastructure error
    pub redelivery_backoff: Duration,

    /// How often an in-flight unit checks for a hard stop
    pub fence_check_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: ConcurrencyConfig::default(),
            poll_interval: Duration::from_millis(500),
            redelivery_backoff: Duration::from_secs(1),
            fence_check_interval: Duration::from_secs(1),
        }
    }
}

/// Running consumer tasks
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

enum Handled {
    Done,
    Requeue,
}

impl WorkerPool {
    /// Spawn every consumer on the current tokio runtime
    pub fn spawn(
        dispatcher: Dispatcher,
        orchestrator: PipelineOrchestrator,
        config: WorkerPoolConfig,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let config = Arc::new(config);
        let mut handles = Vec::new();

        let mut assignments: Vec<(String, usize)> = Stage::all()
            .iter()
            .map(|stage| {
                (
                    stage.descriptor().queue_name(),
                    config.concurrency.for_stage(*stage),
                )
            })
            .collect();
        assignments.push((
            ORCHESTRATION_QUEUE.to_string(),
            config.concurrency.orchestration,
        ));

        for (queue, consumers) in assignments {
            for index in 0..consumers {
                let consumer = Consumer {
                    worker_id: format!("{}#{}", queue, index),
                    queue: queue.clone(),
                    dispatcher: dispatcher.clone(),
                    orchestrator: orchestrator.clone(),
                    control: orchestrator.control().clone(),
                    config: config.clone(),
                    shutdown: shutdown_rx.clone(),
                };
                handles.push(tokio::spawn(consumer.run()));
            }
        }

        info!(consumers = handles.len(), "Worker pool started");
        Self { shutdown, handles }
    }

    pub fn consumer_count(&self) -> usize {
        self.handles.len()
    }

    /// Stop polling, let every consumer finish the unit it holds, and wait
    /// for all of them
    pub async fn shutdown(self) {
        // Receivers are held by the consumers; a send error means they are all gone
        let _ = self.shutdown.send(true);
        for result in futures::future::join_all(self.handles).await {
            if let Err(e) = result {
                error!(error = %e, "Consumer task panicked");
            }
        }
        info!("Worker pool stopped");
    }
}

struct Consumer {
    worker_id: String,
    queue: String,
    dispatcher: Dispatcher,
    orchestrator: PipelineOrchestrator,
    control: Arc<dyn ControlPlane>,
    config: Arc<WorkerPoolConfig>,
    shutdown: watch::Receiver<bool>,
}

impl Consumer {
    async fn run(self) {
        debug!(worker_id = %self.worker_id, "Consumer started");

        while !*self.shutdown.borrow() {
            let unit = match self
                .control
                .dequeue(&self.queue, self.config.poll_interval)
                .await
            {
                Ok(Some(unit)) => unit,
                Ok(None) => continue,
                Err(e) => {
                    warn!(worker_id = %self.worker_id, error = %e, "Dequeue failed");
                    tokio::time::sleep(self.config.redelivery_backoff).await;
                    continue;
                }
            };

            let span = tracing::info_span!(
                "dispatch",
                worker_id = %self.worker_id,
                run_id = %unit.run_id(),
                epoch = unit.epoch(),
            );
            self.handle(unit).instrument(span).await;
        }

        debug!(worker_id = %self.worker_id, "Consumer stopped");
    }

    async fn handle(&self, unit: DispatchUnit) {
        let epoch = unit.epoch();

        let result = tokio::select! {
            result = self.execute(&unit) => Some(result),
            _ = self.wait_for_fence(epoch) => None,
        };

        match result {
            None => {
                DISPATCH_UNITS_DROPPED_TOTAL
                    .with_label_values(&[DropReason::StaleEpoch.as_str()])
                    .inc();
                warn!("Hard stop while handling unit, abandoned");
            }
            Some(Ok(Handled::Done)) => {}
            Some(Ok(Handled::Requeue)) => self.requeue(unit).await,
            Some(Err(e)) if e.is_retryable() => {
                warn!(error = %e, "Infrastructure error, redelivering unit");
                tokio::time::sleep(self.config.redelivery_backoff).await;
                self.requeue(unit.redelivered()).await;
            }
            Some(Err(e)) => {
                error!(error = %e, unit = ?unit, "Dispatch unit failed and was dropped");
            }
        }
    }

    async fn execute(&self, unit: &DispatchUnit) -> crate::Result<Handled> {
        match unit {
            DispatchUnit::Stage { .. } => match self.dispatcher.process(unit).await? {
                DispatchOutcome::Deferred => Ok(Handled::Requeue),
                outcome => {
                    debug!(outcome = ?outcome, "Stage unit handled");
                    Ok(Handled::Done)
                }
            },
            DispatchUnit::Seed {
                run_id,
                mode,
                epoch,
            } => {
                let report = self.orchestrator.seed(*run_id, *mode, *epoch).await?;
                debug!(seeded = report.seeded.len(), "Run seeded");
                Ok(Handled::Done)
            }
            DispatchUnit::Finalize { run_id, epoch } => {
                if self.control.epoch().await? > *epoch {
                    DISPATCH_UNITS_DROPPED_TOTAL
                        .with_label_values(&[DropReason::StaleEpoch.as_str()])
                        .inc();
                    return Ok(Handled::Done);
                }
                self.orchestrator.check_finalization(*run_id).await?;
                Ok(Handled::Done)
            }
        }
    }

    /// Resolves once the control-plane epoch moves past `epoch`
    async fn wait_for_fence(&self, epoch: u64) {
        let mut ticker = tokio::time::interval(self.config.fence_check_interval);
        loop {
            ticker.tick().await;
            match self.control.epoch().await {
                Ok(current) if current > epoch => return,
                Ok(_) => {}
                Err(e) => debug!(error = %e, "Epoch check failed"),
            }
        }
    }

    async fn requeue(&self, unit: DispatchUnit) {
        let queue = unit.queue();
        match self.control.enqueue(unit).await {
            Ok(()) => {
                DISPATCH_UNITS_REQUEUED_TOTAL
                    .with_label_values(&[queue.as_str()])
                    .inc();
            }
            Err(e) => {
                error!(
                    queue = %queue,
                    error = %e,
                    "Failed to requeue unit; resume the run to recover it"
                );
            }
        }
    }
}
