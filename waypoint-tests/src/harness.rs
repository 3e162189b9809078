//! In-memory pipeline wired to a worker pool

use crate::mocks::ScriptedExecutor;
use std::sync::Arc;
use std::time::Duration;
use waypoint_core::{RunId, RunStatus};
use waypoint_runtime::{
    ConcurrencyConfig, Dispatcher, DispatcherConfig, MemoryControlPlane, PipelineOrchestrator,
    RetryPolicy, WorkerPool, WorkerPoolConfig,
};
use waypoint_storage::MemoryStore;

/// Store, control plane, scripted executor and orchestrator sharing state,
/// with an optional worker pool consuming the queues
pub struct PipelineHarness {
    pub store: MemoryStore,
    pub control: MemoryControlPlane,
    pub executor: Arc<ScriptedExecutor>,
    pub orchestrator: PipelineOrchestrator,
    pool: Option<WorkerPool>,
}

impl PipelineHarness {
    /// Everything wired up, no consumers running
    pub fn idle() -> Self {
        let store = MemoryStore::new();
        let control = MemoryControlPlane::new();
        let orchestrator =
            PipelineOrchestrator::new(Arc::new(store.clone()), Arc::new(control.clone()));

        Self {
            store,
            control,
            executor: Arc::new(ScriptedExecutor::new()),
            orchestrator,
            pool: None,
        }
    }

    /// Everything wired up with the worker pool running
    pub fn start() -> Self {
        let mut harness = Self::idle();
        harness.start_workers();
        harness
    }

    /// Spawn the worker pool; script the executor before calling this
    pub fn start_workers(&mut self) {
        if self.pool.is_some() {
            return;
        }

        let dispatcher = Dispatcher::new(
            Arc::new(self.store.clone()),
            Arc::new(self.control.clone()),
            self.executor.clone(),
            DispatcherConfig {
                retry: RetryPolicy::immediate(3),
                lock_poll_interval: Duration::from_millis(5),
                ..Default::default()
            },
        );

        self.pool = Some(WorkerPool::spawn(
            dispatcher,
            self.orchestrator.clone(),
            WorkerPoolConfig {
                concurrency: ConcurrencyConfig::default().with_orchestration(2),
                poll_interval: Duration::from_millis(10),
                redelivery_backoff: Duration::from_millis(10),
                fence_check_interval: Duration::from_millis(10),
            },
        ));
    }

    /// Poll until the run has a terminal status
    ///
    /// # Panics
    ///
    /// If the run is still running after ten seconds.
    pub async fn wait_for_terminal(&self, run_id: RunId) -> RunStatus {
        for _ in 0..1000 {
            let status = self
                .orchestrator
                .get_run_status(run_id)
                .await
                .expect("run status")
                .status;
            if status.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run {} did not finish", run_id);
    }

    /// Poll until `condition` holds
    ///
    /// # Panics
    ///
    /// If it does not hold within ten seconds.
    pub async fn wait_until<F>(&self, what: &str, condition: F)
    where
        F: Fn(&Self) -> bool,
    {
        for _ in 0..1000 {
            if condition(self) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    pub async fn shutdown(mut self) {
        if let Some(pool) = self.pool.take() {
            pool.shutdown().await;
        }
    }
}
