//! Mock implementations of the stage executor

use crate::fixtures::completed_report;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use waypoint_core::{EntityId, RunId, Stage};
use waypoint_runtime::{StageContext, StageError, StageExecutor, StageReport};

type Key = (EntityId, Stage);

/// Stage executor with scripted per-(entity, stage) results
///
/// Scripted results are consumed in order; once a script runs dry (or when
/// none was given) the executor answers with
/// [`completed_report`](crate::fixtures::completed_report). Every call is
/// recorded before its result is produced, so a call abandoned by a hard stop
/// still shows up in [`invocations`](Self::invocations).
#[derive(Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<Key, VecDeque<Result<StageReport, StageError>>>>,
    delays: Mutex<HashMap<Key, Duration>>,
    invocations: Mutex<Vec<StageContext>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a result for the next call of `stage` for `entity`
    pub fn script(
        &self,
        entity: EntityId,
        stage: Stage,
        result: Result<StageReport, StageError>,
    ) -> &Self {
        self.scripts
            .lock()
            .unwrap()
            .entry((entity, stage))
            .or_default()
            .push_back(result);
        self
    }

    /// Queue a terminal failure
    pub fn fail(&self, entity: EntityId, stage: Stage, message: &str) -> &Self {
        self.script(entity, stage, Err(StageError::terminal(message)))
    }

    /// Queue `times` transient failures
    pub fn flaky(&self, entity: EntityId, stage: Stage, times: usize) -> &Self {
        for _ in 0..times {
            self.script(entity, stage, Err(StageError::transient("provider throttled")));
        }
        self
    }

    /// Make every call of `stage` for `entity` take `delay`
    pub fn delay(&self, entity: EntityId, stage: Stage, delay: Duration) -> &Self {
        self.delays.lock().unwrap().insert((entity, stage), delay);
        self
    }

    pub fn invocations(&self) -> Vec<StageContext> {
        self.invocations.lock().unwrap().clone()
    }

    /// Stages invoked for one entity of one run, in call order
    pub fn stages_invoked(&self, run_id: RunId, entity: EntityId) -> Vec<Stage> {
        self.invocations
            .lock()
            .unwrap()
            .iter()
            .filter(|ctx| ctx.run_id == run_id && ctx.entity_id == entity)
            .map(|ctx| ctx.stage)
            .collect()
    }

    pub fn invocation_count(&self, run_id: RunId) -> usize {
        self.invocations
            .lock()
            .unwrap()
            .iter()
            .filter(|ctx| ctx.run_id == run_id)
            .count()
    }
}

#[async_trait]
impl StageExecutor for ScriptedExecutor {
    async fn execute(&self, ctx: &StageContext) -> Result<StageReport, StageError> {
        self.invocations.lock().unwrap().push(*ctx);

        let key = (ctx.entity_id, ctx.stage);
        let delay = self.delays.lock().unwrap().get(&key).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(VecDeque::pop_front);
        scripted.unwrap_or_else(|| Ok(completed_report(ctx.stage)))
    }
}
