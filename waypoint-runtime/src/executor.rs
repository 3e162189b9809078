//! Stage executor contract
//!
//! The orchestrator knows nothing about how a section is fetched. Each stage
//! is delegated to a [`StageExecutor`], which reports an outcome, the item
//! counts it produced and free-form metadata, or an error classified as
//! transient (worth retrying) or terminal.
//!
//! Executors may be invoked more than once for the same (run, entity,
//! stage): after a crash, a redelivery or an explicit retry. Their storage
//! effects must be idempotent.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use waypoint_core::{EntityId, RunId, SectionCounts, Stage};

/// Everything an executor is told about the unit it runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageContext {
    pub run_id: RunId,
    pub entity_id: EntityId,
    pub stage: Stage,

    /// 1-based attempt number within the current dispatch
    pub attempt: u32,
}

/// Successful result of a stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StageOutcome {
    /// Data was fetched and stored
    Completed,

    /// The provider had nothing for this entity; the stage still counts as done
    NoData,

    /// The stage was not executed (e.g. provider quota exhausted) and the
    /// entity moves on without it
    Skipped { reason: String },
}

impl StageOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageOutcome::Completed => "completed",
            StageOutcome::NoData => "no_data",
            StageOutcome::Skipped { .. } => "skipped",
        }
    }
}

/// Report returned by a successful executor call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    #[serde(flatten)]
    pub outcome: StageOutcome,

    #[serde(default)]
    pub counts: SectionCounts,

    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl StageReport {
    pub fn completed() -> Self {
        Self {
            outcome: StageOutcome::Completed,
            counts: SectionCounts::new(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn no_data() -> Self {
        Self {
            outcome: StageOutcome::NoData,
            ..Self::completed()
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            outcome: StageOutcome::Skipped {
                reason: reason.into(),
            },
            ..Self::completed()
        }
    }

    pub fn with_counts(mut self, counts: SectionCounts) -> Self {
        self.counts = counts;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// How a stage error should be handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Timeouts, throttling, 5xx: retried with backoff
    Transient,

    /// Bad input, permanent provider refusal: recorded as a failed checkpoint
    Terminal,
}

/// Error returned by a stage executor
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("{kind:?} stage error: {message}")]
pub struct StageError {
    pub kind: ErrorKind,
    pub message: String,
}

impl StageError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Terminal,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ErrorKind::Transient
    }
}

/// Executes one stage for one entity
#[async_trait]
pub trait StageExecutor: Send + Sync {
    async fn execute(&self, ctx: &StageContext) -> Result<StageReport, StageError>;
}
