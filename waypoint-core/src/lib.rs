//! # Waypoint Core
//!
//! Domain vocabulary shared by every waypoint crate: run and entity
//! identifiers, the fixed stage sequence, tracked data sections and the
//! status values persisted for runs and checkpoints.
//!
//! Nothing in this crate performs I/O.

pub mod ids;
pub mod section;
pub mod stage;
pub mod state_machine;
pub mod status;

// Re-export commonly used types
pub use ids::{EntityId, RunId};
pub use section::{Section, SectionCounts};
pub use stage::{Stage, StageDescriptor, STAGE_COUNT};
pub use state_machine::{EntityState, EntityStateMachine};
pub use status::{CheckpointStatus, RunStatus};

/// Result type for parsing domain values
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised when decoding persisted or user-supplied domain values
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    #[error("Unknown section: {0}")]
    UnknownSection(String),

    #[error("Unknown run status: {0}")]
    UnknownRunStatus(String),

    #[error("Unknown checkpoint status: {0}")]
    UnknownCheckpointStatus(String),

    #[error("Invalid identifier: {0}")]
    InvalidId(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
}
