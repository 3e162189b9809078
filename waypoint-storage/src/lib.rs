//! # Waypoint Storage
//!
//! Durable state of the enrichment pipeline: the run registry, per-stage
//! checkpoints and per-entity data tracking counters.
//!
//! Every store is an async trait with two implementations: PostgreSQL for
//! production and an in-memory store for tests and local runs.

pub mod memory;
pub mod metrics;
pub mod migrations;
pub mod models;
pub mod postgres;
pub mod store;

// Re-export commonly used types
pub use memory::MemoryStore;
pub use models::{CheckpointModel, DataTrackingModel, PipelineRunModel};
pub use postgres::{PoolConfig, PostgresStorage};
pub use store::{
    CheckpointStore, DataTrackingStore, IncompleteEntity, PipelineStore, RunRegistry,
};

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for storage operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Retry pending: {0}")]
    PendingRetry(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Connection pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
}

impl Error {
    /// Whether the error means the store could not be reached at all.
    ///
    /// Work that hits one of these must be retried later rather than
    /// recorded as a failure.
    pub fn is_unavailable(&self) -> bool {
        match self {
            Error::PoolExhausted(_) | Error::ConnectionFailed(_) => true,
            Error::Database(err) => matches!(
                err,
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }
}

impl From<waypoint_core::Error> for Error {
    fn from(err: waypoint_core::Error) -> Self {
        Error::ValidationError(err.to_string())
    }
}
