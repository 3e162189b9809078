//! # Waypoint Runtime
//!
//! Drives entities through the fixed stage sequence: the stage executor
//! contract, the dispatcher that gates and records every stage, the
//! control plane that carries dispatch units and dependency locks, and the
//! orchestrator that starts, inspects, stops and resumes runs.

pub mod concurrency;
pub mod control_plane;
pub mod dispatcher;
pub mod executor;
pub mod metrics;
pub mod orchestrator;
pub mod report;
pub mod retry;
pub mod worker;

// Re-export commonly used types
pub use concurrency::{ConcurrencyConfig, DependencyGate};
pub use control_plane::{
    ControlPlane, DispatchUnit, HardStopReport, LockLease, MemoryControlPlane,
    RedisControlPlane, ORCHESTRATION_QUEUE,
};
pub use dispatcher::{DispatchOutcome, Dispatcher, DispatcherConfig, DropReason};
pub use executor::{ErrorKind, StageContext, StageError, StageExecutor, StageOutcome, StageReport};
pub use orchestrator::{PipelineOrchestrator, ResumeMode, ResumeReport, SeededUnit};
pub use report::{
    EntityProgress, EntityTracking, ProgressSummary, RunStatusReport, SectionStats,
    TrackingSummary,
};
pub use retry::{RetryPolicy, RetryStrategy};
pub use worker::{WorkerPool, WorkerPoolConfig};

use tracing::error;

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for runtime operations
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum Error {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Control plane error: {0}")]
    ControlPlane(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the unit of work that hit this error should be redelivered
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::StorageUnavailable(_) | Error::ControlPlane(_))
    }
}

/// Map storage errors to runtime errors, keeping the "unreachable" signal
pub(crate) fn map_storage_error(err: waypoint_storage::Error) -> Error {
    use waypoint_storage::Error as StorageError;

    if err.is_unavailable() {
        error!(error = %err, "Storage unavailable");
        return Error::StorageUnavailable(err.to_string());
    }

    match err {
        StorageError::NotFound(msg) => Error::NotFound(msg),
        StorageError::Conflict(msg) => Error::Conflict(msg),
        StorageError::PendingRetry(msg) => Error::InvalidState(msg),
        StorageError::ValidationError(msg) => Error::Validation(msg),
        other => {
            error!(error = %other, "Storage operation failed");
            Error::Storage(other.to_string())
        }
    }
}

impl From<waypoint_core::Error> for Error {
    fn from(err: waypoint_core::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_mapping() {
        assert_eq!(
            map_storage_error(waypoint_storage::Error::ConnectionFailed("down".into())),
            Error::StorageUnavailable("Connection failed: down".into())
        );
        assert_eq!(
            map_storage_error(waypoint_storage::Error::NotFound("run".into())),
            Error::NotFound("run".into())
        );
        assert!(matches!(
            map_storage_error(waypoint_storage::Error::Internal("x".into())),
            Error::Storage(_)
        ));
        assert!(matches!(
            map_storage_error(waypoint_storage::Error::PendingRetry("run".into())),
            Error::InvalidState(_)
        ));
    }

    #[test]
    fn test_retryable_errors() {
        assert!(Error::StorageUnavailable("x".into()).is_retryable());
        assert!(Error::ControlPlane("x".into()).is_retryable());
        assert!(!Error::NotFound("x".into()).is_retryable());
        assert!(!Error::InvalidState("x".into()).is_retryable());
    }
}
