//! Persisted status values for runs and checkpoints

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a pipeline run.
///
/// Runs only move forward: `Running` to one of the two terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    PartialFailure,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::PartialFailure => "partial_failure",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "partial_failure" => Ok(RunStatus::PartialFailure),
            other => Err(crate::Error::UnknownRunStatus(other.to_string())),
        }
    }
}

/// Outcome recorded for one (run, entity, stage) triple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Completed,
    Failed,
    /// The stage was deliberately not executed (e.g. provider quota
    /// exhausted). Lets the entity advance like `Completed`.
    Skipped,
    /// A retry of a failed stage was requested and has not run yet. Holds
    /// the entity at the stage so the run cannot be finalized around it.
    Pending,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStatus::Completed => "completed",
            CheckpointStatus::Failed => "failed",
            CheckpointStatus::Skipped => "skipped",
            CheckpointStatus::Pending => "pending",
        }
    }

    /// Whether the checkpoint lets the entity move on to the next stage
    pub fn is_satisfying(&self) -> bool {
        matches!(self, CheckpointStatus::Completed | CheckpointStatus::Skipped)
    }
}

impl fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckpointStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "completed" => Ok(CheckpointStatus::Completed),
            "failed" => Ok(CheckpointStatus::Failed),
            "skipped" => Ok(CheckpointStatus::Skipped),
            "pending" => Ok(CheckpointStatus::Pending),
            other => Err(crate::Error::UnknownCheckpointStatus(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_terminality() {
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::PartialFailure.is_terminal());
    }

    #[test]
    fn test_run_status_parse() {
        assert_eq!(
            "partial_failure".parse::<RunStatus>().unwrap(),
            RunStatus::PartialFailure
        );
        assert!("done".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_checkpoint_satisfaction() {
        assert!(CheckpointStatus::Completed.is_satisfying());
        assert!(CheckpointStatus::Skipped.is_satisfying());
        assert!(!CheckpointStatus::Failed.is_satisfying());
        assert!(!CheckpointStatus::Pending.is_satisfying());
    }

    #[test]
    fn test_checkpoint_status_parse() {
        for status in [
            CheckpointStatus::Completed,
            CheckpointStatus::Failed,
            CheckpointStatus::Skipped,
            CheckpointStatus::Pending,
        ] {
            assert_eq!(status.as_str().parse::<CheckpointStatus>().unwrap(), status);
        }
    }
}
