//! Type definitions for the worker HTTP API
//!
//! Request and response bodies of the admin routes. Run status, resume and
//! tracking responses reuse the runtime's report types as-is.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use waypoint_core::{EntityId, RunId};
use waypoint_runtime::ResumeMode;
use waypoint_storage::PipelineRunModel;

/// Body of `POST /pipeline/runs`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRunRequest {
    pub entity_ids: Vec<EntityId>,

    /// Free-form JSON object stored with the run
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Response of `POST /pipeline/runs`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRunResponse {
    pub run_id: RunId,
    pub status: String,
}

impl StartRunResponse {
    pub fn accepted(run_id: RunId) -> Self {
        Self {
            run_id,
            status: "running".to_string(),
        }
    }
}

/// Body of `POST /pipeline/runs/:run_id/resume`; an empty body resumes pending entities only
/// and a body that does not parse is rejected
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResumeRequest {
    #[serde(default)]
    pub mode: ResumeMode,
}

/// Query of `GET /pipeline/runs`
#[derive(Debug, Clone, Deserialize)]
pub struct ListRunsQuery {
    #[serde(default = "default_list_limit")]
    pub limit: i64,
}

fn default_list_limit() -> i64 {
    20
}

/// Query of `GET /pipeline/runs/:run_id/tracking`
#[derive(Debug, Clone, Deserialize)]
pub struct TrackingQuery {
    #[serde(default = "default_top")]
    pub top: usize,
}

fn default_top() -> usize {
    10
}

/// Response of `GET /pipeline/runs/:run_id/tracking/empty`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmptyEntitiesResponse {
    pub run_id: RunId,
    pub count: usize,
    pub entity_ids: Vec<EntityId>,
}

impl EmptyEntitiesResponse {
    pub fn new(run_id: RunId, entity_ids: Vec<EntityId>) -> Self {
        Self {
            run_id,
            count: entity_ids.len(),
            entity_ids,
        }
    }
}

/// One line of the run listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunListItem {
    pub run_id: RunId,
    pub status: String,
    pub entity_count: usize,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&PipelineRunModel> for RunListItem {
    fn from(run: &PipelineRunModel) -> Self {
        Self {
            run_id: run.run_id(),
            status: run.status.clone(),
            entity_count: run.entity_ids.0.len(),
            started_at: run.started_at,
            completed_at: run.completed_at,
        }
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,

    /// Optional version information
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl HealthResponse {
    /// Create a healthy response
    pub fn healthy() -> Self {
        Self {
            status: "healthy".to_string(),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
        }
    }
}

/// Readiness check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub storage: String,
    pub control_plane: String,
}

/// JSON error body of every failed admin request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}
