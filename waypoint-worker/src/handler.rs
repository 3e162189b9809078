//! HTTP handlers for the worker API
//!
//! Implements:
//! - POST /pipeline/runs - Start a run
//! - GET /pipeline/runs - List recent runs
//! - GET /pipeline/runs/:run_id - Run status with per-entity progress
//! - GET /pipeline/runs/:run_id/tracking - Collected item counters with per-section stats
//! - GET /pipeline/runs/:run_id/tracking/empty - Entities with nothing collected
//! - GET /pipeline/runs/:run_id/tracking/entities/:entity_id - Counters of one entity
//! - POST /pipeline/runs/:run_id/resume - Re-seed an interrupted run
//! - POST /pipeline/stop - Hard stop of every queue and lock
//! - GET /pipeline/queues - Queue depths
//! - GET /health, GET /ready, GET /metrics - Liveness, readiness and metrics, without authentication
//!
//! Every `/pipeline` route requires the `X-Admin-Key` header.

use crate::types::{
    EmptyEntitiesResponse, ErrorBody, HealthResponse, ListRunsQuery, ReadyResponse,
    ResumeRequest, RunListItem, StartRunRequest, StartRunResponse, TrackingQuery,
};
use axum::{
    body::Bytes,
    extract::{Path, Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use std::collections::BTreeMap;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{error, info, warn};
use waypoint_core::{EntityId, RunId};
use waypoint_runtime::{
    ControlPlane, EntityTracking, HardStopReport, PipelineOrchestrator, ResumeReport,
    RunStatusReport, TrackingSummary,
};

/// Header carrying the admin key
pub const ADMIN_KEY_HEADER: &str = "x-admin-key";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: PipelineOrchestrator,
    pub admin_key: Arc<str>,
}

impl AppState {
    pub fn new(orchestrator: PipelineOrchestrator, admin_key: impl Into<Arc<str>>) -> Self {
        Self {
            orchestrator,
            admin_key: admin_key.into(),
        }
    }
}

/// Build the router with every route; transport layers are added by the caller
pub fn router(state: AppState) -> Router {
    let admin = Router::new()
        .route("/pipeline/runs", get(list_runs_handler).post(start_run_handler))
        .route("/pipeline/runs/:run_id", get(run_status_handler))
        .route("/pipeline/runs/:run_id/tracking", get(tracking_handler))
        .route("/pipeline/runs/:run_id/tracking/empty", get(empty_entities_handler))
        .route(
            "/pipeline/runs/:run_id/tracking/entities/:entity_id",
            get(entity_tracking_handler),
        )
        .route("/pipeline/runs/:run_id/resume", post(resume_handler))
        .route("/pipeline/stop", post(stop_handler))
        .route("/pipeline/queues", get(queues_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin_key));

    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .merge(admin)
        .with_state(state)
}

/// Reject requests whose `X-Admin-Key` does not match, comparing in constant time
async fn require_admin_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let provided = headers
        .get(ADMIN_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Unauthorized)?;

    if provided.as_bytes().ct_eq(state.admin_key.as_bytes()).into() {
        Ok(next.run(request).await)
    } else {
        warn!(path = %request.uri().path(), "Rejected admin request with a wrong key");
        Err(ApiError::Unauthorized)
    }
}

/// Start a run over the given entities
///
/// The response is sent once the run is stored and its seeding unit queued;
/// the stages themselves run on the worker pool.
pub async fn start_run_handler(
    State(state): State<AppState>,
    Json(request): Json<StartRunRequest>,
) -> Result<Json<StartRunResponse>, ApiError> {
    let metadata = with_trigger(request.metadata);
    let run_id = state
        .orchestrator
        .start_pipeline(&request.entity_ids, metadata)
        .await?;

    info!(run_id = %run_id, entity_count = request.entity_ids.len(), "Run started via admin API");
    Ok(Json(StartRunResponse::accepted(run_id)))
}

pub async fn list_runs_handler(
    State(state): State<AppState>,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<Vec<RunListItem>>, ApiError> {
    let runs = state.orchestrator.list_runs(query.limit).await?;
    Ok(Json(runs.iter().map(RunListItem::from).collect()))
}

pub async fn run_status_handler(
    State(state): State<AppState>,
    Path(run_id): Path<RunId>,
) -> Result<Json<RunStatusReport>, ApiError> {
    Ok(Json(state.orchestrator.get_run_status(run_id).await?))
}

pub async fn tracking_handler(
    State(state): State<AppState>,
    Path(run_id): Path<RunId>,
    Query(query): Query<TrackingQuery>,
) -> Result<Json<TrackingSummary>, ApiError> {
    Ok(Json(
        state.orchestrator.tracking_summary(run_id, query.top).await?,
    ))
}

pub async fn empty_entities_handler(
    State(state): State<AppState>,
    Path(run_id): Path<RunId>,
) -> Result<Json<EmptyEntitiesResponse>, ApiError> {
    let entity_ids = state.orchestrator.empty_entities(run_id).await?;
    Ok(Json(EmptyEntitiesResponse::new(run_id, entity_ids)))
}

pub async fn entity_tracking_handler(
    State(state): State<AppState>,
    Path((run_id, entity_id)): Path<(RunId, EntityId)>,
) -> Result<Json<EntityTracking>, ApiError> {
    Ok(Json(
        state.orchestrator.entity_tracking(run_id, entity_id).await?,
    ))
}

/// Resume a run. A missing or blank body means `pending_only`; a body that
/// is present must be a valid [`ResumeRequest`].
pub async fn resume_handler(
    State(state): State<AppState>,
    Path(run_id): Path<RunId>,
    body: Bytes,
) -> Result<Json<ResumeReport>, ApiError> {
    let request = parse_resume_request(&body)?;
    Ok(Json(
        state.orchestrator.resume_run(run_id, request.mode).await?,
    ))
}

fn parse_resume_request(body: &[u8]) -> Result<ResumeRequest, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(ResumeRequest::default());
    }
    serde_json::from_slice(body).map_err(|e| {
        ApiError::Runtime(waypoint_runtime::Error::Validation(format!(
            "invalid resume request: {}",
            e
        )))
    })
}

pub async fn stop_handler(
    State(state): State<AppState>,
) -> Result<Json<HardStopReport>, ApiError> {
    Ok(Json(state.orchestrator.stop_pipeline().await?))
}

pub async fn queues_handler(
    State(state): State<AppState>,
) -> Result<Json<BTreeMap<String, u64>>, ApiError> {
    Ok(Json(state.orchestrator.queue_depths().await?))
}

/// Health check endpoint
///
/// Returns 200 OK if the process is running.
pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse::healthy())
}

/// Readiness: both the pipeline store and the control plane answer
pub async fn ready_handler(State(state): State<AppState>) -> (StatusCode, Json<ReadyResponse>) {
    let storage = component_status(state.orchestrator.list_runs(1).await.map(|_| ()));
    let control_plane = component_status(state.orchestrator.control().epoch().await.map(|_| ()));

    let ready = storage == "ok" && control_plane == "ok";
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyResponse {
            ready,
            storage,
            control_plane,
        }),
    )
}

fn component_status(result: waypoint_runtime::Result<()>) -> String {
    match result {
        Ok(()) => "ok".to_string(),
        Err(e) => {
            warn!(error = %e, "Readiness check failed");
            e.to_string()
        }
    }
}

/// Prometheus text exposition of the default registry
pub async fn metrics_handler() -> Result<Response, ApiError> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|e| ApiError::Internal(format!("failed to encode metrics: {}", e)))?;

    Ok((
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response())
}

/// Tag the run with its trigger unless the caller already did
fn with_trigger(metadata: serde_json::Value) -> serde_json::Value {
    match metadata {
        serde_json::Value::Null => serde_json::json!({ "trigger": "admin_api" }),
        serde_json::Value::Object(mut map) => {
            map.entry("trigger")
                .or_insert_with(|| serde_json::Value::from("admin_api"));
            serde_json::Value::Object(map)
        }
        other => other,
    }
}

/// Error types for the admin API
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("missing or invalid admin key")]
    Unauthorized,

    #[error(transparent)]
    Runtime(#[from] waypoint_runtime::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        use waypoint_runtime::Error as RuntimeError;

        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Runtime(err) => match err {
                RuntimeError::NotFound(_) => StatusCode::NOT_FOUND,
                RuntimeError::Validation(_) => StatusCode::BAD_REQUEST,
                RuntimeError::InvalidState(_) | RuntimeError::Conflict(_) => StatusCode::CONFLICT,
                RuntimeError::StorageUnavailable(_) | RuntimeError::ControlPlane(_) => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                RuntimeError::Storage(_) | RuntimeError::Internal(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self, "Admin request failed");
        }

        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}
