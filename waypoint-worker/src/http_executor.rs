//! Stage executor calling the section fetcher service over HTTP
//!
//! Each stage is a `POST <fetcher_url>/stages/<stage>` with the
//! [`StageContext`] as JSON body. A 2xx response carries a [`StageReport`].
//! Timeouts, throttling (408, 425, 429) and 5xx responses are transient;
//! any other status is a terminal failure of the stage.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use waypoint_core::Stage;
use waypoint_runtime::{StageContext, StageError, StageExecutor, StageReport};

/// Longest response body excerpt kept in a stage error
const MAX_ERROR_BODY: usize = 512;

/// Executes stages through the section fetcher service
#[derive(Clone)]
pub struct HttpStageExecutor {
    client: reqwest::Client,
    base_url: String,
}

impl HttpStageExecutor {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn stage_url(&self, stage: Stage) -> String {
        format!("{}/stages/{}", self.base_url, stage.as_str())
    }
}

#[async_trait]
impl StageExecutor for HttpStageExecutor {
    #[instrument(
        skip(self, ctx),
        fields(
            run_id = %ctx.run_id,
            entity_id = %ctx.entity_id,
            stage = %ctx.stage,
            attempt = ctx.attempt,
        )
    )]
    async fn execute(&self, ctx: &StageContext) -> std::result::Result<StageReport, StageError> {
        let response = self
            .client
            .post(self.stage_url(ctx.stage))
            .json(ctx)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if status.is_success() {
            let report: StageReport = response.json().await.map_err(|e| {
                StageError::terminal(format!("fetcher returned an unreadable report: {}", e))
            })?;
            debug!(outcome = report.outcome.as_str(), "Fetcher call succeeded");
            return Ok(report);
        }

        let body = response.text().await.unwrap_or_default();
        let message = format!("fetcher returned {}: {}", status, excerpt(&body));
        warn!(status = %status, "Fetcher call failed");

        if is_transient_status(status) {
            Err(StageError::transient(message))
        } else {
            Err(StageError::terminal(message))
        }
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status.as_u16() == 425
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

/// Requests that never got a response are retried, except malformed ones
fn classify_transport_error(err: reqwest::Error) -> StageError {
    if err.is_builder() {
        StageError::terminal(format!("invalid fetcher request: {}", err))
    } else if err.is_timeout() {
        StageError::transient(format!("fetcher timed out: {}", err))
    } else {
        StageError::transient(format!("fetcher unreachable: {}", err))
    }
}

fn excerpt(body: &str) -> &str {
    match body.char_indices().nth(MAX_ERROR_BODY) {
        Some((end, _)) => &body[..end],
        None => body,
    }
}
