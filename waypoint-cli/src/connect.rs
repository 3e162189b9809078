//! Connections shared by the commands

use anyhow::{Context, Result};
use std::sync::Arc;
use waypoint_core::RunId;
use waypoint_runtime::{PipelineOrchestrator, RedisControlPlane};
use waypoint_storage::PostgresStorage;

/// Where the pipeline state lives
pub struct Targets {
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub prefix: String,
}

impl Targets {
    pub fn database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("DATABASE_URL not set"))
    }

    pub fn redis_url(&self) -> Result<&str> {
        self.redis_url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("REDIS_URL not set"))
    }

    /// Orchestrator over PostgreSQL and the redis control plane
    pub async fn orchestrator(&self) -> Result<PipelineOrchestrator> {
        let storage = PostgresStorage::new(self.database_url()?)
            .await
            .context("Failed to connect to the database")?;
        let control = RedisControlPlane::connect(self.redis_url()?, self.prefix.clone())
            .await
            .context("Failed to connect to the control plane")?;

        Ok(PipelineOrchestrator::new(
            Arc::new(storage),
            Arc::new(control),
        ))
    }
}

pub fn parse_run_id(raw: &str) -> Result<RunId> {
    raw.parse()
        .with_context(|| format!("'{}' is not a valid run id", raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_urls() {
        let targets = Targets {
            database_url: None,
            redis_url: Some("redis://localhost/2".to_string()),
            prefix: "waypoint".to_string(),
        };
        assert!(targets.database_url().is_err());
        assert_eq!(targets.redis_url().unwrap(), "redis://localhost/2");
    }

    #[test]
    fn test_parse_run_id() {
        assert!(parse_run_id("not-a-uuid").is_err());
        let id = RunId::new();
        assert_eq!(parse_run_id(&id.to_string()).unwrap(), id);
    }
}
