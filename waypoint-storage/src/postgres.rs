//! PostgreSQL storage implementation

use crate::metrics::{DB_ERRORS_TOTAL, DB_OPERATION_DURATION};
use crate::models::*;
use crate::store::{normalize_metadata, CheckpointStore, DataTrackingStore, RunRegistry};
use crate::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use sqlx::types::Json;
use sqlx::{postgres::PgPoolOptions, PgPool, Postgres, Transaction};
use std::time::Instant;
use tracing::{error, info, instrument, warn};
use waypoint_core::{CheckpointStatus, EntityId, RunId, RunStatus, Section, SectionCounts, Stage};

const RUN_COLUMNS: &str =
    "id, status, entity_ids, metadata, started_at, completed_at, updated_at";
const CHECKPOINT_COLUMNS: &str =
    "id, run_id, entity_id, stage_name, status, metadata, created_at, updated_at";
const TRACKING_COLUMNS: &str = "id, run_id, entity_id, hero_images_count, reviews_count, \
     tips_count, social_videos_count, nearby_attractions_count, audience_profiles_count, \
     metadata, created_at, updated_at";

/// Configuration for the PostgreSQL connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
    pub idle_timeout_secs: Option<u64>,
    pub max_lifetime_secs: Option<u64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 1,
            acquire_timeout_secs: 30,
            idle_timeout_secs: None,
            max_lifetime_secs: None,
        }
    }
}

impl PoolConfig {
    fn validate(&self) -> Result<()> {
        if self.min_connections == 0 {
            return Err(crate::Error::ValidationError(
                "min_connections must be > 0".to_string(),
            ));
        }
        if self.max_connections == 0 || self.max_connections < self.min_connections {
            return Err(crate::Error::ValidationError(
                "max_connections must be >= min_connections and > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// PostgreSQL storage backend
#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    /// Create a new PostgreSQL storage instance with default configuration
    pub async fn new(database_url: &str) -> Result<Self> {
        Self::with_pool_config(database_url, PoolConfig::default()).await
    }

    /// Create a new PostgreSQL storage instance using a PoolConfig
    pub async fn with_pool_config(database_url: &str, config: PoolConfig) -> Result<Self> {
        config.validate()?;

        let mut opts = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(std::time::Duration::from_secs(config.acquire_timeout_secs));

        if let Some(idle) = config.idle_timeout_secs {
            opts = opts.idle_timeout(std::time::Duration::from_secs(idle));
        }
        if let Some(max_life) = config.max_lifetime_secs {
            opts = opts.max_lifetime(std::time::Duration::from_secs(max_life));
        }

        let pool = opts.connect(database_url).await.map_err(map_db_error)?;
        Ok(Self { pool })
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Execute a closure within a transaction
    ///
    /// Commits on success, rolls back on error.
    async fn with_transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut Transaction<'_, Postgres>) -> BoxFuture<'c, Result<T>> + Send,
        T: Send,
    {
        let mut tx = self.pool.begin().await.map_err(map_db_error)?;

        match f(&mut tx).await {
            Ok(result) => {
                tx.commit().await.map_err(map_db_error)?;
                Ok(result)
            }
            Err(e) => {
                tx.rollback().await.map_err(map_db_error)?;
                Err(e)
            }
        }
    }

    /// Health check used at startup and by `/ready`
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map(|_| ())
            .map_err(map_db_error)
    }

    // ========== Input Validation Helpers ==========

    fn validate_limit(limit: i64) -> Result<()> {
        if limit <= 0 {
            return Err(crate::Error::ValidationError(
                "Limit must be greater than 0".to_string(),
            ));
        }
        if limit > 1000 {
            return Err(crate::Error::ValidationError(
                "Limit cannot exceed 1000".to_string(),
            ));
        }
        Ok(())
    }

    fn validate_entities(entities: &[EntityId]) -> Result<()> {
        if entities.is_empty() {
            return Err(crate::Error::ValidationError(
                "A run needs at least one entity".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl RunRegistry for PostgresStorage {
    #[instrument(
        skip(self, entities, metadata),
        fields(
            db.system = "postgresql",
            db.operation = "INSERT",
            db.sql.table = "pipeline_runs",
            entity_count = entities.len(),
            run_id = tracing::field::Empty
        )
    )]
    async fn create_run(
        &self,
        entities: &[EntityId],
        metadata: serde_json::Value,
    ) -> Result<PipelineRunModel> {
        Self::validate_entities(entities)?;
        let metadata = normalize_metadata(metadata)?;
        let run_id = RunId::new();
        tracing::Span::current().record("run_id", tracing::field::display(run_id));

        let start = Instant::now();
        let entity_ids: Vec<i64> = entities.iter().map(|e| e.get()).collect();
        let run = sqlx::query_as::<_, PipelineRunModel>(&format!(
            r#"
            INSERT INTO pipeline_runs (id, status, entity_ids, metadata, started_at, updated_at)
            VALUES ($1, 'running', $2, $3, NOW(), NOW())
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(run_id.as_uuid())
        .bind(Json(entity_ids))
        .bind(Json(metadata))
        .fetch_one(&self.pool)
        .await
        .map_err(map_db_error)?;
        observe("create_run", start);

        info!(run_id = %run_id, entity_count = entities.len(), "Created pipeline run");
        Ok(run)
    }

    #[instrument(
        skip(self),
        fields(
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.sql.table = "pipeline_runs",
            run_id = %run_id,
            status = %status
        )
    )]
    async fn complete_run(&self, run_id: RunId, status: RunStatus) -> Result<PipelineRunModel> {
        if !status.is_terminal() {
            return Err(crate::Error::ValidationError(format!(
                "{} is not a terminal run status",
                status
            )));
        }

        let start = Instant::now();
        let result = self
            .with_transaction(|tx| {
                Box::pin(async move {
                    // Row lock serializes with request_retry
                    let existing = sqlx::query_as::<_, PipelineRunModel>(&format!(
                        "SELECT {RUN_COLUMNS} FROM pipeline_runs WHERE id = $1 FOR UPDATE"
                    ))
                    .bind(run_id.as_uuid())
                    .fetch_optional(&mut **tx)
                    .await
                    .map_err(map_db_error)?
                    .ok_or_else(|| crate::Error::NotFound(format!("Run {} not found", run_id)))?;

                    if existing.status != RunStatus::Running.as_str() {
                        return if existing.status == status.as_str() {
                            Ok(existing)
                        } else {
                            Err(crate::Error::Conflict(format!(
                                "Run {} already finished as {}",
                                run_id, existing.status
                            )))
                        };
                    }

                    let pending: bool = sqlx::query_scalar(
                        r#"
                        SELECT EXISTS (
                            SELECT 1 FROM pipeline_checkpoints
                            WHERE run_id = $1 AND status = 'pending'
                        )
                        "#,
                    )
                    .bind(run_id.as_uuid())
                    .fetch_one(&mut **tx)
                    .await
                    .map_err(map_db_error)?;
                    if pending {
                        return Err(crate::Error::PendingRetry(format!(
                            "Run {} has a retry that has not run yet",
                            run_id
                        )));
                    }

                    sqlx::query_as::<_, PipelineRunModel>(&format!(
                        r#"
                        UPDATE pipeline_runs
                        SET status = $2, completed_at = NOW(), updated_at = NOW()
                        WHERE id = $1
                        RETURNING {RUN_COLUMNS}
                        "#
                    ))
                    .bind(run_id.as_uuid())
                    .bind(status.as_str())
                    .fetch_one(&mut **tx)
                    .await
                    .map_err(map_db_error)
                })
            })
            .await;
        observe("complete_run", start);
        result
    }

    #[instrument(
        skip(self),
        fields(
            db.system = "postgresql",
            db.operation = "SELECT",
            db.sql.table = "pipeline_runs",
            run_id = %run_id
        )
    )]
    async fn get_run(&self, run_id: RunId) -> Result<PipelineRunModel> {
        let start = Instant::now();
        let run = sqlx::query_as::<_, PipelineRunModel>(&format!(
            "SELECT {RUN_COLUMNS} FROM pipeline_runs WHERE id = $1"
        ))
        .bind(run_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?
        .ok_or_else(|| crate::Error::NotFound(format!("Run {} not found", run_id)))?;
        observe("get_run", start);
        Ok(run)
    }

    #[instrument(
        skip(self),
        fields(db.system = "postgresql", db.operation = "SELECT", db.sql.table = "pipeline_runs")
    )]
    async fn list_runs(&self, limit: i64) -> Result<Vec<PipelineRunModel>> {
        Self::validate_limit(limit)?;

        let start = Instant::now();
        let runs = sqlx::query_as::<_, PipelineRunModel>(&format!(
            "SELECT {RUN_COLUMNS} FROM pipeline_runs ORDER BY started_at DESC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        observe("list_runs", start);
        Ok(runs)
    }
}

#[async_trait]
impl CheckpointStore for PostgresStorage {
    #[instrument(
        skip(self, metadata),
        fields(
            db.system = "postgresql",
            db.operation = "UPSERT",
            db.sql.table = "pipeline_checkpoints",
            run_id = %run_id,
            entity_id = %entity_id,
            stage = %stage,
            status = %status
        )
    )]
    async fn record_checkpoint(
        &self,
        run_id: RunId,
        entity_id: EntityId,
        stage: Stage,
        status: CheckpointStatus,
        metadata: serde_json::Value,
    ) -> Result<CheckpointModel> {
        let metadata = normalize_metadata(metadata)?;

        let start = Instant::now();
        let checkpoint = sqlx::query_as::<_, CheckpointModel>(&format!(
            r#"
            INSERT INTO pipeline_checkpoints (
                run_id, entity_id, stage_name, status, metadata, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, NOW(), NOW())
            ON CONFLICT (run_id, entity_id, stage_name) DO UPDATE
            SET status = EXCLUDED.status,
                metadata = EXCLUDED.metadata,
                updated_at = NOW()
            RETURNING {CHECKPOINT_COLUMNS}
            "#
        ))
        .bind(run_id.as_uuid())
        .bind(entity_id.get())
        .bind(stage.as_str())
        .bind(status.as_str())
        .bind(Json(metadata))
        .fetch_one(&self.pool)
        .await
        .map_err(map_db_error)?;
        observe("record_checkpoint", start);

        Ok(checkpoint)
    }

    #[instrument(
        skip(self),
        fields(
            db.system = "postgresql",
            db.operation = "SELECT",
            db.sql.table = "pipeline_checkpoints",
            run_id = %run_id,
            entity_id = %entity_id,
            stage = %stage
        )
    )]
    async fn get_checkpoint(
        &self,
        run_id: RunId,
        entity_id: EntityId,
        stage: Stage,
    ) -> Result<Option<CheckpointModel>> {
        let start = Instant::now();
        let checkpoint = sqlx::query_as::<_, CheckpointModel>(&format!(
            r#"
            SELECT {CHECKPOINT_COLUMNS}
            FROM pipeline_checkpoints
            WHERE run_id = $1 AND entity_id = $2 AND stage_name = $3
            "#
        ))
        .bind(run_id.as_uuid())
        .bind(entity_id.get())
        .bind(stage.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;
        observe("get_checkpoint", start);
        Ok(checkpoint)
    }

    #[instrument(
        skip(self),
        fields(
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.sql.table = "pipeline_checkpoints",
            run_id = %run_id,
            entity_id = %entity_id,
            stage = %stage
        )
    )]
    async fn request_retry(
        &self,
        run_id: RunId,
        entity_id: EntityId,
        stage: Stage,
    ) -> Result<Option<CheckpointModel>> {
        let start = Instant::now();
        let result = self
            .with_transaction(|tx| {
                Box::pin(async move {
                    // Same row lock as complete_run
                    let run_status: String = sqlx::query_scalar(
                        "SELECT status FROM pipeline_runs WHERE id = $1 FOR UPDATE",
                    )
                    .bind(run_id.as_uuid())
                    .fetch_optional(&mut **tx)
                    .await
                    .map_err(map_db_error)?
                    .ok_or_else(|| crate::Error::NotFound(format!("Run {} not found", run_id)))?;

                    if run_status != RunStatus::Running.as_str() {
                        return Err(crate::Error::Conflict(format!(
                            "Run {} already finished as {}",
                            run_id, run_status
                        )));
                    }

                    sqlx::query_as::<_, CheckpointModel>(&format!(
                        r#"
                        UPDATE pipeline_checkpoints
                        SET status = 'pending',
                            metadata = (metadata - 'error') || jsonb_build_object(
                                'previous_error', metadata -> 'error',
                                'retry_requested_at', NOW()
                            ),
                            updated_at = NOW()
                        WHERE run_id = $1 AND entity_id = $2 AND stage_name = $3
                          AND status = 'failed'
                        RETURNING {CHECKPOINT_COLUMNS}
                        "#
                    ))
                    .bind(run_id.as_uuid())
                    .bind(entity_id.get())
                    .bind(stage.as_str())
                    .fetch_optional(&mut **tx)
                    .await
                    .map_err(map_db_error)
                })
            })
            .await;
        observe("request_retry", start);

        if let Ok(Some(_)) = &result {
            info!(run_id = %run_id, entity_id = %entity_id, stage = %stage, "Retry requested");
        }
        result
    }

    #[instrument(
        skip(self),
        fields(
            db.system = "postgresql",
            db.operation = "SELECT",
            db.sql.table = "pipeline_checkpoints",
            run_id = %run_id,
            entity_id = %entity_id
        )
    )]
    async fn list_entity_checkpoints(
        &self,
        run_id: RunId,
        entity_id: EntityId,
    ) -> Result<Vec<CheckpointModel>> {
        let start = Instant::now();
        let checkpoints = sqlx::query_as::<_, CheckpointModel>(&format!(
            r#"
            SELECT {CHECKPOINT_COLUMNS}
            FROM pipeline_checkpoints
            WHERE run_id = $1 AND entity_id = $2
            ORDER BY id
            "#
        ))
        .bind(run_id.as_uuid())
        .bind(entity_id.get())
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        observe("list_entity_checkpoints", start);
        Ok(checkpoints)
    }

    #[instrument(
        skip(self),
        fields(
            db.system = "postgresql",
            db.operation = "SELECT",
            db.sql.table = "pipeline_checkpoints",
            run_id = %run_id
        )
    )]
    async fn list_checkpoints(&self, run_id: RunId) -> Result<Vec<CheckpointModel>> {
        let start = Instant::now();
        let checkpoints = sqlx::query_as::<_, CheckpointModel>(&format!(
            r#"
            SELECT {CHECKPOINT_COLUMNS}
            FROM pipeline_checkpoints
            WHERE run_id = $1
            ORDER BY entity_id, id
            "#
        ))
        .bind(run_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        observe("list_checkpoints", start);
        Ok(checkpoints)
    }

    #[instrument(
        skip(self),
        fields(
            db.system = "postgresql",
            db.operation = "SELECT",
            db.sql.table = "pipeline_checkpoints",
            run_id = %run_id,
            entity_id = %entity_id,
            stage = %stage
        )
    )]
    async fn has_completed(
        &self,
        run_id: RunId,
        entity_id: EntityId,
        stage: Stage,
    ) -> Result<bool> {
        let start = Instant::now();
        let completed: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM pipeline_checkpoints
                WHERE run_id = $1 AND entity_id = $2 AND stage_name = $3
                  AND status = 'completed'
            )
            "#,
        )
        .bind(run_id.as_uuid())
        .bind(entity_id.get())
        .bind(stage.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(map_db_error)?;
        observe("has_completed", start);
        Ok(completed)
    }
}

#[async_trait]
impl DataTrackingStore for PostgresStorage {
    #[instrument(
        skip(self, counts, metadata),
        fields(
            db.system = "postgresql",
            db.operation = "UPSERT",
            db.sql.table = "attraction_data_tracking",
            run_id = %run_id,
            entity_id = %entity_id,
            sections = counts.len()
        )
    )]
    async fn record_counts(
        &self,
        run_id: RunId,
        entity_id: EntityId,
        counts: &SectionCounts,
        metadata: serde_json::Value,
    ) -> Result<DataTrackingModel> {
        let metadata = normalize_metadata(metadata)?;

        // GREATEST ignores NULL, so unreported sections keep their stored value
        let start = Instant::now();
        let record = sqlx::query_as::<_, DataTrackingModel>(&format!(
            r#"
            INSERT INTO attraction_data_tracking AS t (
                run_id, entity_id, hero_images_count, reviews_count, tips_count,
                social_videos_count, nearby_attractions_count, audience_profiles_count,
                metadata, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW(), NOW())
            ON CONFLICT (run_id, entity_id) DO UPDATE
            SET hero_images_count = GREATEST(t.hero_images_count, EXCLUDED.hero_images_count),
                reviews_count = GREATEST(t.reviews_count, EXCLUDED.reviews_count),
                tips_count = GREATEST(t.tips_count, EXCLUDED.tips_count),
                social_videos_count = GREATEST(t.social_videos_count, EXCLUDED.social_videos_count),
                nearby_attractions_count =
                    GREATEST(t.nearby_attractions_count, EXCLUDED.nearby_attractions_count),
                audience_profiles_count =
                    GREATEST(t.audience_profiles_count, EXCLUDED.audience_profiles_count),
                metadata = t.metadata || EXCLUDED.metadata,
                updated_at = NOW()
            RETURNING {TRACKING_COLUMNS}
            "#
        ))
        .bind(run_id.as_uuid())
        .bind(entity_id.get())
        .bind(counts.get(Section::HeroImages))
        .bind(counts.get(Section::Reviews))
        .bind(counts.get(Section::Tips))
        .bind(counts.get(Section::SocialVideos))
        .bind(counts.get(Section::NearbyAttractions))
        .bind(counts.get(Section::AudienceProfiles))
        .bind(Json(metadata))
        .fetch_one(&self.pool)
        .await
        .map_err(map_db_error)?;
        observe("record_counts", start);

        Ok(record)
    }

    #[instrument(
        skip(self),
        fields(
            db.system = "postgresql",
            db.operation = "SELECT",
            db.sql.table = "attraction_data_tracking",
            run_id = %run_id,
            entity_id = %entity_id
        )
    )]
    async fn get_tracking(
        &self,
        run_id: RunId,
        entity_id: EntityId,
    ) -> Result<Option<DataTrackingModel>> {
        let start = Instant::now();
        let record = sqlx::query_as::<_, DataTrackingModel>(&format!(
            r#"
            SELECT {TRACKING_COLUMNS}
            FROM attraction_data_tracking
            WHERE run_id = $1 AND entity_id = $2
            "#
        ))
        .bind(run_id.as_uuid())
        .bind(entity_id.get())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;
        observe("get_tracking", start);
        Ok(record)
    }

    #[instrument(
        skip(self),
        fields(
            db.system = "postgresql",
            db.operation = "SELECT",
            db.sql.table = "attraction_data_tracking",
            run_id = %run_id
        )
    )]
    async fn list_tracking(&self, run_id: RunId) -> Result<Vec<DataTrackingModel>> {
        let start = Instant::now();
        let records = sqlx::query_as::<_, DataTrackingModel>(&format!(
            r#"
            SELECT {TRACKING_COLUMNS}
            FROM attraction_data_tracking
            WHERE run_id = $1
            ORDER BY entity_id
            "#
        ))
        .bind(run_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        observe("list_tracking", start);
        Ok(records)
    }
}

/// Record operation latency and flag slow queries (>100ms)
fn observe(operation: &str, start: Instant) {
    let elapsed = start.elapsed();
    DB_OPERATION_DURATION
        .with_label_values(&[operation])
        .observe(elapsed.as_secs_f64());

    if elapsed.as_millis() > 100 {
        warn!(
            operation,
            duration_ms = elapsed.as_millis() as u64,
            "Slow database operation detected"
        );
    }
}

/// Map a sqlx error onto the storage error taxonomy
fn map_db_error(err: sqlx::Error) -> crate::Error {
    match &err {
        sqlx::Error::PoolTimedOut => {
            error!(error = %err, "Connection pool timed out");
            DB_ERRORS_TOTAL.with_label_values(&["unavailable"]).inc();
            return crate::Error::PoolExhausted("Connection pool timed out".to_string());
        }
        sqlx::Error::PoolClosed => {
            error!(error = %err, "Connection pool closed");
            DB_ERRORS_TOTAL.with_label_values(&["unavailable"]).inc();
            return crate::Error::ConnectionFailed("Connection pool closed".to_string());
        }
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
            error!(error = %err, "Database connection failed");
            DB_ERRORS_TOTAL.with_label_values(&["unavailable"]).inc();
            return crate::Error::ConnectionFailed(err.to_string());
        }
        _ => {}
    }

    if let sqlx::Error::Database(db_err) = &err {
        if let Some(code) = db_err.code().as_deref() {
            match code {
                // unique_violation
                "23505" => {
                    warn!(error_code = code, message = db_err.message(), "Unique constraint violation");
                    DB_ERRORS_TOTAL.with_label_values(&["constraint"]).inc();
                    return crate::Error::AlreadyExists(db_err.message().to_string());
                }
                // foreign_key_violation: run or entity no longer exists
                "23503" => {
                    warn!(error_code = code, message = db_err.message(), "Foreign key violation");
                    DB_ERRORS_TOTAL.with_label_values(&["constraint"]).inc();
                    return crate::Error::NotFound(db_err.message().to_string());
                }
                // check_violation
                "23514" => {
                    warn!(error_code = code, message = db_err.message(), "CHECK constraint violation");
                    DB_ERRORS_TOTAL.with_label_values(&["constraint"]).inc();
                    return crate::Error::ValidationError(format!(
                        "Constraint violation: {}",
                        db_err.message()
                    ));
                }
                // too_many_connections
                "53300" => {
                    error!(error_code = code, message = db_err.message(), "Database connection limit reached");
                    DB_ERRORS_TOTAL.with_label_values(&["unavailable"]).inc();
                    return crate::Error::PoolExhausted(db_err.message().to_string());
                }
                "08006" | "08001" | "08003" | "08004" | "57P01" => {
                    error!(error_code = code, message = db_err.message(), "Database connection failed");
                    DB_ERRORS_TOTAL.with_label_values(&["unavailable"]).inc();
                    return crate::Error::ConnectionFailed(db_err.message().to_string());
                }
                _ => {
                    error!(error_code = code, message = db_err.message(), "Unexpected database error");
                }
            }
        }
    }

    error!(error = %err, "Database error");
    DB_ERRORS_TOTAL.with_label_values(&["other"]).inc();
    crate::Error::Database(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_validation() {
        assert!(PoolConfig::default().validate().is_ok());

        let zero_min = PoolConfig {
            min_connections: 0,
            ..Default::default()
        };
        assert!(zero_min.validate().is_err());

        let inverted = PoolConfig {
            max_connections: 1,
            min_connections: 2,
            ..Default::default()
        };
        assert!(inverted.validate().is_err());
    }

    #[test]
    fn test_limit_validation() {
        assert!(PostgresStorage::validate_limit(20).is_ok());
        assert!(PostgresStorage::validate_limit(0).is_err());
        assert!(PostgresStorage::validate_limit(1001).is_err());
    }

    #[test]
    fn test_pool_errors_map_to_unavailable() {
        assert!(map_db_error(sqlx::Error::PoolTimedOut).is_unavailable());
        assert!(map_db_error(sqlx::Error::PoolClosed).is_unavailable());
        assert!(!map_db_error(sqlx::Error::RowNotFound).is_unavailable());
    }
}
