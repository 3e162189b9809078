//! In-memory storage implementation
//!
//! Behaves like the PostgreSQL backend (same upsert, merge and conflict
//! rules) so orchestration logic can be exercised without a database. It
//! can also be told to act unavailable, which is how tests drive the
//! "storage is down" paths.

use crate::models::*;
use crate::store::{normalize_metadata, CheckpointStore, DataTrackingStore, RunRegistry};
use crate::Result;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::types::Json;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;
use waypoint_core::{CheckpointStatus, EntityId, RunId, RunStatus, SectionCounts, Stage};

#[derive(Default)]
struct Inner {
    runs: HashMap<Uuid, PipelineRunModel>,
    checkpoints: BTreeMap<(Uuid, i64, Stage), CheckpointModel>,
    tracking: BTreeMap<(Uuid, i64), DataTrackingModel>,
    next_id: i64,
}

impl Inner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn ensure_run(&self, run_id: RunId) -> Result<()> {
        if self.runs.contains_key(&run_id.as_uuid()) {
            Ok(())
        } else {
            Err(crate::Error::NotFound(format!("Run {} not found", run_id)))
        }
    }
}

/// In-memory pipeline store
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with `ConnectionFailed` until reset
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Remove a run together with its checkpoints and tracking records
    pub async fn delete_run(&self, run_id: RunId) -> bool {
        let mut inner = self.inner.write().await;
        let id = run_id.as_uuid();
        inner.checkpoints.retain(|(run, _, _), _| *run != id);
        inner.tracking.retain(|(run, _), _| *run != id);
        inner.runs.remove(&id).is_some()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(crate::Error::ConnectionFailed(
                "memory store marked unavailable".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RunRegistry for MemoryStore {
    async fn create_run(
        &self,
        entities: &[EntityId],
        metadata: serde_json::Value,
    ) -> Result<PipelineRunModel> {
        self.check_available()?;
        if entities.is_empty() {
            return Err(crate::Error::ValidationError(
                "A run needs at least one entity".to_string(),
            ));
        }
        let metadata = normalize_metadata(metadata)?;

        let now = Utc::now();
        let run = PipelineRunModel {
            id: RunId::new().as_uuid(),
            status: RunStatus::Running.as_str().to_string(),
            entity_ids: Json(entities.iter().map(|e| e.get()).collect()),
            metadata: Json(metadata),
            started_at: now,
            completed_at: None,
            updated_at: now,
        };

        self.inner.write().await.runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn complete_run(&self, run_id: RunId, status: RunStatus) -> Result<PipelineRunModel> {
        self.check_available()?;
        if !status.is_terminal() {
            return Err(crate::Error::ValidationError(format!(
                "{} is not a terminal run status",
                status
            )));
        }

        let mut inner = self.inner.write().await;
        let pending = inner.checkpoints.iter().any(|((run, _, _), checkpoint)| {
            *run == run_id.as_uuid() && checkpoint.status == CheckpointStatus::Pending.as_str()
        });
        let run = inner
            .runs
            .get_mut(&run_id.as_uuid())
            .ok_or_else(|| crate::Error::NotFound(format!("Run {} not found", run_id)))?;

        if run.status == RunStatus::Running.as_str() {
            if pending {
                return Err(crate::Error::PendingRetry(format!(
                    "Run {} has a retry that has not run yet",
                    run_id
                )));
            }
            let now = Utc::now();
            run.status = status.as_str().to_string();
            run.completed_at = Some(now);
            run.updated_at = now;
            Ok(run.clone())
        } else if run.status == status.as_str() {
            Ok(run.clone())
        } else {
            Err(crate::Error::Conflict(format!(
                "Run {} already finished as {}",
                run_id, run.status
            )))
        }
    }

    async fn get_run(&self, run_id: RunId) -> Result<PipelineRunModel> {
        self.check_available()?;
        self.inner
            .read()
            .await
            .runs
            .get(&run_id.as_uuid())
            .cloned()
            .ok_or_else(|| crate::Error::NotFound(format!("Run {} not found", run_id)))
    }

    async fn list_runs(&self, limit: i64) -> Result<Vec<PipelineRunModel>> {
        self.check_available()?;
        let mut runs: Vec<PipelineRunModel> =
            self.inner.read().await.runs.values().cloned().collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit.max(0) as usize);
        Ok(runs)
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn record_checkpoint(
        &self,
        run_id: RunId,
        entity_id: EntityId,
        stage: Stage,
        status: CheckpointStatus,
        metadata: serde_json::Value,
    ) -> Result<CheckpointModel> {
        self.check_available()?;
        let metadata = normalize_metadata(metadata)?;

        let mut inner = self.inner.write().await;
        inner.ensure_run(run_id)?;

        let key = (run_id.as_uuid(), entity_id.get(), stage);
        let now = Utc::now();
        if let Some(existing) = inner.checkpoints.get_mut(&key) {
            existing.status = status.as_str().to_string();
            existing.metadata = Json(metadata);
            existing.updated_at = now;
            return Ok(existing.clone());
        }

        let checkpoint = CheckpointModel {
            id: inner.next_id(),
            run_id: run_id.as_uuid(),
            entity_id: entity_id.get(),
            stage_name: stage.as_str().to_string(),
            status: status.as_str().to_string(),
            metadata: Json(metadata),
            created_at: now,
            updated_at: now,
        };
        inner.checkpoints.insert(key, checkpoint.clone());
        Ok(checkpoint)
    }

    async fn get_checkpoint(
        &self,
        run_id: RunId,
        entity_id: EntityId,
        stage: Stage,
    ) -> Result<Option<CheckpointModel>> {
        self.check_available()?;
        Ok(self
            .inner
            .read()
            .await
            .checkpoints
            .get(&(run_id.as_uuid(), entity_id.get(), stage))
            .cloned())
    }

    async fn request_retry(
        &self,
        run_id: RunId,
        entity_id: EntityId,
        stage: Stage,
    ) -> Result<Option<CheckpointModel>> {
        self.check_available()?;

        let mut inner = self.inner.write().await;
        let run = inner
            .runs
            .get(&run_id.as_uuid())
            .ok_or_else(|| crate::Error::NotFound(format!("Run {} not found", run_id)))?;
        if run.status != RunStatus::Running.as_str() {
            return Err(crate::Error::Conflict(format!(
                "Run {} already finished as {}",
                run_id, run.status
            )));
        }

        let Some(checkpoint) = inner
            .checkpoints
            .get_mut(&(run_id.as_uuid(), entity_id.get(), stage))
            .filter(|c| c.status == CheckpointStatus::Failed.as_str())
        else {
            return Ok(None);
        };

        let now = Utc::now();
        if let Some(metadata) = checkpoint.metadata.0.as_object_mut() {
            let previous = metadata.remove("error").unwrap_or(serde_json::Value::Null);
            metadata.insert("previous_error".to_string(), previous);
            metadata.insert(
                "retry_requested_at".to_string(),
                serde_json::Value::String(now.to_rfc3339()),
            );
        }
        checkpoint.status = CheckpointStatus::Pending.as_str().to_string();
        checkpoint.updated_at = now;
        Ok(Some(checkpoint.clone()))
    }

    async fn list_entity_checkpoints(
        &self,
        run_id: RunId,
        entity_id: EntityId,
    ) -> Result<Vec<CheckpointModel>> {
        self.check_available()?;
        let run = run_id.as_uuid();
        let entity = entity_id.get();
        Ok(self
            .inner
            .read()
            .await
            .checkpoints
            .range((run, entity, Stage::first())..=(run, entity, Stage::last()))
            .map(|(_, checkpoint)| checkpoint.clone())
            .collect())
    }

    async fn list_checkpoints(&self, run_id: RunId) -> Result<Vec<CheckpointModel>> {
        self.check_available()?;
        let run = run_id.as_uuid();
        Ok(self
            .inner
            .read()
            .await
            .checkpoints
            .iter()
            .filter(|((r, _, _), _)| *r == run)
            .map(|(_, checkpoint)| checkpoint.clone())
            .collect())
    }
}

#[async_trait]
impl DataTrackingStore for MemoryStore {
    async fn record_counts(
        &self,
        run_id: RunId,
        entity_id: EntityId,
        counts: &SectionCounts,
        metadata: serde_json::Value,
    ) -> Result<DataTrackingModel> {
        self.check_available()?;
        let metadata = normalize_metadata(metadata)?;

        let mut inner = self.inner.write().await;
        inner.ensure_run(run_id)?;

        let key = (run_id.as_uuid(), entity_id.get());
        let now = Utc::now();
        if !inner.tracking.contains_key(&key) {
            let id = inner.next_id();
            inner.tracking.insert(
                key,
                DataTrackingModel {
                    id,
                    run_id: run_id.as_uuid(),
                    entity_id: entity_id.get(),
                    hero_images_count: None,
                    reviews_count: None,
                    tips_count: None,
                    social_videos_count: None,
                    nearby_attractions_count: None,
                    audience_profiles_count: None,
                    metadata: Json(serde_json::json!({})),
                    created_at: now,
                    updated_at: now,
                },
            );
        }

        let record = inner
            .tracking
            .get_mut(&key)
            .ok_or_else(|| crate::Error::Internal("tracking record vanished".to_string()))?;

        for (section, count) in counts.iter() {
            let slot = record.count_mut(section);
            *slot = Some(slot.map_or(count, |existing| existing.max(count)));
        }
        if let (Some(stored), serde_json::Value::Object(patch)) =
            (record.metadata.0.as_object_mut(), metadata)
        {
            stored.extend(patch);
        }
        record.updated_at = now;

        Ok(record.clone())
    }

    async fn get_tracking(
        &self,
        run_id: RunId,
        entity_id: EntityId,
    ) -> Result<Option<DataTrackingModel>> {
        self.check_available()?;
        Ok(self
            .inner
            .read()
            .await
            .tracking
            .get(&(run_id.as_uuid(), entity_id.get()))
            .cloned())
    }

    async fn list_tracking(&self, run_id: RunId) -> Result<Vec<DataTrackingModel>> {
        self.check_available()?;
        let run = run_id.as_uuid();
        Ok(self
            .inner
            .read()
            .await
            .tracking
            .iter()
            .filter(|((r, _), _)| *r == run)
            .map(|(_, record)| record.clone())
            .collect())
    }
}
