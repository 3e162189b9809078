//! Database models for pipeline state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;
use waypoint_core::{
    CheckpointStatus, EntityId, RunId, RunStatus, Section, SectionCounts, Stage,
};

/// Pipeline run model for database storage
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PipelineRunModel {
    pub id: Uuid,
    pub status: String,
    /// Entities the run was started for
    pub entity_ids: Json<Vec<i64>>,
    pub metadata: Json<serde_json::Value>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineRunModel {
    pub fn run_id(&self) -> RunId {
        RunId(self.id)
    }

    pub fn run_status(&self) -> crate::Result<RunStatus> {
        Ok(self.status.parse()?)
    }

    pub fn entities(&self) -> Vec<EntityId> {
        self.entity_ids.0.iter().copied().map(EntityId).collect()
    }
}

/// Checkpoint model: outcome of one (run, entity, stage) triple
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CheckpointModel {
    pub id: i64,
    pub run_id: Uuid,
    pub entity_id: i64,
    pub stage_name: String,
    pub status: String,
    pub metadata: Json<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CheckpointModel {
    pub fn entity(&self) -> EntityId {
        EntityId(self.entity_id)
    }

    pub fn stage(&self) -> crate::Result<Stage> {
        Ok(self.stage_name.parse()?)
    }

    pub fn checkpoint_status(&self) -> crate::Result<CheckpointStatus> {
        Ok(self.status.parse()?)
    }

    /// Error message recorded with a failed checkpoint
    pub fn error_message(&self) -> Option<&str> {
        self.metadata.0.get("error").and_then(|v| v.as_str())
    }
}

/// Data tracking model: audit counters for one (run, entity) pair.
///
/// A `None` counter means the owning stage has not reported yet.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DataTrackingModel {
    pub id: i64,
    pub run_id: Uuid,
    pub entity_id: i64,
    pub hero_images_count: Option<i64>,
    pub reviews_count: Option<i64>,
    pub tips_count: Option<i64>,
    pub social_videos_count: Option<i64>,
    pub nearby_attractions_count: Option<i64>,
    pub audience_profiles_count: Option<i64>,
    pub metadata: Json<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DataTrackingModel {
    pub fn entity(&self) -> EntityId {
        EntityId(self.entity_id)
    }

    pub fn count(&self, section: Section) -> Option<i64> {
        match section {
            Section::HeroImages => self.hero_images_count,
            Section::Reviews => self.reviews_count,
            Section::Tips => self.tips_count,
            Section::SocialVideos => self.social_videos_count,
            Section::NearbyAttractions => self.nearby_attractions_count,
            Section::AudienceProfiles => self.audience_profiles_count,
        }
    }

    pub(crate) fn count_mut(&mut self, section: Section) -> &mut Option<i64> {
        match section {
            Section::HeroImages => &mut self.hero_images_count,
            Section::Reviews => &mut self.reviews_count,
            Section::Tips => &mut self.tips_count,
            Section::SocialVideos => &mut self.social_videos_count,
            Section::NearbyAttractions => &mut self.nearby_attractions_count,
            Section::AudienceProfiles => &mut self.audience_profiles_count,
        }
    }

    /// Counters that have been reported, as a sparse map
    pub fn counts(&self) -> SectionCounts {
        Section::all()
            .iter()
            .filter_map(|section| self.count(*section).map(|c| (*section, c)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracking() -> DataTrackingModel {
        DataTrackingModel {
            id: 1,
            run_id: Uuid::new_v4(),
            entity_id: 9,
            hero_images_count: Some(4),
            reviews_count: None,
            tips_count: Some(0),
            social_videos_count: None,
            nearby_attractions_count: None,
            audience_profiles_count: None,
            metadata: Json(serde_json::json!({})),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_counts_are_sparse() {
        let counts = tracking().counts();
        assert_eq!(counts.get(Section::HeroImages), Some(4));
        assert_eq!(counts.get(Section::Tips), Some(0));
        assert_eq!(counts.get(Section::Reviews), None);
        assert_eq!(counts.len(), 2);
    }

    #[test]
    fn test_checkpoint_error_message() {
        let checkpoint = CheckpointModel {
            id: 1,
            run_id: Uuid::new_v4(),
            entity_id: 2,
            stage_name: "weather".to_string(),
            status: "failed".to_string(),
            metadata: Json(serde_json::json!({"error": "timeout"})),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(checkpoint.error_message(), Some("timeout"));
        assert_eq!(checkpoint.stage().unwrap(), Stage::Weather);
        assert_eq!(
            checkpoint.checkpoint_status().unwrap(),
            CheckpointStatus::Failed
        );
    }
}
