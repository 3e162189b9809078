//! The fixed stage sequence
//!
//! Every entity walks the same ten stages in the same order. A stage is only
//! eligible once its predecessor has a satisfying checkpoint, so the order
//! below is the whole dependency graph of the pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Number of stages in the pipeline
pub const STAGE_COUNT: usize = 10;

/// A pipeline stage, declared in execution order
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Metadata,
    HeroImages,
    BestTime,
    Weather,
    Tips,
    Map,
    Reviews,
    SocialVideos,
    Nearby,
    Audiences,
}

const ORDER: [Stage; STAGE_COUNT] = [
    Stage::Metadata,
    Stage::HeroImages,
    Stage::BestTime,
    Stage::Weather,
    Stage::Tips,
    Stage::Map,
    Stage::Reviews,
    Stage::SocialVideos,
    Stage::Nearby,
    Stage::Audiences,
];

impl Stage {
    /// All stages in execution order
    pub fn all() -> &'static [Stage; STAGE_COUNT] {
        &ORDER
    }

    /// The first stage every entity starts at
    pub fn first() -> Stage {
        ORDER[0]
    }

    /// The last stage of the pipeline
    pub fn last() -> Stage {
        ORDER[STAGE_COUNT - 1]
    }

    /// Zero-based position in the sequence
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// One-based position, as shown to operators
    pub fn number(&self) -> usize {
        self.index() + 1
    }

    /// Stage at a zero-based position
    pub fn from_index(index: usize) -> Option<Stage> {
        ORDER.get(index).copied()
    }

    /// The stage that follows this one, or `None` for the last stage
    pub fn next(&self) -> Option<Stage> {
        Self::from_index(self.index() + 1)
    }

    /// The stage that precedes this one, or `None` for the first stage
    pub fn previous(&self) -> Option<Stage> {
        self.index().checked_sub(1).and_then(Self::from_index)
    }

    pub fn is_last(&self) -> bool {
        self.next().is_none()
    }

    /// Persisted name of the stage
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Metadata => "metadata",
            Stage::HeroImages => "hero_images",
            Stage::BestTime => "best_time",
            Stage::Weather => "weather",
            Stage::Tips => "tips",
            Stage::Map => "map",
            Stage::Reviews => "reviews",
            Stage::SocialVideos => "social_videos",
            Stage::Nearby => "nearby",
            Stage::Audiences => "audiences",
        }
    }

    /// Static properties of the stage
    pub fn descriptor(&self) -> StageDescriptor {
        StageDescriptor::for_stage(*self)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        ORDER
            .iter()
            .copied()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| crate::Error::UnknownStage(s.to_string()))
    }
}

impl TryFrom<&str> for Stage {
    type Error = crate::Error;

    fn try_from(s: &str) -> crate::Result<Self> {
        s.parse()
    }
}

/// Static description of a stage: where its work is queued and which
/// rate-limited external dependency it calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageDescriptor {
    pub stage: Stage,

    /// Name of the external dependency whose calls must be serialized
    /// system-wide, if any
    pub dependency: Option<&'static str>,
}

impl StageDescriptor {
    pub fn for_stage(stage: Stage) -> Self {
        let dependency = match stage {
            Stage::Metadata | Stage::Audiences => Some("gemini"),
            Stage::HeroImages | Stage::Reviews | Stage::Nearby => Some("google_places"),
            Stage::BestTime => Some("besttime"),
            Stage::Weather => Some("openweathermap"),
            Stage::Tips => Some("reddit"),
            Stage::SocialVideos => Some("youtube"),
            Stage::Map => None,
        };

        Self { stage, dependency }
    }

    /// Name of the dispatch queue that carries this stage's work
    pub fn queue_name(&self) -> String {
        format!("stage:{}", self.stage.as_str())
    }

    /// Name of the lock that serializes calls to the stage's dependency
    pub fn lock_name(&self) -> Option<String> {
        self.dependency.map(|dep| format!("dependency:{}", dep))
    }

    pub fn is_rate_limited(&self) -> bool {
        self.dependency.is_some()
    }
}
