//! Data sections tracked per entity and the counters reported for them

use crate::Stage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// A data section whose item count is tracked for auditing
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    HeroImages,
    Reviews,
    Tips,
    SocialVideos,
    NearbyAttractions,
    AudienceProfiles,
}

impl Section {
    pub fn all() -> &'static [Section] {
        &[
            Section::HeroImages,
            Section::Reviews,
            Section::Tips,
            Section::SocialVideos,
            Section::NearbyAttractions,
            Section::AudienceProfiles,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Section::HeroImages => "hero_images",
            Section::Reviews => "reviews",
            Section::Tips => "tips",
            Section::SocialVideos => "social_videos",
            Section::NearbyAttractions => "nearby_attractions",
            Section::AudienceProfiles => "audience_profiles",
        }
    }

    /// The only stage allowed to write this section's counter
    pub fn owner(&self) -> Stage {
        match self {
            Section::HeroImages => Stage::HeroImages,
            Section::Reviews => Stage::Reviews,
            Section::Tips => Stage::Tips,
            Section::SocialVideos => Stage::SocialVideos,
            Section::NearbyAttractions => Stage::Nearby,
            Section::AudienceProfiles => Stage::Audiences,
        }
    }

    /// Section owned by a stage, if the stage produces a tracked section
    pub fn owned_by(stage: Stage) -> Option<Section> {
        Self::all().iter().copied().find(|s| s.owner() == stage)
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Section {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::all()
            .iter()
            .copied()
            .find(|section| section.as_str() == s)
            .ok_or_else(|| crate::Error::UnknownSection(s.to_string()))
    }
}

/// Sparse set of section counters.
///
/// Sections absent from the map are "not reported", which is different from
/// a reported count of zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SectionCounts(BTreeMap<Section, i64>);

impl SectionCounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter
    pub fn with(mut self, section: Section, count: i64) -> Self {
        self.set(section, count);
        self
    }

    /// Set a counter. Negative counts are clamped to zero.
    pub fn set(&mut self, section: Section, count: i64) {
        self.0.insert(section, count.max(0));
    }

    pub fn get(&self, section: Section) -> Option<i64> {
        self.0.get(&section).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Section, i64)> + '_ {
        self.0.iter().map(|(s, c)| (*s, *c))
    }

    /// Sum of all reported counters
    pub fn total(&self) -> i64 {
        self.0.values().fold(0i64, |total, count| total.saturating_add(*count))
    }

    /// Merge-patch another set of counters into this one.
    ///
    /// Only sections present in `other` are touched, and a touched counter
    /// never decreases.
    pub fn merge(&mut self, other: &SectionCounts) {
        for (section, count) in other.iter() {
            let entry = self.0.entry(section).or_insert(0);
            *entry = (*entry).max(count);
        }
    }

    /// Add another set of counters (used for run-wide totals)
    pub fn accumulate(&mut self, other: &SectionCounts) {
        for (section, count) in other.iter() {
            let entry = self.0.entry(section).or_insert(0);
            *entry = entry.saturating_add(count);
        }
    }

    /// Split into counters owned by `stage` and counters it may not write
    pub fn partition_by_owner(self, stage: Stage) -> (SectionCounts, Vec<Section>) {
        let mut owned = SectionCounts::new();
        let mut foreign = Vec::new();
        for (section, count) in self.0 {
            if section.owner() == stage {
                owned.0.insert(section, count);
            } else {
                foreign.push(section);
            }
        }
        (owned, foreign)
    }
}

impl FromIterator<(Section, i64)> for SectionCounts {
    fn from_iter<T: IntoIterator<Item = (Section, i64)>>(iter: T) -> Self {
        let mut counts = SectionCounts::new();
        for (section, count) in iter {
            counts.set(section, count);
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_section_has_a_distinct_owner() {
        let mut owners: Vec<Stage> = Section::all().iter().map(|s| s.owner()).collect();
        owners.sort();
        owners.dedup();
        assert_eq!(owners.len(), Section::all().len());
        assert_eq!(Section::owned_by(Stage::Nearby), Some(Section::NearbyAttractions));
        assert_eq!(Section::owned_by(Stage::Weather), None);
    }

    #[test]
    fn test_merge_is_sparse_and_never_regresses() {
        let mut stored = SectionCounts::new()
            .with(Section::Reviews, 10)
            .with(Section::Tips, 4);

        stored.merge(&SectionCounts::new().with(Section::Reviews, 3));
        assert_eq!(stored.get(Section::Reviews), Some(10));
        assert_eq!(stored.get(Section::Tips), Some(4));

        stored.merge(&SectionCounts::new().with(Section::HeroImages, 5));
        assert_eq!(stored.get(Section::HeroImages), Some(5));
        assert_eq!(stored.len(), 3);
    }

    #[test]
    fn test_merge_order_does_not_matter() {
        let a = SectionCounts::new().with(Section::Tips, 2);
        let b = SectionCounts::new()
            .with(Section::Tips, 5)
            .with(Section::Reviews, 1);

        let mut ab = SectionCounts::new();
        ab.merge(&a);
        ab.merge(&b);

        let mut ba = SectionCounts::new();
        ba.merge(&b);
        ba.merge(&a);

        assert_eq!(ab, ba);
    }

    #[test]
    fn test_negative_counts_are_clamped() {
        let counts = SectionCounts::new().with(Section::Tips, -3);
        assert_eq!(counts.get(Section::Tips), Some(0));
    }

    #[test]
    fn test_large_counts_saturate_instead_of_overflowing() {
        let huge = SectionCounts::new()
            .with(Section::Reviews, i64::MAX - 1)
            .with(Section::Tips, i64::MAX);
        assert_eq!(huge.total(), i64::MAX);

        let mut totals = SectionCounts::new();
        totals.accumulate(&huge);
        totals.accumulate(&SectionCounts::new().with(Section::Reviews, 5));
        assert_eq!(totals.get(Section::Reviews), Some(i64::MAX));
        assert_eq!(totals.get(Section::Tips), Some(i64::MAX));
    }

    #[test]
    fn test_partition_by_owner() {
        let reported = SectionCounts::new()
            .with(Section::Reviews, 8)
            .with(Section::Tips, 2);
        let (owned, foreign) = reported.partition_by_owner(Stage::Reviews);
        assert_eq!(owned.get(Section::Reviews), Some(8));
        assert_eq!(owned.get(Section::Tips), None);
        assert_eq!(foreign, vec![Section::Tips]);
    }

    #[test]
    fn test_serializes_as_section_map() {
        let counts = SectionCounts::new().with(Section::SocialVideos, 3);
        let json = serde_json::to_value(&counts).unwrap();
        assert_eq!(json, serde_json::json!({"social_videos": 3}));
    }
}
