//! Test data factories for waypoint types

use waypoint_core::{EntityId, Section, SectionCounts, Stage};
use waypoint_runtime::StageReport;

/// Item count the default report gives every tracked section
pub const DEFAULT_SECTION_COUNT: i64 = 3;

/// Entity ids from raw integers
pub fn entities(ids: &[i64]) -> Vec<EntityId> {
    ids.iter().copied().map(EntityId).collect()
}

/// Successful report of a stage; stages that own a tracked section report
/// [`DEFAULT_SECTION_COUNT`] items for it
pub fn completed_report(stage: Stage) -> StageReport {
    match Section::owned_by(stage) {
        Some(section) => StageReport::completed()
            .with_counts(SectionCounts::new().with(section, DEFAULT_SECTION_COUNT)),
        None => StageReport::completed(),
    }
}

/// Successful report carrying `count` items for the stage's own section
pub fn report_with_count(stage: Stage, count: i64) -> StageReport {
    match Section::owned_by(stage) {
        Some(section) => {
            StageReport::completed().with_counts(SectionCounts::new().with(section, count))
        }
        None => StageReport::completed(),
    }
}

/// The first `n` stages in execution order
pub fn first_stages(n: usize) -> &'static [Stage] {
    &Stage::all()[..n]
}
