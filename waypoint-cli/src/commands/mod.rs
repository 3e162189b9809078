//! CLI command implementations

pub mod migrate;
pub mod resume;
pub mod runs;
pub mod start;
pub mod status;
pub mod stop;
pub mod tracking;
