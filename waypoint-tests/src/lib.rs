//! Shared test utilities for waypoint crates
//!
//! This crate provides:
//! - **Fixtures**: entity sets and stage reports with sensible defaults
//! - **Mocks**: a scripted stage executor that records every invocation
//! - **Harness**: in-memory store, control plane and worker pool wired together
//! - **Assertions**: checks over checkpoint ledgers
//!
//! # Example
//!
//! ```ignore
//! use waypoint_tests::{fixtures, PipelineHarness};
//!
//! #[tokio::test]
//! async fn test_run() {
//!     let harness = PipelineHarness::start();
//!     let run_id = harness
//!         .orchestrator
//!         .start_pipeline(&fixtures::entities(&[1, 2]), serde_json::json!({}))
//!         .await
//!         .unwrap();
//!     harness.wait_for_terminal(run_id).await;
//!     harness.shutdown().await;
//! }
//! ```

pub mod assertions;
pub mod fixtures;
pub mod harness;
pub mod mocks;

// Re-export commonly used items
pub use harness::PipelineHarness;
pub use mocks::ScriptedExecutor;
