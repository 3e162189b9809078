//! End-to-end pipeline properties
//!
//! Every test drives runs through the real dispatcher, orchestrator and
//! worker pool over the in-memory store and control plane, with a scripted
//! stage executor standing in for the section fetchers.

use serde_json::json;
use std::time::Duration;
use waypoint_core::{
    CheckpointStatus, EntityId, EntityState, RunStatus, Section, SectionCounts, Stage,
};
use waypoint_runtime::{ResumeMode, SeededUnit};
use waypoint_storage::{CheckpointStore, DataTrackingStore, RunRegistry};
use waypoint_tests::assertions::{
    assert_entity_completed, assert_entity_stalled_at, assert_unique_checkpoints, ledger,
};
use waypoint_tests::fixtures::{entities, first_stages, report_with_count, DEFAULT_SECTION_COUNT};
use waypoint_tests::PipelineHarness;

#[tokio::test]
async fn full_run_completes_every_stage_in_order() {
    let harness = PipelineHarness::start();
    let ids = entities(&[1, 2, 3]);

    let run_id = harness
        .orchestrator
        .start_pipeline(&ids, json!({"trigger": "test"}))
        .await
        .unwrap();
    assert_eq!(harness.wait_for_terminal(run_id).await, RunStatus::Completed);

    let checkpoints = harness.store.list_checkpoints(run_id).await.unwrap();
    assert_eq!(checkpoints.len(), 30);
    assert_unique_checkpoints(&checkpoints);
    for id in &ids {
        assert_entity_completed(&checkpoints, *id);
        assert_eq!(
            harness.executor.stages_invoked(run_id, *id),
            Stage::all().to_vec()
        );
    }

    let report = harness.orchestrator.get_run_status(run_id).await.unwrap();
    assert_eq!(report.summary.completed, 3);
    assert!(report.completed_at.is_some());

    harness.shutdown().await;
}

#[tokio::test]
async fn stage_failure_stalls_only_the_failing_entity() {
    let mut harness = PipelineHarness::idle();
    let (a, b, c) = (EntityId(1), EntityId(2), EntityId(3));
    harness.executor.fail(b, Stage::Tips, "timeout");
    harness.start_workers();

    let run_id = harness
        .orchestrator
        .start_pipeline(&[a, b, c], json!({}))
        .await
        .unwrap();
    assert_eq!(
        harness.wait_for_terminal(run_id).await,
        RunStatus::PartialFailure
    );

    let checkpoints = harness.store.list_checkpoints(run_id).await.unwrap();
    assert_entity_completed(&checkpoints, a);
    assert_entity_stalled_at(&checkpoints, b, Stage::Tips);
    assert_entity_completed(&checkpoints, c);
    assert_eq!(
        harness.executor.stages_invoked(run_id, b),
        first_stages(5).to_vec()
    );

    let report = harness.orchestrator.get_run_status(run_id).await.unwrap();
    let b_progress = report.entities.iter().find(|e| e.entity_id == b).unwrap();
    assert_eq!(b_progress.state, EntityState::Failed(Stage::Tips));
    assert_eq!(b_progress.current_stage_number, Some(5));
    assert_eq!(b_progress.error.as_deref(), Some("timeout"));
    assert_eq!(report.summary.stalled, 1);
    assert_eq!(report.summary.completed, 2);

    // Only the stages B actually executed left counters behind
    let tracking = harness
        .store
        .get_tracking(run_id, b)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        tracking.counts(),
        SectionCounts::new().with(Section::HeroImages, DEFAULT_SECTION_COUNT)
    );

    harness.shutdown().await;
}

#[tokio::test]
async fn transient_failures_are_retried_without_duplicate_checkpoints() {
    let mut harness = PipelineHarness::idle();
    let (a, b) = (EntityId(1), EntityId(2));
    harness.executor.flaky(a, Stage::Reviews, 2);
    harness.executor.flaky(b, Stage::Weather, 3);
    harness.start_workers();

    let run_id = harness
        .orchestrator
        .start_pipeline(&[a, b], json!({}))
        .await
        .unwrap();
    assert_eq!(
        harness.wait_for_terminal(run_id).await,
        RunStatus::PartialFailure
    );

    let checkpoints = harness.store.list_checkpoints(run_id).await.unwrap();
    assert_unique_checkpoints(&checkpoints);
    assert_entity_completed(&checkpoints, a);
    assert_entity_stalled_at(&checkpoints, b, Stage::Weather);

    let attempts: Vec<u32> = harness
        .executor
        .invocations()
        .iter()
        .filter(|ctx| ctx.entity_id == a && ctx.stage == Stage::Reviews)
        .map(|ctx| ctx.attempt)
        .collect();
    assert_eq!(attempts, vec![1, 2, 3]);

    let failed = harness
        .store
        .get_checkpoint(run_id, b, Stage::Weather)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failed.metadata.0["attempts"], 3);
    assert_eq!(failed.metadata.0["kind"], "transient");

    harness.shutdown().await;
}

#[tokio::test]
async fn resume_after_crash_continues_from_the_next_stage() {
    let mut harness = PipelineHarness::idle();
    let (a, b) = (EntityId(1), EntityId(2));

    // A process died after A's fourth stage; B had already finished
    let run = harness.store.create_run(&[a, b], json!({})).await.unwrap();
    let run_id = run.run_id();
    for stage in first_stages(4) {
        harness
            .store
            .record_checkpoint(run_id, a, *stage, CheckpointStatus::Completed, json!({}))
            .await
            .unwrap();
    }
    for stage in Stage::all() {
        harness
            .store
            .record_checkpoint(run_id, b, *stage, CheckpointStatus::Completed, json!({}))
            .await
            .unwrap();
    }

    harness.start_workers();
    let report = harness
        .orchestrator
        .resume_run(run_id, ResumeMode::PendingOnly)
        .await
        .unwrap();
    assert_eq!(
        report.seeded,
        vec![SeededUnit {
            entity_id: a,
            stage: Stage::Tips,
            retry: false
        }]
    );

    assert_eq!(harness.wait_for_terminal(run_id).await, RunStatus::Completed);
    assert_eq!(
        harness.executor.stages_invoked(run_id, a),
        Stage::all()[4..].to_vec()
    );
    assert!(harness.executor.stages_invoked(run_id, b).is_empty());

    let checkpoints = harness.store.list_checkpoints(run_id).await.unwrap();
    assert_entity_completed(&checkpoints, a);
    assert_entity_completed(&checkpoints, b);

    harness.shutdown().await;
}

/// Run with A untouched and B stalled at tips after four completed stages
async fn interrupted_run(harness: &PipelineHarness) -> waypoint_core::RunId {
    let (a, b) = (EntityId(1), EntityId(2));
    let run = harness.store.create_run(&[a, b], json!({})).await.unwrap();
    let run_id = run.run_id();

    for stage in first_stages(4) {
        harness
            .store
            .record_checkpoint(run_id, b, *stage, CheckpointStatus::Completed, json!({}))
            .await
            .unwrap();
    }
    harness
        .store
        .record_checkpoint(
            run_id,
            b,
            Stage::Tips,
            CheckpointStatus::Failed,
            json!({"error": "timeout"}),
        )
        .await
        .unwrap();
    harness
        .store
        .record_counts(
            run_id,
            b,
            &SectionCounts::new().with(Section::HeroImages, 8),
            json!({}),
        )
        .await
        .unwrap();

    run_id
}

#[tokio::test]
async fn pending_only_resume_leaves_stalled_entities_alone() {
    let mut harness = PipelineHarness::idle();
    let run_id = interrupted_run(&harness).await;
    harness.start_workers();

    let report = harness
        .orchestrator
        .resume_run(run_id, ResumeMode::PendingOnly)
        .await
        .unwrap();
    assert_eq!(report.stalled_skipped, 1);
    assert_eq!(
        report.seeded,
        vec![SeededUnit {
            entity_id: EntityId(1),
            stage: Stage::Metadata,
            retry: false
        }]
    );

    assert_eq!(
        harness.wait_for_terminal(run_id).await,
        RunStatus::PartialFailure
    );
    assert!(harness
        .executor
        .stages_invoked(run_id, EntityId(2))
        .is_empty());

    harness.shutdown().await;
}

#[tokio::test]
async fn retry_failed_resume_completes_stalled_entity_without_regressing_counts() {
    let mut harness = PipelineHarness::idle();
    let b = EntityId(2);
    let run_id = interrupted_run(&harness).await;
    harness
        .executor
        .script(b, Stage::Tips, Ok(report_with_count(Stage::Tips, 4)));
    harness.start_workers();

    let before = harness
        .store
        .get_tracking(run_id, b)
        .await
        .unwrap()
        .unwrap()
        .counts();

    let report = harness
        .orchestrator
        .resume_run(run_id, ResumeMode::RetryFailed)
        .await
        .unwrap();
    assert_eq!(report.stalled_skipped, 0);
    assert!(report.seeded.contains(&SeededUnit {
        entity_id: b,
        stage: Stage::Tips,
        retry: true
    }));

    assert_eq!(harness.wait_for_terminal(run_id).await, RunStatus::Completed);
    assert_eq!(
        harness.executor.stages_invoked(run_id, b),
        Stage::all()[4..].to_vec()
    );

    let checkpoints = harness.store.list_checkpoints(run_id).await.unwrap();
    assert_eq!(
        ledger(&checkpoints, b)[4],
        (Stage::Tips, CheckpointStatus::Completed)
    );

    let after = harness
        .store
        .get_tracking(run_id, b)
        .await
        .unwrap()
        .unwrap()
        .counts();
    for (section, count) in before.iter() {
        assert!(after.get(section).unwrap() >= count, "{} regressed", section);
    }
    assert_eq!(after.get(Section::HeroImages), Some(8));
    assert_eq!(after.get(Section::Tips), Some(4));
    assert_eq!(after.get(Section::Reviews), Some(DEFAULT_SECTION_COUNT));

    harness.shutdown().await;
}

#[tokio::test]
async fn duplicate_units_after_a_failure_do_not_rerun_the_stage() {
    let mut harness = PipelineHarness::idle();
    let a = EntityId(1);
    harness.executor.fail(a, Stage::Metadata, "bad place id");

    let run = harness.store.create_run(&[a], json!({})).await.unwrap();
    let run_id = run.run_id();
    // Two plain units for the same stage, as from overlapping resumes
    for _ in 0..2 {
        harness
            .orchestrator
            .resume_run(run_id, ResumeMode::PendingOnly)
            .await
            .unwrap();
    }
    assert_eq!(harness.control.peek("stage:metadata").len(), 2);
    harness.start_workers();

    assert_eq!(
        harness.wait_for_terminal(run_id).await,
        RunStatus::PartialFailure
    );
    harness
        .wait_until("the metadata queue to drain", |h| {
            h.control.peek("stage:metadata").is_empty()
        })
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(harness.executor.stages_invoked(run_id, a), vec![Stage::Metadata]);
    let checkpoints = harness.store.list_checkpoints(run_id).await.unwrap();
    assert_entity_stalled_at(&checkpoints, a, Stage::Metadata);

    harness.shutdown().await;
}

#[tokio::test]
async fn retry_failed_resume_is_not_lost_to_a_racing_finalize() {
    let mut harness = PipelineHarness::idle();
    let (a, b) = (EntityId(1), EntityId(2));
    let run = harness.store.create_run(&[a, b], json!({})).await.unwrap();
    let run_id = run.run_id();

    harness
        .store
        .record_checkpoint(
            run_id,
            a,
            Stage::Metadata,
            CheckpointStatus::Failed,
            json!({"error": "bad place id"}),
        )
        .await
        .unwrap();
    for stage in first_stages(9) {
        harness
            .store
            .record_checkpoint(run_id, b, *stage, CheckpointStatus::Completed, json!({}))
            .await
            .unwrap();
    }
    harness
        .store
        .record_checkpoint(
            run_id,
            b,
            Stage::Audiences,
            CheckpointStatus::Failed,
            json!({"error": "timeout"}),
        )
        .await
        .unwrap();

    // B's retry finishes, and asks for finalization, long before A's does
    harness
        .executor
        .delay(a, Stage::Metadata, Duration::from_millis(300));
    let report = harness
        .orchestrator
        .resume_run(run_id, ResumeMode::RetryFailed)
        .await
        .unwrap();
    assert!(report.seeded.iter().all(|unit| unit.retry));
    harness.start_workers();

    assert_eq!(harness.wait_for_terminal(run_id).await, RunStatus::Completed);
    assert_eq!(harness.executor.stages_invoked(run_id, b), vec![Stage::Audiences]);
    assert_eq!(
        harness.executor.stages_invoked(run_id, a),
        Stage::all().to_vec()
    );

    let checkpoints = harness.store.list_checkpoints(run_id).await.unwrap();
    assert_entity_completed(&checkpoints, a);
    assert_entity_completed(&checkpoints, b);

    harness.shutdown().await;
}

#[tokio::test]
async fn retry_failed_unit_survives_a_storage_outage() {
    let mut harness = PipelineHarness::idle();
    let b = EntityId(2);
    let run_id = interrupted_run(&harness).await;

    harness
        .orchestrator
        .resume_run(run_id, ResumeMode::RetryFailed)
        .await
        .unwrap();
    harness.store.set_unavailable(true);
    harness.start_workers();
    tokio::time::sleep(Duration::from_millis(100)).await;
    harness.store.set_unavailable(false);

    assert_eq!(harness.wait_for_terminal(run_id).await, RunStatus::Completed);
    assert_eq!(
        harness.executor.stages_invoked(run_id, b),
        Stage::all()[4..].to_vec()
    );

    harness.shutdown().await;
}

#[tokio::test]
async fn hard_stop_does_not_leak_into_the_next_run() {
    let mut harness = PipelineHarness::idle();
    harness
        .executor
        .delay(EntityId(1), Stage::Metadata, Duration::from_secs(30));
    harness.start_workers();

    let stopped_run = harness
        .orchestrator
        .start_pipeline(&entities(&[1]), json!({}))
        .await
        .unwrap();
    harness
        .wait_until("the first metadata call", |h| {
            h.executor.invocation_count(stopped_run) == 1
        })
        .await;

    let stop = harness.orchestrator.stop_pipeline().await.unwrap();
    assert_eq!(stop.epoch, 1);

    let fresh_run = harness
        .orchestrator
        .start_pipeline(&entities(&[2]), json!({}))
        .await
        .unwrap();
    assert_eq!(
        harness.wait_for_terminal(fresh_run).await,
        RunStatus::Completed
    );

    // The interrupted run made no progress and waits for a resume
    let stopped = harness.orchestrator.get_run_status(stopped_run).await.unwrap();
    assert_eq!(stopped.status, RunStatus::Running);
    assert!(harness
        .store
        .list_checkpoints(stopped_run)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(harness.executor.invocation_count(stopped_run), 1);

    let checkpoints = harness.store.list_checkpoints(fresh_run).await.unwrap();
    assert_eq!(checkpoints.len(), 10);
    assert_entity_completed(&checkpoints, EntityId(2));

    harness.shutdown().await;
}

#[tokio::test]
async fn storage_outage_delays_but_does_not_break_a_run() {
    let harness = PipelineHarness::start();
    let ids = entities(&[1, 2, 3]);

    let run_id = harness
        .orchestrator
        .start_pipeline(&ids, json!({}))
        .await
        .unwrap();
    harness
        .wait_until("the first stage call", |h| h.executor.invocation_count(run_id) > 0)
        .await;

    harness.store.set_unavailable(true);
    tokio::time::sleep(Duration::from_millis(100)).await;
    harness.store.set_unavailable(false);

    assert_eq!(harness.wait_for_terminal(run_id).await, RunStatus::Completed);

    let checkpoints = harness.store.list_checkpoints(run_id).await.unwrap();
    assert_unique_checkpoints(&checkpoints);
    for id in &ids {
        assert_entity_completed(&checkpoints, *id);
    }

    harness.shutdown().await;
}
