//! Redis control plane integration tests
//!
//! ## Running these tests
//! ```bash
//! export TEST_REDIS_URL="redis://localhost:6379/15"
//! cargo test -p waypoint-runtime --test redis_control_plane -- --ignored --test-threads=1
//! ```
//!
//! Each test uses its own key prefix, so the database may be shared.

use std::time::Duration;
use waypoint_core::{EntityId, RunId, Stage};
use waypoint_runtime::{ControlPlane, DispatchUnit, RedisControlPlane, ResumeMode};

async fn control_plane() -> RedisControlPlane {
    let url = std::env::var("TEST_REDIS_URL").expect("TEST_REDIS_URL must be set");
    let prefix = format!("waypoint-test-{}", uuid::Uuid::new_v4());
    RedisControlPlane::connect(&url, prefix)
        .await
        .expect("connect to redis")
}

#[tokio::test]
#[ignore]
async fn test_queue_roundtrip() {
    let control = control_plane().await;
    let run_id = RunId::new();
    let first = DispatchUnit::stage(run_id, EntityId(1), Stage::Reviews, 0);
    let second = DispatchUnit::Seed {
        run_id,
        mode: ResumeMode::RetryFailed,
        epoch: 0,
    };

    control.enqueue(first.clone()).await.unwrap();
    control.enqueue(second.clone()).await.unwrap();

    assert_eq!(control.queue_depth("stage:reviews").await.unwrap(), 1);
    assert_eq!(
        control
            .dequeue("stage:reviews", Duration::ZERO)
            .await
            .unwrap(),
        Some(first)
    );
    assert_eq!(
        control
            .dequeue("orchestration", Duration::from_millis(50))
            .await
            .unwrap(),
        Some(second)
    );
    assert_eq!(
        control
            .dequeue("orchestration", Duration::from_millis(50))
            .await
            .unwrap(),
        None
    );
}

#[tokio::test]
#[ignore]
async fn test_lock_ownership() {
    let control = control_plane().await;
    let lease = control
        .acquire_lock("dependency:google_places", Duration::from_secs(30))
        .await
        .unwrap()
        .expect("lock is free");

    assert!(control
        .acquire_lock("dependency:google_places", Duration::from_secs(30))
        .await
        .unwrap()
        .is_none());
    assert!(control
        .renew_lock(&lease, Duration::from_secs(30))
        .await
        .unwrap());
    assert!(control.release_lock(&lease).await.unwrap());
    assert!(!control.release_lock(&lease).await.unwrap());
}

#[tokio::test]
#[ignore]
async fn test_hard_stop_only_touches_own_prefix() {
    let control = control_plane().await;
    let neighbour = control_plane().await;
    let run_id = RunId::new();

    control
        .enqueue(DispatchUnit::stage(run_id, EntityId(1), Stage::Metadata, 0))
        .await
        .unwrap();
    control
        .enqueue(DispatchUnit::stage(run_id, EntityId(2), Stage::Map, 0))
        .await
        .unwrap();
    control
        .acquire_lock("dependency:gemini", Duration::from_secs(30))
        .await
        .unwrap();
    neighbour
        .enqueue(DispatchUnit::stage(run_id, EntityId(3), Stage::Metadata, 0))
        .await
        .unwrap();

    let report = control.hard_stop().await.unwrap();
    assert_eq!(report.units_discarded, 2);
    assert_eq!(report.locks_cleared, 1);
    assert_eq!(report.epoch, 1);
    assert_eq!(control.epoch().await.unwrap(), 1);
    assert_eq!(control.queue_depth("stage:metadata").await.unwrap(), 0);

    assert_eq!(neighbour.epoch().await.unwrap(), 0);
    assert_eq!(neighbour.queue_depth("stage:metadata").await.unwrap(), 1);

    // Locks are free again after the stop
    assert!(control
        .acquire_lock("dependency:gemini", Duration::from_secs(30))
        .await
        .unwrap()
        .is_some());
}
