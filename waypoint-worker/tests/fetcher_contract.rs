//! Admin API and fetcher contract tests
//!
//! Drive a whole run through the admin routes with the HTTP stage executor
//! talking to a mocked fetcher service. Storage and control plane are the
//! in-memory implementations, so no database or redis is needed.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use waypoint_runtime::{
    ConcurrencyConfig, Dispatcher, DispatcherConfig, MemoryControlPlane, PipelineOrchestrator,
    RetryPolicy, WorkerPool, WorkerPoolConfig,
};
use waypoint_storage::MemoryStore;
use waypoint_worker::handler::{router, AppState, ADMIN_KEY_HEADER};
use waypoint_worker::http_executor::HttpStageExecutor;
use wiremock::{
    matchers::{body_partial_json, method, path, path_regex},
    Mock, MockServer, ResponseTemplate,
};

const KEY: &str = "contract-key";

async fn fetcher() -> MockServer {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/stages/tips"))
        .and(body_partial_json(json!({"entity_id": 2})))
        .respond_with(ResponseTemplate::new(422).set_body_string("no subreddit for attraction"))
        .with_priority(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/stages/reviews"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "outcome": "completed",
            "counts": {"reviews": 5}
        })))
        .with_priority(2)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path_regex("^/stages/[a-z_]+$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"outcome": "completed"})))
        .mount(&server)
        .await;

    server
}

fn start_worker(fetcher_url: String) -> (Router, WorkerPool) {
    let store = Arc::new(MemoryStore::new());
    let control = Arc::new(MemoryControlPlane::new());
    let executor = Arc::new(HttpStageExecutor::new(fetcher_url, Duration::from_secs(5)).unwrap());

    let orchestrator = PipelineOrchestrator::new(store.clone(), control.clone());
    let dispatcher = Dispatcher::new(
        store,
        control,
        executor,
        DispatcherConfig {
            retry: RetryPolicy::immediate(2),
            ..Default::default()
        },
    );
    let pool = WorkerPool::spawn(
        dispatcher,
        orchestrator.clone(),
        WorkerPoolConfig {
            concurrency: ConcurrencyConfig::default().with_orchestration(2),
            poll_interval: Duration::from_millis(10),
            redelivery_backoff: Duration::from_millis(10),
            fence_check_interval: Duration::from_millis(10),
        },
    );

    (router(AppState::new(orchestrator, KEY)), pool)
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header(ADMIN_KEY_HEADER, KEY)
        .header("content-type", "application/json");
    let request = match body {
        Some(body) => request.body(Body::from(body.to_string())).unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

async fn wait_until_finished(app: &Router, run_id: &str) -> Value {
    for _ in 0..500 {
        let (status, body) = call(app, "GET", &format!("/pipeline/runs/{}", run_id), None).await;
        assert_eq!(status, StatusCode::OK);
        if body["status"] != "running" {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run {} did not finish", run_id);
}

#[tokio::test]
async fn run_finishes_with_partial_failure_when_one_entity_stalls() {
    let server = fetcher().await;
    let (app, pool) = start_worker(server.uri());

    let (status, body) = call(
        &app,
        "POST",
        "/pipeline/runs",
        Some(json!({"entity_ids": [1, 2], "metadata": {"trigger": "contract"}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let run_id = body["run_id"].as_str().unwrap().to_string();

    let report = wait_until_finished(&app, &run_id).await;
    assert_eq!(report["status"], "partial_failure");
    assert_eq!(report["metadata"]["trigger"], "contract");
    assert_eq!(report["summary"]["completed"], 1);
    assert_eq!(report["summary"]["stalled"], 1);

    let stalled = report["entities"]
        .as_array()
        .unwrap()
        .iter()
        .find(|e| e["entity_id"] == 2)
        .unwrap();
    assert_eq!(stalled["state"], json!({"state": "failed", "stage": "tips"}));
    assert_eq!(stalled["stages_completed"], 4);
    assert!(stalled["error"].as_str().unwrap().contains("422"));

    // Entity 2 never reached the reviews stage
    let (status, tracking) = call(
        &app,
        "GET",
        &format!("/pipeline/runs/{}/tracking?top=5", run_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(tracking["totals"], json!({"reviews": 5}));
    assert_eq!(tracking["total_entities"], 1);

    pool.shutdown().await;
}

#[tokio::test]
async fn resume_of_finished_run_is_a_conflict() {
    let server = fetcher().await;
    let (app, pool) = start_worker(server.uri());

    let (_, body) = call(&app, "POST", "/pipeline/runs", Some(json!({"entity_ids": [1]}))).await;
    let run_id = body["run_id"].as_str().unwrap().to_string();
    let report = wait_until_finished(&app, &run_id).await;
    assert_eq!(report["status"], "completed");

    let (status, body) = call(
        &app,
        "POST",
        &format!("/pipeline/runs/{}/resume", run_id),
        Some(json!({"mode": "retry_failed"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].is_string());

    pool.shutdown().await;
}

#[tokio::test]
async fn run_listing_shows_started_runs() {
    let server = fetcher().await;
    let (app, pool) = start_worker(server.uri());

    call(&app, "POST", "/pipeline/runs", Some(json!({"entity_ids": [1]}))).await;
    call(&app, "POST", "/pipeline/runs", Some(json!({"entity_ids": [2, 3]}))).await;

    let (status, runs) = call(&app, "GET", "/pipeline/runs?limit=10", None).await;
    assert_eq!(status, StatusCode::OK);
    let counts: Vec<u64> = runs
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["entity_count"].as_u64().unwrap())
        .collect();
    assert_eq!(counts.len(), 2);
    assert!(counts.contains(&1) && counts.contains(&2));

    pool.shutdown().await;
}
