use std::path::Path;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use base64::Engine;
use http_body_util::BodyExt;
use tower::ServiceExt;

use sner_api::{create_routes, AppState};
use sner_core::config::{ApiClient, AuthConfig, Role, ServerConfig};
use sner_scheduler::SchedulerService;
use sner_testing_utils::{MockDb, MockSchedulerLock, MockStorageRepository, QueueBuilder};

struct TestApp {
    db: Arc<MockDb>,
    storage: Arc<MockStorageRepository>,
    scheduler: Arc<SchedulerService>,
    state: AppState,
}

fn make_app(var_dir: &Path) -> TestApp {
    let db = MockDb::new();
    let storage = MockStorageRepository::new();

    let config = ServerConfig {
        var_dir: var_dir.to_path_buf(),
        timeout_assign_ms: 50,
        timeout_output_ms: 50,
        ..Default::default()
    };
    let scheduler = Arc::new(SchedulerService::new(
        &config,
        Arc::new(db.queues()),
        Arc::new(db.targets()),
        Arc::new(db.jobs()),
        Arc::new(db.excls()),
        Arc::new(MockSchedulerLock::new()),
    ));

    let auth = AuthConfig {
        clients: vec![
            ApiClient {
                apikey: "agent-key".to_string(),
                role: Role::Agent,
                api_networks: vec![],
            },
            ApiClient {
                apikey: "user-key".to_string(),
                role: Role::User,
                api_networks: vec!["127.0.0.0/8".to_string()],
            },
        ],
    };

    let state = AppState {
        scheduler: Arc::clone(&scheduler),
        queues: Arc::new(db.queues()),
        jobs: Arc::new(db.jobs()),
        storage: Arc::clone(&storage) as Arc<dyn sner_core::traits::StorageRepository>,
        auth: Arc::new(auth),
        stale_horizon_days: 5,
        metrics: None,
    };

    TestApp {
        db,
        storage,
        scheduler,
        state,
    }
}

async fn post_json(
    state: &AppState,
    uri: &str,
    apikey: Option<&str>,
    body: serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(apikey) = apikey {
        builder = builder.header("x-api-key", apikey);
    }
    let request = builder.body(Body::from(body.to_string())).unwrap();

    let response = create_routes(state.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, value)
}

#[tokio::test]
async fn job_assign_and_output_roundtrip() {
    let tmp = tempfile::tempdir().unwrap();
    let app = make_app(tmp.path());

    let queue = app.db.add_queue(QueueBuilder::new("q1").group_size(2).build());
    app.scheduler
        .enqueue(&queue, vec!["t1".to_string(), "t2".to_string()])
        .await
        .unwrap();

    let (status, assignment) = post_json(
        &app.state,
        "/api/v2/scheduler/job/assign",
        Some("agent-key"),
        serde_json::json!({"queue": "q1", "caps": []}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(assignment["config"]["module"], "dummy");
    assert_eq!(assignment["targets"].as_array().unwrap().len(), 2);

    let output = base64::engine::general_purpose::STANDARD.encode(b"zip-payload");
    let (status, response) = post_json(
        &app.state,
        "/api/v2/scheduler/job/output",
        Some("agent-key"),
        serde_json::json!({"id": assignment["id"], "retval": 0, "output": output}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["message"], "success");

    // repeated upload discards silently
    let output = base64::engine::general_purpose::STANDARD.encode(b"other");
    let (status, response) = post_json(
        &app.state,
        "/api/v2/scheduler/job/output",
        Some("agent-key"),
        serde_json::json!({"id": assignment["id"], "retval": 0, "output": output}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["message"], "discard job");
}

#[tokio::test]
async fn job_assign_empty_reply_means_no_work() {
    let tmp = tempfile::tempdir().unwrap();
    let app = make_app(tmp.path());

    let (status, assignment) = post_json(
        &app.state,
        "/api/v2/scheduler/job/assign",
        Some("agent-key"),
        serde_json::json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(assignment, serde_json::json!({}));
}

#[tokio::test]
async fn job_output_validation() {
    let tmp = tempfile::tempdir().unwrap();
    let app = make_app(tmp.path());

    // malformed base64
    let (status, _) = post_json(
        &app.state,
        "/api/v2/scheduler/job/output",
        Some("agent-key"),
        serde_json::json!({"id": uuid::Uuid::new_v4(), "retval": 0, "output": "!!not-base64!!"}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // schema failure: retval missing
    let (status, _) = post_json(
        &app.state,
        "/api/v2/scheduler/job/output",
        Some("agent-key"),
        serde_json::json!({"id": uuid::Uuid::new_v4(), "output": ""}),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn scheduler_routes_require_agent_role() {
    let tmp = tempfile::tempdir().unwrap();
    let app = make_app(tmp.path());

    let (status, _) = post_json(
        &app.state,
        "/api/v2/scheduler/job/assign",
        None,
        serde_json::json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = post_json(
        &app.state,
        "/api/v2/scheduler/job/assign",
        Some("bogus-key"),
        serde_json::json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = post_json(
        &app.state,
        "/api/v2/scheduler/job/assign",
        Some("user-key"),
        serde_json::json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn public_host_honors_api_networks() {
    let tmp = tempfile::tempdir().unwrap();
    let app = make_app(tmp.path());
    seed_host(&app.storage, "127.0.0.1");

    let (status, host) = post_json(
        &app.state,
        "/api/v2/public/storage/host",
        Some("user-key"),
        serde_json::json!({"address": "127.0.0.1"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(host["address"], "127.0.0.1");

    // address outside the caller's networks
    let (status, _) = post_json(
        &app.state,
        "/api/v2/public/storage/host",
        Some("user-key"),
        serde_json::json!({"address": "192.0.2.1"}),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // agent keys have no storage access
    let (status, _) = post_json(
        &app.state,
        "/api/v2/public/storage/host",
        Some("agent-key"),
        serde_json::json!({"address": "127.0.0.1"}),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn public_lists_filter_and_restrict() {
    let tmp = tempfile::tempdir().unwrap();
    let app = make_app(tmp.path());
    seed_host(&app.storage, "127.0.0.1");
    seed_host(&app.storage, "192.0.2.1");

    // range: only the caller's networks are visible
    let (status, hosts) = post_json(
        &app.state,
        "/api/v2/public/storage/range",
        Some("user-key"),
        serde_json::json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let hosts = hosts.as_array().unwrap();
    assert_eq!(hosts.len(), 1);
    assert_eq!(hosts[0]["address"], "127.0.0.1");

    // servicelist with a filter expression
    let (status, services) = post_json(
        &app.state,
        "/api/v2/public/storage/servicelist",
        Some("user-key"),
        serde_json::json!({"filter": "Service.port==80"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(services.as_array().unwrap().len(), 1);

    let (status, services) = post_json(
        &app.state,
        "/api/v2/public/storage/servicelist",
        Some("user-key"),
        serde_json::json!({"filter": "Service.port==81"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(services.as_array().unwrap().is_empty());

    // malformed filter expression
    let (status, _) = post_json(
        &app.state,
        "/api/v2/public/storage/servicelist",
        Some("user-key"),
        serde_json::json!({"filter": "address = ="}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn prometheus_stats_expose_gauges() {
    let tmp = tempfile::tempdir().unwrap();
    let app = make_app(tmp.path());

    let queue = app.db.add_queue(QueueBuilder::new("q1").build());
    app.scheduler
        .enqueue(&queue, vec!["t1".to_string(), "t2".to_string()])
        .await
        .unwrap();
    let assignment = app.scheduler.job_assign(None, &[]).await.unwrap().unwrap();
    app.scheduler
        .job_output(assignment.id, 0, b"data")
        .await
        .unwrap();

    let request = Request::builder()
        .method("GET")
        .uri("/api/v2/stats/prometheus")
        .body(Body::empty())
        .unwrap();
    let response = create_routes(app.state.clone())
        .oneshot(request)
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(body.to_vec()).unwrap();

    assert!(text.contains("sner_scheduler_jobs_total{state=\"finished\"} 1"));
    assert!(text.contains("sner_scheduler_jobs_total{state=\"running\"} 0"));
    assert!(text.contains("sner_scheduler_queue_targets_total{name=\"q1\"} 1"));
    assert!(text.contains("sner_storage_hosts_total 0"));
}

fn seed_host(storage: &Arc<MockStorageRepository>, address: &str) {
    use chrono::Utc;
    let mut state = storage.state.lock().unwrap();
    let now = Utc::now();
    let host_id = (state.hosts.len() + 1) as i64;
    state.hosts.push(sner_core::models::Host {
        id: host_id,
        address: address.to_string(),
        hostname: None,
        os: None,
        tags: Vec::new(),
        comment: None,
        created: now,
        modified: now,
        rescan_time: now,
    });
    state.services.push(sner_core::models::Service {
        id: host_id * 10,
        host_id,
        proto: "tcp".to_string(),
        port: 80,
        state: Some("open".to_string()),
        name: Some("http".to_string()),
        info: None,
        tags: Vec::new(),
        comment: None,
        created: now,
        modified: now,
        rescan_time: now,
        import_time: None,
    });
}
