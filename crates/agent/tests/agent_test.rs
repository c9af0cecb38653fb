use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use sner_agent::Agent;
use sner_api::{create_routes, AppState};
use sner_core::config::{AgentConfig, ApiClient, AuthConfig, Role, ServerConfig};
use sner_scheduler::SchedulerService;
use sner_testing_utils::{MockDb, MockSchedulerLock, MockStorageRepository, QueueBuilder};

struct TestServer {
    db: Arc<MockDb>,
    scheduler: Arc<SchedulerService>,
    address: String,
}

async fn spawn_server(var_dir: &Path) -> TestServer {
    let db = MockDb::new();
    let storage = MockStorageRepository::new();

    let config = ServerConfig {
        var_dir: var_dir.to_path_buf(),
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

    let state = AppState {
        scheduler: Arc::clone(&scheduler),
        queues: Arc::new(db.queues()),
        jobs: Arc::new(db.jobs()),
        storage: storage as Arc<dyn sner_core::traits::StorageRepository>,
        auth: Arc::new(AuthConfig {
            clients: vec![ApiClient {
                apikey: "agent-key".to_string(),
                role: Role::Agent,
                api_networks: vec![],
            }],
        }),
        stale_horizon_days: 5,
        metrics: None,
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = format!("http://{}", listener.local_addr().unwrap());
    let app = create_routes(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        db,
        scheduler,
        address,
    }
}

fn agent_config(server: &str) -> AgentConfig {
    AgentConfig {
        server: server.to_string(),
        apikey: "agent-key".to_string(),
        queue: None,
        caps: vec![],
        backoff_seconds: 1,
        net_timeout_seconds: 30,
        oneshot: true,
    }
}

#[tokio::test]
async fn agent_processes_one_assignment_end_to_end() {
    let server_dir = tempfile::tempdir().unwrap();
    let server = spawn_server(server_dir.path()).await;

    let queue = server.db.add_queue(
        QueueBuilder::new("q1")
            .config("module: dummy\nargs: --test\n")
            .build(),
    );
    server
        .scheduler
        .enqueue(&queue, vec!["192.0.2.1".to_string()])
        .await
        .unwrap();

    let agent_dir = tempfile::tempdir().unwrap();
    let agent = Agent::new(agent_config(&server.address), agent_dir.path()).unwrap();
    let retval = agent.run().await.unwrap();
    assert_eq!(retval, 0);

    // job finished server side
    let job = {
        let state = server.db.state.lock().unwrap();
        assert_eq!(state.jobs.len(), 1);
        state.jobs[0].clone()
    };
    assert_eq!(job.retval, Some(0));

    // uploaded archive holds the assignment the agent received
    let output_path = server_dir
        .path()
        .join("scheduler")
        .join(format!("queue-{}", queue.id))
        .join(job.id.to_string());
    let mut archive =
        zip::ZipArchive::new(std::fs::File::open(&output_path).unwrap()).unwrap();
    let mut member = archive.by_name("assignment.json").unwrap();
    let mut data = String::new();
    member.read_to_string(&mut data).unwrap();
    let assignment: serde_json::Value = serde_json::from_str(&data).unwrap();
    assert_eq!(assignment["targets"], serde_json::json!(["192.0.2.1"]));

    // agent cleaned its working directory
    assert_eq!(std::fs::read_dir(agent_dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn agent_oneshot_exits_on_no_work() {
    let server_dir = tempfile::tempdir().unwrap();
    let server = spawn_server(server_dir.path()).await;

    let agent_dir = tempfile::tempdir().unwrap();
    let agent = Agent::new(agent_config(&server.address), agent_dir.path()).unwrap();
    let retval = agent.run().await.unwrap();
    assert_eq!(retval, 0);
    assert_eq!(server.db.job_count(), 0);
}

#[tokio::test]
async fn agent_shutdown_stops_the_loop() {
    let server_dir = tempfile::tempdir().unwrap();
    let server = spawn_server(server_dir.path()).await;

    let agent_dir = tempfile::tempdir().unwrap();
    let mut config = agent_config(&server.address);
    config.oneshot = false;
    let agent = Agent::new(config, agent_dir.path()).unwrap();

    let control = agent.control();
    control.shutdown();
    // with shutdown already requested the loop exits immediately
    let retval = agent.run().await.unwrap();
    assert_eq!(retval, 0);
}
