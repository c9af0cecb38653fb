use std::sync::Arc;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use tracing::info;

use sner_agent::Agent;
use sner_api::{create_routes, AppState};
use sner_core::config::AppConfig;
use sner_core::traits::{
    ExclRepository, JobRepository, QueueRepository, SchedulerLock, StorageRepository,
    TargetRepository,
};
use sner_infrastructure::{
    create_pool, PgExclRepository, PgJobRepository, PgQueueRepository, PgSchedulerLock,
    PgStorageRepository, PgTargetRepository,
};
use sner_planner::Planner;
use sner_scheduler::SchedulerService;

use crate::shutdown::{spawn_signal_listener, ShutdownManager};

/// Database-backed context shared by server, planner and the scheduler
/// command line.
pub struct AppContext {
    pub queues: Arc<dyn QueueRepository>,
    pub targets: Arc<dyn TargetRepository>,
    pub jobs: Arc<dyn JobRepository>,
    pub excls: Arc<dyn ExclRepository>,
    pub storage: Arc<dyn StorageRepository>,
    pub scheduler: Arc<SchedulerService>,
}

pub async fn build_context(config: &AppConfig) -> Result<AppContext> {
    let pool = create_pool(&config.database)
        .await
        .context("database connection failed")?;

    let queues: Arc<dyn QueueRepository> = Arc::new(PgQueueRepository::new(pool.clone()));
    let targets: Arc<dyn TargetRepository> = Arc::new(PgTargetRepository::new(pool.clone()));
    let jobs: Arc<dyn JobRepository> = Arc::new(PgJobRepository::new(pool.clone()));
    let excls: Arc<dyn ExclRepository> = Arc::new(PgExclRepository::new(pool.clone()));
    let storage: Arc<dyn StorageRepository> = Arc::new(PgStorageRepository::new(pool));
    let lock: Arc<dyn SchedulerLock> = Arc::new(PgSchedulerLock::new(&config.database.url));

    let scheduler = Arc::new(SchedulerService::new(
        &config.server,
        Arc::clone(&queues),
        Arc::clone(&targets),
        Arc::clone(&jobs),
        Arc::clone(&excls),
        lock,
    ));

    Ok(AppContext {
        queues,
        targets,
        jobs,
        excls,
        storage,
        scheduler,
    })
}

/// Run the central server: scheduler API plus storage query endpoints.
pub async fn run_server(config: AppConfig) -> Result<()> {
    let ctx = build_context(&config).await?;

    // rebuild in-flight accounting lost on the previous stop
    ctx.scheduler
        .restore_heatmap()
        .await
        .context("heatmap restore failed")?;

    let metrics = PrometheusBuilder::new()
        .install_recorder()
        .context("metrics recorder setup failed")?;

    let state = AppState {
        scheduler: Arc::clone(&ctx.scheduler),
        queues: Arc::clone(&ctx.queues),
        jobs: Arc::clone(&ctx.jobs),
        storage: Arc::clone(&ctx.storage),
        auth: Arc::new(config.auth.clone()),
        stale_horizon_days: config.server.stale_horizon_days,
        metrics: Some(metrics),
    };

    let shutdown = ShutdownManager::new();
    spawn_signal_listener(shutdown.clone());
    let mut shutdown_rx = shutdown.subscribe();

    let listener = TcpListener::bind(&config.server.bind_address)
        .await
        .with_context(|| format!("bind failed: {}", config.server.bind_address))?;
    info!("server listening on http://{}", config.server.bind_address);

    axum::serve(listener, create_routes(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await
        .context("server failed")?;

    ctx.scheduler
        .save_heatmap()
        .await
        .context("heatmap save failed")?;
    info!("server stopped");
    Ok(())
}

/// Run the planner process.
pub async fn run_planner(config: AppConfig, oneshot: bool) -> Result<()> {
    let ctx = build_context(&config).await?;
    ctx.scheduler
        .restore_heatmap()
        .await
        .context("heatmap restore failed")?;

    let shutdown = ShutdownManager::new();
    spawn_signal_listener(shutdown.clone());

    let planner = Planner::new(
        &config.server,
        config.planner.clone(),
        Arc::clone(&ctx.scheduler),
        Arc::clone(&ctx.queues),
        Arc::clone(&ctx.jobs),
        Arc::clone(&ctx.excls),
        Arc::clone(&ctx.storage),
        oneshot,
    );
    planner.run(shutdown.subscribe()).await?;
    Ok(())
}

/// Run the agent loop; SIGUSR1 finishes the current assignment and exits,
/// SIGTERM terminates immediately.
pub async fn run_agent(config: AppConfig) -> Result<i32> {
    let workdir = std::env::current_dir().context("cannot determine working directory")?;
    let agent = Agent::new(config.agent, &workdir)?;

    let control = agent.control();
    tokio::spawn(async move {
        let mut sigusr1 = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::user_defined1())
            .expect("sigusr1 handler");
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("sigterm handler");

        tokio::select! {
            _ = sigusr1.recv() => control.shutdown(),
            _ = sigterm.recv() => control.terminate(),
        }
    });

    Ok(agent.run().await?)
}
