use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::trace::TraceLayer;

use sner_core::config::AuthConfig;
use sner_core::traits::{JobRepository, QueueRepository, StorageRepository};
use sner_scheduler::SchedulerService;

use crate::handlers::{scheduler, stats, storage};

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<SchedulerService>,
    pub queues: Arc<dyn QueueRepository>,
    pub jobs: Arc<dyn JobRepository>,
    pub storage: Arc<dyn StorageRepository>,
    pub auth: Arc<AuthConfig>,
    pub stale_horizon_days: i64,
    /// Render handle of the installed metrics recorder; None in tests.
    pub metrics: Option<PrometheusHandle>,
}

pub fn create_routes(state: AppState) -> Router {
    Router::new()
        .route("/api/v2/scheduler/job/assign", post(scheduler::job_assign))
        .route("/api/v2/scheduler/job/output", post(scheduler::job_output))
        .route("/api/v2/stats/prometheus", get(stats::prometheus))
        .route("/api/v2/public/storage/host", post(storage::host))
        .route("/api/v2/public/storage/range", post(storage::range))
        .route(
            "/api/v2/public/storage/servicelist",
            post(storage::servicelist),
        )
        .route("/api/v2/public/storage/notelist", post(storage::notelist))
        .route(
            "/api/v2/public/storage/versioninfo",
            post(storage::versioninfo),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
