use std::fmt::Write;

use axum::extract::State;
use chrono::{Duration, Utc};

use crate::error::ApiResult;
use crate::routes::AppState;

/// Prometheus exposition: storage totals, job state counts with the stale
/// heuristic, per-queue pending target gauges, plus the counters of the
/// installed metrics recorder.
pub async fn prometheus(State(state): State<AppState>) -> ApiResult<String> {
    let mut output = String::new();

    let counts = state.storage.counts().await?;
    let _ = writeln!(output, "sner_storage_hosts_total {}", counts.hosts);
    let _ = writeln!(output, "sner_storage_services_total {}", counts.services);
    let _ = writeln!(output, "sner_storage_vulns_total {}", counts.vulns);
    let _ = writeln!(output, "sner_storage_notes_total {}", counts.notes);

    let stale_horizon = Utc::now() - Duration::days(state.stale_horizon_days);
    let jobs = state.jobs.state_counts(stale_horizon).await?;
    for (job_state, count) in [
        ("running", jobs.running),
        ("stale", jobs.stale),
        ("finished", jobs.finished),
        ("failed", jobs.failed),
    ] {
        let _ = writeln!(
            output,
            "sner_scheduler_jobs_total{{state=\"{job_state}\"}} {count}"
        );
    }

    for (queue, targets) in state.queues.target_counts().await? {
        let _ = writeln!(
            output,
            "sner_scheduler_queue_targets_total{{name=\"{queue}\"}} {targets}"
        );
    }

    if let Some(handle) = &state.metrics {
        output.push_str(&handle.render());
    }

    Ok(output)
}
