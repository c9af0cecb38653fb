use axum::extract::State;
use axum::Json;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use sner_core::errors::SnerError;
use sner_scheduler::JobOutputOutcome;

use crate::auth::AuthedClient;
use crate::error::ApiResult;
use crate::routes::AppState;

#[derive(Debug, Deserialize)]
pub struct JobAssignRequest {
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub caps: Vec<String>,
}

/// Assign a job for an agent; the empty object means no work.
pub async fn job_assign(
    State(state): State<AppState>,
    client: AuthedClient,
    Json(request): Json<JobAssignRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    client.require_agent()?;

    let assignment = state
        .scheduler
        .job_assign(request.queue.as_deref(), &request.caps)
        .await?;

    match assignment {
        Some(assignment) => Ok(Json(serde_json::to_value(assignment).map_err(SnerError::from)?)),
        None => Ok(Json(json!({}))),
    }
}

#[derive(Debug, Deserialize)]
pub struct JobOutputRequest {
    pub id: Uuid,
    pub retval: i32,
    pub output: String,
}

/// Receive the output of an assigned job. Unknown or finished job ids are
/// silently discarded so agents can drop local state.
pub async fn job_output(
    State(state): State<AppState>,
    client: AuthedClient,
    Json(request): Json<JobOutputRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    client.require_agent()?;

    let output = base64::engine::general_purpose::STANDARD
        .decode(&request.output)
        .map_err(|_| SnerError::BadRequest("invalid base64 output".to_string()))?;

    let outcome = state
        .scheduler
        .job_output(request.id, request.retval, &output)
        .await?;

    let message = match outcome {
        JobOutputOutcome::Success => "success",
        JobOutputOutcome::Discard => "discard job",
    };
    Ok(Json(json!({"message": message})))
}
