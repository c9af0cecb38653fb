use axum::extract::State;
use axum::Json;
use serde::Deserialize;

use sner_core::filter::{parse as parse_filter, Filter};
use sner_core::errors::SnerResult;

use crate::auth::AuthedClient;
use crate::error::{ApiError, ApiResult};
use crate::routes::AppState;

#[derive(Debug, Deserialize)]
pub struct HostRequest {
    pub address: String,
}

/// Host detail; restricted to callers whose api_networks contain the
/// address.
pub async fn host(
    State(state): State<AppState>,
    client: AuthedClient,
    Json(request): Json<HostRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    client.require_user()?;
    if !client.network_allowed(&request.address) {
        return Err(ApiError::Forbidden);
    }

    let host = state.storage.get_host(&request.address).await?;
    Ok(Json(serde_json::to_value(host).map_err(sner_core::SnerError::from)?))
}

#[derive(Debug, Deserialize)]
pub struct ListRequest {
    #[serde(default)]
    pub filter: Option<String>,
}

fn parsed_filter(request: &ListRequest) -> SnerResult<Option<Filter>> {
    request.filter.as_deref().map(parse_filter).transpose()
}

pub async fn range(
    State(state): State<AppState>,
    client: AuthedClient,
    Json(request): Json<ListRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    client.require_user()?;
    let filter = parsed_filter(&request)?;
    let hosts = state
        .storage
        .query_hosts(filter.as_ref(), &client.0.api_networks)
        .await?;
    Ok(Json(serde_json::to_value(hosts).map_err(sner_core::SnerError::from)?))
}

pub async fn servicelist(
    State(state): State<AppState>,
    client: AuthedClient,
    Json(request): Json<ListRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    client.require_user()?;
    let filter = parsed_filter(&request)?;
    let services = state
        .storage
        .query_services(filter.as_ref(), &client.0.api_networks)
        .await?;
    Ok(Json(serde_json::to_value(services).map_err(sner_core::SnerError::from)?))
}

pub async fn notelist(
    State(state): State<AppState>,
    client: AuthedClient,
    Json(request): Json<ListRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    client.require_user()?;
    let filter = parsed_filter(&request)?;
    let notes = state
        .storage
        .query_notes(filter.as_ref(), &client.0.api_networks)
        .await?;
    Ok(Json(serde_json::to_value(notes).map_err(sner_core::SnerError::from)?))
}

pub async fn versioninfo(
    State(state): State<AppState>,
    client: AuthedClient,
    Json(request): Json<ListRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    client.require_user()?;
    let filter = parsed_filter(&request)?;
    let infos = state
        .storage
        .query_versioninfo(filter.as_ref(), &client.0.api_networks)
        .await?;
    Ok(Json(serde_json::to_value(infos).map_err(sner_core::SnerError::from)?))
}
