use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use sner_core::config::{ApiClient, Role};
use sner_core::netutils::CidrNet;

use crate::error::ApiError;
use crate::routes::AppState;

/// Authenticated API client, resolved from the X-API-KEY header against
/// the configured clients.
pub struct AuthedClient(pub ApiClient);

impl AuthedClient {
    /// Scheduling endpoints are agent-only.
    pub fn require_agent(&self) -> Result<(), ApiError> {
        match self.0.role {
            Role::Agent => Ok(()),
            _ => Err(ApiError::Forbidden),
        }
    }

    /// Public storage endpoints accept user and operator keys.
    pub fn require_user(&self) -> Result<(), ApiError> {
        match self.0.role {
            Role::User | Role::Operator => Ok(()),
            Role::Agent => Err(ApiError::Forbidden),
        }
    }

    /// True when the caller may see the given address.
    pub fn network_allowed(&self, address: &str) -> bool {
        let Ok(addr) = address.parse() else {
            return false;
        };
        self.0.api_networks.iter().any(|network| {
            network
                .parse::<CidrNet>()
                .map(|net| net.contains(&addr))
                .unwrap_or(false)
        })
    }
}

impl FromRequestParts<AppState> for AuthedClient {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let apikey = parts
            .headers
            .get("x-api-key")
            .and_then(|value| value.to_str().ok())
            .ok_or(ApiError::Unauthorized)?;

        state
            .auth
            .clients
            .iter()
            .find(|client| client.apikey == apikey)
            .cloned()
            .map(AuthedClient)
            .ok_or(ApiError::Unauthorized)
    }
}
