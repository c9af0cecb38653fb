use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use sner_core::errors::SnerError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Sner(#[from] SnerError),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Sner(SnerError::Busy) => {
                (StatusCode::TOO_MANY_REQUESTS, "server busy".to_string())
            }
            ApiError::Sner(SnerError::BadRequest(message)) => {
                (StatusCode::BAD_REQUEST, message.clone())
            }
            ApiError::Sner(SnerError::Parse(message)) => {
                (StatusCode::BAD_REQUEST, message.clone())
            }
            ApiError::Sner(SnerError::NotFound(message)) => {
                (StatusCode::NOT_FOUND, message.clone())
            }
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized".to_string()),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, "forbidden".to_string()),
            ApiError::Sner(err) => {
                tracing::error!("api internal error: {}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };

        (status, Json(json!({"message": message}))).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
