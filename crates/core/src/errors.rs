use thiserror::Error;

/// Unified error type shared by all sner components.
#[derive(Debug, Error)]
pub enum SnerError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Advisory lock could not be acquired within the endpoint timeout.
    /// Surfaced as empty assignment or HTTP 429; the caller retries.
    #[error("server busy")]
    Busy,

    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Operator misuse (delete running job, delete queue with jobs, unknown
    /// queue on the command line). Maps to 5xx or CLI exit 1.
    #[error("{0}")]
    Operator(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type SnerResult<T> = std::result::Result<T, SnerError>;
