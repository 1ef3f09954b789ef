use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Gateway error taxonomy. Connection errors are retryable inside the
/// dispatcher; everything else propagates to the caller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("provider unreachable: {0}")]
    Connection(String),

    #[error("provider rejected credentials")]
    Auth,

    #[error("rate limited by provider")]
    RateLimited,

    #[error("delivery failed: {0}")]
    DeliveryFailed(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("instance is not pairing")]
    NotPairing,

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::RateLimited)
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Connection(_) => StatusCode::BAD_GATEWAY,
            Error::Auth => StatusCode::UNAUTHORIZED,
            Error::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Error::DeliveryFailed(_) => StatusCode::BAD_GATEWAY,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::NotPairing => StatusCode::CONFLICT,
            Error::Invalid(_) => StatusCode::BAD_REQUEST,
            Error::Provider(_) => StatusCode::BAD_GATEWAY,
            Error::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            Error::Connection(err.to_string())
        } else {
            Error::Provider(err.to_string())
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(json!({"error": self.to_string()}))).into_response()
    }
}

pub type Result<T> = std::result::Result<T, Error>;
