use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("backend request failed: {0}")]
    Backend(#[from] reqwest::Error),

    #[error("malformed line protocol: {0}")]
    LineProtocol(String),

    #[error("malformed prometheus write request: {0}")]
    Prometheus(String),

    #[error("no route matched for this request")]
    NoRouteMatch,

    #[error("missing parameter: {0}")]
    MissingParameter(String),

    #[error("method not allowed")]
    MethodNotAllowed,

    #[error("retry buffer full")]
    BufferFull,

    #[error("rate limited")]
    RateLimited,

    #[error("request timed out")]
    Timeout,

    #[error("cluster {0} not exist in config")]
    UnknownCluster(String),

    #[error("duplicate cluster name: {0}")]
    DuplicateCluster(String),

    #[error("duplicate relay name: {0}")]
    DuplicateRelay(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RelayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::Io(_) | RelayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RelayError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RelayError::Backend(_) => StatusCode::BAD_GATEWAY,
            RelayError::LineProtocol(_) | RelayError::Prometheus(_) => StatusCode::BAD_REQUEST,
            RelayError::NoRouteMatch => StatusCode::BAD_REQUEST,
            RelayError::MissingParameter(_) => StatusCode::BAD_REQUEST,
            RelayError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            RelayError::BufferFull => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            RelayError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            RelayError::UnknownCluster(_) => StatusCode::BAD_REQUEST,
            RelayError::DuplicateCluster(_) | RelayError::DuplicateRelay(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            RelayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({ "error": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

pub type RelayResult<T> = Result<T, RelayError>;
