//! Error type for the management API

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::error::ProxyError;

pub type ApiResult<T> = Result<T, ApiError>;

/// Errors returned to the dashboard, always rendered as `{"error": message}`
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("missing or invalid bearer token")]
    Unauthorized,

    #[error("{0}")]
    NotFound(String),

    /// Checked target refused or unreachable
    #[error("{0}")]
    BadGateway(String),

    #[error("{0}")]
    GatewayTimeout(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            ApiError::GatewayTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ProxyError> for ApiError {
    fn from(err: ProxyError) -> Self {
        match err {
            ProxyError::Validation(msg) => ApiError::BadRequest(msg),
            ProxyError::NotFound(msg) => ApiError::NotFound(msg),
            ProxyError::Timeout(msg) => ApiError::GatewayTimeout(msg),
            ProxyError::Transport(e) | ProxyError::Io(e) => ApiError::BadGateway(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
