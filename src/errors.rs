//! Service and HTTP error types
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::time::Duration;
use tracing::{error, warn};

use crate::capabilities::CapabilityError;
use crate::queue::QueueError;
use crate::residency::{LoadError, RunError};

/// Everything that can go wrong while serving a request.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Run(#[from] RunError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("{0}")]
    InvalidRequest(String),

    /// The submitter stopped waiting. The task itself may still run to completion.
    #[error("task did not complete within {}s", .0.as_secs())]
    Timeout(Duration),
}

impl ServiceError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        ServiceError::InvalidRequest(msg.into())
    }
}

/// Error returned by HTTP handlers
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    fn error_type(&self) -> &'static str {
        match self.status {
            StatusCode::BAD_REQUEST => "invalid_request_error",
            StatusCode::UNAUTHORIZED => "authentication_error",
            StatusCode::SERVICE_UNAVAILABLE => "service_unavailable",
            StatusCode::GATEWAY_TIMEOUT => "timeout_error",
            _ => "server_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "message": self.message,
                "type": self.error_type(),
                "code": self.status.as_str()
            }
        }));
        (self.status, body).into_response()
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        let status = match &err {
            ServiceError::Capability(_) | ServiceError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::Queue(QueueError::Cancelled | QueueError::Closed) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ServiceError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ServiceError::Load(_) | ServiceError::Run(_) | ServiceError::Queue(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            error!(error = %err, status = status.as_u16(), "Request failed");
        } else {
            warn!(error = %err, status = status.as_u16(), "Request rejected");
        }
        ApiError::new(status, err.to_string())
    }
}
