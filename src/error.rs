use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::response::RateLimitDenial;
use crate::throttle::QuotaStatus;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Rate limit exceeded")]
    RateLimited(QuotaStatus),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        GatewayError::Upstream(err.to_string())
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub code: u16,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, code: u16) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            code,
        }
    }

    pub fn from_gateway_error(err: &GatewayError) -> Self {
        match err {
            GatewayError::InvalidRequest(msg) => Self::new("bad_request", msg, 400),
            GatewayError::RateLimited(_) => {
                Self::new("rate_limit_exceeded", "Request rate limit exceeded", 429)
            }
            GatewayError::Upstream(msg) => Self::new("upstream_error", msg, 502),
            GatewayError::Unavailable(msg) => Self::new("service_unavailable", msg, 503),
            GatewayError::Configuration(msg) => Self::new("configuration_error", msg, 500),
            GatewayError::Internal(msg) => Self::new("internal_error", msg, 500),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        if let GatewayError::RateLimited(status) = self {
            return RateLimitDenial::from_status(&status).into_response();
        }

        let body = ErrorResponse::from_gateway_error(&self);
        let code = StatusCode::from_u16(body.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if code.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, "Request rejected");
        }

        (code, Json(body)).into_response()
    }
}
